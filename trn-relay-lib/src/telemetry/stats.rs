use std::sync::atomic::{AtomicU64, Ordering};

/// Per-port event counters, incremented only from the port's own task.
#[derive(Debug, Default)]
pub struct PortStats {
    cli_con: AtomicU64,
    cli_dis: AtomicU64,
    tx_n: AtomicU64,
    tx_bytes: AtomicU64,
    rx_n: AtomicU64,
    rx_bytes: AtomicU64,
    pub_n: AtomicU64,
    pub_bytes: AtomicU64,
    etx: AtomicU64,
    eproto_rd: AtomicU64,
    eproto_hnd: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortStatsSnapshot {
    pub cli_con: u64,
    pub cli_dis: u64,
    pub tx_n: u64,
    pub tx_bytes: u64,
    pub rx_n: u64,
    pub rx_bytes: u64,
    pub pub_n: u64,
    pub pub_bytes: u64,
    pub etx: u64,
    pub eproto_rd: u64,
    pub eproto_hnd: u64,
}

impl PortStats {
    pub fn client_connected(&self) {
        self.cli_con.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_disconnected(&self) {
        self.cli_dis.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rx(&self, bytes: u64) {
        self.rx_n.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn tx(&self, bytes: u64) {
        self.tx_n.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn published(&self, bytes: u64) {
        self.pub_n.fetch_add(1, Ordering::Relaxed);
        self.pub_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn tx_error(&self) {
        self.etx.fetch_add(1, Ordering::Relaxed);
    }

    pub fn proto_read_error(&self) {
        self.eproto_rd.fetch_add(1, Ordering::Relaxed);
    }

    pub fn proto_handle_error(&self) {
        self.eproto_hnd.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PortStatsSnapshot {
        PortStatsSnapshot {
            cli_con: self.cli_con.load(Ordering::Relaxed),
            cli_dis: self.cli_dis.load(Ordering::Relaxed),
            tx_n: self.tx_n.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_n: self.rx_n.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            pub_n: self.pub_n.load(Ordering::Relaxed),
            pub_bytes: self.pub_bytes.load(Ordering::Relaxed),
            etx: self.etx.load(Ordering::Relaxed),
            eproto_rd: self.eproto_rd.load(Ordering::Relaxed),
            eproto_hnd: self.eproto_hnd.load(Ordering::Relaxed),
        }
    }
}

impl PortStatsSnapshot {
    /// One-line profile for the session log.
    pub fn profile_line(&self, port_name: &str, peers: usize) -> String {
        format!(
            "[PROF.{port_name}] peers[{peers}] con[{}] dis[{}] rx[{}/{}] tx[{}/{}] pub[{}/{}] etx[{}] erd[{}] ehnd[{}]",
            self.cli_con,
            self.cli_dis,
            self.rx_n,
            self.rx_bytes,
            self.tx_n,
            self.tx_bytes,
            self.pub_n,
            self.pub_bytes,
            self.etx,
            self.eproto_rd,
            self.eproto_hnd
        )
    }
}
