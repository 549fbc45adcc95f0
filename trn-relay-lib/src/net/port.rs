#![forbid(unsafe_code)]

//! Per-port network interface.
//!
//! A port binds one socket and services many peers from a single task:
//! TCP ports accept subscribers, UDP ports discover them from inbound
//! datagrams. Each loop iteration admits new peers, runs one
//! read→handle cycle per peer in insertion order (request/response
//! ports), publishes any queued records (publish ports), and expires
//! peers whose heartbeat is stale. All socket reads on the hot path are
//! non-blocking; `WouldBlock` means the cycle is complete.

use std::net::SocketAddr;
#[cfg(unix)]
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::error::{MsgErr, Result};
use crate::net::addr::TargetAddr;
use crate::net::peer::{Peer, PeerList};
use crate::net::socket::{bind_tcp, bind_udp};
use crate::telemetry::{PortStats, SessionLog};

/// Inbound datagram buffer for the UDP discovery path.
pub const NETIF_UDP_BUF_LEN: usize = 2048;
/// Default listen queue depth.
pub const NETIF_QUEUE_DFL: u32 = 16;
/// Interval between stats profile lines in the session log.
pub const NETIF_PROFILE_INTERVAL: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CType {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortMode {
    /// Client-initiated request/response.
    ReqRes,
    /// Server-initiated broadcast to subscribed peers.
    Publish,
}

/// Construction parameters for a port.
#[derive(Debug, Clone)]
pub struct PortSettings {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub ctype: CType,
    pub mode: PortMode,
    /// Heartbeat timeout in seconds; ≤ 0 disables expiry.
    pub hbto_sec: f64,
    /// Delay between main-loop iterations.
    pub delay_ms: u64,
}

/// The part of a port that protocol callbacks may see: identity, the
/// shared UDP socket (for sendto replies), stats, and the session log.
#[derive(Debug)]
pub struct PortCtx {
    pub name: String,
    pub ctype: CType,
    pub mode: PortMode,
    pub hbto: Option<Duration>,
    pub stats: Arc<PortStats>,
    log: SessionLog,
    udp: Option<Arc<UdpSocket>>,
}

impl PortCtx {
    pub fn log_event(&self, msg: &str) {
        self.log.event(msg);
    }

    pub fn udp(&self) -> Option<&UdpSocket> {
        self.udp.as_deref()
    }

    /// Reply through the port's own socket (UDP protocols).
    pub async fn send_udp(&self, addr: SocketAddr, data: &[u8]) -> std::result::Result<usize, MsgErr> {
        let udp = self.udp.as_ref().ok_or(MsgErr::Einval)?;
        udp.send_to(data, addr)
            .await
            .map_err(|e| MsgErr::from_write_err(&e))
    }
}

/// The read/handle/publish capability a protocol plugs into a port.
///
/// `read` collects at most one message per cycle and returns `Ok(None)`
/// when the peer has nothing to say. `handle` decodes the message,
/// performs the operation, and sends the reply, returning the reply
/// length (0 when the protocol sends none). `publish` pushes one record
/// to one peer. `Err(MsgErr::Epipe)` from `handle` evicts the peer.
#[allow(async_fn_in_trait)]
pub trait PortProtocol: Send + 'static {
    async fn read(
        &mut self,
        ctx: &PortCtx,
        peer: &mut Peer,
    ) -> std::result::Result<Option<BytesMut>, MsgErr>;

    async fn handle(
        &mut self,
        ctx: &PortCtx,
        peer: &mut Peer,
        msg: &[u8],
    ) -> std::result::Result<usize, MsgErr>;

    async fn publish(
        &mut self,
        ctx: &PortCtx,
        peer: &mut Peer,
        data: &[u8],
    ) -> std::result::Result<usize, MsgErr>;
}

pub struct Port<P> {
    host: String,
    port: u16,
    delay: Duration,
    ctx: PortCtx,
    listener: Option<TcpListener>,
    peers: PeerList,
    proto: P,
    shutdown: watch::Receiver<bool>,
    input: Option<mpsc::Receiver<Bytes>>,
    last_profile: Instant,
    local_addr: Option<SocketAddr>,
}

impl<P: PortProtocol> Port<P> {
    pub fn new(
        settings: PortSettings,
        log: SessionLog,
        proto: P,
        shutdown: watch::Receiver<bool>,
    ) -> Port<P> {
        let hbto = if settings.hbto_sec > 0.0 {
            Some(Duration::from_secs_f64(settings.hbto_sec))
        } else {
            None
        };
        Port {
            host: settings.host,
            port: settings.port,
            delay: Duration::from_millis(settings.delay_ms),
            ctx: PortCtx {
                name: settings.name,
                ctype: settings.ctype,
                mode: settings.mode,
                hbto,
                stats: Arc::new(PortStats::default()),
                log,
                udp: None,
            },
            listener: None,
            peers: PeerList::new(),
            proto,
            shutdown,
            input: None,
            last_profile: Instant::now(),
            local_addr: None,
        }
    }

    /// Attach a record source for publish-mode ports; every record
    /// received is fanned out to all live peers.
    pub fn with_input(mut self, rx: mpsc::Receiver<Bytes>) -> Port<P> {
        self.input = Some(rx);
        self
    }

    pub fn ctx(&self) -> &PortCtx {
        &self.ctx
    }

    pub fn stats(&self) -> Arc<PortStats> {
        self.ctx.stats.clone()
    }

    pub fn connections(&self) -> usize {
        self.peers.len()
    }

    /// Bound address; available after [`connect`](Port::connect).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind the port socket (and listen, for TCP).
    pub async fn connect(&mut self) -> Result<()> {
        let addr = TargetAddr::new(&self.host, self.port)?.resolve().await?;
        match self.ctx.ctype {
            CType::Tcp => {
                let listener = bind_tcp(addr).await?;
                self.local_addr = listener.local_addr().ok();
                info!(name = %self.ctx.name, %addr, "tcp port bound");
                self.listener = Some(listener);
            }
            CType::Udp => {
                let sock = bind_udp(addr).await?;
                self.local_addr = sock.local_addr().ok();
                info!(name = %self.ctx.name, %addr, "udp port bound");
                self.ctx.udp = Some(Arc::new(sock));
            }
        }
        Ok(())
    }

    /// Run the port loop until the shutdown flag is set.
    pub async fn run(mut self) -> Result<()> {
        self.ctx.log_event("*** netif session start ***");
        if self.listener.is_none() && self.ctx.udp.is_none() {
            if let Err(e) = self.connect().await {
                self.ctx.log_event(&format!("connect failed: {e}"));
                self.ctx.log_event("*** netif session end ***");
                return Err(e);
            }
        }

        loop {
            if *self.shutdown.borrow() {
                self.ctx.log_event("session stop called");
                break;
            }
            self.update_connections().await;
            if self.ctx.mode == PortMode::ReqRes {
                self.reqres().await;
            }
            let mut pending = Vec::new();
            if let Some(rx) = self.input.as_mut() {
                while let Ok(frame) = rx.try_recv() {
                    pending.push(frame);
                }
            }
            for frame in pending {
                self.publish(&frame).await;
            }
            if self.last_profile.elapsed() >= NETIF_PROFILE_INTERVAL {
                self.last_profile = Instant::now();
                let line = self
                    .ctx
                    .stats
                    .snapshot()
                    .profile_line(&self.ctx.name, self.peers.len());
                self.ctx.log_event(&line);
            }
            sleep(self.delay).await;
        }

        let line = self
            .ctx
            .stats
            .snapshot()
            .profile_line(&self.ctx.name, self.peers.len());
        self.ctx.log_event(&line);
        self.ctx.log_event("*** netif session end ***");
        Ok(())
    }

    /// Admit new peers: non-blocking accept (TCP) or datagram-driven
    /// discovery (UDP).
    pub async fn update_connections(&mut self) {
        match self.ctx.ctype {
            CType::Tcp => self.accept_pending().await,
            CType::Udp => self.udp_discover().await,
        }
    }

    async fn accept_pending(&mut self) {
        let Some(listener) = &self.listener else {
            return;
        };
        match timeout(Duration::ZERO, listener.accept()).await {
            Err(_) => {} // nothing queued this cycle
            Ok(Err(e)) => {
                debug!(name = %self.ctx.name, error = %e, "accept failed");
            }
            Ok(Ok((stream, addr))) => {
                let peer = Peer::from_stream(stream, addr);
                #[cfg(unix)]
                let fd = peer.sock.as_ref().map(|s| s.as_raw_fd()).unwrap_or(-1);
                #[cfg(not(unix))]
                let fd = -1;
                let idx = self.peers.len();
                self.ctx.stats.client_connected();
                self.ctx.log_event(&format!(
                    "[TCPCON.{}]:ADD_CLI - id[{}/{}:{}] fd[{}] idx[{}]",
                    self.ctx.name, peer.id, peer.chost, peer.service, fd, idx
                ));
                self.peers.push(peer);
            }
        }
    }

    async fn udp_discover(&mut self) {
        let Some(udp) = self.ctx.udp.clone() else {
            return;
        };
        let mut buf = [0u8; NETIF_UDP_BUF_LEN];
        let (len, addr) = match udp.try_recv_from(&mut buf) {
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(e) => {
                debug!(name = %self.ctx.name, error = %e, "recvfrom failed");
                return;
            }
            Ok((0, _)) => return,
            Ok(pair) => pair,
        };

        let svc = addr.port() as u32;
        let idx = match self.peers.position_by_id(svc) {
            Some(idx) => {
                if let Some(peer) = self.peers.get_mut(idx) {
                    peer.touch();
                }
                idx
            }
            None => {
                let mut peer = Peer::from_addr(addr);
                peer.touch();
                self.ctx.stats.client_connected();
                self.ctx.log_event(&format!(
                    "[UDPCON.{}]:ADD_SUB - id[{}/{}:{}] n[{}]",
                    self.ctx.name,
                    peer.id,
                    peer.chost,
                    peer.service,
                    self.peers.len() + 1
                ));
                self.peers.push(peer);
                self.peers.len() - 1
            }
        };

        // deliver the inbound message (connect/heartbeat/request)
        let ctx = &self.ctx;
        let proto = &mut self.proto;
        if let Some(peer) = self.peers.get_mut(idx) {
            ctx.stats.rx(len as u64);
            match proto.handle(ctx, peer, &buf[..len]).await {
                Ok(n) if n > 0 => ctx.stats.tx(n as u64),
                Ok(_) => {}
                Err(_) => ctx.stats.proto_handle_error(),
            }
        }
    }

    /// One read→handle cycle for every peer, in insertion order. A peer
    /// evicted mid-iteration is not serviced again this iteration; a
    /// peer added this iteration waits for the next one.
    pub async fn reqres(&mut self) {
        let ctx = &self.ctx;
        let proto = &mut self.proto;
        let peers = &mut self.peers;

        let mut i = 0;
        while i < peers.len() {
            let read_res = {
                let Some(peer) = peers.get_mut(i) else {
                    break;
                };
                proto.read(ctx, peer).await
            };

            let msg = match read_res {
                Ok(Some(m)) if !m.is_empty() => {
                    ctx.stats.rx(m.len() as u64);
                    if ctx.hbto.is_some() {
                        if let Some(peer) = peers.get_mut(i) {
                            peer.touch();
                        }
                    }
                    Some(m)
                }
                Ok(_) => None,
                Err(MsgErr::Enodata) => None,
                Err(kind) => {
                    debug!(name = %ctx.name, ?kind, "peer read error");
                    ctx.stats.proto_read_error();
                    None
                }
            };

            if Self::check_hbeat(ctx, peers, i) {
                continue;
            }

            if let Some(msg) = msg {
                let handle_res = {
                    let Some(peer) = peers.get_mut(i) else {
                        break;
                    };
                    proto.handle(ctx, peer, &msg).await
                };
                match handle_res {
                    Ok(n) if n > 0 => ctx.stats.tx(n as u64),
                    Ok(_) => {}
                    Err(MsgErr::Epipe) => {
                        if let Some(peer) = peers.get_mut(i) {
                            ctx.log_event(&format!(
                                "[SVCCLI.{}]:DEL_CLI - send err (EPIPE) id[{}/{}:{}]",
                                ctx.name, peer.id, peer.chost, peer.service
                            ));
                        }
                        ctx.stats.client_disconnected();
                        peers.remove(i);
                        continue;
                    }
                    Err(kind) => {
                        debug!(name = %ctx.name, ?kind, "peer handle error");
                        ctx.stats.proto_handle_error();
                    }
                }
            }

            i += 1;
        }
    }

    /// Fan one record out to every live peer in insertion order.
    pub async fn publish(&mut self, data: &[u8]) {
        let ctx = &self.ctx;
        let proto = &mut self.proto;
        let peers = &mut self.peers;

        let mut i = 0;
        while i < peers.len() {
            let res = {
                let Some(peer) = peers.get_mut(i) else {
                    break;
                };
                proto.publish(ctx, peer, data).await
            };
            match res {
                Ok(n) if n > 0 => {
                    ctx.stats.tx(n as u64);
                    ctx.stats.published(n as u64);
                }
                Ok(_) => ctx.stats.tx_error(),
                Err(kind) => {
                    warn!(name = %ctx.name, ?kind, "publish failed");
                    ctx.stats.tx_error();
                }
            }
            if Self::check_hbeat(ctx, peers, i) {
                continue;
            }
            i += 1;
        }
    }

    /// Expire the peer at `idx` when its heartbeat is stale. Returns
    /// true if the peer was removed (no-op when expiry is disabled).
    fn check_hbeat(ctx: &PortCtx, peers: &mut PeerList, idx: usize) -> bool {
        let Some(hbto) = ctx.hbto else {
            return false;
        };
        let Some(peer) = peers.get_mut(idx) else {
            return false;
        };
        if peer.hbtime.elapsed() > hbto {
            ctx.log_event(&format!(
                "[CHKHB.{}]:DEL_CLI - expired id[{}/{}:{}] - removed",
                ctx.name, peer.id, peer.chost, peer.service
            ));
            ctx.stats.client_disconnected();
            peers.remove(idx);
            true
        } else {
            false
        }
    }
}
