use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::net::port::{CType, PortMode, PortSettings};
use crate::proto::commst::{CommstOptions, TRN_MSG_SIZE};

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PortCtype {
    Tcp,
    Udp,
}

impl From<PortCtype> for CType {
    fn from(v: PortCtype) -> CType {
        match v {
            PortCtype::Tcp => CType::Tcp,
            PortCtype::Udp => CType::Udp,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PortModeCfg {
    #[default]
    Reqres,
    Pub,
}

impl From<PortModeCfg> for PortMode {
    fn from(v: PortModeCfg) -> PortMode {
        match v {
            PortModeCfg::Reqres => PortMode::ReqRes,
            PortModeCfg::Pub => PortMode::Publish,
        }
    }
}

/// Which protocol services the port.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PortProtoCfg {
    /// Legacy fixed-size TRN request/response (TCP).
    Commst,
    /// Framed sync+checksum TRN request/response (TCP).
    Trnmsg,
    /// MB1 record publishing with plain-text control (UDP).
    Mb,
    /// TRN update publishing with plain-text control (UDP).
    Trnu,
}

/// One netif port.
#[derive(Debug, Deserialize, Clone)]
pub struct PortConfig {
    /// Logical name; also the session-log basename for this port.
    pub name: String,
    /// Bind host (default all interfaces).
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    pub ctype: PortCtype,
    #[serde(default)]
    pub mode: PortModeCfg,
    pub protocol: PortProtoCfg,
    /// Heartbeat timeout in seconds; ≤ 0 disables peer expiry.
    #[serde(default = "default_hbto")]
    pub hbto_sec: f64,
    /// Delay between port loop iterations.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

impl PortConfig {
    pub fn settings(&self) -> PortSettings {
        PortSettings {
            name: self.name.clone(),
            host: self.host.clone(),
            port: self.port,
            ctype: self.ctype.into(),
            mode: self.mode.into(),
            hbto_sec: self.hbto_sec,
            delay_ms: self.delay_ms,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_hbto() -> f64 {
    15.0
}

fn default_delay_ms() -> u64 {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    /// Directory for per-port session logs; None disables them.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Default tracing filter (overridden by RUST_LOG).
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            dir: None,
            level: default_level(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

/// commsT reader tuning (the corpus hard-coded 40 × 10 ms).
#[derive(Debug, Deserialize, Clone)]
pub struct CommstConfig {
    #[serde(default = "default_msg_size")]
    pub msg_size: usize,
    #[serde(default = "default_retries")]
    pub read_retries: u32,
    #[serde(default = "default_read_delay_ms")]
    pub read_delay_ms: u64,
}

impl Default for CommstConfig {
    fn default() -> Self {
        CommstConfig {
            msg_size: default_msg_size(),
            read_retries: default_retries(),
            read_delay_ms: default_read_delay_ms(),
        }
    }
}

impl CommstConfig {
    pub fn options(&self) -> CommstOptions {
        CommstOptions {
            msg_size: self.msg_size,
            retries: self.read_retries,
            delay: Duration::from_millis(self.read_delay_ms),
        }
    }
}

fn default_msg_size() -> usize {
    TRN_MSG_SIZE
}

fn default_retries() -> u32 {
    40
}

fn default_read_delay_ms() -> u64 {
    10
}

/// Optional MB1 record source replayed into publish-mode ports.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub mb1_file: PathBuf,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

fn default_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub commst: CommstConfig,
    #[serde(default)]
    pub source: Option<SourceConfig>,
    #[serde(rename = "port", default)]
    pub ports: Vec<PortConfig>,
}
