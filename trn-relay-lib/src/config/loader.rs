use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::config::types::{Config, PortCtype, PortProtoCfg};
use crate::error::{RelayError, Result};
use crate::proto::commst::COMMST_MIN_BYTES;

pub fn load_from_path<P: AsRef<Path>>(p: P) -> Result<Config> {
    let txt = fs::read_to_string(p)
        .map_err(|e| RelayError::Config(format!("Failed to read config file: {e}")))?;
    let cfg: Config = toml::from_str(&txt)
        .map_err(|e| RelayError::Config(format!("Failed to parse config: {e}")))?;

    validate_config(&cfg)?;

    Ok(cfg)
}

pub fn validate_config(cfg: &Config) -> Result<()> {
    if cfg.ports.is_empty() {
        return Err(RelayError::NoPorts);
    }

    let mut names = HashSet::new();
    let mut binds = HashSet::new();
    for port in &cfg.ports {
        if !names.insert(port.name.as_str()) {
            return Err(RelayError::Config(format!(
                "Duplicate port name: {}",
                port.name
            )));
        }
        if port.port != 0 && !binds.insert((port.host.as_str(), port.port)) {
            return Err(RelayError::Config(format!(
                "Duplicate bind address: {}:{}",
                port.host, port.port
            )));
        }

        let want_tcp = matches!(port.protocol, PortProtoCfg::Commst | PortProtoCfg::Trnmsg);
        let is_tcp = port.ctype == PortCtype::Tcp;
        if want_tcp != is_tcp {
            return Err(RelayError::Config(format!(
                "Port {}: protocol {:?} requires ctype {}",
                port.name,
                port.protocol,
                if want_tcp { "tcp" } else { "udp" }
            )));
        }
    }

    if cfg.commst.msg_size < COMMST_MIN_BYTES {
        return Err(RelayError::Config(format!(
            "commst msg_size {} below minimum {}",
            cfg.commst.msg_size, COMMST_MIN_BYTES
        )));
    }

    if let Some(source) = &cfg.source {
        if source.interval_ms == 0 {
            return Err(RelayError::Config(
                "source interval_ms must be non-zero".to_string(),
            ));
        }
    }

    Ok(())
}
