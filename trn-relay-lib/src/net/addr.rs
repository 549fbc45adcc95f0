#![forbid(unsafe_code)]

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use tokio::net::lookup_host;

use crate::error::{RelayError, Result};

/// A host:port endpoint, either already numeric or needing resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Socket(SocketAddr),
    Domain(String, u16),
}

impl FromStr for TargetAddr {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<TargetAddr> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(TargetAddr::Socket(addr));
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| RelayError::Socket(format!("missing port in address: {s}")))?;
        if host.is_empty() {
            return Err(RelayError::Socket(format!("missing host in address: {s}")));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| RelayError::Socket(format!("invalid port in address: {s}")))?;
        Ok(TargetAddr::Domain(host.to_string(), port))
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Socket(a) => write!(f, "{a}"),
            TargetAddr::Domain(h, p) => write!(f, "{h}:{p}"),
        }
    }
}

impl TargetAddr {
    pub fn new(host: &str, port: u16) -> Result<TargetAddr> {
        TargetAddr::from_str(&format!("{host}:{port}"))
    }

    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Socket(a) => a.port(),
            TargetAddr::Domain(_, p) => *p,
        }
    }

    /// Resolve to the first address for the endpoint.
    pub async fn resolve(&self) -> Result<SocketAddr> {
        match self {
            TargetAddr::Socket(a) => Ok(*a),
            TargetAddr::Domain(host, port) => {
                let mut addrs = lookup_host((host.as_str(), *port))
                    .await
                    .map_err(|e| RelayError::Socket(format!("failed to resolve {host}: {e}")))?;
                addrs
                    .next()
                    .ok_or_else(|| RelayError::Socket(format!("no addresses found for {host}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numeric_and_domain_forms() {
        assert!(matches!(
            "127.0.0.1:7007".parse::<TargetAddr>().unwrap(),
            TargetAddr::Socket(_)
        ));
        match "localhost:7007".parse::<TargetAddr>().unwrap() {
            TargetAddr::Domain(h, p) => {
                assert_eq!(h, "localhost");
                assert_eq!(p, 7007);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
        assert!("noport".parse::<TargetAddr>().is_err());
        assert!(":7007".parse::<TargetAddr>().is_err());
        assert!("host:notaport".parse::<TargetAddr>().is_err());
    }

    #[tokio::test]
    async fn resolves_localhost() {
        let addr = TargetAddr::new("localhost", 7007)
            .unwrap()
            .resolve()
            .await
            .unwrap();
        assert_eq!(addr.port(), 7007);
        assert!(addr.ip().is_loopback());
    }
}
