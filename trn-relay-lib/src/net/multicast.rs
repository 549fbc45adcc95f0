#![forbid(unsafe_code)]

//! Multicast publish/subscribe loop.
//!
//! The publisher multicasts either a plain `MSG mid[i]` token or an
//! LCM-compatible envelope; when bidirectional, subscribers answer with
//! a unicast `PNG mid[n] cid[pid]` and the publisher acknowledges each
//! ping with a unicast `ACK`. Option policy (REUSEADDR/REUSEPORT,
//! loopback, TTL, group membership) lives in
//! [`crate::net::socket::multicast_socket`].

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{MsgErr, RelayError, Result};
use crate::net::socket::{multicast_socket, McastSocketOpts};
use crate::proto::text;

pub const MCAST_GROUP_DFL: &str = "239.255.0.16";
pub const MCAST_PORT_DFL: u16 = 29000;
pub const MCAST_LOCAL_PORT_DFL: u16 = 7070;
pub const MCAST_TTL_DFL: u32 = 32;
const MAX_DATA_BYTES: usize = 1024;
/// LCM envelope magic.
pub const LCM_MAGIC: [u8; 4] = *b"LC02";

#[derive(Debug, Clone)]
pub struct McastOptions {
    pub group: Ipv4Addr,
    pub mcast_port: u16,
    pub local_port: u16,
    pub ttl: u32,
    pub loopback: bool,
    /// Interface for sends and membership; UNSPECIFIED lets the routing
    /// table choose.
    pub iface: Ipv4Addr,
    pub bind_en: bool,
    /// Exchange PNG/ACK with the other side.
    pub bidir: bool,
    /// Wrap payloads in an LCM envelope on this channel name.
    pub lcm_channel: Option<String>,
    /// Iterations to run; negative means indefinite.
    pub cycles: i64,
    pub delay: Duration,
}

impl Default for McastOptions {
    fn default() -> Self {
        McastOptions {
            group: MCAST_GROUP_DFL.parse().unwrap_or(Ipv4Addr::new(239, 255, 0, 16)),
            mcast_port: MCAST_PORT_DFL,
            local_port: MCAST_LOCAL_PORT_DFL,
            ttl: MCAST_TTL_DFL,
            loopback: true,
            iface: Ipv4Addr::UNSPECIFIED,
            bind_en: true,
            bidir: false,
            lcm_channel: None,
            cycles: -1,
            delay: Duration::from_millis(500),
        }
    }
}

/// Encode `payload` in an LCM-compatible envelope: magic, sequence,
/// NUL-terminated channel name, payload length, payload.
pub fn lcm_encode(seq: u32, channel: &str, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 4 + channel.len() + 1 + 4 + payload.len());
    out.extend_from_slice(&LCM_MAGIC);
    out.extend_from_slice(&seq.to_ne_bytes());
    out.extend_from_slice(channel.as_bytes());
    out.push(0);
    out.extend_from_slice(&(payload.len() as u32).to_ne_bytes());
    out.extend_from_slice(payload);
    out
}

/// Decode an LCM envelope into (sequence, channel, payload).
pub fn lcm_decode(buf: &[u8]) -> Result<(u32, String, Vec<u8>)> {
    if buf.len() < 9 || buf[..4] != LCM_MAGIC {
        return Err(RelayError::Msg(MsgErr::Eparse));
    }
    let mut seq = [0u8; 4];
    seq.copy_from_slice(&buf[4..8]);
    let seq = u32::from_ne_bytes(seq);
    let rest = &buf[8..];
    let nul = rest
        .iter()
        .position(|b| *b == 0)
        .ok_or(RelayError::Msg(MsgErr::Eparse))?;
    let channel = String::from_utf8_lossy(&rest[..nul]).to_string();
    let rest = &rest[nul + 1..];
    if rest.len() < 4 {
        return Err(RelayError::Msg(MsgErr::Eparse));
    }
    let mut len = [0u8; 4];
    len.copy_from_slice(&rest[..4]);
    let len = u32::from_ne_bytes(len) as usize;
    if rest.len() < 4 + len {
        return Err(RelayError::Msg(MsgErr::Eparse));
    }
    Ok((seq, channel, rest[4..4 + len].to_vec()))
}

/// Multicast publisher loop. Returns the number of messages sent.
pub async fn run_pub(opts: McastOptions, mut shutdown: watch::Receiver<bool>) -> Result<u64> {
    let sock = multicast_socket(&McastSocketOpts {
        group: opts.group,
        port: opts.mcast_port,
        ttl: opts.ttl,
        loopback: opts.loopback,
        iface: opts.iface,
        bind_port: if opts.bind_en {
            Some(opts.local_port)
        } else {
            None
        },
    })?;
    let dest = SocketAddr::V4(SocketAddrV4::new(opts.group, opts.mcast_port));
    info!(group = %opts.group, port = opts.mcast_port, "mcast pub running");

    let pid = std::process::id() as i64;
    let mut sent = 0u64;
    let mut msg_n: i64 = 0;
    while !*shutdown.borrow_and_update() {
        if opts.cycles >= 0 && sent as i64 >= opts.cycles {
            break;
        }
        let payload = text::message(text::TOK_MSG, &[("mid", msg_n)]);
        let txbuf = match &opts.lcm_channel {
            Some(channel) => {
                // LCM payload carries just the pair, no MSG token
                let body = format!("mid[{msg_n}]");
                let mut body = body.into_bytes();
                body.push(0);
                lcm_encode(msg_n as u32, channel, &body)
            }
            None => payload,
        };
        msg_n += 1;
        match sock.send_to(&txbuf, dest).await {
            Ok(n) => {
                sent += 1;
                debug!(bytes = n, mid = msg_n - 1, "mcast tx");
            }
            Err(e) => warn!(error = %e, "mcast send failed"),
        }

        if opts.bidir {
            // drain subscriber pings, acknowledge each
            let mut rxbuf = [0u8; MAX_DATA_BYTES];
            loop {
                match sock.try_recv_from(&mut rxbuf) {
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        debug!(error = %e, "mcast reply drain failed");
                        break;
                    }
                    Ok((n, src)) => {
                        let msg = &rxbuf[..n];
                        if text::token(msg) == text::TOK_PNG {
                            let mid = text::parse_kv(msg, "mid").unwrap_or(-1);
                            let cid = text::parse_kv(msg, "cid").unwrap_or(-1);
                            let ack = text::message(
                                text::TOK_ACK,
                                &[("mid", mid), ("cid", cid), ("pid", pid)],
                            );
                            if let Err(e) = sock.send_to(&ack, src).await {
                                debug!(error = %e, %src, "ack send failed");
                            }
                        }
                    }
                }
            }
        }
        sleep(opts.delay).await;
    }
    info!(sent, "mcast pub done");
    Ok(sent)
}

/// Multicast subscriber loop. Returns the number of messages received.
pub async fn run_sub(opts: McastOptions, mut shutdown: watch::Receiver<bool>) -> Result<u64> {
    let sock = multicast_socket(&McastSocketOpts {
        group: opts.group,
        port: opts.mcast_port,
        ttl: opts.ttl,
        loopback: opts.loopback,
        iface: opts.iface,
        bind_port: if opts.bind_en {
            Some(opts.mcast_port)
        } else {
            None
        },
    })?;
    info!(group = %opts.group, port = opts.mcast_port, "mcast sub running");

    let pid = std::process::id() as i64;
    let mut received = 0u64;
    let mut rxbuf = [0u8; MAX_DATA_BYTES];
    while !*shutdown.borrow_and_update() {
        if opts.cycles >= 0 && received as i64 >= opts.cycles {
            break;
        }
        let (n, src) = match sock.try_recv_from(&mut rxbuf) {
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                sleep(opts.delay).await;
                continue;
            }
            Err(e) => {
                warn!(error = %e, "mcast recv failed");
                sleep(opts.delay).await;
                continue;
            }
            Ok(pair) => pair,
        };

        let msg = &rxbuf[..n];
        let mid = match (&opts.lcm_channel, text::token(msg)) {
            (Some(_), _) if msg.starts_with(&LCM_MAGIC) => match lcm_decode(msg) {
                Ok((_, _, payload)) => text::parse_kv(&payload, "mid").unwrap_or(-1),
                Err(_) => continue,
            },
            (None, tok) if tok == text::TOK_MSG => text::parse_kv(msg, "mid").unwrap_or(-1),
            _ => continue,
        };
        received += 1;
        debug!(mid, %src, "mcast rx");

        if opts.bidir {
            let png = text::message(text::TOK_PNG, &[("mid", mid), ("cid", pid)]);
            if let Err(e) = sock.send_to(&png, src).await {
                debug!(error = %e, "png send failed");
                continue;
            }
            // read the publisher's ACK; bounded poll
            for _ in 0..10 {
                match sock.try_recv_from(&mut rxbuf) {
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        sleep(Duration::from_millis(10)).await;
                    }
                    Err(_) => break,
                    Ok((n, _)) => {
                        if text::token(&rxbuf[..n]) == text::TOK_ACK {
                            debug!(
                                mid = text::parse_kv(&rxbuf[..n], "mid").unwrap_or(-1),
                                "ack rx"
                            );
                        }
                        break;
                    }
                }
            }
        }
    }
    info!(received, "mcast sub done");
    Ok(received)
}
