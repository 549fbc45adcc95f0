#![forbid(unsafe_code)]

//! Socket lifecycle helpers.
//!
//! Plain TCP/UDP binds go straight through tokio; multicast sockets are
//! built with socket2 first because the group/reuse options must be set
//! before the bind.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::{timeout_at, Instant};

use crate::error::{MsgErr, RelayError, Result};

pub async fn bind_tcp(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| RelayError::Socket(format!("tcp bind {addr} failed: {e}")))
}

pub async fn bind_udp(addr: SocketAddr) -> Result<UdpSocket> {
    UdpSocket::bind(addr)
        .await
        .map_err(|e| RelayError::Socket(format!("udp bind {addr} failed: {e}")))
}

/// Multicast socket options shared by the PUB and SUB sides.
#[derive(Debug, Clone)]
pub struct McastSocketOpts {
    pub group: Ipv4Addr,
    pub port: u16,
    pub ttl: u32,
    pub loopback: bool,
    /// Interface for sends and group membership; UNSPECIFIED lets the
    /// routing table choose.
    pub iface: Ipv4Addr,
    /// Local port to bind, or None to leave the socket unbound (the OS
    /// assigns an ephemeral port on first send).
    pub bind_port: Option<u16>,
}

/// Build a multicast-ready UDP socket: REUSEADDR/REUSEPORT, multicast
/// interface/loop/TTL, group membership, optional bind, non-blocking.
pub fn multicast_socket(opts: &McastSocketOpts) -> Result<UdpSocket> {
    let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| RelayError::Socket(format!("udp socket create failed: {e}")))?;
    sock.set_reuse_address(true)
        .map_err(|e| RelayError::Socket(format!("SO_REUSEADDR failed: {e}")))?;
    #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
    sock.set_reuse_port(true)
        .map_err(|e| RelayError::Socket(format!("SO_REUSEPORT failed: {e}")))?;
    sock.set_multicast_if_v4(&opts.iface)
        .map_err(|e| RelayError::Socket(format!("IP_MULTICAST_IF failed: {e}")))?;
    sock.set_multicast_loop_v4(opts.loopback)
        .map_err(|e| RelayError::Socket(format!("IP_MULTICAST_LOOP failed: {e}")))?;
    sock.set_multicast_ttl_v4(opts.ttl)
        .map_err(|e| RelayError::Socket(format!("IP_MULTICAST_TTL failed: {e}")))?;
    sock.join_multicast_v4(&opts.group, &opts.iface)
        .map_err(|e| RelayError::Socket(format!("IP_ADD_MEMBERSHIP failed: {e}")))?;
    if let Some(port) = opts.bind_port {
        let bind = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
        sock.bind(&bind.into())
            .map_err(|e| RelayError::Socket(format!("mcast bind {bind} failed: {e}")))?;
    }
    sock.set_nonblocking(true)
        .map_err(|e| RelayError::Socket(format!("set_nonblocking failed: {e}")))?;
    let std_sock: std::net::UdpSocket = sock.into();
    UdpSocket::from_std(std_sock)
        .map_err(|e| RelayError::Socket(format!("udp socket register failed: {e}")))
}

/// Bounded-blocking read: keep reading until `buf` is full, the
/// deadline expires, or a terminal socket condition. Returns the bytes
/// collected plus the error kind that ended a short read.
pub async fn read_tmout(
    stream: &mut TcpStream,
    buf: &mut [u8],
    tmout: Duration,
) -> (usize, Option<MsgErr>) {
    let deadline = Instant::now() + tmout;
    let mut got = 0usize;
    while got < buf.len() {
        match timeout_at(deadline, stream.read(&mut buf[got..])).await {
            Err(_) => return (got, Some(MsgErr::Etmout)),
            Ok(Ok(0)) => return (got, Some(MsgErr::Eof)),
            Ok(Ok(n)) => got += n,
            Ok(Err(e)) => return (got, Some(MsgErr::from_read_err(&e))),
        }
    }
    (got, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn read_tmout_collects_full_buffer() {
        let listener = bind_tcp("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut s = TcpStream::connect(addr).await.unwrap();
            s.write_all(b"hello").await.unwrap();
            // second chunk after a pause, still inside the deadline
            tokio::time::sleep(Duration::from_millis(20)).await;
            s.write_all(b" world").await.unwrap();
            s
        });

        let (mut server, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 11];
        let (n, err) = read_tmout(&mut server, &mut buf, Duration::from_millis(500)).await;
        assert_eq!(n, 11);
        assert_eq!(err, None);
        assert_eq!(&buf, b"hello world");
        let _ = client.await.unwrap();
    }

    #[tokio::test]
    async fn read_tmout_reports_expiry_with_partial_bytes() {
        let listener = bind_tcp("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut s = TcpStream::connect(addr).await.unwrap();
            s.write_all(b"abc").await.unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;
            s
        });

        let (mut server, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 16];
        let (n, err) = read_tmout(&mut server, &mut buf, Duration::from_millis(60)).await;
        assert_eq!(n, 3);
        assert_eq!(err, Some(MsgErr::Etmout));
        let _ = client.await.unwrap();
    }

    #[tokio::test]
    async fn read_tmout_reports_orderly_close() {
        let listener = bind_tcp("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut s = TcpStream::connect(addr).await.unwrap();
            s.write_all(b"bye").await.unwrap();
            // drop closes the stream
        });

        let (mut server, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 8];
        let (n, err) = read_tmout(&mut server, &mut buf, Duration::from_millis(500)).await;
        assert_eq!(n, 3);
        assert_eq!(err, Some(MsgErr::Eof));
    }

    #[test]
    fn multicast_socket_builds_with_options() {
        let opts = McastSocketOpts {
            group: "239.255.0.16".parse().unwrap(),
            port: 29000,
            ttl: 3,
            loopback: true,
            iface: Ipv4Addr::LOCALHOST,
            bind_port: Some(0),
        };
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()
            .unwrap();
        let _guard = rt.enter();
        let sock = multicast_socket(&opts).unwrap();
        assert!(sock.local_addr().is_ok());
    }
}
