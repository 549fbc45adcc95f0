#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::time::Instant;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::error::MsgErr;

/// One remote endpoint tracked by a port.
///
/// TCP peers own their accepted stream; UDP peers are address-only and
/// are serviced through the port's own socket. `hbtime` is the wall
/// clock of the last activity and drives heartbeat expiry.
#[derive(Debug)]
pub struct Peer {
    /// Stable lookup key: the numeric service (peer port) number.
    pub id: u32,
    pub addr: SocketAddr,
    /// Peer host as a numeric string.
    pub chost: String,
    /// Peer service (port) as a decimal string.
    pub service: String,
    pub sock: Option<TcpStream>,
    pub hbtime: Instant,
}

impl Peer {
    /// A UDP peer discovered from a recvfrom source address.
    pub fn from_addr(addr: SocketAddr) -> Peer {
        let mut peer = Peer {
            id: 0,
            addr,
            chost: String::new(),
            service: String::new(),
            sock: None,
            hbtime: Instant::now(),
        };
        peer.addr2str();
        peer
    }

    /// A TCP peer wrapping an accepted stream.
    pub fn from_stream(stream: TcpStream, addr: SocketAddr) -> Peer {
        let mut peer = Peer::from_addr(addr);
        peer.sock = Some(stream);
        peer
    }

    /// Fill the string host/service fields from the address and return
    /// the numeric service id, which is the list lookup key.
    pub fn addr2str(&mut self) -> u32 {
        self.chost = self.addr.ip().to_string();
        self.service = self.addr.port().to_string();
        self.id = self.addr.port() as u32;
        self.id
    }

    pub fn touch(&mut self) {
        self.hbtime = Instant::now();
    }

    /// Send a reply over the peer's own stream (TCP protocols only).
    pub async fn send(&mut self, data: &[u8]) -> Result<usize, MsgErr> {
        let sock = self.sock.as_mut().ok_or(MsgErr::Einval)?;
        sock.write_all(data)
            .await
            .map_err(|e| MsgErr::from_write_err(&e))?;
        Ok(data.len())
    }
}

/// Insertion-ordered set of peers for one port. Iteration order is
/// arrival order; removal drops the peer record and its socket.
#[derive(Debug, Default)]
pub struct PeerList {
    peers: Vec<Peer>,
}

impl PeerList {
    pub fn new() -> PeerList {
        PeerList::default()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn push(&mut self, peer: Peer) {
        self.peers.push(peer);
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Peer> {
        self.peers.get_mut(idx)
    }

    pub fn remove(&mut self, idx: usize) -> Peer {
        self.peers.remove(idx)
    }

    /// Lookup by the stable id (numeric service number).
    pub fn find_by_id(&mut self, id: u32) -> Option<&mut Peer> {
        self.peers.iter_mut().find(|p| p.id == id)
    }

    pub fn position_by_id(&self, id: u32) -> Option<usize> {
        self.peers.iter().position(|p| p.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter()
    }
}
