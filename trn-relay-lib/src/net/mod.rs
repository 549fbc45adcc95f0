#![forbid(unsafe_code)]

pub mod addr;
pub mod multicast;
pub mod peer;
pub mod port;
pub mod socket;

pub use addr::TargetAddr;
pub use peer::{Peer, PeerList};
pub use port::{CType, Port, PortCtx, PortMode, PortProtocol, PortSettings};
