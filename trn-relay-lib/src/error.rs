use thiserror::Error;

/// Errors that can occur in the relay
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Frame error: {0}")]
    Frame(String),

    #[error("Socket error: {0}")]
    Socket(String),

    #[error("Message error: {0}")]
    Msg(#[from] MsgErr),

    #[error("No ports configured")]
    NoPorts,
}

pub type Result<T> = std::result::Result<T, RelayError>;

/// Message/framing error kinds carried alongside byte counts by the
/// framing layer and the port loop. `Epipe` is the eviction trigger.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgErr {
    #[error("invalid argument")]
    Einval,
    #[error("parse error")]
    Eparse,
    #[error("checksum mismatch")]
    Echk,
    #[error("read timeout")]
    Etmout,
    #[error("terminal socket error")]
    Esock,
    #[error("end of stream")]
    Eof,
    #[error("recv error")]
    Erecv,
    #[error("read error")]
    Eread,
    #[error("write error")]
    Ewrite,
    #[error("protocol violation")]
    Eproto,
    #[error("allocation failure")]
    Enomem,
    #[error("peer closed (broken pipe)")]
    Epipe,
    #[error("no data available")]
    Enodata,
}

impl MsgErr {
    /// Map an I/O error from a socket read to a message error kind.
    /// `WouldBlock` is normal control flow (no data this cycle); the
    /// kinds listed under the socket branch imply the peer is gone.
    pub fn from_read_err(e: &std::io::Error) -> MsgErr {
        use std::io::ErrorKind::*;
        match e.kind() {
            WouldBlock => MsgErr::Enodata,
            TimedOut => MsgErr::Etmout,
            UnexpectedEof => MsgErr::Eof,
            ConnectionReset | ConnectionAborted | NotConnected | NotFound | InvalidInput => {
                MsgErr::Esock
            }
            BrokenPipe => MsgErr::Epipe,
            _ => MsgErr::Eread,
        }
    }

    /// Map an I/O error from a socket write. Broken pipe surfaces as
    /// `Epipe` so the port loop evicts the peer.
    pub fn from_write_err(e: &std::io::Error) -> MsgErr {
        use std::io::ErrorKind::*;
        match e.kind() {
            BrokenPipe | ConnectionReset | ConnectionAborted => MsgErr::Epipe,
            TimedOut => MsgErr::Etmout,
            _ => MsgErr::Ewrite,
        }
    }
}
