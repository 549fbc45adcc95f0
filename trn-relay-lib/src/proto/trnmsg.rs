#![forbid(unsafe_code)]

//! Framed TRN message protocol.
//!
//! Wire format: `[sync 4][msg_id u16][reserved u16][data_len u32]
//! [checksum u32][data]`, everything in host order. The checksum is the
//! unsigned byte sum of the data field only. The reader resynchronizes
//! on stream corruption by matching the sync pattern one byte at a
//! time.

use bytes::BytesMut;
use tokio::net::TcpStream;

use crate::error::MsgErr;
use crate::frame::bytesutil::checksum;

/// Compile-time sync pattern prefixed to every frame.
pub const TRNMSG_SYNC: [u8; 4] = *b"TRN\0";
pub const TRNMSG_SYNC_LEN: usize = 4;
/// Full header: sync plus the four fixed fields.
pub const TRNMSG_HDR_LEN: usize = 16;
/// Upper bound on the data field; larger claims are corruption.
pub const TRNMSG_MAX_DATA: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TrnMsgId {
    Ping = 1,
    Ack = 2,
    Nack = 3,
    Meas = 4,
    Motn = 5,
    Mle = 6,
    Mmse = 7,
}

impl TrnMsgId {
    pub fn from_u16(v: u16) -> Option<TrnMsgId> {
        match v {
            1 => Some(TrnMsgId::Ping),
            2 => Some(TrnMsgId::Ack),
            3 => Some(TrnMsgId::Nack),
            4 => Some(TrnMsgId::Meas),
            5 => Some(TrnMsgId::Motn),
            6 => Some(TrnMsgId::Mle),
            7 => Some(TrnMsgId::Mmse),
            _ => None,
        }
    }
}

/// A decoded frame: id plus owned data payload.
#[derive(Debug, Clone, PartialEq)]
pub struct TrnMsg {
    pub msg_id: u16,
    pub reserved: u16,
    pub data: Vec<u8>,
}

impl TrnMsg {
    pub fn new(msg_id: TrnMsgId, data: Vec<u8>) -> TrnMsg {
        TrnMsg {
            msg_id: msg_id as u16,
            reserved: 0,
            data,
        }
    }

    /// A frame whose data is a single u32 parameter (PING/ACK/NACK).
    pub fn with_param(msg_id: TrnMsgId, param: u32) -> TrnMsg {
        TrnMsg::new(msg_id, param.to_ne_bytes().to_vec())
    }

    pub fn id(&self) -> Option<TrnMsgId> {
        TrnMsgId::from_u16(self.msg_id)
    }

    pub fn param(&self) -> Option<u32> {
        if self.data.len() < 4 {
            return None;
        }
        let mut a = [0u8; 4];
        a.copy_from_slice(&self.data[..4]);
        Some(u32::from_ne_bytes(a))
    }

    pub fn len(&self) -> usize {
        TRNMSG_HDR_LEN + self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        out.extend_from_slice(&TRNMSG_SYNC);
        out.extend_from_slice(&self.msg_id.to_ne_bytes());
        out.extend_from_slice(&self.reserved.to_ne_bytes());
        out.extend_from_slice(&(self.data.len() as u32).to_ne_bytes());
        out.extend_from_slice(&checksum(&self.data).to_ne_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    /// Decode a frame starting at its sync pattern. Validates sync,
    /// length, and data checksum.
    pub fn deserialize(buf: &[u8]) -> Result<TrnMsg, MsgErr> {
        if buf.len() < TRNMSG_HDR_LEN || buf[..TRNMSG_SYNC_LEN] != TRNMSG_SYNC {
            return Err(MsgErr::Eparse);
        }
        let u16_at = |off: usize| {
            let mut a = [0u8; 2];
            a.copy_from_slice(&buf[off..off + 2]);
            u16::from_ne_bytes(a)
        };
        let u32_at = |off: usize| {
            let mut a = [0u8; 4];
            a.copy_from_slice(&buf[off..off + 4]);
            u32::from_ne_bytes(a)
        };
        let msg_id = u16_at(4);
        let reserved = u16_at(6);
        let data_len = u32_at(8) as usize;
        let chk = u32_at(12);
        if data_len > TRNMSG_MAX_DATA || buf.len() < TRNMSG_HDR_LEN + data_len {
            return Err(MsgErr::Eparse);
        }
        let data = buf[TRNMSG_HDR_LEN..TRNMSG_HDR_LEN + data_len].to_vec();
        if checksum(&data) != chk {
            return Err(MsgErr::Echk);
        }
        Ok(TrnMsg {
            msg_id,
            reserved,
            data,
        })
    }
}

fn is_would_block(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::WouldBlock
}

/// Read one framed message from a non-blocking stream.
///
/// State machine: match the sync pattern byte-by-byte (restarting the
/// match on a mismatched byte), read the rest of the header, read
/// `data_len` payload bytes, then verify the checksum. `WouldBlock`
/// anywhere yields `Enodata` for this cycle; any other read error
/// restarts the sync scan. A checksum mismatch consumes the frame but
/// reports `Echk`.
pub fn read_msg(stream: &TcpStream) -> Result<BytesMut, MsgErr> {
    'resync: loop {
        // SYNC: stateful byte-at-a-time match
        let mut matched = 0usize;
        while matched < TRNMSG_SYNC_LEN {
            let mut b = [0u8; 1];
            match stream.try_read(&mut b) {
                Ok(0) => return Err(MsgErr::Eof),
                Ok(_) => {
                    if b[0] == TRNMSG_SYNC[matched] {
                        matched += 1;
                    } else {
                        matched = 0;
                    }
                }
                Err(e) if is_would_block(&e) => return Err(MsgErr::Enodata),
                Err(e) => return Err(MsgErr::from_read_err(&e)),
            }
        }

        // SYNC_OK: remaining header bytes
        let mut hdr = [0u8; TRNMSG_HDR_LEN - TRNMSG_SYNC_LEN];
        let mut got = 0usize;
        while got < hdr.len() {
            match stream.try_read(&mut hdr[got..]) {
                Ok(0) => return Err(MsgErr::Eof),
                Ok(n) => got += n,
                Err(e) if is_would_block(&e) => return Err(MsgErr::Enodata),
                Err(_) => continue 'resync,
            }
        }
        let mut a = [0u8; 4];
        a.copy_from_slice(&hdr[4..8]);
        let data_len = u32::from_ne_bytes(a) as usize;
        a.copy_from_slice(&hdr[8..12]);
        let chk = u32::from_ne_bytes(a);
        if data_len > TRNMSG_MAX_DATA {
            // corrupt length claim; hunt for the next frame
            continue 'resync;
        }

        // HDR_OK: data (zero-length is legal)
        let mut data = vec![0u8; data_len];
        let mut got = 0usize;
        while got < data_len {
            match stream.try_read(&mut data[got..]) {
                Ok(0) => return Err(MsgErr::Eof),
                Ok(n) => got += n,
                Err(e) if is_would_block(&e) => return Err(MsgErr::Enodata),
                Err(_) => continue 'resync,
            }
        }

        // DATA_OK: verify checksum over the data field
        if checksum(&data) != chk {
            return Err(MsgErr::Echk);
        }

        let mut frame = BytesMut::with_capacity(TRNMSG_HDR_LEN + data_len);
        frame.extend_from_slice(&TRNMSG_SYNC);
        frame.extend_from_slice(&hdr);
        frame.extend_from_slice(&data);
        return Ok(frame);
    }
}
