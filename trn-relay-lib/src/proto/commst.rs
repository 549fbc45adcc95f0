#![forbid(unsafe_code)]

//! Legacy commsT request/response protocol.
//!
//! Every message is one fixed-size host-order blob whose first byte is
//! a one-character type code; the rest is the serialized parameter /
//! pose / measurement state. There is no sync mechanism: the writer is
//! trusted to emit whole `msg_size` blocks, and the reader collects a
//! block with a bounded retry loop once the first bytes arrive.

use std::time::Duration;

use bytes::BytesMut;
use tokio::net::TcpStream;
use tokio::time::sleep;

use crate::error::MsgErr;
use crate::trn::{Measurement, PoseData};

/// Default fixed message size on the wire.
pub const TRN_MSG_SIZE: usize = 8192;
const OFF_TYPE: usize = 0;
const OFF_PARAMETER: usize = 4;
const OFF_VDR: usize = 8;
const OFF_EST: usize = 16;
const OFF_MEAS: usize = 104;
/// Fixed region before the variable measurement beams.
pub const COMMST_MIN_BYTES: usize = OFF_MEAS + 20;

/// One-character message type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommstType {
    Init = b'I',
    Meas = b'M',
    Motn = b'N',
    Mle = b'E',
    Mmse = b'S',
    Ack = b'+',
    Nack = b'-',
    Ping = b'P',
    LastMeas = b'L',
    NReinits = b'R',
    FiltType = b'T',
    FiltState = b'H',
    OutMeas = b'O',
    IsConv = b'C',
    IsInit = b'i',
    FiltReinit = b'F',
    SetMw = b'W',
    SetFr = b'f',
    SetIma = b'A',
    SetMim = b'm',
    SetVdr = b'V',
    FiltGrd = b'G',
}

impl CommstType {
    pub fn from_u8(v: u8) -> Option<CommstType> {
        use CommstType::*;
        let t = match v {
            b'I' => Init,
            b'M' => Meas,
            b'N' => Motn,
            b'E' => Mle,
            b'S' => Mmse,
            b'+' => Ack,
            b'-' => Nack,
            b'P' => Ping,
            b'L' => LastMeas,
            b'R' => NReinits,
            b'T' => FiltType,
            b'H' => FiltState,
            b'O' => OutMeas,
            b'C' => IsConv,
            b'i' => IsInit,
            b'F' => FiltReinit,
            b'W' => SetMw,
            b'f' => SetFr,
            b'A' => SetIma,
            b'm' => SetMim,
            b'V' => SetVdr,
            b'G' => FiltGrd,
            _ => return None,
        };
        Some(t)
    }
}

/// Decoded commsT state blob.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommstMsg {
    pub msg_type: u8,
    pub parameter: i32,
    pub vdr: f64,
    pub est: PoseData,
    pub meas: Measurement,
}

impl CommstMsg {
    pub fn of_type(t: CommstType) -> CommstMsg {
        CommstMsg {
            msg_type: t as u8,
            ..Default::default()
        }
    }

    /// ACK/NACK-style message with the parameter field set.
    pub fn ptype(t: CommstType, parameter: i32) -> CommstMsg {
        CommstMsg {
            msg_type: t as u8,
            parameter,
            ..Default::default()
        }
    }

    pub fn msg_type(&self) -> Option<CommstType> {
        CommstType::from_u8(self.msg_type)
    }

    /// Serialize into a zero-padded `msg_size` blob.
    pub fn serialize(&self, msg_size: usize) -> Result<Vec<u8>, MsgErr> {
        if COMMST_MIN_BYTES + self.meas.wire_len() - 20 > msg_size {
            return Err(MsgErr::Einval);
        }
        let mut out = Vec::with_capacity(msg_size);
        out.push(self.msg_type);
        out.extend_from_slice(&[0u8; 3]);
        out.extend_from_slice(&self.parameter.to_ne_bytes());
        out.extend_from_slice(&self.vdr.to_ne_bytes());
        for v in [
            self.est.time,
            self.est.x,
            self.est.y,
            self.est.z,
            self.est.phi,
            self.est.theta,
            self.est.psi,
        ] {
            out.extend_from_slice(&v.to_ne_bytes());
        }
        for v in self.est.covariance {
            out.extend_from_slice(&v.to_ne_bytes());
        }
        self.meas.write_to(&mut out);
        out.resize(msg_size, 0);
        Ok(out)
    }

    /// Decode a blob; tolerates blobs shorter than the nominal size as
    /// long as the fixed region and the declared beams are present.
    pub fn deserialize(buf: &[u8]) -> Result<CommstMsg, MsgErr> {
        if buf.len() < COMMST_MIN_BYTES {
            return Err(MsgErr::Eparse);
        }
        let f64_at = |off: usize| {
            let mut a = [0u8; 8];
            a.copy_from_slice(&buf[off..off + 8]);
            f64::from_ne_bytes(a)
        };
        let i32_at = |off: usize| {
            let mut a = [0u8; 4];
            a.copy_from_slice(&buf[off..off + 4]);
            i32::from_ne_bytes(a)
        };
        let est = PoseData {
            time: f64_at(OFF_EST),
            x: f64_at(OFF_EST + 8),
            y: f64_at(OFF_EST + 16),
            z: f64_at(OFF_EST + 24),
            phi: f64_at(OFF_EST + 32),
            theta: f64_at(OFF_EST + 40),
            psi: f64_at(OFF_EST + 48),
            covariance: [
                f64_at(OFF_EST + 56),
                f64_at(OFF_EST + 64),
                f64_at(OFF_EST + 72),
                f64_at(OFF_EST + 80),
            ],
        };
        let (meas, _) = Measurement::read_from(&buf[OFF_MEAS..]).ok_or(MsgErr::Eparse)?;
        Ok(CommstMsg {
            msg_type: buf[OFF_TYPE],
            parameter: i32_at(OFF_PARAMETER),
            vdr: f64_at(OFF_VDR),
            est,
            meas,
        })
    }
}

/// Reader tuning; the retry loop covers writers that chunk the blob.
#[derive(Debug, Clone)]
pub struct CommstOptions {
    pub msg_size: usize,
    pub retries: u32,
    pub delay: Duration,
}

impl Default for CommstOptions {
    fn default() -> Self {
        CommstOptions {
            msg_size: TRN_MSG_SIZE,
            retries: 40,
            delay: Duration::from_millis(10),
        }
    }
}

/// Collect one `msg_size` blob from a non-blocking stream.
///
/// If the very first read yields nothing, there is no message this
/// cycle (`Ok(None)`). Once any bytes arrive, keep reading the
/// remaining suffix with brief delays until the blob is complete or the
/// retries expire; a short blob is returned as-is and left to the
/// handler to reject.
pub async fn read_msg(
    stream: &TcpStream,
    opts: &CommstOptions,
) -> Result<Option<BytesMut>, MsgErr> {
    let mut buf = BytesMut::zeroed(opts.msg_size);
    let mut got = 0usize;
    let mut retries = 0u32;

    while retries < opts.retries && got < opts.msg_size {
        match stream.try_read(&mut buf[got..]) {
            Ok(0) => {
                if got == 0 {
                    return Err(MsgErr::Eof);
                }
                break;
            }
            Ok(n) => got += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if got == 0 && retries == 0 {
                    return Ok(None);
                }
            }
            Err(e) => return Err(MsgErr::from_read_err(&e)),
        }
        if got >= opts.msg_size {
            break;
        }
        sleep(opts.delay).await;
        retries += 1;
    }

    if got == 0 {
        return Ok(None);
    }
    buf.truncate(got);
    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trn::MeasBeam;

    #[test]
    fn blob_round_trips_at_fixed_size() {
        let msg = CommstMsg {
            msg_type: CommstType::Meas as u8,
            parameter: 3,
            vdr: 0.01,
            est: PoseData {
                time: 5.0,
                x: 1.0,
                y: 2.0,
                z: 3.0,
                phi: 0.1,
                theta: 0.2,
                psi: 0.3,
                covariance: [1.0, 0.0, 0.0, 1.0],
            },
            meas: Measurement {
                time: 6.0,
                data_type: 1,
                ping_number: 77,
                beams: vec![MeasBeam {
                    beam_num: 4,
                    range: 55.5,
                    cross: 1.0,
                    along: -1.0,
                    altitude: 55.0,
                }],
            },
        };
        let wire = msg.serialize(TRN_MSG_SIZE).unwrap();
        assert_eq!(wire.len(), TRN_MSG_SIZE);
        assert_eq!(wire[0], b'M');
        let back = CommstMsg::deserialize(&wire).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.msg_type(), Some(CommstType::Meas));
    }

    #[test]
    fn unknown_type_codes_surface_as_none() {
        let blob = CommstMsg::ptype(CommstType::Ack, 1)
            .serialize(TRN_MSG_SIZE)
            .unwrap();
        let mut blob = blob;
        blob[0] = b'?';
        let msg = CommstMsg::deserialize(&blob).unwrap();
        assert_eq!(msg.msg_type(), None);
        assert_eq!(msg.parameter, 1);
    }

    #[test]
    fn truncated_blobs_are_rejected() {
        let wire = CommstMsg::of_type(CommstType::Ping)
            .serialize(TRN_MSG_SIZE)
            .unwrap();
        assert_eq!(
            CommstMsg::deserialize(&wire[..COMMST_MIN_BYTES - 1]),
            Err(MsgErr::Eparse)
        );
        // fixed region intact but declared beams missing
        let mut short = wire[..COMMST_MIN_BYTES].to_vec();
        short[OFF_MEAS + 16] = 2; // claim two beams
        assert_eq!(CommstMsg::deserialize(&short), Err(MsgErr::Eparse));
    }

    #[test]
    fn oversized_measurement_fails_serialize() {
        let msg = CommstMsg {
            msg_type: CommstType::Meas as u8,
            meas: Measurement {
                beams: vec![MeasBeam::default(); 1000],
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(msg.serialize(1024), Err(MsgErr::Einval));
    }
}
