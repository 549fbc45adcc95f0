#![forbid(unsafe_code)]

//! Record reader for MB1 log streams.
//!
//! An MB1 log is nothing but concatenated records, so recovering from
//! corruption means scanning byte-by-byte for the `'M'` that starts the
//! type tag, then validating the assembled header before committing to
//! the rest of the record. Skipped bytes are tallied in `lost_bytes`.

use std::io::Read;

use tracing::{debug, warn};

use crate::error::{MsgErr, RelayError, Result};
use crate::frame::mb1::{
    mb1_frame_bytes, Mb1Frame, ZeroFlags, MB1_CHECKSUM_BYTES, MB1_HEADER_BYTES, MB1_MAX_BEAMS,
    MB1_TYPE_ID,
};

fn hdr_u32(b: &[u8], off: usize) -> u32 {
    let mut a = [0u8; 4];
    a.copy_from_slice(&b[off..off + 4]);
    u32::from_ne_bytes(a)
}

pub struct Mb1StreamReader {
    frame: Mb1Frame,
    lost_bytes: u64,
    strict: bool,
}

impl Default for Mb1StreamReader {
    fn default() -> Self {
        Self::new()
    }
}

impl Mb1StreamReader {
    pub fn new() -> Mb1StreamReader {
        Mb1StreamReader {
            // reuse one frame allocation across records
            frame: Mb1Frame::empty(),
            lost_bytes: 0,
            strict: false,
        }
    }

    /// When set, a checksum mismatch is surfaced as [`MsgErr::Echk`]
    /// instead of the default log-and-deliver behavior.
    pub fn strict(mut self, on: bool) -> Mb1StreamReader {
        self.strict = on;
        self
    }

    /// The most recently read record.
    pub fn frame(&self) -> &Mb1Frame {
        &self.frame
    }

    /// Bytes skipped while hunting for record boundaries, cumulative.
    pub fn lost_bytes(&self) -> u64 {
        self.lost_bytes
    }

    /// Read the next record from `src`, resynchronizing on `'M'` if the
    /// stream does not start on a record boundary. Returns the record
    /// length consumed; the record itself is available via [`frame`].
    ///
    /// A failed type-tag or size check after sync costs the header bytes
    /// (counted lost) and returns [`MsgErr::Eparse`]; end of stream
    /// before a complete header returns [`MsgErr::Eof`].
    ///
    /// [`frame`]: Mb1StreamReader::frame
    pub fn read_frame<R: Read>(&mut self, src: &mut R) -> Result<usize> {
        // sync: scan for the first byte of the type tag
        let mut b = [0u8; 1];
        loop {
            match src.read(&mut b) {
                Ok(0) => return Err(RelayError::Msg(MsgErr::Eof)),
                Ok(_) => {
                    if b[0] == b'M' {
                        break;
                    }
                    self.lost_bytes += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        // header: the remaining fixed bytes, then validate the tag
        let mut hdr = [0u8; MB1_HEADER_BYTES];
        hdr[0] = b'M';
        src.read_exact(&mut hdr[1..]).map_err(eof_or_io)?;

        let rtype = hdr_u32(&hdr, 0);
        if rtype != MB1_TYPE_ID {
            self.lost_bytes += MB1_HEADER_BYTES as u64;
            debug!(rtype = format!("0x{rtype:08X}"), "record type mismatch");
            return Err(RelayError::Msg(MsgErr::Eparse));
        }
        let size = hdr_u32(&hdr, 4) as usize;
        let nbeams = hdr_u32(&hdr, 52);
        if nbeams > MB1_MAX_BEAMS || size != mb1_frame_bytes(nbeams) {
            self.lost_bytes += MB1_HEADER_BYTES as u64;
            debug!(size, nbeams, "inconsistent record header");
            return Err(RelayError::Msg(MsgErr::Eparse));
        }

        // resize the working frame, keep the header just read
        self.frame.resize(nbeams, ZeroFlags::NONE)?;
        self.frame.bytes_mut()[..MB1_HEADER_BYTES].copy_from_slice(&hdr);

        // payload + trailing checksum
        let payload_end = size - MB1_CHECKSUM_BYTES;
        {
            let bytes = self.frame.bytes_mut();
            src.read_exact(&mut bytes[MB1_HEADER_BYTES..payload_end])
                .map_err(eof_or_io)?;
            src.read_exact(&mut bytes[payload_end..size])
                .map_err(eof_or_io)?;
        }

        if !self.frame.validate_checksum() {
            warn!(
                expected = self.frame.calc_checksum(),
                stored = self.frame.stored_checksum(),
                ping = self.frame.ping_number(),
                "mb1 checksum mismatch"
            );
            if self.strict {
                return Err(RelayError::Msg(MsgErr::Echk));
            }
        }

        Ok(size)
    }
}

fn eof_or_io(e: std::io::Error) -> RelayError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        RelayError::Msg(MsgErr::Eof)
    } else {
        e.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::mb1::Mb1Beam;
    use std::io::Cursor;

    fn record(ping: i32, nbeams: u32) -> Mb1Frame {
        let mut f = Mb1Frame::new(nbeams).unwrap();
        f.set_ts(1_000_000.0 + ping as f64);
        f.set_lat(36.8);
        f.set_lon(-122.0);
        f.set_ping_number(ping);
        for i in 0..nbeams {
            f.set_beam(
                i,
                Mb1Beam {
                    beam_num: i,
                    rhox: i as f64,
                    rhoy: -(i as f64),
                    rhoz: 50.0 + i as f64,
                },
            )
            .unwrap();
        }
        f.set_checksum();
        f
    }

    #[test]
    fn reads_concatenated_records_byte_identical() {
        let a = record(1, 4);
        let b = record(2, 0);
        let mut stream = Vec::new();
        stream.extend_from_slice(a.as_bytes());
        stream.extend_from_slice(b.as_bytes());

        let mut rdr = Mb1StreamReader::new();
        let mut cur = Cursor::new(stream);

        let n = rdr.read_frame(&mut cur).unwrap();
        assert_eq!(n, a.size());
        assert_eq!(rdr.frame().as_bytes(), a.as_bytes());

        let n = rdr.read_frame(&mut cur).unwrap();
        assert_eq!(n, b.size());
        assert_eq!(rdr.frame().as_bytes(), b.as_bytes());
        assert_eq!(rdr.lost_bytes(), 0);

        assert!(matches!(
            rdr.read_frame(&mut cur),
            Err(RelayError::Msg(MsgErr::Eof))
        ));
    }

    #[test]
    fn resyncs_over_leading_garbage() {
        let a = record(3, 2);
        let mut stream = vec![0xFFu8, 0xFF];
        stream.extend_from_slice(a.as_bytes());

        let mut rdr = Mb1StreamReader::new();
        let mut cur = Cursor::new(stream);
        let n = rdr.read_frame(&mut cur).unwrap();
        assert_eq!(n, a.size());
        assert_eq!(rdr.lost_bytes(), 2);
        assert_eq!(rdr.frame().as_bytes(), a.as_bytes());
    }

    #[test]
    fn bad_tag_after_sync_costs_header() {
        // 'M' followed by a non-MB1 tag
        let mut stream = vec![b'M'];
        stream.extend_from_slice(&[b'X'; 60]);

        let mut rdr = Mb1StreamReader::new();
        let mut cur = Cursor::new(stream);
        assert!(matches!(
            rdr.read_frame(&mut cur),
            Err(RelayError::Msg(MsgErr::Eparse))
        ));
        assert_eq!(rdr.lost_bytes(), MB1_HEADER_BYTES as u64);
    }

    #[test]
    fn checksum_mismatch_is_permissive_by_default() {
        let a = record(4, 1);
        let mut bytes = a.as_bytes().to_vec();
        let corrupt = bytes.len() - 10;
        bytes[corrupt] ^= 0x55;

        let mut rdr = Mb1StreamReader::new();
        let n = rdr.read_frame(&mut Cursor::new(bytes.clone())).unwrap();
        assert_eq!(n, a.size());
        assert!(!rdr.frame().validate_checksum());

        let mut strict = Mb1StreamReader::new().strict(true);
        assert!(matches!(
            strict.read_frame(&mut Cursor::new(bytes)),
            Err(RelayError::Msg(MsgErr::Echk))
        ));
    }

    #[test]
    fn truncated_record_reports_eof() {
        let a = record(5, 3);
        let bytes = a.as_bytes()[..a.size() - 6].to_vec();
        let mut rdr = Mb1StreamReader::new();
        assert!(matches!(
            rdr.read_frame(&mut Cursor::new(bytes)),
            Err(RelayError::Msg(MsgErr::Eof))
        ));
    }
}
