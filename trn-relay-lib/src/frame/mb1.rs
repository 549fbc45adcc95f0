#![forbid(unsafe_code)]

//! MB1 sounding frame codec.
//!
//! An MB1 record is a variable-length bathymetry ping: a 56-byte header,
//! `nbeams` 28-byte beam entries, and a trailing 32-bit checksum (the
//! unsigned byte sum of everything before it). Records travel in host
//! byte order; there is no framing outside the record itself.
//!
//! The frame is kept as one owned byte buffer with field views derived
//! from offsets, so a resize only has to grow the buffer and rewrite the
//! size/count fields — the checksum location follows from `size`.

use std::fmt::Write as _;
use std::ops::BitOr;

use crate::error::{MsgErr, RelayError, Result};
use crate::frame::bytesutil::checksum;

/// Record type tag: the ASCII bytes 'M','B','1','\0' read as a 32-bit
/// little-endian integer.
pub const MB1_TYPE_ID: u32 = 0x0031_424D;
pub const MB1_HEADER_BYTES: usize = 56;
pub const MB1_BEAM_BYTES: usize = 28;
pub const MB1_CHECKSUM_BYTES: usize = 4;
pub const MB1_MAX_BEAMS: u32 = 512;

const OFF_TYPE: usize = 0;
const OFF_SIZE: usize = 4;
const OFF_TS: usize = 8;
const OFF_LAT: usize = 16;
const OFF_LON: usize = 24;
const OFF_DEPTH: usize = 32;
const OFF_HDG: usize = 40;
const OFF_PING_NUMBER: usize = 48;
const OFF_NBEAMS: usize = 52;

/// Complete frame size for a beam count.
pub const fn mb1_frame_bytes(nbeams: u32) -> usize {
    MB1_HEADER_BYTES + nbeams as usize * MB1_BEAM_BYTES + MB1_CHECKSUM_BYTES
}

/// Largest legal frame (`MB1_MAX_BEAMS` beams).
pub const MB1_MAX_FRAME_BYTES: usize = mb1_frame_bytes(MB1_MAX_BEAMS);

/// Regions cleared by [`Mb1Frame::resize`] / [`Mb1Frame::zero`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZeroFlags(u8);

impl ZeroFlags {
    pub const NONE: ZeroFlags = ZeroFlags(0);
    pub const BEAMS: ZeroFlags = ZeroFlags(0x1);
    pub const HEADER: ZeroFlags = ZeroFlags(0x2);
    pub const CHECKSUM: ZeroFlags = ZeroFlags(0x4);
    pub const ALL: ZeroFlags = ZeroFlags(0x7);

    pub fn contains(self, other: ZeroFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ZeroFlags {
    type Output = ZeroFlags;
    fn bitor(self, rhs: ZeroFlags) -> ZeroFlags {
        ZeroFlags(self.0 | rhs.0)
    }
}

/// One sonar return: beam number plus along/cross/vertical position in
/// meters relative to the sonar (z positive down).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Mb1Beam {
    pub beam_num: u32,
    pub rhox: f64,
    pub rhoy: f64,
    pub rhoz: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Mb1Frame {
    buf: Vec<u8>,
}

fn get_u32(b: &[u8], off: usize) -> u32 {
    let mut a = [0u8; 4];
    a.copy_from_slice(&b[off..off + 4]);
    u32::from_ne_bytes(a)
}

fn get_i32(b: &[u8], off: usize) -> i32 {
    let mut a = [0u8; 4];
    a.copy_from_slice(&b[off..off + 4]);
    i32::from_ne_bytes(a)
}

fn get_f64(b: &[u8], off: usize) -> f64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(&b[off..off + 8]);
    f64::from_ne_bytes(a)
}

fn put_u32(b: &mut [u8], off: usize, v: u32) {
    b[off..off + 4].copy_from_slice(&v.to_ne_bytes());
}

fn put_i32(b: &mut [u8], off: usize, v: i32) {
    b[off..off + 4].copy_from_slice(&v.to_ne_bytes());
}

fn put_f64(b: &mut [u8], off: usize, v: f64) {
    b[off..off + 8].copy_from_slice(&v.to_ne_bytes());
}

impl Mb1Frame {
    /// Allocate a zeroed frame for `nbeams` beams, with the type tag,
    /// size, and beam count fields set.
    pub fn new(nbeams: u32) -> Result<Mb1Frame> {
        if nbeams > MB1_MAX_BEAMS {
            return Err(RelayError::Frame(format!(
                "beam count {nbeams} exceeds max {MB1_MAX_BEAMS}"
            )));
        }
        let size = mb1_frame_bytes(nbeams);
        let mut buf = vec![0u8; size];
        put_u32(&mut buf, OFF_TYPE, MB1_TYPE_ID);
        put_u32(&mut buf, OFF_SIZE, size as u32);
        put_u32(&mut buf, OFF_NBEAMS, nbeams);
        Ok(Mb1Frame { buf })
    }

    /// A zero-beam frame; the smallest legal record.
    pub fn empty() -> Mb1Frame {
        let size = mb1_frame_bytes(0);
        let mut buf = vec![0u8; size];
        put_u32(&mut buf, OFF_TYPE, MB1_TYPE_ID);
        put_u32(&mut buf, OFF_SIZE, size as u32);
        Mb1Frame { buf }
    }

    /// Rebuild a frame from raw record bytes, validating the type tag,
    /// size field, and beam-count invariant. The checksum is not
    /// verified here; see [`Mb1Frame::validate_checksum`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Mb1Frame> {
        if bytes.len() < mb1_frame_bytes(0) {
            return Err(RelayError::Frame(format!(
                "record too short: {} bytes",
                bytes.len()
            )));
        }
        let rtype = get_u32(bytes, OFF_TYPE);
        if rtype != MB1_TYPE_ID {
            return Err(RelayError::Frame(format!(
                "bad record type 0x{rtype:08X} (expected 0x{MB1_TYPE_ID:08X})"
            )));
        }
        let size = get_u32(bytes, OFF_SIZE) as usize;
        let nbeams = get_u32(bytes, OFF_NBEAMS);
        if nbeams > MB1_MAX_BEAMS || size != mb1_frame_bytes(nbeams) || size != bytes.len() {
            return Err(RelayError::Frame(format!(
                "inconsistent record: size[{size}] nbeams[{nbeams}] len[{}]",
                bytes.len()
            )));
        }
        Ok(Mb1Frame {
            buf: bytes.to_vec(),
        })
    }

    /// Grow or shrink the frame to hold `nbeams` beams. The size and
    /// beam-count fields are rewritten; `flags` selects which regions
    /// are cleared (remaining header fields are otherwise preserved).
    pub fn resize(&mut self, nbeams: u32, flags: ZeroFlags) -> Result<()> {
        if nbeams > MB1_MAX_BEAMS {
            return Err(RelayError::Frame(format!(
                "beam count {nbeams} exceeds max {MB1_MAX_BEAMS}"
            )));
        }
        let size = mb1_frame_bytes(nbeams);
        self.buf.resize(size, 0);
        put_u32(&mut self.buf, OFF_TYPE, MB1_TYPE_ID);
        put_u32(&mut self.buf, OFF_SIZE, size as u32);
        put_u32(&mut self.buf, OFF_NBEAMS, nbeams);
        self.zero(flags);
        Ok(())
    }

    /// Clear regions of the frame without changing its size.
    pub fn zero(&mut self, flags: ZeroFlags) {
        if flags.contains(ZeroFlags::HEADER) {
            // type/size/nbeams are structural; reset the rest
            put_f64(&mut self.buf, OFF_TS, 0.0);
            put_f64(&mut self.buf, OFF_LAT, 0.0);
            put_f64(&mut self.buf, OFF_LON, 0.0);
            put_f64(&mut self.buf, OFF_DEPTH, 0.0);
            put_f64(&mut self.buf, OFF_HDG, 0.0);
            put_i32(&mut self.buf, OFF_PING_NUMBER, 0);
        }
        if flags.contains(ZeroFlags::BEAMS) {
            let end = self.size() - MB1_CHECKSUM_BYTES;
            self.buf[MB1_HEADER_BYTES..end].fill(0);
        }
        if flags.contains(ZeroFlags::CHECKSUM) {
            let off = self.size() - MB1_CHECKSUM_BYTES;
            put_u32(&mut self.buf, off, 0);
        }
    }

    pub fn type_id(&self) -> u32 {
        get_u32(&self.buf, OFF_TYPE)
    }

    /// Total frame bytes including header and checksum.
    pub fn size(&self) -> usize {
        get_u32(&self.buf, OFF_SIZE) as usize
    }

    pub fn ts(&self) -> f64 {
        get_f64(&self.buf, OFF_TS)
    }

    pub fn set_ts(&mut self, v: f64) {
        put_f64(&mut self.buf, OFF_TS, v);
    }

    pub fn lat(&self) -> f64 {
        get_f64(&self.buf, OFF_LAT)
    }

    pub fn set_lat(&mut self, v: f64) {
        put_f64(&mut self.buf, OFF_LAT, v);
    }

    pub fn lon(&self) -> f64 {
        get_f64(&self.buf, OFF_LON)
    }

    pub fn set_lon(&mut self, v: f64) {
        put_f64(&mut self.buf, OFF_LON, v);
    }

    pub fn depth(&self) -> f64 {
        get_f64(&self.buf, OFF_DEPTH)
    }

    pub fn set_depth(&mut self, v: f64) {
        put_f64(&mut self.buf, OFF_DEPTH, v);
    }

    /// Vehicle heading in degrees.
    pub fn hdg(&self) -> f64 {
        get_f64(&self.buf, OFF_HDG)
    }

    pub fn set_hdg(&mut self, v: f64) {
        put_f64(&mut self.buf, OFF_HDG, v);
    }

    pub fn ping_number(&self) -> i32 {
        get_i32(&self.buf, OFF_PING_NUMBER)
    }

    pub fn set_ping_number(&mut self, v: i32) {
        put_i32(&mut self.buf, OFF_PING_NUMBER, v);
    }

    pub fn nbeams(&self) -> u32 {
        get_u32(&self.buf, OFF_NBEAMS)
    }

    pub fn beam(&self, idx: u32) -> Option<Mb1Beam> {
        if idx >= self.nbeams() {
            return None;
        }
        let off = MB1_HEADER_BYTES + idx as usize * MB1_BEAM_BYTES;
        Some(Mb1Beam {
            beam_num: get_u32(&self.buf, off),
            rhox: get_f64(&self.buf, off + 4),
            rhoy: get_f64(&self.buf, off + 12),
            rhoz: get_f64(&self.buf, off + 20),
        })
    }

    pub fn set_beam(&mut self, idx: u32, beam: Mb1Beam) -> Result<()> {
        if idx >= self.nbeams() {
            return Err(RelayError::Msg(MsgErr::Einval));
        }
        let off = MB1_HEADER_BYTES + idx as usize * MB1_BEAM_BYTES;
        put_u32(&mut self.buf, off, beam.beam_num);
        put_f64(&mut self.buf, off + 4, beam.rhox);
        put_f64(&mut self.buf, off + 12, beam.rhoy);
        put_f64(&mut self.buf, off + 20, beam.rhoz);
        Ok(())
    }

    pub fn beams(&self) -> impl Iterator<Item = Mb1Beam> + '_ {
        (0..self.nbeams()).filter_map(|i| self.beam(i))
    }

    /// Unsigned byte sum over everything before the trailing checksum.
    pub fn calc_checksum(&self) -> u32 {
        checksum(&self.buf[..self.size() - MB1_CHECKSUM_BYTES])
    }

    /// Checksum value currently stored in the trailing word.
    pub fn stored_checksum(&self) -> u32 {
        get_u32(&self.buf, self.size() - MB1_CHECKSUM_BYTES)
    }

    /// Recompute and store the checksum; returns the previous value.
    pub fn set_checksum(&mut self) -> u32 {
        let prev = self.stored_checksum();
        let sum = self.calc_checksum();
        let off = self.size() - MB1_CHECKSUM_BYTES;
        put_u32(&mut self.buf, off, sum);
        prev
    }

    pub fn validate_checksum(&self) -> bool {
        self.calc_checksum() == self.stored_checksum()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Mutable view of the raw record; used by the stream reader to
    /// fill the payload in place.
    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// One CSV record:
    /// `MB1,<ts>,<lon>,<lat>,<depth>,<hdg>,<nbeams>[,x,y,z]...`.
    /// When `radians` is set, lat/lon/heading are converted to degrees
    /// on the way out.
    pub fn csv_record(&self, radians: bool) -> String {
        let (mut lat, mut lon, mut hdg) = (self.lat(), self.lon(), self.hdg());
        if radians {
            let k = 180.0 / std::f64::consts::PI;
            lat *= k;
            lon *= k;
            hdg *= k;
        }
        let mut out = format!(
            "MB1,{:.3},{:e},{:e},{:e},{:e},{}",
            self.ts(),
            lon,
            lat,
            self.depth(),
            hdg,
            self.nbeams()
        );
        for b in self.beams() {
            let _ = write!(out, ",{:e},{:e},{:e}", b.rhox, b.rhoy, b.rhoz);
        }
        out
    }

    /// Parameter summary for diagnostics; `verbose` adds per-beam rows.
    pub fn show(&self, verbose: bool, indent: usize) -> String {
        let pad = " ".repeat(indent);
        let mut out = String::new();
        let _ = writeln!(out, "{pad}type        0x{:08X}", self.type_id());
        let _ = writeln!(out, "{pad}size        {}", self.size());
        let _ = writeln!(out, "{pad}ts          {:.3}", self.ts());
        let _ = writeln!(out, "{pad}lat         {:.6}", self.lat());
        let _ = writeln!(out, "{pad}lon         {:.6}", self.lon());
        let _ = writeln!(out, "{pad}depth       {:.3}", self.depth());
        let _ = writeln!(out, "{pad}hdg         {:.3}", self.hdg());
        let _ = writeln!(out, "{pad}ping_number {}", self.ping_number());
        let _ = writeln!(out, "{pad}nbeams      {}", self.nbeams());
        let _ = writeln!(out, "{pad}checksum    0x{:08X}", self.stored_checksum());
        if verbose {
            for b in self.beams() {
                let _ = writeln!(
                    out,
                    "{pad}  [{:3}] x[{:10.3}] y[{:10.3}] z[{:10.3}]",
                    b.beam_num, b.rhox, b.rhoy, b.rhoz
                );
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_frame_size_matches_layout() {
        for n in [0u32, 1, 7, 512] {
            let f = Mb1Frame::new(n).unwrap();
            assert_eq!(f.size(), 56 + 28 * n as usize + 4);
            assert_eq!(f.as_bytes().len(), f.size());
            assert_eq!(f.type_id(), MB1_TYPE_ID);
            assert_eq!(f.nbeams(), n);
        }
        assert!(Mb1Frame::new(513).is_err());
    }

    #[test]
    fn resize_preserves_header_unless_flagged() {
        let mut f = Mb1Frame::new(4).unwrap();
        f.set_ts(1234.5);
        f.set_lat(36.8);
        f.set_ping_number(99);
        f.set_beam(
            0,
            Mb1Beam {
                beam_num: 0,
                rhox: 1.0,
                rhoy: 2.0,
                rhoz: 3.0,
            },
        )
        .unwrap();

        f.resize(8, ZeroFlags::NONE).unwrap();
        assert_eq!(f.nbeams(), 8);
        assert_eq!(f.size(), mb1_frame_bytes(8));
        assert_eq!(f.ts(), 1234.5);
        assert_eq!(f.lat(), 36.8);
        assert_eq!(f.ping_number(), 99);
        // beam region kept since BEAMS flag was not set
        assert_eq!(f.beam(0).unwrap().rhoz, 3.0);

        f.resize(2, ZeroFlags::BEAMS).unwrap();
        assert_eq!(f.beam(0).unwrap(), Mb1Beam::default());
        assert_eq!(f.ts(), 1234.5);

        f.zero(ZeroFlags::HEADER);
        assert_eq!(f.ts(), 0.0);
        assert_eq!(f.ping_number(), 0);
        assert_eq!(f.type_id(), MB1_TYPE_ID);
        assert_eq!(f.nbeams(), 2);
    }

    #[test]
    fn checksum_covers_all_but_trailing_word() {
        let mut f = Mb1Frame::new(2).unwrap();
        f.set_ts(1.0);
        f.set_beam(
            1,
            Mb1Beam {
                beam_num: 1,
                rhox: -10.0,
                rhoy: 10.0,
                rhoz: 70.0,
            },
        )
        .unwrap();
        let expect = checksum(&f.as_bytes()[..f.size() - 4]);
        assert_eq!(f.calc_checksum(), expect);

        assert!(!f.validate_checksum() || expect == 0);
        f.set_checksum();
        assert!(f.validate_checksum());

        // corrupt one payload byte
        let mut bytes = f.clone().into_bytes();
        bytes[60] ^= 0xFF;
        let g = Mb1Frame::from_bytes(&bytes).unwrap();
        assert!(!g.validate_checksum());
    }

    #[test]
    fn csv_record_lists_header_then_beams() {
        let mut f = Mb1Frame::new(2).unwrap();
        f.set_ts(1000.125);
        f.set_lat(36.5);
        f.set_lon(-122.25);
        f.set_depth(80.0);
        f.set_hdg(90.0);
        f.set_beam(
            1,
            Mb1Beam {
                beam_num: 1,
                rhox: 1.0,
                rhoy: 2.0,
                rhoz: 3.0,
            },
        )
        .unwrap();

        let csv = f.csv_record(false);
        assert!(csv.starts_with("MB1,1000.125,"));
        // header fields + 3 per beam
        assert_eq!(csv.split(',').count(), 7 + 3 * 2);
        assert!(csv.contains(",2,"));

        // radian inputs convert to degrees
        let mut r = Mb1Frame::new(0).unwrap();
        r.set_hdg(std::f64::consts::PI);
        let csv = r.csv_record(true);
        let hdg_field = csv.split(',').nth(5).unwrap();
        let hdg: f64 = hdg_field.parse().unwrap();
        assert!((hdg - 180.0).abs() < 1e-9);
    }

    #[test]
    fn from_bytes_validates_type_and_size() {
        let f = Mb1Frame::new(3).unwrap();
        let ok = Mb1Frame::from_bytes(f.as_bytes()).unwrap();
        assert_eq!(ok, f);

        let mut bad_type = f.as_bytes().to_vec();
        bad_type[0] = b'X';
        assert!(Mb1Frame::from_bytes(&bad_type).is_err());

        let mut bad_size = f.as_bytes().to_vec();
        bad_size[4] = 0xFF;
        assert!(Mb1Frame::from_bytes(&bad_size).is_err());

        assert!(Mb1Frame::from_bytes(&f.as_bytes()[..32]).is_err());
    }
}
