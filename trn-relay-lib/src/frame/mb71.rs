#![forbid(unsafe_code)]

//! MB71 (F71/FBT) export frame codec.
//!
//! The export record carries a fixed 98-byte header followed by three
//! packed parallel arrays sized by the bathymetry beam count: per-beam
//! flags (u8), then vertical, cross-track, and along-track samples as
//! scaled i16. Frames are built from MB1 soundings and may be
//! byte-swapped for cross-endian consumers; everything else in the
//! system stays in host order.

use std::fmt::Write as _;

use crate::error::{RelayError, Result};
use crate::frame::bytesutil::{swap16, swap32, swap64};
use crate::frame::mb1::Mb1Frame;

/// Record type tag ('V','5').
pub const MB71V5_TYPE_ID: u16 = 0x5635;
pub const MB71V5_HEADER_BYTES: usize = 98;
/// Per-beam payload: one flag byte plus three i16 samples.
pub const MB71V5_BEAM_BYTES: usize = 7;

const OFF_RECORDTYPE: usize = 0;
const OFF_TIME_D: usize = 2;
const OFF_LONGITUDE: usize = 10;
const OFF_LATITUDE: usize = 18;
const OFF_SONARDEPTH: usize = 26;
const OFF_ALTITUDE: usize = 34;
const OFF_HEADING: usize = 42;
const OFF_SPEED: usize = 46;
const OFF_ROLL: usize = 50;
const OFF_PITCH: usize = 54;
const OFF_HEAVE: usize = 58;
const OFF_BEAM_XWIDTH: usize = 62;
const OFF_BEAM_LWIDTH: usize = 66;
const OFF_BEAMS_BATH: usize = 70;
const OFF_BEAMS_AMP: usize = 74;
const OFF_PIXELS_SS: usize = 78;
const OFF_SPARE1: usize = 82;
const OFF_DEPTH_SCALE: usize = 86;
const OFF_DISTANCE_SCALE: usize = 90;
const OFF_SS_SCALEPOWER: usize = 94;
const OFF_SS_TYPE: usize = 95;
const OFF_IMAGERY_TYPE: usize = 96;
const OFF_TOPO_TYPE: usize = 97;

pub const fn mb71_frame_bytes(nbeams: u32) -> usize {
    MB71V5_HEADER_BYTES + nbeams as usize * MB71V5_BEAM_BYTES
}

fn get_u16(b: &[u8], off: usize) -> u16 {
    let mut a = [0u8; 2];
    a.copy_from_slice(&b[off..off + 2]);
    u16::from_ne_bytes(a)
}

fn get_i16(b: &[u8], off: usize) -> i16 {
    let mut a = [0u8; 2];
    a.copy_from_slice(&b[off..off + 2]);
    i16::from_ne_bytes(a)
}

fn get_i32(b: &[u8], off: usize) -> i32 {
    let mut a = [0u8; 4];
    a.copy_from_slice(&b[off..off + 4]);
    i32::from_ne_bytes(a)
}

fn get_f32(b: &[u8], off: usize) -> f32 {
    let mut a = [0u8; 4];
    a.copy_from_slice(&b[off..off + 4]);
    f32::from_ne_bytes(a)
}

fn get_f64(b: &[u8], off: usize) -> f64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(&b[off..off + 8]);
    f64::from_ne_bytes(a)
}

fn put_u16(b: &mut [u8], off: usize, v: u16) {
    b[off..off + 2].copy_from_slice(&v.to_ne_bytes());
}

fn put_i16(b: &mut [u8], off: usize, v: i16) {
    b[off..off + 2].copy_from_slice(&v.to_ne_bytes());
}

fn put_i32(b: &mut [u8], off: usize, v: i32) {
    b[off..off + 4].copy_from_slice(&v.to_ne_bytes());
}

fn put_f32(b: &mut [u8], off: usize, v: f32) {
    b[off..off + 4].copy_from_slice(&v.to_ne_bytes());
}

fn put_f64(b: &mut [u8], off: usize, v: f64) {
    b[off..off + 8].copy_from_slice(&v.to_ne_bytes());
}

#[derive(Debug, Clone, PartialEq)]
pub struct Mb71Frame {
    buf: Vec<u8>,
}

impl Mb71Frame {
    /// Build an export frame from an MB1 sounding.
    ///
    /// Scale factors follow the writer policy `0.001 · max(max/30, 1)`
    /// so that the largest quantised sample stays inside i16. MB1
    /// heading is degrees and is copied verbatim; altitude, speed,
    /// attitude, and heave are not carried by MB1 and are zero.
    pub fn from_mb1(src: &Mb1Frame) -> Mb71Frame {
        let nbeams = src.nbeams();
        let mut buf = vec![0u8; mb71_frame_bytes(nbeams)];

        put_u16(&mut buf, OFF_RECORDTYPE, MB71V5_TYPE_ID);
        put_f64(&mut buf, OFF_TIME_D, src.ts());
        put_f64(&mut buf, OFF_LONGITUDE, src.lon());
        put_f64(&mut buf, OFF_LATITUDE, src.lat());
        put_f64(&mut buf, OFF_SONARDEPTH, src.depth());
        put_f64(&mut buf, OFF_ALTITUDE, 0.0);
        put_f32(&mut buf, OFF_HEADING, src.hdg() as f32);
        put_f32(&mut buf, OFF_SPEED, 0.0);
        put_f32(&mut buf, OFF_ROLL, 0.0);
        put_f32(&mut buf, OFF_PITCH, 0.0);
        put_f32(&mut buf, OFF_HEAVE, 0.0);
        put_f32(&mut buf, OFF_BEAM_XWIDTH, 1.0);
        put_f32(&mut buf, OFF_BEAM_LWIDTH, 1.0);
        put_i32(&mut buf, OFF_BEAMS_BATH, nbeams as i32);
        put_i32(&mut buf, OFF_BEAMS_AMP, 0);
        put_i32(&mut buf, OFF_PIXELS_SS, 0);
        put_i32(&mut buf, OFF_SPARE1, 0);
        buf[OFF_SS_SCALEPOWER] = 0x00;
        buf[OFF_SS_TYPE] = 0x00;
        buf[OFF_IMAGERY_TYPE] = 0x02;
        buf[OFF_TOPO_TYPE] = 0x02;

        let mut depth_max = 0.0f64;
        let mut dist_max = 0.0f64;
        for beam in src.beams() {
            depth_max = depth_max.max(beam.rhoz.abs());
            dist_max = dist_max.max(beam.rhoy.abs()).max(beam.rhox.abs());
        }
        let depth_scale = if depth_max > 0.0 {
            0.001 * (depth_max / 30.0).max(1.0) as f32
        } else {
            0.0
        };
        let dist_scale = if dist_max > 0.0 {
            0.001 * (dist_max / 30.0).max(1.0) as f32
        } else {
            0.0
        };
        put_f32(&mut buf, OFF_DEPTH_SCALE, depth_scale);
        put_f32(&mut buf, OFF_DISTANCE_SCALE, dist_scale);

        let mut out = Mb71Frame { buf };
        for (i, beam) in src.beams().enumerate() {
            out.set_flag(i, 0x00);
            let z = if depth_scale > 0.0 {
                (beam.rhoz / depth_scale as f64).round() as i16
            } else {
                0
            };
            let (y, x) = if dist_scale > 0.0 {
                (
                    (beam.rhoy / dist_scale as f64).round() as i16,
                    (beam.rhox / dist_scale as f64).round() as i16,
                )
            } else {
                (0, 0)
            };
            out.set_bath(i, z);
            out.set_bath_across(i, y);
            out.set_bath_along(i, x);
        }
        out
    }

    /// Rebuild a frame from raw bytes, validating the host-order type
    /// tag and the beam-count/length relationship.
    pub fn from_bytes(bytes: &[u8]) -> Result<Mb71Frame> {
        if bytes.len() < MB71V5_HEADER_BYTES {
            return Err(RelayError::Frame(format!(
                "mb71 record too short: {} bytes",
                bytes.len()
            )));
        }
        let rtype = get_u16(bytes, OFF_RECORDTYPE);
        if rtype != MB71V5_TYPE_ID {
            return Err(RelayError::Frame(format!(
                "bad mb71 record type 0x{rtype:04X}"
            )));
        }
        let nbeams = get_i32(bytes, OFF_BEAMS_BATH);
        if nbeams < 0 || bytes.len() != mb71_frame_bytes(nbeams as u32) {
            return Err(RelayError::Frame(format!(
                "inconsistent mb71 record: beams[{nbeams}] len[{}]",
                bytes.len()
            )));
        }
        Ok(Mb71Frame {
            buf: bytes.to_vec(),
        })
    }

    pub fn recordtype(&self) -> u16 {
        get_u16(&self.buf, OFF_RECORDTYPE)
    }

    pub fn time_d(&self) -> f64 {
        get_f64(&self.buf, OFF_TIME_D)
    }

    pub fn longitude(&self) -> f64 {
        get_f64(&self.buf, OFF_LONGITUDE)
    }

    pub fn latitude(&self) -> f64 {
        get_f64(&self.buf, OFF_LATITUDE)
    }

    pub fn sonardepth(&self) -> f64 {
        get_f64(&self.buf, OFF_SONARDEPTH)
    }

    pub fn altitude(&self) -> f64 {
        get_f64(&self.buf, OFF_ALTITUDE)
    }

    pub fn heading(&self) -> f32 {
        get_f32(&self.buf, OFF_HEADING)
    }

    pub fn beams_bath(&self) -> i32 {
        get_i32(&self.buf, OFF_BEAMS_BATH)
    }

    pub fn depth_scale(&self) -> f32 {
        get_f32(&self.buf, OFF_DEPTH_SCALE)
    }

    pub fn distance_scale(&self) -> f32 {
        get_f32(&self.buf, OFF_DISTANCE_SCALE)
    }

    fn flags_off(&self, i: usize) -> usize {
        MB71V5_HEADER_BYTES + i
    }

    fn bath_off(&self, i: usize) -> usize {
        let n = self.beams_bath().max(0) as usize;
        MB71V5_HEADER_BYTES + n + 2 * i
    }

    fn bath_across_off(&self, i: usize) -> usize {
        let n = self.beams_bath().max(0) as usize;
        MB71V5_HEADER_BYTES + 3 * n + 2 * i
    }

    fn bath_along_off(&self, i: usize) -> usize {
        let n = self.beams_bath().max(0) as usize;
        MB71V5_HEADER_BYTES + 5 * n + 2 * i
    }

    pub fn flag(&self, i: usize) -> u8 {
        self.buf[self.flags_off(i)]
    }

    pub fn set_flag(&mut self, i: usize, v: u8) {
        let off = self.flags_off(i);
        self.buf[off] = v;
    }

    /// Scaled vertical sample for beam `i`.
    pub fn bath(&self, i: usize) -> i16 {
        get_i16(&self.buf, self.bath_off(i))
    }

    pub fn set_bath(&mut self, i: usize, v: i16) {
        let off = self.bath_off(i);
        put_i16(&mut self.buf, off, v);
    }

    pub fn bath_across(&self, i: usize) -> i16 {
        get_i16(&self.buf, self.bath_across_off(i))
    }

    pub fn set_bath_across(&mut self, i: usize, v: i16) {
        let off = self.bath_across_off(i);
        put_i16(&mut self.buf, off, v);
    }

    pub fn bath_along(&self, i: usize) -> i16 {
        get_i16(&self.buf, self.bath_along_off(i))
    }

    pub fn set_bath_along(&mut self, i: usize, v: i16) {
        let off = self.bath_along_off(i);
        put_i16(&mut self.buf, off, v);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Byte-swap every multi-byte field in place, including the i16 beam
    /// samples. The beam count must be captured before the count field
    /// itself is swapped; after this call the buffer is foreign-endian
    /// and the typed accessors no longer apply.
    pub fn byteswap(&mut self) -> Result<()> {
        let nbeams = self.beams_bath();
        if nbeams <= 0 {
            return Err(RelayError::Frame(format!(
                "mb71 byteswap: no beams ({nbeams})"
            )));
        }
        self.swap_fields(nbeams as usize);
        Ok(())
    }

    /// Byte-swapped copy; `self` is left untouched.
    pub fn byteswapped(&self) -> Result<Mb71Frame> {
        let mut dest = self.clone();
        dest.byteswap()?;
        Ok(dest)
    }

    /// Byte-swapped copy with the beam count supplied by the caller,
    /// for images whose count field is foreign-endian (a cross-endian
    /// reader swaps the count field first, then the frame).
    pub fn byteswapped_with_count(&self, nbeams: u32) -> Result<Mb71Frame> {
        if nbeams == 0 || mb71_frame_bytes(nbeams) != self.buf.len() {
            return Err(RelayError::Frame(format!(
                "mb71 byteswap: count {nbeams} does not fit {} bytes",
                self.buf.len()
            )));
        }
        let mut dest = self.clone();
        dest.swap_fields(nbeams as usize);
        Ok(dest)
    }

    fn swap_fields(&mut self, nbeams: usize) {
        let b = &mut self.buf;
        let swapped_recordtype = swap16(get_u16(b, OFF_RECORDTYPE));
        put_u16(b, OFF_RECORDTYPE, swapped_recordtype);
        for off in [
            OFF_TIME_D,
            OFF_LONGITUDE,
            OFF_LATITUDE,
            OFF_SONARDEPTH,
            OFF_ALTITUDE,
        ] {
            let mut a = [0u8; 8];
            a.copy_from_slice(&b[off..off + 8]);
            let v = swap64(u64::from_ne_bytes(a));
            b[off..off + 8].copy_from_slice(&v.to_ne_bytes());
        }
        for off in [
            OFF_HEADING,
            OFF_SPEED,
            OFF_ROLL,
            OFF_PITCH,
            OFF_HEAVE,
            OFF_BEAM_XWIDTH,
            OFF_BEAM_LWIDTH,
            OFF_BEAMS_BATH,
            OFF_BEAMS_AMP,
            OFF_PIXELS_SS,
            OFF_SPARE1,
            OFF_DEPTH_SCALE,
            OFF_DISTANCE_SCALE,
        ] {
            let mut a = [0u8; 4];
            a.copy_from_slice(&b[off..off + 4]);
            let v = swap32(u32::from_ne_bytes(a));
            b[off..off + 4].copy_from_slice(&v.to_ne_bytes());
        }
        // single-byte fields (ss_scalepower..topo_type, beam flags) keep
        for arr in 0..3usize {
            let base = MB71V5_HEADER_BYTES + nbeams + arr * 2 * nbeams;
            for i in 0..nbeams {
                let off = base + 2 * i;
                let v = swap16(get_u16(b, off));
                put_u16(b, off, v);
            }
        }
    }

    pub fn show(&self, verbose: bool, indent: usize) -> String {
        let pad = " ".repeat(indent);
        let mut out = String::new();
        let _ = writeln!(out, "{pad}recordtype     0x{:04X}", self.recordtype());
        let _ = writeln!(out, "{pad}time_d         {:.3}", self.time_d());
        let _ = writeln!(out, "{pad}longitude      {:.6}", self.longitude());
        let _ = writeln!(out, "{pad}latitude       {:.6}", self.latitude());
        let _ = writeln!(out, "{pad}sonardepth     {:.3}", self.sonardepth());
        let _ = writeln!(out, "{pad}altitude       {:.3}", self.altitude());
        let _ = writeln!(out, "{pad}heading        {:.3}", self.heading());
        let _ = writeln!(out, "{pad}beams_bath     {}", self.beams_bath());
        let _ = writeln!(out, "{pad}depth_scale    {:.6}", self.depth_scale());
        let _ = writeln!(out, "{pad}distance_scale {:.6}", self.distance_scale());
        if verbose && self.beams_bath() > 0 {
            let _ = writeln!(out, "{pad}[ n  flags    vert   cross   along]");
            for i in 0..self.beams_bath() as usize {
                let _ = writeln!(
                    out,
                    "{pad} {:3}  {:02X} {:8} {:8} {:8}",
                    i,
                    self.flag(i),
                    self.bath(i),
                    self.bath_across(i),
                    self.bath_along(i)
                );
            }
        }
        out
    }
}
