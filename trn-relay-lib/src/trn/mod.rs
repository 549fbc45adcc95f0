#![forbid(unsafe_code)]

//! Interface to the terrain-relative-navigation filter.
//!
//! The filter itself is an external collaborator; the relay only needs
//! the operations the request/response protocols dispatch to. Protocol
//! handlers own a `TrnFilter` and drive it from the port task, so no
//! implementation needs interior locking.

/// Vehicle pose with attitude and a compact covariance summary.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PoseData {
    pub time: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub phi: f64,
    pub theta: f64,
    pub psi: f64,
    pub covariance: [f64; 4],
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MeasBeam {
    pub beam_num: u32,
    pub range: f64,
    pub cross: f64,
    pub along: f64,
    pub altitude: f64,
}

/// One sonar measurement handed to the filter.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Measurement {
    pub time: f64,
    pub data_type: i32,
    pub ping_number: i32,
    pub beams: Vec<MeasBeam>,
}

pub const MEAS_HDR_BYTES: usize = 20;
pub const MEAS_BEAM_BYTES: usize = 36;

impl Measurement {
    pub fn wire_len(&self) -> usize {
        MEAS_HDR_BYTES + self.beams.len() * MEAS_BEAM_BYTES
    }

    /// Serialize in host order: header (time, data_type, ping_number,
    /// beam count) then packed beams.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.time.to_ne_bytes());
        out.extend_from_slice(&self.data_type.to_ne_bytes());
        out.extend_from_slice(&self.ping_number.to_ne_bytes());
        out.extend_from_slice(&(self.beams.len() as u32).to_ne_bytes());
        for b in &self.beams {
            out.extend_from_slice(&b.beam_num.to_ne_bytes());
            out.extend_from_slice(&b.range.to_ne_bytes());
            out.extend_from_slice(&b.cross.to_ne_bytes());
            out.extend_from_slice(&b.along.to_ne_bytes());
            out.extend_from_slice(&b.altitude.to_ne_bytes());
        }
    }

    pub fn read_from(buf: &[u8]) -> Option<(Measurement, usize)> {
        if buf.len() < MEAS_HDR_BYTES {
            return None;
        }
        let f64_at = |off: usize| {
            let mut a = [0u8; 8];
            a.copy_from_slice(&buf[off..off + 8]);
            f64::from_ne_bytes(a)
        };
        let u32_at = |off: usize| {
            let mut a = [0u8; 4];
            a.copy_from_slice(&buf[off..off + 4]);
            u32::from_ne_bytes(a)
        };
        let time = f64_at(0);
        let data_type = u32_at(8) as i32;
        let ping_number = u32_at(12) as i32;
        let nbeams = u32_at(16) as usize;
        let need = MEAS_HDR_BYTES + nbeams * MEAS_BEAM_BYTES;
        if buf.len() < need {
            return None;
        }
        let mut beams = Vec::with_capacity(nbeams);
        for i in 0..nbeams {
            let off = MEAS_HDR_BYTES + i * MEAS_BEAM_BYTES;
            beams.push(MeasBeam {
                beam_num: u32_at(off),
                range: f64_at(off + 4),
                cross: f64_at(off + 12),
                along: f64_at(off + 20),
                altitude: f64_at(off + 28),
            });
        }
        Some((
            Measurement {
                time,
                data_type,
                ping_number,
                beams,
            },
            need,
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoseEstimate {
    Mle,
    Mmse,
}

/// Operations the protocol handlers dispatch to. Mirrors the filter's
/// reinitializable state object: measurement/motion updates, pose
/// estimation, status queries, and tuning setters.
pub trait TrnFilter: Send + 'static {
    fn initialize(&mut self, config: &Measurement);
    fn initialized(&self) -> bool;
    /// Update with a measurement; the measurement may be modified in
    /// place (outlier flags, corrected ranges) and is echoed to the
    /// client in the reply.
    fn meas_update(&mut self, meas: &mut Measurement, parameter: i32);
    fn motion_update(&mut self, pose: &PoseData);
    fn estimate_pose(&mut self, kind: PoseEstimate) -> PoseData;
    fn last_meas_successful(&self) -> bool;
    fn num_reinits(&self) -> i32;
    fn filter_type(&self) -> i32;
    fn filter_state(&self) -> i32;
    fn outstanding_meas(&self) -> bool;
    fn is_converged(&self) -> bool;
    fn reinit_filter(&mut self, low_info_hint: bool);
    fn set_modified_weighting(&mut self, value: i32);
    fn set_filter_reinit(&mut self, enable: bool);
    fn set_interp_meas_attitude(&mut self, enable: bool);
    fn set_map_interp_method(&mut self, method: i32);
    fn set_vehicle_drift_rate(&mut self, rate: f64);
    fn use_highgrade_filter(&mut self);
    fn use_lowgrade_filter(&mut self);
}

/// A trivially deterministic filter used by the test suite and bench
/// runs. It tracks the state the queries report and answers pose
/// estimates from the last motion update.
#[derive(Debug, Default)]
pub struct BenchFilter {
    initialized: bool,
    converged: bool,
    last_meas_ok: bool,
    outstanding: bool,
    num_reinits: i32,
    filter_state: i32,
    modified_weighting: i32,
    filter_reinit_en: bool,
    interp_attitude: bool,
    map_interp: i32,
    drift_rate: f64,
    lowgrade: bool,
    meas_count: u64,
    last_pose: PoseData,
}

impl BenchFilter {
    pub fn new() -> BenchFilter {
        BenchFilter::default()
    }

    pub fn meas_count(&self) -> u64 {
        self.meas_count
    }
}

impl TrnFilter for BenchFilter {
    fn initialize(&mut self, _config: &Measurement) {
        self.initialized = true;
        self.filter_state = 1;
    }

    fn initialized(&self) -> bool {
        self.initialized
    }

    fn meas_update(&mut self, meas: &mut Measurement, _parameter: i32) {
        self.meas_count += 1;
        self.last_meas_ok = !meas.beams.is_empty();
        self.outstanding = false;
        // flag beams with no return
        for b in meas.beams.iter_mut() {
            if b.range <= 0.0 {
                b.altitude = 0.0;
            }
        }
        self.converged = self.meas_count >= 3;
    }

    fn motion_update(&mut self, pose: &PoseData) {
        self.last_pose = *pose;
    }

    fn estimate_pose(&mut self, kind: PoseEstimate) -> PoseData {
        let mut est = self.last_pose;
        est.covariance = match kind {
            PoseEstimate::Mle => [1.0, 0.0, 0.0, 1.0],
            PoseEstimate::Mmse => [0.5, 0.0, 0.0, 0.5],
        };
        est
    }

    fn last_meas_successful(&self) -> bool {
        self.last_meas_ok
    }

    fn num_reinits(&self) -> i32 {
        self.num_reinits
    }

    fn filter_type(&self) -> i32 {
        if self.lowgrade {
            1
        } else {
            0
        }
    }

    fn filter_state(&self) -> i32 {
        self.filter_state
    }

    fn outstanding_meas(&self) -> bool {
        self.outstanding
    }

    fn is_converged(&self) -> bool {
        self.converged
    }

    fn reinit_filter(&mut self, _low_info_hint: bool) {
        self.num_reinits += 1;
        self.converged = false;
        self.meas_count = 0;
    }

    fn set_modified_weighting(&mut self, value: i32) {
        self.modified_weighting = value;
    }

    fn set_filter_reinit(&mut self, enable: bool) {
        self.filter_reinit_en = enable;
    }

    fn set_interp_meas_attitude(&mut self, enable: bool) {
        self.interp_attitude = enable;
    }

    fn set_map_interp_method(&mut self, method: i32) {
        self.map_interp = method;
    }

    fn set_vehicle_drift_rate(&mut self, rate: f64) {
        self.drift_rate = rate;
    }

    fn use_highgrade_filter(&mut self) {
        self.lowgrade = false;
    }

    fn use_lowgrade_filter(&mut self) {
        self.lowgrade = true;
    }
}
