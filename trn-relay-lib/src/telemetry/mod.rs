#![forbid(unsafe_code)]

pub mod session_log;
pub mod stats;
pub mod tracing;

pub use session_log::SessionLog;
pub use stats::{PortStats, PortStatsSnapshot};
