#![forbid(unsafe_code)]

//! Sonar telemetry and terrain-relative-navigation middleware.
//!
//! The library ingests MB1 multibeam sounding records, distributes them
//! to networked subscribers, converts them to the MB71/FBT export
//! format, and mediates the TRN request/response protocols between
//! compute clients and an embedded navigation filter.

pub mod config;
pub mod error;
pub mod frame;
pub mod net;
pub mod proto;
pub mod telemetry;
pub mod trn;

pub use config::{load_from_path, Config};
pub use error::{MsgErr, RelayError, Result};
pub use frame::{Mb1Beam, Mb1Frame, Mb1StreamReader, Mb71Frame};
pub use net::{CType, Port, PortMode, PortProtocol, PortSettings};
pub use proto::{CommstOptions, CommstProtocol, MbTextProtocol, TrnmsgProtocol, TrnuTextProtocol};
pub use telemetry::SessionLog;
pub use trn::{BenchFilter, TrnFilter};
