#![forbid(unsafe_code)]

pub mod loader;
pub mod types;

pub use loader::{load_from_path, validate_config};
pub use types::{
    CommstConfig, Config, LogConfig, PortConfig, PortCtype, PortModeCfg, PortProtoCfg,
    SourceConfig,
};
