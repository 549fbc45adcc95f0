#![forbid(unsafe_code)]

pub mod bytesutil;
pub mod mb1;
pub mod mb71;
pub mod reader;

pub use mb1::{Mb1Beam, Mb1Frame, ZeroFlags};
pub use mb71::Mb71Frame;
pub use reader::Mb1StreamReader;
