#![forbid(unsafe_code)]

pub mod commst;
pub mod handlers;
pub mod text;
pub mod trnmsg;

pub use commst::{CommstMsg, CommstOptions, CommstType};
pub use handlers::{CommstProtocol, MbTextProtocol, TrnmsgProtocol, TrnuTextProtocol};
pub use trnmsg::{TrnMsg, TrnMsgId};
