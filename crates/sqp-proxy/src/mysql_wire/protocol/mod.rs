//! MySQL wire protocol messages, reply assembly and constants

pub mod constants;
pub mod messages;
pub mod result_set;

pub use result_set::{Response, ResponseAssembler, ResponseKind};
