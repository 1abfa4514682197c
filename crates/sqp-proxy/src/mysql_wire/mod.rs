//! MySQL wire protocol plumbing
//!
//! ## Module Structure
//!
//! - `transport` - byte-stream boundary (TCP, in-memory pipes, ...)
//! - `framed` - frame codec and the per-connection sequence counter
//! - `protocol` - packet builders/parsers and reply assembly
//! - `auth` - client-facing and backend-facing handshakes

pub mod auth;
pub mod framed;
pub mod protocol;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use framed::{Frame, FramedConnection};
pub use protocol::{Response, ResponseAssembler, ResponseKind};
pub use transport::Transport;
