//! Speculative proxy
//!
//! ## Module Structure
//!
//! - `server` - TCP listener, admission control, per-connection setup
//! - `session` - the per-client query loop (hit/miss, speculation, rollback)
//! - `prefetch` - speculative statement to replica mapping
//! - `ledger` - savepoints and pending rollback obligations per replica
//! - `stats` - per-session latency samples

pub mod ledger;
pub mod prefetch;
pub mod server;
pub mod session;
pub mod stats;

pub use server::ProxyServer;
pub use session::{Session, SessionContext};
