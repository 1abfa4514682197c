//! SQP Common Library
//!
//! Shared error and configuration types for the speculative query proxy.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{ProxyConfig, SpeculatorKind};
pub use error::{Result, SqpError};
