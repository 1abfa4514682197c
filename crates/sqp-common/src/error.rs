//! Error types for the speculative query proxy

use std::fmt;

/// Result type alias using SqpError
pub type Result<T> = std::result::Result<T, SqpError>;

/// Main error type for proxy components
#[derive(Debug, thiserror::Error)]
pub enum SqpError {
    /// Byte-level transport failure (reset, broken pipe, ...)
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Peer closed the connection cleanly
    #[error("Peer closed the connection")]
    PeerClosed,

    /// Frame or packet that does not follow the wire protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Handshake with the client or a backend failed
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The designated read replica (index 0) is gone
    #[error("Designated replica lost: {0}")]
    DesignatedReplicaLost(String),

    /// A non-designated replica dropped out of the group
    #[error("Replica {0} is unavailable")]
    ReplicaUnavailable(usize),

    /// Every replica of the group has failed
    #[error("No replica available")]
    NoReplicaAvailable,

    /// Reference trace or undo trace could not be loaded
    #[error("Trace error: {0}")]
    TraceError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SqpError {
    /// Create an internal error from any error type
    pub fn internal<E: fmt::Display>(err: E) -> Self {
        SqpError::Internal(err.to_string())
    }

    /// Create a protocol error from any message
    pub fn protocol<E: fmt::Display>(msg: E) -> Self {
        SqpError::Protocol(msg.to_string())
    }

    /// Get the error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            SqpError::Transport(_) => "TRANSPORT",
            SqpError::PeerClosed => "PEER_CLOSED",
            SqpError::Protocol(_) => "PROTOCOL",
            SqpError::AuthenticationFailed(_) => "UNAUTHENTICATED",
            SqpError::DesignatedReplicaLost(_) => "DESIGNATED_REPLICA_LOST",
            SqpError::ReplicaUnavailable(_) => "REPLICA_UNAVAILABLE",
            SqpError::NoReplicaAvailable => "NO_REPLICA",
            SqpError::TraceError(_) => "TRACE_ERROR",
            SqpError::ConfigError(_) => "CONFIG_ERROR",
            SqpError::SerializationError(_) => "SERIALIZATION_ERROR",
            SqpError::Internal(_) => "INTERNAL",
        }
    }

    /// True when the error only means the peer went away.
    ///
    /// Client hang-ups are routine for a proxy and are logged at debug level.
    pub fn is_disconnect(&self) -> bool {
        match self {
            SqpError::PeerClosed => true,
            SqpError::Transport(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

// Implement conversions from common error types
impl From<serde_json::Error> for SqpError {
    fn from(err: serde_json::Error) -> Self {
        SqpError::SerializationError(err.to_string())
    }
}

impl From<config::ConfigError> for SqpError {
    fn from(err: config::ConfigError) -> Self {
        SqpError::ConfigError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(SqpError::PeerClosed.code(), "PEER_CLOSED");
        assert_eq!(SqpError::ReplicaUnavailable(2).code(), "REPLICA_UNAVAILABLE");
        assert_eq!(SqpError::protocol("bad frame").code(), "PROTOCOL");
    }

    #[test]
    fn test_disconnect_classification() {
        assert!(SqpError::PeerClosed.is_disconnect());
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(SqpError::from(reset).is_disconnect());
        assert!(!SqpError::NoReplicaAvailable.is_disconnect());
    }

    #[test]
    fn test_display_includes_replica() {
        let err = SqpError::ReplicaUnavailable(3);
        assert_eq!(err.to_string(), "Replica 3 is unavailable");
    }
}
