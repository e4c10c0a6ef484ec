//! agentgate error types

use thiserror::Error;

/// agentgate error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Duplex channel error
    #[error("Channel error: {0}")]
    Channel(String),

    /// RPC protocol error
    #[error("RPC error: {0}")]
    Rpc(String),

    /// Schema compilation or validation error
    #[error("Schema error: {0}")]
    Schema(String),

    /// Input rejected before reaching a handler
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown agent, handler or procedure
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation conflicts with current state
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Session or server token mismatch
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Operation did not finish in time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A dependency (usually an agent process) failed
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Gateway error
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for agentgate operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Forbidden("session token mismatch".to_string());
        assert_eq!(err.to_string(), "Forbidden: session token mismatch");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
