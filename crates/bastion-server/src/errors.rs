//! Server Errors
//!
//! Error types for the authority and resource servers.

use bastion_crypto::CryptoError;
use bastion_protocol::ProtocolError;
use thiserror::Error;

use crate::config::ConfigError;

/// Result type for server operations
pub type ServerResult<T> = Result<T, ServerError>;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    /// Server is already running
    #[error("Server is already running")]
    AlreadyRunning,

    /// Failed to bind to address
    #[error("Failed to bind to {address}: {reason}")]
    BindFailed { address: String, reason: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Crypto error outside of a request
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Service identity could not be loaded or created
    #[error("Identity error: {0}")]
    Identity(String),

    /// Key exchange with the authority failed at startup
    #[error("Bootstrap with authority failed: {0}")]
    Bootstrap(String),

    /// Connection limit reached
    #[error("Maximum connections ({max}) reached")]
    ConnectionLimitReached { max: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_converts() {
        let err: ServerError = ProtocolError::ReplayAttack("seen".into()).into();
        assert!(matches!(err, ServerError::Protocol(ProtocolError::ReplayAttack(_))));
        assert!(err.to_string().contains("seen"));
    }

    #[test]
    fn test_bind_failed_message() {
        let err = ServerError::BindFailed {
            address: "127.0.0.1:1".into(),
            reason: "denied".into(),
        };
        assert_eq!(err.to_string(), "Failed to bind to 127.0.0.1:1: denied");
    }
}
