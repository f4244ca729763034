//! Client Errors
//!
//! Error types for the Bastion client.

use bastion_crypto::CryptoError;
use bastion_protocol::ProtocolError;
use thiserror::Error;

use crate::phase::HandshakePhase;

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    /// Business call before the session is established
    #[error("Not authenticated (handshake phase: {phase})")]
    NotAuthenticated { phase: HandshakePhase },

    /// Handshake step called out of order
    #[error("Cannot {step} in handshake phase {phase}")]
    OutOfOrder {
        step: &'static str,
        phase: HandshakePhase,
    },

    /// Protocol error, local or reported by the server
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Crypto error
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Ledger refused the operation
    #[error("Operation rejected: {0}")]
    Rejected(String),

    /// Reply of the wrong shape for the request
    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Whether the handshake must run again before the next call
    pub fn requires_authentication(&self) -> bool {
        match self {
            ClientError::NotAuthenticated { .. } => true,
            ClientError::Protocol(e) => e.requires_authentication(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_authenticated_message() {
        let err = ClientError::NotAuthenticated {
            phase: HandshakePhase::KeyAgreed,
        };
        assert!(err.to_string().contains("key_agreed"));
        assert!(err.requires_authentication());
    }

    #[test]
    fn test_rejected_does_not_require_handshake() {
        assert!(!ClientError::Rejected("invalid credentials".into()).requires_authentication());
    }
}
