//! Protocol Error Types

use bastion_crypto::CryptoError;
use thiserror::Error;

use crate::constants::ErrorCode;

/// Protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Timestamp or nonce already consumed, or outside the replay window
    #[error("Replay attack detected: {0}")]
    ReplayAttack(String),

    /// Signature check failed or a plaintext field violates an invariant
    #[error("Tampered message: {0}")]
    TamperedMessage(String),

    /// Crypto error from bastion-crypto
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// No (unexpired) key material for this peer
    #[error("Key material not found for {0}")]
    KeyMaterialNotFound(String),

    /// Operation not valid in the current handshake state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Request or payload is not what this endpoint expects
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Frame larger than the wire limit
    #[error("Frame too large: got {size} bytes, max is {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Remote side did not answer in time
    #[error("Operation timed out")]
    Timeout,

    /// Connection closed before a response arrived
    #[error("Connection closed")]
    ConnectionClosed,

    /// Error reported by the remote side that has no local counterpart
    #[error("Remote error ({code:?}): {message}")]
    Remote { code: ErrorCode, message: String },
}

impl ProtocolError {
    /// Convert to error code for wire format
    pub fn to_error_code(&self) -> ErrorCode {
        match self {
            ProtocolError::ReplayAttack(_) => ErrorCode::ReplayAttack,
            ProtocolError::TamperedMessage(_) => ErrorCode::TamperedMessage,
            ProtocolError::Crypto(_) => ErrorCode::CryptoError,
            ProtocolError::KeyMaterialNotFound(_) => ErrorCode::KeyMaterialNotFound,
            ProtocolError::InvalidState(_) => ErrorCode::InvalidState,
            ProtocolError::InvalidMessage(_) => ErrorCode::InvalidMessage,
            ProtocolError::FrameTooLarge { .. } => ErrorCode::InvalidMessage,
            ProtocolError::Serialization(_) => ErrorCode::InvalidMessage,
            ProtocolError::Remote { code, .. } => *code,
            _ => ErrorCode::Internal,
        }
    }

    /// Rebuild an error received over the wire
    pub fn from_wire(code: ErrorCode, message: String) -> Self {
        match code {
            ErrorCode::ReplayAttack => ProtocolError::ReplayAttack(message),
            ErrorCode::TamperedMessage => ProtocolError::TamperedMessage(message),
            ErrorCode::KeyMaterialNotFound => ProtocolError::KeyMaterialNotFound(message),
            ErrorCode::InvalidState => ProtocolError::InvalidState(message),
            _ => ProtocolError::Remote { code, message },
        }
    }

    /// Whether the caller must restart the handshake before retrying
    pub fn requires_authentication(&self) -> bool {
        self.to_error_code().requires_authentication()
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Serialization(e.to_string())
    }
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;
