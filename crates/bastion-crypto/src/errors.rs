//! Error types for bastion-crypto

use thiserror::Error;

/// Errors that can occur in bastion-crypto operations
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Invalid symmetric key length
    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    /// Invalid IV length
    #[error("Invalid IV length: expected {expected}, got {got}")]
    InvalidIvLength { expected: usize, got: usize },

    /// Padding check failed after decryption (wrong key, wrong IV or corrupted data)
    #[error("Decryption failed: bad padding")]
    BadPadding,

    /// Plaintext too short to contain a signature
    #[error("Message too short: got {got} bytes, need at least {min}")]
    MessageTooShort { got: usize, min: usize },

    /// RSA operation failed
    #[error("RSA operation failed: {0}")]
    Rsa(String),

    /// Key could not be encoded or decoded
    #[error("Key encoding error: {0}")]
    KeyEncoding(String),

    /// Diffie-Hellman public value or parameters rejected
    #[error("Invalid Diffie-Hellman value: {0}")]
    InvalidPublicKey(String),

    /// Encoded algorithm parameters are malformed
    #[error("Invalid algorithm parameters: {0}")]
    InvalidParameters(String),

    /// Random number generation failed
    #[error("Random number generation failed")]
    RngError,
}

/// Result type for bastion-crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;
