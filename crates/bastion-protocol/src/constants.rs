//! Protocol Constants
//!
//! Sizes, lifetimes and wire error codes.

use serde::{Deserialize, Serialize};

/// Maximum frame payload accepted on the wire (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Length prefix size for frames
pub const FRAME_HEADER_SIZE: usize = 4;

/// Session identifier size
pub const SESSION_ID_SIZE: usize = 16;

/// Default replay window: timestamps older than this are rejected outright
pub const DEFAULT_REPLAY_WINDOW_SECS: u64 = 300;

/// Default tolerated clock skew for timestamps from the future
pub const DEFAULT_MAX_CLOCK_SKEW_SECS: u64 = 30;

/// Default lifetime of an unanswered nonce challenge
pub const DEFAULT_CHALLENGE_TTL_SECS: u64 = 60;

/// Default idle timeout of an established session
pub const DEFAULT_SESSION_IDLE_TIMEOUT_SECS: u64 = 900;

/// Default per-call timeout on the client side
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;

/// Principal name the resource servers expect in redeemed tickets
pub const DEFAULT_CLIENT_PRINCIPAL: &str = "user";

/// Principal name of the authentication authority
pub const AUTHORITY_PRINCIPAL: &str = "authority";

/// Error codes carried in wire error responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Timestamp or nonce already consumed
    ReplayAttack,
    /// Signature check failed or a field violates an invariant
    TamperedMessage,
    /// Malformed key/IV, padding failure, bad parameters
    CryptoError,
    /// Handshake not completed or key material expired
    KeyMaterialNotFound,
    /// Operation not valid in the current handshake state
    InvalidState,
    /// Request could not be parsed or is not served here
    InvalidMessage,
    /// Anything else
    Internal,
}

impl ErrorCode {
    /// Whether the client must restart the handshake
    pub fn requires_authentication(self) -> bool {
        matches!(self, ErrorCode::KeyMaterialNotFound | ErrorCode::InvalidState)
    }
}
