//! # Bastion Crypto
//!
//! Cryptographic primitives for the Bastion session protocol. Everything
//! here is a pure function or a value type; no component keeps state.
//!
//! ## Components
//!
//! - **Encryption**: AES-256-CBC with PKCS#5/7 padding
//! - **Signing**: SHA-256 / RSA-2048 signatures, RSA-OAEP key wrapping
//! - **Envelope**: sign-then-encrypt `protect`, plus decoupled `unprotect` and `check`
//! - **Derivation**: deterministic keyed IV derivation
//! - **Key Exchange**: finite-field Diffie-Hellman over the RFC 3526 2048-bit group
//! - **Hashing**: SHA-256 for protocol values, BLAKE3 for local fingerprints

pub mod encryption;
pub mod signing;
pub mod envelope;
pub mod derivation;
pub mod key_exchange;
pub mod hashing;
pub mod errors;

pub use encryption::*;
pub use signing::*;
pub use envelope::*;
pub use derivation::*;
pub use key_exchange::*;
pub use hashing::*;
pub use errors::*;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::encryption::*;
    pub use crate::signing::*;
    pub use crate::envelope::*;
    pub use crate::derivation::*;
    pub use crate::key_exchange::*;
    pub use crate::hashing::*;
    pub use crate::errors::*;
}
