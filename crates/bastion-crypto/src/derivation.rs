//! IV Derivation
//!
//! Both ends of a key agreement compute the session IV independently from
//! the freshly agreed secret and a 32-bit discriminant, so the derivation
//! must be reproduced bit for bit:
//!
//! ```text
//! seed_iv = SHA256(discriminant as 4 big-endian bytes)[0..16]
//! iv      = AES-256-CBC(key = secret_key, iv = seed_iv, SHA256(secret_material))[0..16]
//! ```

use crate::encryption::{encrypt, IV_SIZE};
use crate::errors::CryptoResult;
use crate::hashing::sha256;

/// Derive a 16-byte IV from a discriminant, a 256-bit key and secret material
///
/// Pure function: identical inputs always produce identical output.
pub fn derive_iv(
    discriminant: i32,
    secret_key: &[u8],
    secret_material: &[u8],
) -> CryptoResult<[u8; IV_SIZE]> {
    let seed = sha256(&discriminant.to_be_bytes());
    let material = sha256(secret_material);
    let ciphertext = encrypt(secret_key, &seed[..IV_SIZE], &material)?;

    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(&ciphertext[..IV_SIZE]);
    Ok(iv)
}
