//! Hashing
//!
//! SHA-256 for everything both ends must compute identically (IV
//! derivation, signatures, password digests). BLAKE3 for local-only
//! fingerprints such as peer address hashes.

use sha2::{Digest, Sha256};

/// SHA-256 output size
pub const SHA256_SIZE: usize = 32;

/// BLAKE3 output size
pub const FINGERPRINT_SIZE: usize = blake3::OUT_LEN;

/// SHA-256 digest of `data`
pub fn sha256(data: &[u8]) -> [u8; SHA256_SIZE] {
    Sha256::digest(data).into()
}

/// SHA-256 over several pieces, in order
pub fn sha256_many(parts: &[&[u8]]) -> [u8; SHA256_SIZE] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Hex-encoded SHA-256 digest of a password, as sent in business requests
pub fn hash_password(password: &str) -> String {
    hex::encode(sha256(password.as_bytes()))
}

/// Local fingerprint of arbitrary bytes (BLAKE3)
pub fn fingerprint(data: &[u8]) -> [u8; FINGERPRINT_SIZE] {
    *blake3::hash(data).as_bytes()
}

/// Constant-time comparison to prevent timing attacks
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_answer() {
        assert_eq!(
            hex::encode(sha256(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sha256_many_matches_concatenation() {
        assert_eq!(sha256_many(&[b"ab", b"c"]), sha256(b"abc"));
    }

    #[test]
    fn test_hash_password() {
        let hashed = hash_password("pw");
        assert_eq!(hashed.len(), 64);
        assert_eq!(hashed, hash_password("pw"));
        assert_ne!(hashed, hash_password("pw2"));
    }

    #[test]
    fn test_fingerprint_deterministic() {
        assert_eq!(fingerprint(b"127.0.0.1:4000"), fingerprint(b"127.0.0.1:4000"));
        assert_ne!(fingerprint(b"127.0.0.1:4000"), fingerprint(b"127.0.0.1:4001"));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"hello", b"hell"));
    }
}
