//! Sign-then-encrypt Envelopes
//!
//! `protect` signs the plaintext, prepends the 256-byte signature and
//! encrypts the result. Decryption (`unprotect`) and verification (`check`)
//! are separate operations: a recipient that learns the sender's public key
//! from inside the message must be able to decrypt first.
//!
//! ```text
//! cryptogram = AES-CBC(key, iv, signature[256] || message)
//! ```

use crate::encryption::{decrypt, encrypt, SessionCipher};
use crate::errors::{CryptoError, CryptoResult};
use crate::signing::{sign, verify, RsaPrivateKey, RsaPublicKey, SIGNATURE_SIZE};

/// Sign `message` with `private_key`, then encrypt `signature || message`
pub fn protect(
    symmetric_key: &[u8],
    private_key: &RsaPrivateKey,
    iv: &[u8],
    message: &[u8],
) -> CryptoResult<Vec<u8>> {
    let signature = sign(private_key, message)?;
    let mut signed = Vec::with_capacity(signature.len() + message.len());
    signed.extend_from_slice(&signature);
    signed.extend_from_slice(message);
    encrypt(symmetric_key, iv, &signed)
}

/// Decrypt a protected cryptogram and return the message without verifying it
pub fn unprotect(cryptogram: &[u8], symmetric_key: &[u8], iv: &[u8]) -> CryptoResult<Vec<u8>> {
    let plaintext = decrypt(symmetric_key, iv, cryptogram)?;
    if plaintext.len() < SIGNATURE_SIZE {
        return Err(CryptoError::MessageTooShort {
            got: plaintext.len(),
            min: SIGNATURE_SIZE,
        });
    }
    Ok(plaintext[SIGNATURE_SIZE..].to_vec())
}

/// Decrypt a protected cryptogram and verify its signature against `public_key`
///
/// Any decryption failure counts as a failed check.
pub fn check(
    cryptogram: &[u8],
    symmetric_key: &[u8],
    public_key: &RsaPublicKey,
    iv: &[u8],
) -> bool {
    match decrypt(symmetric_key, iv, cryptogram) {
        Ok(plaintext) if plaintext.len() >= SIGNATURE_SIZE => {
            let (signature, message) = plaintext.split_at(SIGNATURE_SIZE);
            verify(public_key, message, signature)
        }
        _ => false,
    }
}

impl SessionCipher {
    /// [`protect`] with this cipher's key and IV
    pub fn protect(&self, private_key: &RsaPrivateKey, message: &[u8]) -> CryptoResult<Vec<u8>> {
        protect(self.key(), private_key, self.iv(), message)
    }

    /// [`unprotect`] with this cipher's key and IV
    pub fn unprotect(&self, cryptogram: &[u8]) -> CryptoResult<Vec<u8>> {
        unprotect(cryptogram, self.key(), self.iv())
    }

    /// [`check`] with this cipher's key and IV
    pub fn check(&self, cryptogram: &[u8], public_key: &RsaPublicKey) -> bool {
        check(cryptogram, self.key(), public_key, self.iv())
    }
}
