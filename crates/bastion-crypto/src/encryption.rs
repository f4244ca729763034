//! AES-256-CBC Encryption
//!
//! Symmetric encryption with PKCS#5/7 padding. Every peer relationship in
//! the protocol owns a 256-bit key and a 128-bit IV; both ends use the same
//! pair for both directions.

use aes::Aes256;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use zeroize::Zeroizing;

use crate::errors::{CryptoError, CryptoResult};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// AES-256 key size in bytes
pub const KEY_SIZE: usize = 32;

/// CBC initialization vector size in bytes
pub const IV_SIZE: usize = 16;

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;

fn check_lengths(key: &[u8], iv: &[u8]) -> CryptoResult<()> {
    if key.len() != KEY_SIZE {
        return Err(CryptoError::InvalidKeyLength {
            expected: KEY_SIZE,
            got: key.len(),
        });
    }
    if iv.len() != IV_SIZE {
        return Err(CryptoError::InvalidIvLength {
            expected: IV_SIZE,
            got: iv.len(),
        });
    }
    Ok(())
}

/// Encrypt `plaintext` with AES-256-CBC and PKCS#7 padding
///
/// # Errors
/// `InvalidKeyLength` / `InvalidIvLength` when the key is not 32 bytes or the
/// IV is not exactly 16 bytes.
pub fn encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
    check_lengths(key, iv)?;
    let cipher = Aes256CbcEnc::new_from_slices(key, iv).map_err(|_| {
        CryptoError::InvalidKeyLength {
            expected: KEY_SIZE,
            got: key.len(),
        }
    })?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// Decrypt an AES-256-CBC ciphertext and strip its padding
///
/// # Errors
/// Length errors as for [`encrypt`], `BadPadding` when the ciphertext does
/// not decrypt to validly padded data.
pub fn decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
    check_lengths(key, iv)?;
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::BadPadding);
    }
    let cipher = Aes256CbcDec::new_from_slices(key, iv).map_err(|_| {
        CryptoError::InvalidKeyLength {
            expected: KEY_SIZE,
            got: key.len(),
        }
    })?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::BadPadding)
}

/// Generate a fresh random 256-bit AES session key
pub fn generate_session_key() -> CryptoResult<[u8; KEY_SIZE]> {
    let mut key = [0u8; KEY_SIZE];
    rand::thread_rng()
        .try_fill_bytes(&mut key)
        .map_err(|_| CryptoError::RngError)?;
    Ok(key)
}

/// Generate a fresh random IV
pub fn generate_iv() -> CryptoResult<[u8; IV_SIZE]> {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng()
        .try_fill_bytes(&mut iv)
        .map_err(|_| CryptoError::RngError)?;
    Ok(iv)
}

/// Key and IV bound together for one peer relationship
///
/// The key is wiped from memory when the cipher is dropped.
#[derive(Clone)]
pub struct SessionCipher {
    key: Zeroizing<[u8; KEY_SIZE]>,
    iv: [u8; IV_SIZE],
}

impl SessionCipher {
    /// Create a new cipher from a key and IV
    pub fn new(key: [u8; KEY_SIZE], iv: [u8; IV_SIZE]) -> Self {
        Self {
            key: Zeroizing::new(key),
            iv,
        }
    }

    /// Create from slices, validating their lengths
    pub fn from_slices(key: &[u8], iv: &[u8]) -> CryptoResult<Self> {
        check_lengths(key, iv)?;
        let mut k = [0u8; KEY_SIZE];
        k.copy_from_slice(key);
        let mut v = [0u8; IV_SIZE];
        v.copy_from_slice(iv);
        Ok(Self::new(k, v))
    }

    /// Generate a random key and IV
    pub fn generate() -> CryptoResult<Self> {
        Ok(Self::new(generate_session_key()?, generate_iv()?))
    }

    /// Encrypt with this key/IV pair
    pub fn encrypt(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        encrypt(self.key.as_ref(), &self.iv, plaintext)
    }

    /// Decrypt with this key/IV pair
    pub fn decrypt(&self, ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        decrypt(self.key.as_ref(), &self.iv, ciphertext)
    }

    /// Raw key bytes
    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// IV bytes
    pub fn iv(&self) -> &[u8; IV_SIZE] {
        &self.iv
    }

    /// Ciphertext length for a given plaintext length
    pub fn ciphertext_len(plaintext_len: usize) -> usize {
        (plaintext_len / BLOCK_SIZE + 1) * BLOCK_SIZE
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCipher")
            .field("key", &"[REDACTED]")
            .field("iv", &hex::encode(self.iv))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = i as u8;
        }
        key
    }

    #[test]
    fn test_encrypt_decrypt() {
        let key = test_key();
        let iv = [7u8; IV_SIZE];
        let plaintext = b"transfer 100 to bob";

        let ciphertext = encrypt(&key, &iv, plaintext).unwrap();
        assert_eq!(ciphertext.len(), SessionCipher::ciphertext_len(plaintext.len()));

        let decrypted = decrypt(&key, &iv, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_known_answer() {
        // NIST SP 800-38A F.2.5 CBC-AES256.Encrypt, first block
        let key = hex::decode("603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff4").unwrap();
        let iv = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
        let plaintext = hex::decode("6bc1bee22e409f96e93d7e117393172a").unwrap();

        let ciphertext = encrypt(&key, &iv, &plaintext).unwrap();
        assert_eq!(hex::encode(&ciphertext[..16]), "f58c4c04d6e5f1ba779eabfb5f7bfbd6");
        // Full block of padding follows
        assert_eq!(ciphertext.len(), 32);
    }

    #[test]
    fn test_empty_plaintext() {
        let key = test_key();
        let iv = [0u8; IV_SIZE];
        let ciphertext = encrypt(&key, &iv, b"").unwrap();
        assert_eq!(ciphertext.len(), BLOCK_SIZE);
        assert!(decrypt(&key, &iv, &ciphertext).unwrap().is_empty());
    }

    #[test]
    fn test_wrong_key_length() {
        let result = encrypt(&[0u8; 16], &[0u8; IV_SIZE], b"data");
        assert!(matches!(
            result,
            Err(CryptoError::InvalidKeyLength { expected: 32, got: 16 })
        ));
    }

    #[test]
    fn test_wrong_iv_length() {
        let key = test_key();
        let result = encrypt(&key, &[0u8; 12], b"data");
        assert!(matches!(
            result,
            Err(CryptoError::InvalidIvLength { expected: 16, got: 12 })
        ));

        let result = decrypt(&key, &[0u8; 17], &[0u8; 16]);
        assert!(matches!(result, Err(CryptoError::InvalidIvLength { .. })));
    }

    #[test]
    fn test_truncated_ciphertext() {
        let key = test_key();
        let iv = [1u8; IV_SIZE];
        let ciphertext = encrypt(&key, &iv, b"some longer message here").unwrap();

        let result = decrypt(&key, &iv, &ciphertext[..ciphertext.len() - 1]);
        assert!(matches!(result, Err(CryptoError::BadPadding)));
    }

    #[test]
    fn test_wrong_key_fails_or_garbles() {
        let key = test_key();
        let mut other = test_key();
        other[0] ^= 0xFF;
        let iv = [3u8; IV_SIZE];
        let plaintext = b"account: alice";

        let ciphertext = encrypt(&key, &iv, plaintext).unwrap();
        match decrypt(&other, &iv, &ciphertext) {
            Ok(garbled) => assert_ne!(garbled, plaintext),
            Err(e) => assert!(matches!(e, CryptoError::BadPadding)),
        }
    }

    #[test]
    fn test_session_cipher() {
        let cipher = SessionCipher::generate().unwrap();
        let ciphertext = cipher.encrypt(b"hello").unwrap();
        assert_eq!(cipher.decrypt(&ciphertext).unwrap(), b"hello");

        let copy = SessionCipher::from_slices(cipher.key(), cipher.iv()).unwrap();
        assert_eq!(copy.decrypt(&ciphertext).unwrap(), b"hello");
    }

    #[test]
    fn test_session_cipher_debug_redacts_key() {
        let cipher = SessionCipher::new(test_key(), [0u8; IV_SIZE]);
        let debug = format!("{:?}", cipher);
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains(&hex::encode(test_key())));
    }

    #[test]
    fn test_generated_keys_differ() {
        let a = generate_session_key().unwrap();
        let b = generate_session_key().unwrap();
        assert_ne!(a, b);
        assert_ne!(generate_iv().unwrap(), generate_iv().unwrap());
    }
}
