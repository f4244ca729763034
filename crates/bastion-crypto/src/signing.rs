//! RSA Identities
//!
//! Long-lived 2048-bit RSA key pairs. Used for SHA-256 PKCS#1 v1.5
//! signatures on protected messages, and for RSA-OAEP wrapping of the
//! ephemeral key in the encrypted key exchange.

use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::Oaep;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::errors::{CryptoError, CryptoResult};

pub use rsa::{RsaPrivateKey, RsaPublicKey};

/// RSA modulus size in bits
pub const RSA_BITS: usize = 2048;

/// Signature size in bytes (equal to the modulus size)
pub const SIGNATURE_SIZE: usize = RSA_BITS / 8;

/// Sign `message` with SHA-256 / RSA PKCS#1 v1.5
///
/// Output is always [`SIGNATURE_SIZE`] bytes for a 2048-bit key.
pub fn sign(private_key: &RsaPrivateKey, message: &[u8]) -> CryptoResult<Vec<u8>> {
    let signing_key = SigningKey::<Sha256>::new(private_key.clone());
    let signature = signing_key
        .try_sign(message)
        .map_err(|e| CryptoError::Rsa(e.to_string()))?;
    Ok(signature.to_vec())
}

/// Verify a signature produced by [`sign`]
///
/// Returns `false` on any mismatch or malformed signature; never errors.
pub fn verify(public_key: &RsaPublicKey, message: &[u8], signature: &[u8]) -> bool {
    let verifying_key = VerifyingKey::<Sha256>::new(public_key.clone());
    match Signature::try_from(signature) {
        Ok(signature) => verifying_key.verify(message, &signature).is_ok(),
        Err(_) => false,
    }
}

/// Encrypt a short payload for the holder of `public_key` (RSA-OAEP, SHA-256)
pub fn seal_for(public_key: &RsaPublicKey, data: &[u8]) -> CryptoResult<Vec<u8>> {
    let mut rng = rand::thread_rng();
    public_key
        .encrypt(&mut rng, Oaep::new::<Sha256>(), data)
        .map_err(|e| CryptoError::Rsa(e.to_string()))
}

/// Decrypt a payload produced by [`seal_for`]
pub fn open_with(private_key: &RsaPrivateKey, data: &[u8]) -> CryptoResult<Zeroizing<Vec<u8>>> {
    private_key
        .decrypt(Oaep::new::<Sha256>(), data)
        .map(Zeroizing::new)
        .map_err(|e| CryptoError::Rsa(e.to_string()))
}

/// Encode a public key as SPKI DER
pub fn public_key_to_der(public_key: &RsaPublicKey) -> CryptoResult<Vec<u8>> {
    public_key
        .to_public_key_der()
        .map(|doc| doc.as_bytes().to_vec())
        .map_err(|e| CryptoError::KeyEncoding(e.to_string()))
}

/// Decode an SPKI DER public key
pub fn public_key_from_der(der: &[u8]) -> CryptoResult<RsaPublicKey> {
    RsaPublicKey::from_public_key_der(der).map_err(|e| CryptoError::KeyEncoding(e.to_string()))
}

/// Service identity: the RSA key pair a party signs with
#[derive(Clone)]
pub struct RsaKeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl RsaKeyPair {
    /// Generate a new 2048-bit key pair
    pub fn generate() -> CryptoResult<Self> {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, RSA_BITS)
            .map_err(|e| CryptoError::Rsa(e.to_string()))?;
        let public = RsaPublicKey::from(&private);
        Ok(Self { private, public })
    }

    /// Build from an existing private key
    pub fn from_private(private: RsaPrivateKey) -> Self {
        let public = RsaPublicKey::from(&private);
        Self { private, public }
    }

    /// Load from PKCS#8 PEM text
    pub fn from_pem(pem: &str) -> CryptoResult<Self> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| CryptoError::KeyEncoding(e.to_string()))?;
        Ok(Self::from_private(private))
    }

    /// Export the private key as PKCS#8 PEM
    pub fn private_key_pem(&self) -> CryptoResult<Zeroizing<String>> {
        self.private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CryptoError::KeyEncoding(e.to_string()))
    }

    /// Export the public key as SPKI PEM
    pub fn public_key_pem(&self) -> CryptoResult<String> {
        self.public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::KeyEncoding(e.to_string()))
    }

    /// Export the public key as SPKI DER
    pub fn public_key_der(&self) -> CryptoResult<Vec<u8>> {
        public_key_to_der(&self.public)
    }

    /// The private half
    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private
    }

    /// The public half
    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    /// Sign with this identity
    pub fn sign(&self, message: &[u8]) -> CryptoResult<Vec<u8>> {
        sign(&self.private, message)
    }
}

impl std::fmt::Debug for RsaKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fingerprint = self
            .public_key_der()
            .map(|der| hex::encode(&crate::hashing::sha256(&der)[..8]))
            .unwrap_or_else(|_| "?".into());
        f.debug_struct("RsaKeyPair")
            .field("public", &fingerprint)
            .field("private", &"[REDACTED]")
            .finish()
    }
}

/// Public parse from PEM, used for counterpart keys in configuration
pub fn public_key_from_pem(pem: &str) -> CryptoResult<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem).map_err(|e| CryptoError::KeyEncoding(e.to_string()))
}

#[cfg(test)]
pub(crate) mod test_keys {
    use super::RsaKeyPair;
    use std::sync::OnceLock;

    static ALICE: OnceLock<RsaKeyPair> = OnceLock::new();
    static BOB: OnceLock<RsaKeyPair> = OnceLock::new();

    pub fn alice() -> &'static RsaKeyPair {
        ALICE.get_or_init(|| RsaKeyPair::generate().unwrap())
    }

    pub fn bob() -> &'static RsaKeyPair {
        BOB.get_or_init(|| RsaKeyPair::generate().unwrap())
    }
}
