//! Finite-field Diffie-Hellman
//!
//! Classic DH over the RFC 3526 2048-bit MODP group (group 14, g = 2).
//! Public keys carry their group parameters so a responder can adopt the
//! initiator's group, and the shared secret is encoded big-endian, padded
//! to the modulus length.
//!
//! Also home of [`AesParameters`], the encoded CBC parameter blob the
//! responder sends back. Its bytes 10..14 double as the IV-derivation
//! discriminant.

use num_bigint::{BigUint, RandBigInt};
use num_traits::One;
use zeroize::Zeroizing;

use crate::encryption::{generate_iv, IV_SIZE, KEY_SIZE};
use crate::errors::{CryptoError, CryptoResult};

/// Minimum accepted modulus size in bits
pub const MIN_MODULUS_BITS: u64 = 2048;

/// Maximum accepted modulus size in bits
pub const MAX_MODULUS_BITS: u64 = 8192;

/// RFC 3526 group 14 prime
const MODP_2048_PRIME: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1",
    "29024E088A67CC74020BBEA63B139B22514A08798E3404DD",
    "EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245",
    "E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D",
    "C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F",
    "83655D23DCA3AD961C62F356208552BB9ED529077096966D",
    "670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9",
    "DE2BCBF6955817183995497CEA956AE515D2261898FA0510",
    "15728E5A8AACAA68FFFFFFFFFFFFFFFF",
);

/// Group parameters `(p, g)`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DhParams {
    p: BigUint,
    g: BigUint,
}

impl DhParams {
    /// The 2048-bit MODP group from RFC 3526
    pub fn modp_2048() -> Self {
        let p = BigUint::parse_bytes(MODP_2048_PRIME.as_bytes(), 16)
            .unwrap_or_else(BigUint::one);
        Self {
            p,
            g: BigUint::from(2u32),
        }
    }

    /// Build from raw values, rejecting groups that are too small or too large
    pub fn new(p: BigUint, g: BigUint) -> CryptoResult<Self> {
        if p.bits() < MIN_MODULUS_BITS {
            return Err(CryptoError::InvalidPublicKey(format!(
                "modulus of {} bits is below the {} bit minimum",
                p.bits(),
                MIN_MODULUS_BITS
            )));
        }
        if p.bits() > MAX_MODULUS_BITS {
            return Err(CryptoError::InvalidPublicKey(format!(
                "modulus of {} bits exceeds the {} bit maximum",
                p.bits(),
                MAX_MODULUS_BITS
            )));
        }
        if g <= BigUint::one() || g >= p {
            return Err(CryptoError::InvalidPublicKey("generator out of range".into()));
        }
        Ok(Self { p, g })
    }

    /// Prime modulus
    pub fn prime(&self) -> &BigUint {
        &self.p
    }

    /// Generator
    pub fn generator(&self) -> &BigUint {
        &self.g
    }

    /// Modulus length in bytes (size of an encoded shared secret)
    pub fn modulus_len(&self) -> usize {
        ((self.p.bits() + 7) / 8) as usize
    }

    /// Public values must lie in `[2, p - 2]`
    fn check_public_value(&self, y: &BigUint) -> CryptoResult<()> {
        let two = BigUint::from(2u32);
        if y < &two || y > &(&self.p - &two) {
            return Err(CryptoError::InvalidPublicKey(
                "public value outside [2, p-2]".into(),
            ));
        }
        Ok(())
    }
}

impl Default for DhParams {
    fn default() -> Self {
        Self::modp_2048()
    }
}

/// A DH public key together with its group
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DhPublicKey {
    params: DhParams,
    y: BigUint,
}

impl DhPublicKey {
    /// Group this key belongs to
    pub fn params(&self) -> &DhParams {
        &self.params
    }

    /// Public value
    pub fn value(&self) -> &BigUint {
        &self.y
    }

    /// Serialize as three u16-length-prefixed big-endian integers: p, g, y
    pub fn to_bytes(&self) -> Vec<u8> {
        let fields = [
            self.params.p.to_bytes_be(),
            self.params.g.to_bytes_be(),
            self.y.to_bytes_be(),
        ];
        let mut buf = Vec::with_capacity(fields.iter().map(|f| f.len() + 2).sum());
        for field in &fields {
            buf.extend_from_slice(&(field.len() as u16).to_be_bytes());
            buf.extend_from_slice(field);
        }
        buf
    }

    /// Deserialize and validate an encoded public key
    pub fn from_bytes(data: &[u8]) -> CryptoResult<Self> {
        let mut rest = data;
        let mut fields = Vec::with_capacity(3);
        for name in ["p", "g", "y"] {
            if rest.len() < 2 {
                return Err(CryptoError::InvalidPublicKey(format!(
                    "truncated before field {}",
                    name
                )));
            }
            let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
            rest = &rest[2..];
            if rest.len() < len {
                return Err(CryptoError::InvalidPublicKey(format!(
                    "field {} truncated",
                    name
                )));
            }
            fields.push(BigUint::from_bytes_be(&rest[..len]));
            rest = &rest[len..];
        }
        if !rest.is_empty() {
            return Err(CryptoError::InvalidPublicKey("trailing bytes".into()));
        }

        let y = fields.pop().unwrap_or_default();
        let g = fields.pop().unwrap_or_default();
        let p = fields.pop().unwrap_or_default();
        let params = DhParams::new(p, g)?;
        params.check_public_value(&y)?;
        Ok(Self { params, y })
    }
}

/// Ephemeral DH key pair for one exchange
///
/// Consumed by [`DhKeyPair::agree`], so a key pair cannot be reused.
pub struct DhKeyPair {
    secret: BigUint,
    public: DhPublicKey,
}

impl DhKeyPair {
    /// Generate a key pair in the given group
    pub fn generate(params: &DhParams) -> Self {
        let mut rng = rand::thread_rng();
        let two = BigUint::from(2u32);
        let upper = &params.p - &two;
        let secret = rng.gen_biguint_range(&two, &upper);
        let y = params.g.modpow(&secret, &params.p);
        Self {
            secret,
            public: DhPublicKey {
                params: params.clone(),
                y,
            },
        }
    }

    /// Generate a key pair in the default 2048-bit group
    pub fn generate_default() -> Self {
        Self::generate(&DhParams::modp_2048())
    }

    /// Generate a key pair adopting the group of a peer's public key
    pub fn generate_for_peer(peer: &DhPublicKey) -> Self {
        Self::generate(&peer.params)
    }

    /// Our public key
    pub fn public_key(&self) -> &DhPublicKey {
        &self.public
    }

    /// Compute the shared secret with a peer, consuming this key pair
    pub fn agree(self, peer: &DhPublicKey) -> CryptoResult<DhSharedSecret> {
        if peer.params != self.public.params {
            return Err(CryptoError::InvalidPublicKey(
                "peer uses a different group".into(),
            ));
        }
        self.public.params.check_public_value(&peer.y)?;

        let shared = peer.y.modpow(&self.secret, &self.public.params.p);
        if shared <= BigUint::one() {
            return Err(CryptoError::InvalidPublicKey(
                "derived a degenerate shared secret".into(),
            ));
        }

        let raw = shared.to_bytes_be();
        let len = self.public.params.modulus_len();
        let mut encoded = Zeroizing::new(vec![0u8; len]);
        encoded[len - raw.len()..].copy_from_slice(&raw);
        Ok(DhSharedSecret(encoded))
    }
}

impl std::fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhKeyPair")
            .field("modulus_bits", &self.public.params.p.bits())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Agreed DH secret, wiped on drop
pub struct DhSharedSecret(Zeroizing<Vec<u8>>);

impl DhSharedSecret {
    /// Full encoded secret
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// AES-256 key: the first 32 bytes of the secret
    pub fn aes_key(&self) -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&self.0[..KEY_SIZE]);
        key
    }
}

/// DER tag for an OCTET STRING
const OCTET_STRING_TAG: u8 = 0x04;

/// Offset of the 4-byte discriminant inside an encoded parameter blob
pub const DISCRIMINANT_OFFSET: usize = 10;

/// Encoded AES-CBC parameters: `04 10 || iv` (DER OCTET STRING)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AesParameters(Vec<u8>);

impl AesParameters {
    /// Encode a CBC IV
    pub fn from_iv(iv: &[u8; IV_SIZE]) -> Self {
        let mut encoded = Vec::with_capacity(2 + IV_SIZE);
        encoded.push(OCTET_STRING_TAG);
        encoded.push(IV_SIZE as u8);
        encoded.extend_from_slice(iv);
        Self(encoded)
    }

    /// Fresh parameters around a random IV
    pub fn generate() -> CryptoResult<Self> {
        Ok(Self::from_iv(&generate_iv()?))
    }

    /// Wrap an encoded blob received from a peer
    pub fn from_encoded(encoded: Vec<u8>) -> CryptoResult<Self> {
        if encoded.len() != 2 + IV_SIZE
            || encoded[0] != OCTET_STRING_TAG
            || encoded[1] as usize != IV_SIZE
        {
            return Err(CryptoError::InvalidParameters(format!(
                "expected {} byte OCTET STRING, got {} bytes",
                2 + IV_SIZE,
                encoded.len()
            )));
        }
        Ok(Self(encoded))
    }

    /// Encoded bytes
    pub fn encoded(&self) -> &[u8] {
        &self.0
    }

    /// Big-endian i32 at bytes 10..14 of the encoding
    pub fn discriminant(&self) -> i32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.0[DISCRIMINANT_OFFSET..DISCRIMINANT_OFFSET + 4]);
        i32::from_be_bytes(bytes)
    }
}
