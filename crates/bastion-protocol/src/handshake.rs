//! Diffie-Hellman key agreement
//!
//! Unauthenticated finite-field DH over the RFC 3526 2048-bit group.
//!
//! ## Exchange Flow
//!
//! ```text
//! Initiator                                         Responder
//!   |                                                   |
//!   |--- DhOffer (p, g, y_i, timestamp) --------------->|
//!   |                                                   |  adopt (p, g), fresh pair,
//!   |                                                   |  fresh AES parameters
//!   |<-- DhReply (p, g, y_r, aes_parameters) -----------|
//!   |                                                   |
//!   |  key = secret[0..32]                              |  same derivation
//!   |  iv  = derive_iv(discriminant, key, secret)       |
//! ```
//!
//! Both sides run the same [`DiffieHellmanExchange`] type, parameterized by
//! [`DhRole`]. The exchange is consumed when the secret is derived, so an
//! ephemeral key pair is never reused.

use bastion_crypto::{derive_iv, AesParameters, DhKeyPair, DhPublicKey, DhSharedSecret};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{ProtocolError, ProtocolResult};
use crate::key_store::KeyMaterial;
use crate::timestamp::Timestamp;

/// First message of the exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhOffer {
    #[serde(with = "hex::serde")]
    pub client_public_key: Vec<u8>,
    pub timestamp: Timestamp,
}

/// Responder's answer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhReply {
    #[serde(with = "hex::serde")]
    pub server_public_key: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub aes_parameters: Vec<u8>,
}

/// Which side of the exchange we are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhRole {
    Initiator,
    Responder,
}

/// One in-flight key agreement
pub struct DiffieHellmanExchange {
    role: DhRole,
    key_pair: DhKeyPair,
}

impl DiffieHellmanExchange {
    /// Start an exchange over the default group
    pub fn initiate() -> Self {
        Self {
            role: DhRole::Initiator,
            key_pair: DhKeyPair::generate_default(),
        }
    }

    /// Answer an exchange, adopting the initiator's group
    pub fn respond_to(initiator_public: &DhPublicKey) -> Self {
        Self {
            role: DhRole::Responder,
            key_pair: DhKeyPair::generate_for_peer(initiator_public),
        }
    }

    pub fn role(&self) -> DhRole {
        self.role
    }

    /// Encoded `(p, g, y)` of our ephemeral key
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.key_pair.public_key().to_bytes()
    }

    /// Offer message for the initiator side
    pub fn offer(&self) -> DhOffer {
        DhOffer {
            client_public_key: self.public_key_bytes(),
            timestamp: Timestamp::now(),
        }
    }

    /// Derive key material with the peer's public key and the agreed parameters
    pub fn finish(
        self,
        owner_id: &str,
        peer_public: &DhPublicKey,
        parameters: &AesParameters,
    ) -> ProtocolResult<KeyMaterial> {
        let secret = self.key_pair.agree(peer_public)?;
        let material = derive_key_material(owner_id, &secret, parameters)?;
        debug!("DH {:?} side derived key material for {}", self.role, owner_id);
        Ok(material)
    }

    /// Initiator side: finish with the responder's reply
    pub fn complete(self, owner_id: &str, reply: &DhReply) -> ProtocolResult<KeyMaterial> {
        if self.role != DhRole::Initiator {
            return Err(ProtocolError::InvalidState(
                "only the initiator completes with a reply".into(),
            ));
        }
        let peer_public = DhPublicKey::from_bytes(&reply.server_public_key)?;
        let parameters = AesParameters::from_encoded(reply.aes_parameters.clone())?;
        self.finish(owner_id, &peer_public, &parameters)
    }

    /// Responder side in one step: parse the initiator key, answer, derive
    pub fn answer(owner_id: &str, initiator_public: &[u8]) -> ProtocolResult<(DhReply, KeyMaterial)> {
        let initiator_public = DhPublicKey::from_bytes(initiator_public)?;
        let exchange = Self::respond_to(&initiator_public);
        let parameters = AesParameters::generate()?;

        let reply = DhReply {
            server_public_key: exchange.public_key_bytes(),
            aes_parameters: parameters.encoded().to_vec(),
        };
        let material = exchange.finish(owner_id, &initiator_public, &parameters)?;
        Ok((reply, material))
    }
}

impl std::fmt::Debug for DiffieHellmanExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiffieHellmanExchange")
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

/// key = secret[0..32], iv = derive_iv(discriminant, key, secret)
fn derive_key_material(
    owner_id: &str,
    secret: &DhSharedSecret,
    parameters: &AesParameters,
) -> ProtocolResult<KeyMaterial> {
    let key = secret.aes_key();
    let iv = derive_iv(parameters.discriminant(), &key, secret.as_bytes())?;
    Ok(KeyMaterial::new(owner_id, key, iv))
}
