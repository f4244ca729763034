//! Encrypted Key Exchange
//!
//! Bootstraps a long-term key between a resource server (initiator) and the
//! authority (responder). The initiator hides its DH public key under an
//! ephemeral AES key, and wraps that key for the responder's RSA key.
//!
//! ```text
//! Initiator                                               Responder
//!   |--- EkeHello ------------------------------------------>|
//!   |    E(ek, dh_pub), RSA-OAEP(responder, ek || eiv)       |
//!   |                                                        |  DH responder side
//!   |<-- EkeReply -------------------------------------------|
//!   |    E(ek, {dh_pub', aes_parameters}), E(k, challenge)   |
//!   |                                                        |
//!   |--- EkeConfirm: E(k, challenge + 1) ------------------->|  pending -> long-term
//! ```
//!
//! Any failure aborts the exchange. There is no retry here.

use bastion_crypto::{open_with, seal_for, RsaPrivateKey, RsaPublicKey, SessionCipher, IV_SIZE, KEY_SIZE};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;
use zeroize::Zeroizing;

use crate::errors::{ProtocolError, ProtocolResult};
use crate::handshake::{DhReply, DiffieHellmanExchange};
use crate::key_store::KeyMaterial;
use crate::timestamp::Timestamp;

/// Initiator's opening message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EkeHello {
    pub initiator: String,
    #[serde(with = "hex::serde")]
    pub encrypted_public_key: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub wrapped_key: Vec<u8>,
    pub timestamp: Timestamp,
}

/// Responder's answer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EkeReply {
    #[serde(with = "hex::serde")]
    pub encrypted_response: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub encrypted_challenge: Vec<u8>,
}

/// Initiator's proof that it derived the same key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EkeConfirm {
    pub initiator: String,
    #[serde(with = "hex::serde")]
    pub challenge_response: Vec<u8>,
}

/// Initiator side of one exchange
pub struct EkeInitiator {
    identity: String,
    exchange: DiffieHellmanExchange,
    ephemeral: SessionCipher,
}

impl EkeInitiator {
    /// Build the opening message for `responder_key`
    pub fn start(
        identity: impl Into<String>,
        responder_key: &RsaPublicKey,
    ) -> ProtocolResult<(Self, EkeHello)> {
        let identity = identity.into();
        let exchange = DiffieHellmanExchange::initiate();
        let ephemeral = SessionCipher::generate()?;

        let encrypted_public_key = ephemeral.encrypt(&exchange.public_key_bytes())?;
        let mut secret = Zeroizing::new(Vec::with_capacity(KEY_SIZE + IV_SIZE));
        secret.extend_from_slice(ephemeral.key());
        secret.extend_from_slice(ephemeral.iv());
        let wrapped_key = seal_for(responder_key, &secret)?;

        let hello = EkeHello {
            initiator: identity.clone(),
            encrypted_public_key,
            wrapped_key,
            timestamp: Timestamp::now(),
        };
        Ok((
            Self {
                identity,
                exchange,
                ephemeral,
            },
            hello,
        ))
    }

    /// Finish the exchange; returns the long-term material and the confirmation
    pub fn finish(
        self,
        responder_id: &str,
        reply: &EkeReply,
    ) -> ProtocolResult<(KeyMaterial, EkeConfirm)> {
        let response = self.ephemeral.decrypt(&reply.encrypted_response)?;
        let dh_reply: DhReply = serde_json::from_slice(&response)?;
        let material = self.exchange.complete(responder_id, &dh_reply)?;

        let cipher = material.cipher();
        let challenge = decode_challenge(&cipher.decrypt(&reply.encrypted_challenge)?)?;
        let challenge_response = cipher.encrypt(&challenge.wrapping_add(1).to_be_bytes())?;

        debug!("EKE initiator {} answered challenge", self.identity);
        Ok((
            material,
            EkeConfirm {
                initiator: self.identity,
                challenge_response,
            },
        ))
    }
}

/// Responder side, bound to our long-term RSA key
pub struct EkeResponder<'a> {
    private_key: &'a RsaPrivateKey,
}

impl<'a> EkeResponder<'a> {
    pub fn new(private_key: &'a RsaPrivateKey) -> Self {
        Self { private_key }
    }

    /// Answer a hello; the key material stays pending until confirmed
    pub fn respond(&self, hello: &EkeHello) -> ProtocolResult<(EkeReply, PendingEke)> {
        let secret = open_with(self.private_key, &hello.wrapped_key)?;
        if secret.len() != KEY_SIZE + IV_SIZE {
            return Err(ProtocolError::TamperedMessage(format!(
                "wrapped key has {} bytes",
                secret.len()
            )));
        }
        let ephemeral = SessionCipher::from_slices(&secret[..KEY_SIZE], &secret[KEY_SIZE..])?;
        let initiator_public = ephemeral.decrypt(&hello.encrypted_public_key)?;

        let (dh_reply, material) = DiffieHellmanExchange::answer(&hello.initiator, &initiator_public)?;
        let encrypted_response = ephemeral.encrypt(&serde_json::to_vec(&dh_reply)?)?;

        let challenge = rand::thread_rng().next_u64() as i64;
        let encrypted_challenge = material.cipher().encrypt(&challenge.to_be_bytes())?;

        debug!("EKE responder issued challenge to {}", hello.initiator);
        Ok((
            EkeReply {
                encrypted_response,
                encrypted_challenge,
            },
            PendingEke {
                initiator: hello.initiator.clone(),
                material,
                challenge,
                issued_at: Instant::now(),
            },
        ))
    }
}

/// Responder-side key material awaiting the initiator's confirmation
pub struct PendingEke {
    initiator: String,
    material: KeyMaterial,
    challenge: i64,
    issued_at: Instant,
}

impl PendingEke {
    pub fn initiator(&self) -> &str {
        &self.initiator
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.issued_at.elapsed() > ttl
    }

    /// Check the confirmation and release the long-term material
    pub fn confirm(self, confirm: &EkeConfirm) -> ProtocolResult<KeyMaterial> {
        if confirm.initiator != self.initiator {
            return Err(ProtocolError::TamperedMessage(format!(
                "confirmation from {} for exchange with {}",
                confirm.initiator, self.initiator
            )));
        }
        let plaintext = self.material.cipher().decrypt(&confirm.challenge_response)?;
        if decode_challenge(&plaintext)? != self.challenge.wrapping_add(1) {
            return Err(ProtocolError::TamperedMessage(
                "key exchange challenge response does not match".into(),
            ));
        }
        Ok(self.material)
    }
}

fn decode_challenge(bytes: &[u8]) -> ProtocolResult<i64> {
    let bytes: [u8; 8] = bytes
        .try_into()
        .map_err(|_| ProtocolError::TamperedMessage(format!("challenge has {} bytes", bytes.len())))?;
    Ok(i64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{authority_key, client_key};

    fn run_until_reply() -> (EkeInitiator, EkeReply, PendingEke) {
        let authority = authority_key();
        let (initiator, hello) = EkeInitiator::start("database", authority.public_key()).unwrap();
        let (reply, pending) = EkeResponder::new(authority.private_key())
            .respond(&hello)
            .unwrap();
        (initiator, reply, pending)
    }

    #[test]
    fn test_full_exchange() {
        let (initiator, reply, pending) = run_until_reply();
        assert_eq!(pending.initiator(), "database");

        let (initiator_material, confirm) = initiator.finish("authority", &reply).unwrap();
        let responder_material = pending.confirm(&confirm).unwrap();

        assert_eq!(initiator_material.key(), responder_material.key());
        assert_eq!(initiator_material.iv(), responder_material.iv());
        assert_eq!(responder_material.owner_id(), "database");
    }

    #[test]
    fn test_wrong_responder_key_fails() {
        let (_, hello) = EkeInitiator::start("database", client_key().public_key()).unwrap();
        let result = EkeResponder::new(authority_key().private_key()).respond(&hello);
        assert!(matches!(result, Err(ProtocolError::Crypto(_))));
    }

    #[test]
    fn test_bad_confirmation_rejected() {
        let (initiator, reply, pending) = run_until_reply();
        let (material, _) = initiator.finish("authority", &reply).unwrap();

        let forged = EkeConfirm {
            initiator: "database".into(),
            challenge_response: material.cipher().encrypt(&7i64.to_be_bytes()).unwrap(),
        };
        assert!(matches!(
            pending.confirm(&forged),
            Err(ProtocolError::TamperedMessage(_))
        ));
    }

    #[test]
    fn test_confirmation_from_other_identity_rejected() {
        let (initiator, reply, pending) = run_until_reply();
        let (_, mut confirm) = initiator.finish("authority", &reply).unwrap();
        confirm.initiator = "bank".into();
        assert!(matches!(
            pending.confirm(&confirm),
            Err(ProtocolError::TamperedMessage(_))
        ));
    }

    #[test]
    fn test_hello_is_json_hex() {
        let (_, hello) = EkeInitiator::start("bank", authority_key().public_key()).unwrap();
        let json = serde_json::to_string(&hello).unwrap();
        let back: EkeHello = serde_json::from_str(&json).unwrap();
        assert_eq!(back.wrapped_key, hello.wrapped_key);
        assert_eq!(back.initiator, "bank");
    }
}
