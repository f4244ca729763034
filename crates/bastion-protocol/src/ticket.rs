//! Needham-Schroeder style tickets
//!
//! The authority hands the client an outer [`Ticket`] encrypted under the
//! client's DH key. Inside it sits the nested ticket: an [`InnerTicket`]
//! encrypted under the target's long-term key, opaque to the client.

use bastion_crypto::{derive_iv, generate_session_key, SessionCipher, IV_SIZE, KEY_SIZE};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::errors::{ProtocolError, ProtocolResult};
use crate::timestamp::Timestamp;

/// Ticket readable only by the target service
///
/// `issued_at` is the timestamp of the ticket request. The authority never
/// issues two tickets for one source with the same timestamp, so the pair
/// names a ticket uniquely.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct InnerTicket {
    pub source: String,
    #[zeroize(skip)]
    pub issued_at: Timestamp,
    #[serde(with = "hex::serde")]
    pub session_key: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub session_iv: Vec<u8>,
}

impl InnerTicket {
    /// Encrypt for the target
    pub fn seal(&self, target: &SessionCipher) -> ProtocolResult<Vec<u8>> {
        let plaintext = zeroize::Zeroizing::new(serde_json::to_vec(self)?);
        Ok(target.encrypt(&plaintext)?)
    }

    /// Decrypt with the target's long-term key
    pub fn open(ciphertext: &[u8], target: &SessionCipher) -> ProtocolResult<Self> {
        let plaintext = zeroize::Zeroizing::new(target.decrypt(ciphertext)?);
        serde_json::from_slice(&plaintext)
            .map_err(|e| ProtocolError::TamperedMessage(format!("unreadable nested ticket: {e}")))
    }

    /// Cipher for the session this ticket grants
    pub fn session_cipher(&self) -> ProtocolResult<SessionCipher> {
        Ok(SessionCipher::from_slices(&self.session_key, &self.session_iv)?)
    }

    /// Replay channel for single-use redemption of tickets from `source`
    pub fn replay_channel(&self) -> String {
        format!("ticket:{}", self.source)
    }
}

/// Ticket as the client sees it
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Ticket {
    pub source: String,
    pub target: String,
    #[zeroize(skip)]
    pub timestamp: Timestamp,
    #[serde(with = "hex::serde")]
    pub session_key: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub session_iv: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub nested_ticket: Vec<u8>,
}

impl Ticket {
    /// Mint a fresh session key and build both ticket layers
    ///
    /// The IV is derived from random material under the new key, so the
    /// authority never reuses an IV across tickets.
    pub fn issue(
        source: &str,
        target: &str,
        timestamp: Timestamp,
        target_cipher: &SessionCipher,
    ) -> ProtocolResult<Self> {
        let session_key = generate_session_key()?;
        let session_iv = fresh_iv(&session_key)?;

        let inner = InnerTicket {
            source: source.to_string(),
            issued_at: timestamp,
            session_key: session_key.to_vec(),
            session_iv: session_iv.to_vec(),
        };
        let nested_ticket = inner.seal(target_cipher)?;

        Ok(Self {
            source: source.to_string(),
            target: target.to_string(),
            timestamp,
            session_key: session_key.to_vec(),
            session_iv: session_iv.to_vec(),
            nested_ticket,
        })
    }

    /// Encrypt for the requesting client
    pub fn seal(&self, client: &SessionCipher) -> ProtocolResult<Vec<u8>> {
        let plaintext = zeroize::Zeroizing::new(serde_json::to_vec(self)?);
        Ok(client.encrypt(&plaintext)?)
    }

    /// Decrypt with the client's DH key
    pub fn open(ciphertext: &[u8], client: &SessionCipher) -> ProtocolResult<Self> {
        let plaintext = zeroize::Zeroizing::new(client.decrypt(ciphertext)?);
        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Cipher for the session this ticket grants
    pub fn session_cipher(&self) -> ProtocolResult<SessionCipher> {
        Ok(SessionCipher::from_slices(&self.session_key, &self.session_iv)?)
    }
}

impl std::fmt::Debug for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticket")
            .field("source", &self.source)
            .field("target", &self.target)
            .field("timestamp", &self.timestamp)
            .finish_non_exhaustive()
    }
}

fn fresh_iv(session_key: &[u8; KEY_SIZE]) -> ProtocolResult<[u8; IV_SIZE]> {
    let mut rng = rand::thread_rng();
    let discriminant = rng.next_u32() as i32;
    let mut material = zeroize::Zeroizing::new([0u8; KEY_SIZE]);
    rng.fill_bytes(&mut material[..]);
    Ok(derive_iv(discriminant, session_key, &material[..])?)
}
