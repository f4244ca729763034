//! Session Management
//!
//! Per-peer state kept by a resource server while a client walks through
//! ticket redemption and the liveness challenge.
//!
//! ```text
//! Unauthenticated --redeem_ticket--> TicketIssued --challenge--> Challenged
//!                                                                    |
//!                                       still_alive(nonce + 1) ------+--> Established
//! ```
//!
//! Every transition consumes the old state, so a nonce can only be answered
//! once: a failed answer drops the challenge along with the state.

use bastion_crypto::{RsaPublicKey, SessionCipher};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::{Duration, Instant};

use crate::constants::*;
use crate::errors::{ProtocolError, ProtocolResult};

/// Unique session identifier, issued when a session is established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId([u8; SESSION_ID_SIZE]);

impl SessionId {
    /// Generate a random session ID
    pub fn generate() -> Self {
        let mut id = [0u8; SESSION_ID_SIZE];
        rand::thread_rng().fill_bytes(&mut id);
        Self(id)
    }

    /// Create from bytes
    pub fn from_bytes(bytes: [u8; SESSION_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; SESSION_ID_SIZE] {
        &self.0
    }

    /// Create from slice
    pub fn from_slice(slice: &[u8]) -> ProtocolResult<Self> {
        let id: [u8; SESSION_ID_SIZE] = slice.try_into().map_err(|_| {
            ProtocolError::InvalidMessage(format!(
                "Invalid session ID length: {} (expected {})",
                slice.len(),
                SESSION_ID_SIZE
            ))
        })?;
        Ok(Self(id))
    }

    /// Full hex form, used as a replay channel name
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..4])) // Show first 4 bytes
    }
}

impl Serialize for SessionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        SessionId::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}

/// A one-shot liveness challenge
#[derive(Debug)]
pub struct NonceChallenge {
    nonce: i64,
    owner: String,
    issued_at: Instant,
}

impl NonceChallenge {
    /// Issue a fresh random challenge for `owner`
    pub fn issue(owner: impl Into<String>) -> Self {
        Self {
            nonce: rand::thread_rng().next_u64() as i64,
            owner: owner.into(),
            issued_at: Instant::now(),
        }
    }

    pub fn nonce(&self) -> i64 {
        self.nonce
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// The only accepted answer
    pub fn expected_response(&self) -> i64 {
        self.nonce.wrapping_add(1)
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.issued_at.elapsed() > ttl
    }

    /// Consume the challenge against a response
    pub fn verify(self, response: i64, ttl: Duration) -> ProtocolResult<()> {
        if self.is_expired(ttl) {
            return Err(ProtocolError::ReplayAttack(format!(
                "challenge for {} expired",
                self.owner
            )));
        }
        if response != self.expected_response() {
            return Err(ProtocolError::TamperedMessage(
                "challenge response does not match".into(),
            ));
        }
        Ok(())
    }
}

/// Session key delivered by a ticket, not yet proven live
pub struct PendingSession {
    cipher: SessionCipher,
    principal: String,
    created_at: Instant,
}

impl PendingSession {
    pub fn new(cipher: SessionCipher, principal: impl Into<String>) -> Self {
        Self {
            cipher,
            principal: principal.into(),
            created_at: Instant::now(),
        }
    }

    pub fn cipher(&self) -> &SessionCipher {
        &self.cipher
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Session that passed the liveness check
pub struct EstablishedSession {
    id: SessionId,
    cipher: SessionCipher,
    principal: String,
    peer_public_key: RsaPublicKey,
    created_at: Instant,
    last_activity: Instant,
    requests: u64,
}

impl EstablishedSession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn cipher(&self) -> &SessionCipher {
        &self.cipher
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// Public key delivered during the liveness check
    pub fn peer_public_key(&self) -> &RsaPublicKey {
        &self.peer_public_key
    }

    /// Update activity timestamp
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.requests += 1;
    }

    pub fn requests(&self) -> u64 {
        self.requests
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_time(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

impl std::fmt::Debug for EstablishedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EstablishedSession")
            .field("id", &self.id)
            .field("principal", &self.principal)
            .field("requests", &self.requests)
            .finish()
    }
}

/// Session state name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    TicketIssued,
    Challenged,
    Established,
}

/// Per-peer state on a resource server
pub enum PeerSession {
    Unauthenticated,
    TicketIssued(PendingSession),
    Challenged(PendingSession, NonceChallenge),
    Established(EstablishedSession),
}

impl PeerSession {
    /// A redeemed ticket always restarts the peer's handshake
    pub fn ticket_issued(cipher: SessionCipher, principal: impl Into<String>) -> Self {
        PeerSession::TicketIssued(PendingSession::new(cipher, principal))
    }

    pub fn state(&self) -> SessionState {
        match self {
            PeerSession::Unauthenticated => SessionState::Unauthenticated,
            PeerSession::TicketIssued(_) => SessionState::TicketIssued,
            PeerSession::Challenged(..) => SessionState::Challenged,
            PeerSession::Established(_) => SessionState::Established,
        }
    }

    /// Session cipher for whatever stage the peer is in
    pub fn cipher(&self) -> Option<&SessionCipher> {
        match self {
            PeerSession::Unauthenticated => None,
            PeerSession::TicketIssued(pending) | PeerSession::Challenged(pending, _) => {
                Some(pending.cipher())
            }
            PeerSession::Established(session) => Some(session.cipher()),
        }
    }

    /// Attach a fresh nonce challenge; returns the nonce to send
    pub fn challenge(self) -> ProtocolResult<(PeerSession, i64)> {
        match self {
            PeerSession::TicketIssued(pending) => {
                let challenge = NonceChallenge::issue(pending.principal());
                let nonce = challenge.nonce();
                Ok((PeerSession::Challenged(pending, challenge), nonce))
            }
            other => Err(ProtocolError::InvalidState(format!(
                "cannot issue a challenge in state {:?}",
                other.state()
            ))),
        }
    }

    /// Answer the outstanding challenge and establish the session
    pub fn confirm(
        self,
        response: i64,
        peer_public_key: RsaPublicKey,
        challenge_ttl: Duration,
    ) -> ProtocolResult<PeerSession> {
        match self {
            PeerSession::Challenged(pending, challenge) => {
                challenge.verify(response, challenge_ttl)?;
                let now = Instant::now();
                Ok(PeerSession::Established(EstablishedSession {
                    id: SessionId::generate(),
                    cipher: pending.cipher,
                    principal: pending.principal,
                    peer_public_key,
                    created_at: now,
                    last_activity: now,
                    requests: 0,
                }))
            }
            PeerSession::Unauthenticated => Err(ProtocolError::KeyMaterialNotFound(
                "no ticket redeemed for this peer".into(),
            )),
            other => Err(ProtocolError::InvalidState(format!(
                "no outstanding challenge in state {:?}",
                other.state()
            ))),
        }
    }

    pub fn established(&self) -> Option<&EstablishedSession> {
        match self {
            PeerSession::Established(session) => Some(session),
            _ => None,
        }
    }

    pub fn established_mut(&mut self) -> Option<&mut EstablishedSession> {
        match self {
            PeerSession::Established(session) => Some(session),
            _ => None,
        }
    }

    /// Whether a sweep should evict this entry
    pub fn is_expired(&self, challenge_ttl: Duration, idle_timeout: Duration) -> bool {
        match self {
            PeerSession::Unauthenticated => true,
            PeerSession::TicketIssued(pending) => pending.age() > challenge_ttl,
            PeerSession::Challenged(_, challenge) => challenge.is_expired(challenge_ttl),
            PeerSession::Established(session) => session.idle_time() > idle_timeout,
        }
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerSession::Established(session) => session.fmt(f),
            other => write!(f, "PeerSession::{:?}", other.state()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::client_key;

    const TTL: Duration = Duration::from_secs(60);

    fn client_public_key() -> RsaPublicKey {
        client_key().public_key().clone()
    }

    fn challenged() -> (PeerSession, i64) {
        let session = PeerSession::ticket_issued(SessionCipher::generate().unwrap(), "user");
        session.challenge().unwrap()
    }

    #[test]
    fn test_session_id_generation() {
        let id1 = SessionId::generate();
        let id2 = SessionId::generate();

        // Should be different (extremely high probability)
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_session_id_from_slice_invalid() {
        let bytes = vec![42u8; 8]; // Wrong size
        assert!(SessionId::from_slice(&bytes).is_err());
    }

    #[test]
    fn test_session_id_serde_hex() {
        let id = SessionId::from_bytes([0xab; SESSION_ID_SIZE]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(SESSION_ID_SIZE)));
        let back: SessionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_full_transition() {
        let (session, nonce) = challenged();
        assert_eq!(session.state(), SessionState::Challenged);

        let session = session
            .confirm(nonce.wrapping_add(1), client_public_key(), TTL)
            .unwrap();
        assert_eq!(session.state(), SessionState::Established);

        let established = session.established().unwrap();
        assert_eq!(established.principal(), "user");
        assert_eq!(established.requests(), 0);
    }

    #[test]
    fn test_wrong_response_is_tampered() {
        let (session, nonce) = challenged();
        let result = session.confirm(nonce, client_public_key(), TTL);
        assert!(matches!(result, Err(ProtocolError::TamperedMessage(_))));
    }

    #[test]
    fn test_expired_challenge_rejected() {
        let (session, nonce) = challenged();
        std::thread::sleep(Duration::from_millis(5));
        let result = session.confirm(nonce.wrapping_add(1), client_public_key(), Duration::ZERO);
        assert!(result.is_err());
    }

    #[test]
    fn test_confirm_without_ticket() {
        let result = PeerSession::Unauthenticated.confirm(1, client_public_key(), TTL);
        assert!(matches!(result, Err(ProtocolError::KeyMaterialNotFound(_))));

        let pending = PeerSession::ticket_issued(SessionCipher::generate().unwrap(), "user");
        let result = pending.confirm(1, client_public_key(), TTL);
        assert!(matches!(result, Err(ProtocolError::InvalidState(_))));
    }

    #[test]
    fn test_challenge_only_after_ticket() {
        assert!(matches!(
            PeerSession::Unauthenticated.challenge(),
            Err(ProtocolError::InvalidState(_))
        ));
        let (session, _) = challenged();
        assert!(session.challenge().is_err());
    }

    #[test]
    fn test_nonce_wraps() {
        let challenge = NonceChallenge {
            nonce: i64::MAX,
            owner: "user".into(),
            issued_at: Instant::now(),
        };
        assert_eq!(challenge.expected_response(), i64::MIN);
        assert!(challenge.verify(i64::MIN, TTL).is_ok());
    }

    #[test]
    fn test_expiry_per_state() {
        let pending = PeerSession::ticket_issued(SessionCipher::generate().unwrap(), "user");
        assert!(!pending.is_expired(TTL, TTL));
        std::thread::sleep(Duration::from_millis(5));
        assert!(pending.is_expired(Duration::ZERO, TTL));
        assert!(PeerSession::Unauthenticated.is_expired(TTL, TTL));
    }
}
