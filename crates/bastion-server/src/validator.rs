//! Session validation on resource servers
//!
//! Tracks one [`PeerSession`] per peer: ticket redemption issues a nonce
//! challenge, a correct `still_alive` answer establishes the session, and
//! business calls are then addressed by [`SessionId`].

use bastion_crypto::{public_key_from_der, RsaKeyPair};
use bastion_protocol::{
    open_protected, open_unverified, seal_protected, BusinessCall, BusinessRequest,
    BusinessResponse, ChallengePayload, InnerTicket, KeyStore, LivenessAck, LivenessProof,
    Operation, Outcome, PeerId, PeerSession, ProtocolError, ProtocolResult, ReplayCache,
    SessionId, SessionState, TicketRedemption, AUTHORITY_PRINCIPAL,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Timing limits for the validator
#[derive(Debug, Clone, Copy)]
pub struct ValidatorLimits {
    pub replay_window: Duration,
    pub max_clock_skew: Duration,
    pub challenge_ttl: Duration,
    pub idle_timeout: Duration,
}

/// Per-peer session state for one resource server
pub struct SessionValidator {
    identity: Arc<RsaKeyPair>,
    long_term: Arc<dyn KeyStore>,
    client_principal: String,
    peers: Mutex<HashMap<PeerId, PeerSession>>,
    sessions: Mutex<HashMap<SessionId, PeerId>>,
    redemptions: ReplayCache,
    tickets: ReplayCache,
    calls: ReplayCache,
    limits: ValidatorLimits,
}

impl SessionValidator {
    pub fn new(
        identity: Arc<RsaKeyPair>,
        long_term: Arc<dyn KeyStore>,
        client_principal: impl Into<String>,
        limits: ValidatorLimits,
    ) -> Self {
        Self {
            identity,
            long_term,
            client_principal: client_principal.into(),
            peers: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            redemptions: ReplayCache::new(limits.replay_window, limits.max_clock_skew),
            tickets: ReplayCache::new(limits.replay_window, limits.max_clock_skew),
            calls: ReplayCache::new(limits.replay_window, limits.max_clock_skew),
            limits,
        }
    }

    /// Current state for `peer`
    pub fn state(&self, peer: &PeerId) -> SessionState {
        self.peers
            .lock()
            .get(peer)
            .map_or(SessionState::Unauthenticated, PeerSession::state)
    }

    /// Number of established sessions
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Redeem a nested ticket and return the protected challenge
    ///
    /// Replay state is only touched once the ticket has been opened, and a
    /// ticket is accepted once: a second redemption of the same nested
    /// ticket fails even under a fresh redemption timestamp.
    pub fn authenticate(&self, peer: &PeerId, redemption: &TicketRedemption) -> ProtocolResult<Vec<u8>> {
        let authority = self.long_term.get(&PeerId::named(AUTHORITY_PRINCIPAL))?;
        let inner = InnerTicket::open(&redemption.nested_ticket, &authority.cipher())
            .map_err(|e| match e {
                ProtocolError::Crypto(c) => {
                    ProtocolError::TamperedMessage(format!("nested ticket: {c}"))
                }
                other => other,
            })?;
        if inner.source != self.client_principal {
            return Err(ProtocolError::TamperedMessage(format!(
                "ticket issued to unexpected principal '{}'",
                inner.source
            )));
        }

        self.redemptions
            .check_and_record("redeem_ticket", redemption.timestamp)?;
        self.tickets
            .check_and_record(&inner.replay_channel(), inner.issued_at)?;

        let state = PeerSession::ticket_issued(inner.session_cipher()?, inner.source.as_str());
        let (state, nonce) = state.challenge()?;
        let cipher = state
            .cipher()
            .ok_or_else(|| ProtocolError::InvalidState("challenge without session key".into()))?;
        let payload = seal_protected(
            cipher,
            self.identity.private_key(),
            &ChallengePayload {
                nonce,
                server_public_key: self.identity.public_key_der()?,
            },
        )?;

        // A new ticket replaces whatever the peer had before
        let previous = self.peers.lock().insert(peer.clone(), state);
        if let Some(old) = previous.as_ref().and_then(PeerSession::established) {
            self.drop_session(old.id());
        }

        debug!("Challenged peer {} for {}", peer.short(), inner.source);
        Ok(payload)
    }

    /// Check the answer to the outstanding challenge and establish the session
    pub fn still_alive(&self, peer: &PeerId, payload: &[u8]) -> ProtocolResult<Vec<u8>> {
        // The challenge leaves the table here, whatever the outcome
        let state = {
            let mut peers = self.peers.lock();
            match peers.remove(peer) {
                Some(state @ PeerSession::Challenged(..)) => state,
                Some(other) => {
                    let current = other.state();
                    peers.insert(peer.clone(), other);
                    return Err(ProtocolError::InvalidState(format!(
                        "no outstanding challenge in state {current:?}"
                    )));
                }
                None => {
                    return Err(ProtocolError::KeyMaterialNotFound(format!(
                        "no ticket redeemed by peer {}",
                        peer.short()
                    )))
                }
            }
        };

        let cipher = state
            .cipher()
            .ok_or_else(|| ProtocolError::InvalidState("challenge without session key".into()))?
            .clone();
        let proof: LivenessProof = open_unverified(&cipher, payload)
            .map_err(|e| ProtocolError::TamperedMessage(format!("unreadable proof: {e}")))?;
        let client_key = public_key_from_der(&proof.client_public_key)
            .map_err(|e| ProtocolError::TamperedMessage(format!("client key: {e}")))?;
        if !cipher.check(payload, &client_key) {
            return Err(ProtocolError::TamperedMessage("proof signature check failed".into()));
        }

        let state = state.confirm(proof.response, client_key, self.limits.challenge_ttl)?;
        let session_id = state
            .established()
            .map(|session| session.id())
            .ok_or_else(|| ProtocolError::InvalidState("session not established".into()))?;

        let ack = seal_protected(
            &cipher,
            self.identity.private_key(),
            &LivenessAck {
                acknowledgement: proof.response.wrapping_add(1),
                session_id,
            },
        )?;

        self.peers.lock().insert(peer.clone(), state);
        self.sessions.lock().insert(session_id, peer.clone());

        info!("Session {} established with peer {}", session_id, peer.short());
        Ok(ack)
    }

    /// Run one business call on an established session
    pub fn business<F>(&self, call: &BusinessCall, execute: F) -> ProtocolResult<Vec<u8>>
    where
        F: FnOnce(&Operation) -> Outcome,
    {
        let peer = self
            .sessions
            .lock()
            .get(&call.session_id)
            .cloned()
            .ok_or_else(|| ProtocolError::KeyMaterialNotFound(format!("unknown session {}", call.session_id)))?;

        let (cipher, client_key) = {
            let mut peers = self.peers.lock();
            let session = peers
                .get_mut(&peer)
                .and_then(PeerSession::established_mut)
                .filter(|session| session.id() == call.session_id)
                .ok_or_else(|| {
                    ProtocolError::KeyMaterialNotFound(format!("unknown session {}", call.session_id))
                })?;
            if session.idle_time() > self.limits.idle_timeout {
                peers.remove(&peer);
                drop(peers);
                self.drop_session(call.session_id);
                return Err(ProtocolError::KeyMaterialNotFound(format!(
                    "session {} expired",
                    call.session_id
                )));
            }
            session.touch();
            (session.cipher().clone(), session.peer_public_key().clone())
        };

        let request: BusinessRequest = open_protected(&cipher, &client_key, &call.payload)?;
        self.calls
            .check_and_record(&call.session_id.to_hex(), request.timestamp)?;

        let outcome = execute(&request.operation);
        debug!("Session {} ran {:?}", call.session_id, outcome);

        seal_protected(
            &cipher,
            self.identity.private_key(),
            &BusinessResponse {
                request_timestamp: request.timestamp,
                outcome,
            },
        )
    }

    /// Evict expired challenges and idle sessions
    pub fn sweep(&self) -> usize {
        let expired: Vec<(PeerId, Option<SessionId>)> = {
            let mut peers = self.peers.lock();
            let expired: Vec<_> = peers
                .iter()
                .filter(|(_, state)| state.is_expired(self.limits.challenge_ttl, self.limits.idle_timeout))
                .map(|(peer, state)| (peer.clone(), state.established().map(|s| s.id())))
                .collect();
            for (peer, _) in &expired {
                peers.remove(peer);
            }
            expired
        };

        for session_id in expired.iter().filter_map(|(_, id)| *id) {
            self.drop_session(session_id);
        }
        self.redemptions.sweep();
        self.tickets.sweep();
        self.calls.sweep();

        if !expired.is_empty() {
            debug!("Swept {} expired peer sessions", expired.len());
        }
        expired.len()
    }

    fn drop_session(&self, session_id: SessionId) {
        self.sessions.lock().remove(&session_id);
        self.calls.forget(&session_id.to_hex());
    }
}
