//! Ticket authority
//!
//! Agrees keys with clients (unauthenticated DH) and with resource servers
//! (EKE against the authority's RSA key), then issues tickets that let a
//! client open a session with a resource server.
//!
//! DH keys are short-lived and live in the session store; EKE keys are the
//! long-term counterpart keys and live in a store without expiry.

use bastion_crypto::RsaKeyPair;
use bastion_protocol::{
    DhOffer, DhReply, DiffieHellmanExchange, EkeConfirm, EkeHello, EkeReply, EkeResponder,
    KeyStore, PeerId, PendingEke, ProtocolError, ProtocolResult, ReplayCache, Request, Response,
    Ticket, TicketGrant, TicketRequest,
};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::binder::RequestIdentityBinder;
use crate::config::ServiceRole;
use crate::service::Service;

/// Issues nested tickets
pub struct TicketAuthority {
    session_keys: Arc<dyn KeyStore>,
    long_term: Arc<dyn KeyStore>,
    replay: ReplayCache,
}

impl TicketAuthority {
    pub fn new(session_keys: Arc<dyn KeyStore>, long_term: Arc<dyn KeyStore>, replay: ReplayCache) -> Self {
        Self {
            session_keys,
            long_term,
            replay,
        }
    }

    /// Build a ticket for `request`, encrypted under the requester's DH key
    ///
    /// The nested ticket is encrypted under the target's long-term key, so
    /// only the target can read the session key from it. The request
    /// timestamp is recorded only once both keys are known.
    pub fn authenticate(&self, requester: &PeerId, request: &TicketRequest) -> ProtocolResult<Vec<u8>> {
        let target = self.long_term.get(&PeerId::named(&request.target))?;
        let requester_material = self.session_keys.get(requester)?;

        self.replay
            .check_and_record(&format!("ticket:{}", request.source), request.timestamp)?;

        let ticket = Ticket::issue(
            &request.source,
            &request.target,
            request.timestamp,
            &target.cipher(),
        )?;
        let sealed = ticket.seal(&requester_material.cipher())?;

        info!(
            "Issued ticket {} -> {} to peer {}",
            request.source,
            request.target,
            requester.short()
        );
        Ok(sealed)
    }

    /// Replay entries older than the window are dropped
    pub fn sweep(&self) -> usize {
        self.replay.sweep()
    }
}

/// Authority role
pub struct AuthorityService {
    identity: Arc<RsaKeyPair>,
    session_keys: Arc<dyn KeyStore>,
    long_term: Arc<dyn KeyStore>,
    tickets: TicketAuthority,
    binder: Arc<RequestIdentityBinder>,
    handshake_replay: ReplayCache,
    pending: Mutex<HashMap<String, PendingEke>>,
    counterparts: BTreeSet<String>,
    exchange_ttl: Duration,
}

impl AuthorityService {
    /// Resource roles are the default key exchange counterparts
    pub fn new(
        identity: Arc<RsaKeyPair>,
        session_keys: Arc<dyn KeyStore>,
        long_term: Arc<dyn KeyStore>,
        replay_window: Duration,
        max_skew: Duration,
        exchange_ttl: Duration,
    ) -> Self {
        Self {
            identity,
            tickets: TicketAuthority::new(
                Arc::clone(&session_keys),
                Arc::clone(&long_term),
                ReplayCache::new(replay_window, max_skew),
            ),
            session_keys,
            long_term,
            binder: RequestIdentityBinder::new(),
            handshake_replay: ReplayCache::new(replay_window, max_skew),
            pending: Mutex::new(HashMap::new()),
            counterparts: [ServiceRole::Bank, ServiceRole::Database]
                .iter()
                .map(|role| role.as_str().to_string())
                .collect(),
            exchange_ttl,
        }
    }

    /// Replace the principals allowed to run EKE
    pub fn with_counterparts<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.counterparts = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn binder(&self) -> &Arc<RequestIdentityBinder> {
        &self.binder
    }

    /// Exchanges waiting for confirmation
    pub fn pending_exchanges(&self) -> usize {
        self.pending.lock().len()
    }

    fn check_counterpart(&self, initiator: &str) -> ProtocolResult<()> {
        if self.counterparts.contains(initiator) {
            Ok(())
        } else {
            Err(ProtocolError::InvalidMessage(format!(
                "'{initiator}' is not a key exchange counterpart"
            )))
        }
    }

    fn diffie_hellman(&self, peer: &PeerId, offer: &DhOffer) -> ProtocolResult<DhReply> {
        self.handshake_replay
            .check_and_record(&format!("dh:{}", peer), offer.timestamp)?;

        let (reply, material) = DiffieHellmanExchange::answer(peer.as_str(), &offer.client_public_key)?;
        // Re-exchange overwrites the previous slot
        self.session_keys.put(peer, material)?;

        debug!("Agreed DH key with peer {}", peer.short());
        Ok(reply)
    }

    fn encrypted_key_exchange(&self, hello: &EkeHello) -> ProtocolResult<EkeReply> {
        self.check_counterpart(&hello.initiator)?;
        let (reply, pending) = EkeResponder::new(self.identity.private_key()).respond(hello)?;
        self.handshake_replay
            .check_and_record(&format!("eke:{}", hello.initiator), hello.timestamp)?;

        if self
            .pending
            .lock()
            .insert(hello.initiator.clone(), pending)
            .is_some()
        {
            debug!("Replaced unconfirmed exchange for {}", hello.initiator);
        }
        Ok(reply)
    }

    fn confirm_key_exchange(&self, confirm: &EkeConfirm) -> ProtocolResult<()> {
        self.check_counterpart(&confirm.initiator)?;
        // Removed before checking: a failed confirmation cannot be retried
        let pending = self.pending.lock().remove(&confirm.initiator).ok_or_else(|| {
            ProtocolError::KeyMaterialNotFound(format!(
                "no pending exchange for {}",
                confirm.initiator
            ))
        })?;
        if pending.is_expired(self.exchange_ttl) {
            return Err(ProtocolError::InvalidState(format!(
                "exchange for {} expired",
                confirm.initiator
            )));
        }

        let material = pending.confirm(confirm)?;
        self.long_term.put(&PeerId::named(&confirm.initiator), material)?;

        info!("Established long-term key with {}", confirm.initiator);
        Ok(())
    }

    fn dispatch(&self, remote: SocketAddr, request: Request) -> ProtocolResult<Response> {
        let binding = self.binder.bind(&remote, request.kind());
        let peer = binding.peer();

        match request {
            Request::DiffieHellmanExchange(offer) => {
                Ok(Response::DiffieHellmanExchange(self.diffie_hellman(peer, &offer)?))
            }
            Request::EncryptedKeyExchange(hello) => {
                Ok(Response::EncryptedKeyExchange(self.encrypted_key_exchange(&hello)?))
            }
            Request::ConfirmKeyExchange(confirm) => {
                self.confirm_key_exchange(&confirm)?;
                Ok(Response::ConfirmKeyExchange)
            }
            Request::RequestTicket(request) => Ok(Response::RequestTicket(TicketGrant {
                ticket: self.tickets.authenticate(peer, &request)?,
            })),
            other => Err(ProtocolError::InvalidMessage(format!(
                "{} is not served by the authority",
                other.kind()
            ))),
        }
    }
}

impl Service for AuthorityService {
    fn handle(&self, remote: SocketAddr, request: Request) -> Response {
        let kind = request.kind();
        match self.dispatch(remote, request) {
            Ok(response) => response,
            Err(e) => {
                warn!("{} from {} failed: {}", kind, remote, e);
                Response::error(&e)
            }
        }
    }

    fn sweep(&self) -> usize {
        let ttl = self.exchange_ttl;
        let mut removed = {
            let mut pending = self.pending.lock();
            let before = pending.len();
            pending.retain(|_, exchange| !exchange.is_expired(ttl));
            before - pending.len()
        };
        removed += self.tickets.sweep();
        removed += self.handshake_replay.sweep();
        match self.session_keys.sweep_expired() {
            Ok(n) => removed += n,
            Err(e) => warn!("Key store sweep failed: {}", e),
        }
        removed
    }

    fn in_flight(&self) -> usize {
        self.binder.in_flight()
    }

    fn name(&self) -> &str {
        "authority"
    }
}
