//! # Bastion Client
//!
//! Drives the handshake against a ticket authority and a resource server,
//! then runs ledger operations over the established session.
//!
//! ## Handshake
//!
//! ```text
//! Unauthenticated --DH with authority--> KeyAgreed
//!     --request_ticket--> TicketIssued
//!     --redeem_ticket--> Challenged
//!     --still_alive--> Established
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use bastion_client::{ClientConfig, ClientError, ClientOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ClientError> {
//!     let config = ClientConfig::builder()
//!         .authority_address("127.0.0.1:7400")
//!         .resource_address("127.0.0.1:7402")
//!         .build()?;
//!
//!     let client = ClientOrchestrator::new(config)?;
//!     client.handshake().await?;
//!     println!("balance: {}", client.balance("alice", "secret").await?);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod errors;
pub mod events;
pub mod phase;

pub use config::*;
pub use errors::*;
pub use events::*;
pub use phase::{HandshakePhase, SessionContext};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::*;
    pub use crate::errors::*;
    pub use crate::events::*;
    pub use crate::phase::{HandshakePhase, SessionContext};
    pub use crate::ClientOrchestrator;
}

use bastion_crypto::{hash_password, public_key_from_der, RsaKeyPair};
use bastion_protocol::{
    open_protected, open_unverified, seal_protected, BusinessCall, BusinessRequest,
    BusinessResponse, ChallengePayload, DiffieHellmanExchange, LivenessAck, LivenessProof,
    Operation, Outcome, ProtectedMessage, ProtocolError, Request, SessionId, TcpTransport, Ticket,
    TicketRedemption, TicketRequest, Timestamp, Transport, AUTHORITY_PRINCIPAL,
};
use phase::Phase;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Client side of the secure-session protocol
pub struct ClientOrchestrator {
    /// Client configuration
    config: ClientConfig,
    /// Signing identity, presented to the resource server
    identity: RsaKeyPair,
    /// Connection to the ticket authority
    authority: Arc<dyn Transport>,
    /// Connection to the resource server
    resource: Arc<dyn Transport>,
    /// Current handshake phase
    phase: Mutex<Phase>,
    /// Last protocol timestamp sent, keeps ours strictly increasing
    last_timestamp: AtomicI64,
    /// Event sender
    event_tx: mpsc::Sender<ClientEvent>,
    /// Event receiver (for the user to consume)
    event_rx: Arc<Mutex<mpsc::Receiver<ClientEvent>>>,
}

impl ClientOrchestrator {
    /// Create a client talking TCP to the configured servers
    pub fn new(config: ClientConfig) -> ClientResult<Self> {
        config.validate()?;
        let identity = load_identity(&config)?;
        let authority: Arc<dyn Transport> = Arc::new(TcpTransport::with_timeout(
            config.authority_address.clone(),
            config.call_timeout(),
        ));
        let resource: Arc<dyn Transport> = Arc::new(TcpTransport::with_timeout(
            config.resource_address.clone(),
            config.call_timeout(),
        ));
        Ok(Self::with_transports(config, identity, authority, resource))
    }

    /// Create a client over caller-supplied transports
    pub fn with_transports(
        config: ClientConfig,
        identity: RsaKeyPair,
        authority: Arc<dyn Transport>,
        resource: Arc<dyn Transport>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(100);

        Self {
            config,
            identity,
            authority,
            resource,
            phase: Mutex::new(Phase::Unauthenticated),
            last_timestamp: AtomicI64::new(0),
            event_tx,
            event_rx: Arc::new(Mutex::new(event_rx)),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Current handshake phase
    pub async fn phase(&self) -> HandshakePhase {
        self.phase.lock().await.name()
    }

    /// Check if a session is established
    pub async fn is_established(&self) -> bool {
        self.phase().await == HandshakePhase::Established
    }

    /// Session identifier, once established
    pub async fn session_id(&self) -> Option<SessionId> {
        match &*self.phase.lock().await {
            Phase::Established(context) => Some(context.session_id()),
            _ => None,
        }
    }

    /// Get the event receiver for handling events
    pub fn events(&self) -> Arc<Mutex<mpsc::Receiver<ClientEvent>>> {
        Arc::clone(&self.event_rx)
    }

    /// Run the whole handshake from scratch
    pub async fn handshake(&self) -> ClientResult<SessionId> {
        self.reset().await;
        let result: ClientResult<SessionId> = async {
            self.agree_key().await?;
            self.request_ticket().await?;
            self.redeem_ticket().await?;
            self.prove_liveness().await
        }
        .await;

        if let Err(e) = &result {
            warn!("Handshake failed: {}", e);
            self.emit_event(ClientEvent::Error {
                message: e.to_string(),
            });
            self.reset().await;
        }
        result
    }

    /// Forget all session material
    pub async fn reset(&self) {
        let mut phase = self.phase.lock().await;
        if !matches!(*phase, Phase::Unauthenticated) {
            *phase = Phase::Unauthenticated;
            self.emit_event(ClientEvent::PhaseChanged {
                phase: HandshakePhase::Unauthenticated,
            });
        }
    }

    /// Diffie-Hellman with the authority
    pub async fn agree_key(&self) -> ClientResult<()> {
        let mut phase = self.phase.lock().await;
        if !matches!(*phase, Phase::Unauthenticated) {
            return Err(ClientError::OutOfOrder {
                step: "agree a key",
                phase: phase.name(),
            });
        }

        let exchange = DiffieHellmanExchange::initiate();
        let mut offer = exchange.offer();
        offer.timestamp = self.next_timestamp();
        let reply = self
            .authority
            .call(Request::DiffieHellmanExchange(offer))
            .await?
            .into_dh_reply()?;
        let authority = exchange.complete(AUTHORITY_PRINCIPAL, &reply)?;

        debug!("Agreed a key with the authority");
        self.advance(&mut phase, Phase::KeyAgreed { authority });
        Ok(())
    }

    /// Ask the authority for a ticket to the configured target
    pub async fn request_ticket(&self) -> ClientResult<()> {
        let mut phase = self.phase.lock().await;
        let Phase::KeyAgreed { authority } = &*phase else {
            return Err(ClientError::OutOfOrder {
                step: "request a ticket",
                phase: phase.name(),
            });
        };

        let request = TicketRequest {
            source: self.config.principal.clone(),
            target: self.config.target.clone(),
            timestamp: self.next_timestamp(),
        };
        let grant = self
            .authority
            .call(Request::RequestTicket(request.clone()))
            .await?
            .into_ticket_grant()?;
        let ticket = Ticket::open(&grant.ticket, &authority.cipher())?;

        if ticket.source != request.source
            || ticket.target != request.target
            || ticket.timestamp != request.timestamp
        {
            return Err(ProtocolError::TamperedMessage(format!(
                "ticket for {} -> {} does not match the request",
                ticket.source, ticket.target
            ))
            .into());
        }

        debug!("Received ticket for {}", ticket.target);
        let next = Phase::TicketIssued {
            session: ticket.session_cipher()?,
            nested_ticket: ticket.nested_ticket.clone(),
        };
        self.advance(&mut phase, next);
        Ok(())
    }

    /// Present the nested ticket to the resource server
    pub async fn redeem_ticket(&self) -> ClientResult<()> {
        let mut phase = self.phase.lock().await;
        let Phase::TicketIssued {
            session,
            nested_ticket,
        } = &*phase
        else {
            return Err(ClientError::OutOfOrder {
                step: "redeem a ticket",
                phase: phase.name(),
            });
        };

        let redemption = TicketRedemption {
            nested_ticket: nested_ticket.clone(),
            timestamp: self.next_timestamp(),
        };
        let reply = self
            .resource
            .call(Request::RedeemTicket(redemption))
            .await?
            .into_challenge()?;

        let challenge: ChallengePayload = open_unverified(session, &reply.payload)?;
        let server_key = public_key_from_der(&challenge.server_public_key)?;
        if !session.check(&reply.payload, &server_key) {
            return Err(
                ProtocolError::TamperedMessage("challenge signature check failed".into()).into(),
            );
        }

        debug!("Resource server issued a challenge");
        let next = Phase::Challenged {
            session: session.clone(),
            server_key,
            nonce: challenge.nonce,
        };
        self.advance(&mut phase, next);
        Ok(())
    }

    /// Answer the challenge and receive the session identifier
    pub async fn prove_liveness(&self) -> ClientResult<SessionId> {
        let mut phase = self.phase.lock().await;
        let Phase::Challenged {
            session,
            server_key,
            nonce,
        } = &*phase
        else {
            return Err(ClientError::OutOfOrder {
                step: "prove liveness",
                phase: phase.name(),
            });
        };

        let response = nonce.wrapping_add(1);
        let proof = seal_protected(
            session,
            self.identity.private_key(),
            &LivenessProof {
                response,
                client_public_key: self.identity.public_key_der()?,
            },
        )?;
        let reply = self
            .resource
            .call(Request::StillAlive(ProtectedMessage { payload: proof }))
            .await?
            .into_liveness_ack()?;

        let ack: LivenessAck = open_protected(session, server_key, &reply.payload)?;
        if ack.acknowledgement != response.wrapping_add(1) {
            return Err(ProtocolError::TamperedMessage(format!(
                "acknowledgement {} does not answer {}",
                ack.acknowledgement, response
            ))
            .into());
        }

        let context = SessionContext {
            cipher: session.clone(),
            server_key: server_key.clone(),
            session_id: ack.session_id,
        };
        self.advance(&mut phase, Phase::Established(context));
        self.emit_event(ClientEvent::SessionEstablished {
            session_id: ack.session_id,
        });
        info!("Session {} established with {}", ack.session_id, self.config.target);
        Ok(ack.session_id)
    }

    /// Balance of `holder`
    pub async fn balance(&self, holder: &str, password: &str) -> ClientResult<String> {
        let operation = Operation::Balance {
            holder: holder.to_string(),
            password_hash: hash_password(password),
        };
        match self.business("balance", operation).await? {
            Outcome::Balance { balance } => Ok(balance),
            other => Err(ClientError::UnexpectedReply(format!("{other:?} to balance"))),
        }
    }

    /// Open a new account
    pub async fn create_account(
        &self,
        holder: &str,
        password: &str,
        initial_deposit: i64,
    ) -> ClientResult<()> {
        let operation = Operation::CreateAccount {
            holder: holder.to_string(),
            password_hash: hash_password(password),
            initial_deposit,
        };
        match self.business("create_account", operation).await? {
            Outcome::AccountCreated { .. } => Ok(()),
            other => Err(ClientError::UnexpectedReply(format!(
                "{other:?} to create_account"
            ))),
        }
    }

    /// Deposit into `holder`'s account; returns the new balance
    pub async fn deposit(&self, holder: &str, password: &str, amount: i64) -> ClientResult<String> {
        let operation = Operation::Deposit {
            holder: holder.to_string(),
            password_hash: hash_password(password),
            amount,
        };
        match self.business("deposit", operation).await? {
            Outcome::Deposited { balance } => Ok(balance),
            other => Err(ClientError::UnexpectedReply(format!("{other:?} to deposit"))),
        }
    }

    async fn business(&self, name: &'static str, operation: Operation) -> ClientResult<Outcome> {
        let context = match &*self.phase.lock().await {
            Phase::Established(context) => context.clone(),
            other => {
                return Err(ClientError::NotAuthenticated {
                    phase: other.name(),
                })
            }
        };

        let request = BusinessRequest {
            timestamp: self.next_timestamp(),
            operation,
        };
        let payload = seal_protected(&context.cipher, self.identity.private_key(), &request)?;
        let call = BusinessCall {
            session_id: context.session_id,
            payload,
        };

        let reply = match self.resource.call(Request::Business(call)).await {
            Ok(reply) => reply.into_business()?,
            Err(e) => {
                let e = ClientError::from(e);
                if e.requires_authentication() {
                    self.expire(context.session_id).await;
                }
                return Err(e);
            }
        };

        let response: BusinessResponse =
            open_protected(&context.cipher, &context.server_key, &reply.payload)?;
        if response.request_timestamp != request.timestamp {
            return Err(ProtocolError::TamperedMessage(format!(
                "reply answers request {} instead of {}",
                response.request_timestamp, request.timestamp
            ))
            .into());
        }

        match response.outcome {
            Outcome::Rejected { reason } => Err(ClientError::Rejected(reason)),
            outcome => {
                self.emit_event(ClientEvent::OperationCompleted { operation: name });
                Ok(outcome)
            }
        }
    }

    /// Drop the session if it is still the current one
    async fn expire(&self, session_id: SessionId) {
        let mut phase = self.phase.lock().await;
        if matches!(&*phase, Phase::Established(c) if c.session_id == session_id) {
            warn!("Session {} no longer valid on the server", session_id);
            *phase = Phase::Unauthenticated;
            self.emit_event(ClientEvent::SessionExpired);
        }
    }

    fn advance(&self, phase: &mut Phase, next: Phase) {
        *phase = next;
        self.emit_event(ClientEvent::PhaseChanged { phase: phase.name() });
    }

    /// Wall-clock millis, bumped past the last one sent
    fn next_timestamp(&self) -> Timestamp {
        let now = Timestamp::now().as_millis();
        let previous = self
            .last_timestamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        Timestamp::from_millis(now.max(previous + 1))
    }

    /// Emit an event, dropping it when nobody keeps up
    fn emit_event(&self, event: ClientEvent) {
        if self.event_tx.try_send(event).is_err() {
            debug!("Event queue full, dropping event");
        }
    }
}

fn load_identity(config: &ClientConfig) -> ClientResult<RsaKeyPair> {
    match &config.identity_key {
        Some(path) => {
            let pem = std::fs::read_to_string(path)?;
            Ok(RsaKeyPair::from_pem(&pem)?)
        }
        None => Ok(RsaKeyPair::generate()?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_protocol::{KeyStore, MemoryKeyStore, PeerId};
    use bastion_server::{
        bootstrap_with_authority, AuthorityService, Ledger, LocalTransport, ResourceService,
        SessionValidator, ValidatorLimits,
    };
    use std::net::SocketAddr;
    use std::sync::OnceLock;
    use std::time::Duration;

    fn cached(slot: &'static OnceLock<RsaKeyPair>) -> &'static RsaKeyPair {
        slot.get_or_init(|| RsaKeyPair::generate().unwrap())
    }

    fn authority_key() -> &'static RsaKeyPair {
        static KEY: OnceLock<RsaKeyPair> = OnceLock::new();
        cached(&KEY)
    }

    fn resource_key() -> &'static RsaKeyPair {
        static KEY: OnceLock<RsaKeyPair> = OnceLock::new();
        cached(&KEY)
    }

    fn client_key() -> &'static RsaKeyPair {
        static KEY: OnceLock<RsaKeyPair> = OnceLock::new();
        cached(&KEY)
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    struct World {
        authority: Arc<AuthorityService>,
        resource: Arc<ResourceService>,
    }

    impl World {
        fn client(&self, port: u16) -> ClientOrchestrator {
            self.client_for(port, ClientConfig::default())
        }

        fn client_for(&self, port: u16, config: ClientConfig) -> ClientOrchestrator {
            ClientOrchestrator::with_transports(
                config,
                client_key().clone(),
                Arc::new(LocalTransport::new(Arc::clone(&self.authority), addr(port))),
                Arc::new(LocalTransport::new(Arc::clone(&self.resource), addr(port))),
            )
        }
    }

    async fn world() -> World {
        let authority = Arc::new(
            AuthorityService::new(
                Arc::new(authority_key().clone()),
                Arc::new(MemoryKeyStore::new()),
                Arc::new(MemoryKeyStore::new()),
                Duration::from_secs(300),
                Duration::from_secs(30),
                Duration::from_secs(60),
            )
            .with_counterparts(["database"]),
        );

        let long_term = Arc::new(MemoryKeyStore::new());
        let bootstrap = LocalTransport::new(Arc::clone(&authority), addr(40000));
        bootstrap_with_authority(
            &bootstrap,
            "database",
            authority_key().public_key(),
            long_term.as_ref(),
        )
        .await
        .unwrap();
        assert!(long_term.get(&PeerId::named(AUTHORITY_PRINCIPAL)).is_ok());

        let ledger = Arc::new(Ledger::new());
        ledger.seed("alice", "pw", 1500);
        let validator = SessionValidator::new(
            Arc::new(resource_key().clone()),
            long_term,
            "user",
            ValidatorLimits {
                replay_window: Duration::from_secs(300),
                max_clock_skew: Duration::from_secs(30),
                challenge_ttl: Duration::from_secs(60),
                idle_timeout: Duration::from_secs(900),
            },
        );
        let resource = Arc::new(ResourceService::new("database", validator, ledger));

        World {
            authority,
            resource,
        }
    }

    #[tokio::test]
    async fn test_client_starts_unauthenticated() {
        let world = world().await;
        let client = world.client(41000);
        assert_eq!(client.phase().await, HandshakePhase::Unauthenticated);
        assert!(!client.is_established().await);
        assert!(client.session_id().await.is_none());
    }

    #[tokio::test]
    async fn test_business_before_handshake() {
        let world = world().await;
        let client = world.client(41001);

        let err = client.balance("alice", "pw").await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::NotAuthenticated {
                phase: HandshakePhase::Unauthenticated
            }
        ));
    }

    #[tokio::test]
    async fn test_steps_out_of_order() {
        let world = world().await;
        let client = world.client(41002);

        let err = client.redeem_ticket().await.unwrap_err();
        assert!(matches!(err, ClientError::OutOfOrder { .. }));

        client.agree_key().await.unwrap();
        assert_eq!(client.phase().await, HandshakePhase::KeyAgreed);
        assert!(client.agree_key().await.is_err());
    }

    #[tokio::test]
    async fn test_stepwise_handshake_phases() {
        let world = world().await;
        let client = world.client(41003);

        client.agree_key().await.unwrap();
        client.request_ticket().await.unwrap();
        assert_eq!(client.phase().await, HandshakePhase::TicketIssued);
        client.redeem_ticket().await.unwrap();
        assert_eq!(client.phase().await, HandshakePhase::Challenged);

        let err = client.balance("alice", "pw").await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::NotAuthenticated {
                phase: HandshakePhase::Challenged
            }
        ));

        let session_id = client.prove_liveness().await.unwrap();
        assert_eq!(client.session_id().await, Some(session_id));
        assert_eq!(world.resource.validator().session_count(), 1);
    }

    #[tokio::test]
    async fn test_full_handshake_and_ledger() {
        let world = world().await;
        let client = world.client(41004);

        client.handshake().await.unwrap();
        assert!(client.is_established().await);

        assert_eq!(client.balance("alice", "pw").await.unwrap(), "1500");
        assert_eq!(client.deposit("alice", "pw", 250).await.unwrap(), "1750");
        assert_eq!(client.balance("alice", "pw").await.unwrap(), "1750");

        client.create_account("bob", "hunter2", 40).await.unwrap();
        assert_eq!(client.balance("bob", "hunter2").await.unwrap(), "40");
        assert_eq!(world.resource.ledger().len(), 2);
    }

    #[tokio::test]
    async fn test_rejections_keep_session() {
        let world = world().await;
        let client = world.client(41005);
        client.handshake().await.unwrap();

        let err = client.balance("alice", "wrong").await.unwrap_err();
        assert!(matches!(err, ClientError::Rejected(_)));
        let err = client.create_account("alice", "pw", 10).await.unwrap_err();
        assert!(matches!(err, ClientError::Rejected(_)));
        let err = client.deposit("alice", "pw", 0).await.unwrap_err();
        assert!(matches!(err, ClientError::Rejected(_)));

        assert!(client.is_established().await);
        assert_eq!(client.balance("alice", "pw").await.unwrap(), "1500");
    }

    #[tokio::test]
    async fn test_unknown_target_fails_handshake() {
        let world = world().await;
        let config = ClientConfig::builder().target("bank").build().unwrap();
        let client = world.client_for(41006, config);

        let err = client.handshake().await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Protocol(ProtocolError::KeyMaterialNotFound(_))
        ));
        assert_eq!(client.phase().await, HandshakePhase::Unauthenticated);
    }

    #[tokio::test]
    async fn test_wrong_principal_rejected_by_resource() {
        let world = world().await;
        let config = ClientConfig::builder().principal("mallory").build().unwrap();
        let client = world.client_for(41007, config);

        let err = client.handshake().await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Protocol(ProtocolError::TamperedMessage(_))
        ));
    }

    #[tokio::test]
    async fn test_rehandshake_replaces_session() {
        let world = world().await;
        let client = world.client(41008);

        let first = client.handshake().await.unwrap();
        let second = client.handshake().await.unwrap();
        assert_ne!(first, second);
        assert_eq!(world.resource.validator().session_count(), 1);
        assert_eq!(client.balance("alice", "pw").await.unwrap(), "1500");
    }

    #[tokio::test]
    async fn test_lost_session_requires_handshake() {
        let world = world().await;
        let client = world.client(41009);
        client.handshake().await.unwrap();

        // Another handshake from the same address evicts our session
        tokio::time::sleep(Duration::from_millis(10)).await;
        let intruder = world.client(41009);
        intruder.handshake().await.unwrap();

        let err = client.balance("alice", "pw").await.unwrap_err();
        assert!(err.requires_authentication());
        assert_eq!(client.phase().await, HandshakePhase::Unauthenticated);

        let err = client.balance("alice", "pw").await.unwrap_err();
        assert!(matches!(err, ClientError::NotAuthenticated { .. }));
    }

    #[tokio::test]
    async fn test_events_emitted() {
        let world = world().await;
        let client = world.client(41010);
        client.handshake().await.unwrap();

        let events = client.events();
        let mut rx = events.lock().await;
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }

        assert!(seen
            .iter()
            .any(|e| matches!(e, ClientEvent::SessionEstablished { .. })));
        assert!(seen.iter().any(|e| matches!(
            e,
            ClientEvent::PhaseChanged {
                phase: HandshakePhase::Challenged
            }
        )));
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let client = ClientOrchestrator::with_transports(
            ClientConfig::default(),
            client_key().clone(),
            Arc::new(TcpTransport::new("127.0.0.1:1")),
            Arc::new(TcpTransport::new("127.0.0.1:1")),
        );
        let mut last = client.next_timestamp();
        for _ in 0..1000 {
            let next = client.next_timestamp();
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn test_identity_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.pem");
        std::fs::write(&path, client_key().private_key_pem().unwrap().as_bytes()).unwrap();

        let config = ClientConfig::builder().identity_key(&path).build().unwrap();
        let identity = load_identity(&config).unwrap();
        assert_eq!(
            identity.public_key_der().unwrap(),
            client_key().public_key_der().unwrap()
        );

        let missing = ClientConfig::builder()
            .identity_key(dir.path().join("absent.pem"))
            .build()
            .unwrap();
        assert!(matches!(load_identity(&missing), Err(ClientError::Io(_))));
    }
}
