//! # Bastion Server
//!
//! Authority and resource servers for the Bastion session protocol.
//!
//! ## Roles
//!
//! - **authority**: agrees DH keys with clients, EKE keys with resource
//!   servers, and issues tickets
//! - **bank** / **database**: redeem tickets, run the liveness challenge,
//!   then serve ledger operations on established sessions
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      Bastion Server                      │
//! ├──────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐  ┌────────────────┐  │
//! │  │ TCP Listener │──│ Id Binder    │──│ Service (role) │  │
//! │  └──────────────┘  └──────────────┘  └────────────────┘  │
//! │                                       │            │     │
//! │                                       ▼            ▼     │
//! │                             ┌──────────────┐ ┌─────────┐ │
//! │                             │ Ticket Auth. │ │Validator│ │
//! │                             │ / EKE        │ │+ Ledger │ │
//! │                             └──────────────┘ └─────────┘ │
//! │                   Key store, replay caches, sweeper      │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod errors;
pub mod keys;
pub mod binder;
pub mod ledger;
pub mod service;
pub mod authority;
pub mod validator;
pub mod resource;
pub mod listener;

pub use config::*;
pub use errors::*;
pub use keys::*;
pub use binder::*;
pub use ledger::*;
pub use service::*;
pub use authority::*;
pub use validator::*;
pub use resource::*;
pub use listener::*;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::*;
    pub use crate::errors::*;
    pub use crate::service::*;
    pub use crate::authority::*;
    pub use crate::validator::*;
    pub use crate::resource::*;
    pub use crate::listener::*;
}

use bastion_crypto::RsaKeyPair;
use bastion_protocol::{FileKeyStore, KeyStore, TcpTransport};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, info, warn};

/// A running Bastion service
pub struct BastionServer {
    /// Server configuration
    config: ServerConfig,
    /// Role implementation
    service: Arc<dyn Service>,
    /// Own RSA identity
    identity: Arc<RsaKeyPair>,
    /// Running state
    running: Arc<AtomicBool>,
    /// Wakes the accept loop on stop
    shutdown: Arc<Notify>,
    /// Connection slots
    connections: Arc<Semaphore>,
    /// Connections accepted so far
    total_connections: Arc<AtomicU64>,
    /// Creation time
    started_at: Instant,
}

impl BastionServer {
    /// Build the service for the configured role
    ///
    /// Loads or creates the identity under `data_dir`. Resource roles run
    /// EKE against the authority before returning.
    pub async fn build(config: ServerConfig) -> ServerResult<Self> {
        config.validate()?;

        let identity = Arc::new(load_or_create_identity(&config.identity_dir())?);
        // Counterpart keys outlive any session TTL
        let long_term: Arc<dyn KeyStore> = Arc::new(FileKeyStore::open(config.counterparts_dir(), None)?);

        let service: Arc<dyn Service> = if config.role.is_resource() {
            Arc::new(Self::resource_service(&config, Arc::clone(&identity), long_term).await?)
        } else {
            let session_keys: Arc<dyn KeyStore> =
                Arc::new(FileKeyStore::open(config.peers_dir(), config.key_ttl())?);
            Arc::new(
                AuthorityService::new(
                    Arc::clone(&identity),
                    session_keys,
                    long_term,
                    config.replay_window(),
                    config.max_clock_skew(),
                    config.challenge_ttl(),
                )
                .with_counterparts(config.counterparts.iter().cloned()),
            )
        };

        Ok(Self::with_service(config, identity, service))
    }

    /// Wrap an existing service
    pub fn with_service(config: ServerConfig, identity: Arc<RsaKeyPair>, service: Arc<dyn Service>) -> Self {
        let connections = Arc::new(Semaphore::new(config.max_connections));
        Self {
            config,
            service,
            identity,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            connections,
            total_connections: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    async fn resource_service(
        config: &ServerConfig,
        identity: Arc<RsaKeyPair>,
        long_term: Arc<dyn KeyStore>,
    ) -> ServerResult<ResourceService> {
        let (address, key_path) = match (&config.authority_address, &config.authority_public_key) {
            (Some(address), Some(path)) => (address, path),
            _ => {
                return Err(ConfigError::InvalidValue(format!(
                    "role {} requires the authority address and public key",
                    config.role
                ))
                .into())
            }
        };
        let authority_key = load_public_key(key_path)?;

        let transport = TcpTransport::new(address.clone());
        bootstrap_with_authority(&transport, &config.name, &authority_key, long_term.as_ref())
            .await
            .map_err(|e| ServerError::Bootstrap(e.to_string()))?;
        transport.disconnect().await;

        let ledger = Arc::new(Ledger::new());
        for account in &config.accounts {
            ledger.seed(&account.holder, &account.password, account.balance);
        }

        let validator = SessionValidator::new(
            identity,
            long_term,
            config.client_principal.clone(),
            ValidatorLimits {
                replay_window: config.replay_window(),
                max_clock_skew: config.max_clock_skew(),
                challenge_ttl: config.challenge_ttl(),
                idle_timeout: config.session_timeout(),
            },
        );
        Ok(ResourceService::new(config.name.clone(), validator, ledger))
    }

    /// Get server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Own RSA identity
    pub fn identity(&self) -> &Arc<RsaKeyPair> {
        &self.identity
    }

    /// Role implementation
    pub fn service(&self) -> &Arc<dyn Service> {
        &self.service
    }

    /// Check if server is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bind the configured address and serve until stopped
    pub async fn start(&self) -> ServerResult<()> {
        let listener = ServiceListener::bind(self.config.socket_addr()?).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until stopped
    pub async fn serve(&self, listener: ServiceListener) -> ServerResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }

        info!(
            "Starting {} ({}) on {}",
            self.config.name,
            self.config.role,
            listener.local_addr()
        );

        let sweeper = self.spawn_sweeper();
        let result = self.run_loop(&listener).await;
        sweeper.abort();

        self.running.store(false, Ordering::SeqCst);
        result
    }

    /// Main accept loop
    async fn run_loop(&self, listener: &ServiceListener) -> ServerResult<()> {
        while self.is_running() {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = self.shutdown.notified() => break,
            };

            let (stream, remote) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Error accepting connection: {}", e);
                    continue;
                }
            };

            let permit = match Arc::clone(&self.connections).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    let err = ServerError::ConnectionLimitReached {
                        max: self.config.max_connections,
                    };
                    warn!("Rejecting {}: {}", remote, err);
                    continue;
                }
            };
            self.total_connections.fetch_add(1, Ordering::Relaxed);

            // Handle connection in background task
            let service = Arc::clone(&self.service);
            tokio::spawn(async move {
                if let Err(e) = serve_connection(service, stream, remote).await {
                    warn!("Error serving connection from {}: {}", remote, e);
                }
                drop(permit);
            });
        }

        Ok(())
    }

    fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(&self.service);
        let interval = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = service.sweep();
                if removed > 0 {
                    debug!("{} sweep removed {} expired entries", service.name(), removed);
                }
            }
        })
    }

    /// Stop the server
    pub fn stop(&self) {
        info!("Stopping {}", self.config.name);
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    /// Get the running flag for external shutdown handling
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Get server statistics
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            active_connections: self.config.max_connections - self.connections.available_permits(),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            in_flight_calls: self.service.in_flight(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

/// Server statistics
#[derive(Debug, Clone)]
pub struct ServerStats {
    /// Connections being served
    pub active_connections: usize,
    /// Total connections accepted
    pub total_connections: u64,
    /// Requests currently being handled
    pub in_flight_calls: usize,
    /// Server uptime in seconds
    pub uptime_secs: u64,
}

#[cfg(test)]
pub(crate) mod test_support {
    use bastion_crypto::RsaKeyPair;
    use bastion_protocol::Timestamp;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::OnceLock;
    use std::time::Duration;

    use crate::validator::ValidatorLimits;

    pub fn identity() -> &'static RsaKeyPair {
        static KEY: OnceLock<RsaKeyPair> = OnceLock::new();
        KEY.get_or_init(|| RsaKeyPair::generate().expect("rsa key generation"))
    }

    pub fn limits() -> ValidatorLimits {
        ValidatorLimits {
            replay_window: Duration::from_secs(300),
            max_clock_skew: Duration::from_secs(30),
            challenge_ttl: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(900),
        }
    }

    /// Strictly increasing timestamps, so replay caches never trip across calls
    pub fn unique_timestamp() -> Timestamp {
        static LAST: AtomicI64 = AtomicI64::new(0);
        let now = Timestamp::now().as_millis();
        let mut prev = LAST.load(Ordering::SeqCst);
        loop {
            let next = now.max(prev + 1);
            match LAST.compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return Timestamp::from_millis(next),
                Err(actual) => prev = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::identity;
    use bastion_crypto::{hash_password, public_key_from_der};
    use bastion_protocol::{
        open_protected, open_unverified, seal_protected, BusinessCall, BusinessRequest,
        BusinessResponse, ChallengePayload, DiffieHellmanExchange, LivenessAck, LivenessProof,
        Operation, Outcome, Request, Ticket, TicketRedemption, TicketRequest, Timestamp,
        Transport, AUTHORITY_PRINCIPAL,
    };
    use std::time::Duration;

    fn test_config(dir: &std::path::Path, role: ServiceRole) -> ServerConfig {
        let mut builder = ServerConfig::builder()
            .role(role)
            .bind_address("127.0.0.1")
            .data_dir(dir.join(role.as_str()));
        if role.is_resource() {
            builder = builder
                .authority("127.0.0.1:1", dir.join("authority/identity/public.pem"))
                .account("alice", "pw", 1500);
        }
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn test_authority_build_creates_identity() {
        let dir = tempfile::tempdir().unwrap();
        let server = BastionServer::build(test_config(dir.path(), ServiceRole::Authority))
            .await
            .unwrap();

        assert!(!server.is_running());
        assert_eq!(server.service().name(), "authority");
        assert!(dir.path().join("authority/identity/private.pem").exists());
    }

    #[tokio::test]
    async fn test_resource_build_fails_without_authority() {
        let dir = tempfile::tempdir().unwrap();
        BastionServer::build(test_config(dir.path(), ServiceRole::Authority))
            .await
            .unwrap();

        // Nothing listens on the configured authority address
        let result = BastionServer::build(test_config(dir.path(), ServiceRole::Database)).await;
        assert!(matches!(result, Err(ServerError::Bootstrap(_))));
    }

    #[tokio::test]
    async fn test_serve_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let server = Arc::new(
            BastionServer::build(test_config(dir.path(), ServiceRole::Authority))
                .await
                .unwrap(),
        );
        let listener = ServiceListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let running = Arc::clone(&server);
        let handle = tokio::spawn(async move { running.serve(listener).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(server.is_running());

        server.stop();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!server.is_running());
    }

    /// Authority and database over TCP, client steps driven by hand
    #[tokio::test]
    async fn test_full_protocol_over_tcp() {
        let dir = tempfile::tempdir().unwrap();

        let authority = Arc::new(
            BastionServer::build(test_config(dir.path(), ServiceRole::Authority))
                .await
                .unwrap(),
        );
        let authority_listener = ServiceListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let authority_addr = authority_listener.local_addr();
        let a = Arc::clone(&authority);
        tokio::spawn(async move { a.serve(authority_listener).await });

        let mut config = test_config(dir.path(), ServiceRole::Database);
        config.authority_address = Some(authority_addr.to_string());
        let database = Arc::new(BastionServer::build(config).await.unwrap());
        let database_listener = ServiceListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let database_addr = database_listener.local_addr();
        let d = Arc::clone(&database);
        tokio::spawn(async move { d.serve(database_listener).await });

        // DH with the authority
        let to_authority = TcpTransport::new(authority_addr.to_string());
        let exchange = DiffieHellmanExchange::initiate();
        let reply = to_authority
            .call(Request::DiffieHellmanExchange(exchange.offer()))
            .await
            .unwrap()
            .into_dh_reply()
            .unwrap();
        let dh = exchange.complete(AUTHORITY_PRINCIPAL, &reply).unwrap();

        // Ticket for the database
        let grant = to_authority
            .call(Request::RequestTicket(TicketRequest {
                source: "user".into(),
                target: "database".into(),
                timestamp: Timestamp::now(),
            }))
            .await
            .unwrap()
            .into_ticket_grant()
            .unwrap();
        let ticket = Ticket::open(&grant.ticket, &dh.cipher()).unwrap();
        let session = ticket.session_cipher().unwrap();

        // Redemption and challenge
        let to_database = TcpTransport::new(database_addr.to_string());
        let challenge = to_database
            .call(Request::RedeemTicket(TicketRedemption {
                nested_ticket: ticket.nested_ticket.clone(),
                timestamp: Timestamp::now(),
            }))
            .await
            .unwrap()
            .into_challenge()
            .unwrap();
        let opened: ChallengePayload = open_unverified(&session, &challenge.payload).unwrap();
        let database_key = public_key_from_der(&opened.server_public_key).unwrap();
        assert!(session.check(&challenge.payload, &database_key));

        // Liveness
        let client = identity();
        let proof = seal_protected(
            &session,
            client.private_key(),
            &LivenessProof {
                response: opened.nonce.wrapping_add(1),
                client_public_key: client.public_key_der().unwrap(),
            },
        )
        .unwrap();
        let ack = to_database
            .call(Request::StillAlive(bastion_protocol::ProtectedMessage { payload: proof }))
            .await
            .unwrap()
            .into_liveness_ack()
            .unwrap();
        let ack: LivenessAck = open_protected(&session, &database_key, &ack.payload).unwrap();
        assert_eq!(ack.acknowledgement, opened.nonce.wrapping_add(2));

        // Balance on the seeded account
        let timestamp = Timestamp::now();
        let request = seal_protected(
            &session,
            client.private_key(),
            &BusinessRequest {
                timestamp,
                operation: Operation::Balance {
                    holder: "alice".into(),
                    password_hash: hash_password("pw"),
                },
            },
        )
        .unwrap();
        let reply = to_database
            .call(Request::Business(BusinessCall {
                session_id: ack.session_id,
                payload: request,
            }))
            .await
            .unwrap()
            .into_business()
            .unwrap();
        let reply: BusinessResponse = open_protected(&session, &database_key, &reply.payload).unwrap();
        assert_eq!(reply.request_timestamp, timestamp);
        match reply.outcome {
            Outcome::Balance { balance } => assert_eq!(balance.parse::<i64>().unwrap(), 1500),
            other => panic!("unexpected outcome {:?}", other),
        }

        let stats = database.stats();
        assert!(stats.total_connections >= 1);
        assert_eq!(stats.in_flight_calls, 0);
        assert!(dir.path().join("database/counterparts").is_dir());
        authority.stop();
        database.stop();
    }
}
