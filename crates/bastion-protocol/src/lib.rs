//! # Bastion Protocol
//!
//! Session establishment between the services of the bank:
//! - Unauthenticated Diffie-Hellman between a client and the authority
//! - Encrypted Key Exchange bootstrapping resource servers with the authority
//! - Needham-Schroeder style tickets for client to resource server sessions
//! - A nonce challenge proving liveness and delivering the client's RSA key
//! - Replay caches, per-peer key material stores, framed JSON transport
//!
//! ## Protocol Overview
//!
//! ```text
//! Client                      Authority                  Resource server
//!   |                             |<------ EKE (startup) -------|
//!   |--- diffie_hellman_exchange ->|                            |
//!   |<-- server key, parameters --|                             |
//!   |--- request_ticket --------->|                             |
//!   |<-- E(k_client, ticket) -----|                             |
//!   |--- redeem_ticket (nested) ----------------------------->  |
//!   |<-- protect(challenge N, server key) --------------------  |
//!   |--- still_alive protect(N + 1, client key) ------------->  |
//!   |<-- protect(N + 2, session id) --------------------------  |
//!   |=========== business calls on the session ===============  |
//! ```

pub mod constants;
pub mod errors;
pub mod timestamp;
pub mod identity;
pub mod key_store;
pub mod replay;
pub mod session;
pub mod handshake;
pub mod eke;
pub mod ticket;
pub mod messages;
pub mod frame;
pub mod transport;

pub use constants::*;
pub use errors::*;
pub use timestamp::*;
pub use identity::*;
pub use key_store::*;
pub use replay::*;
pub use session::*;
pub use handshake::*;
pub use eke::*;
pub use ticket::*;
pub use messages::*;
pub use frame::*;
pub use transport::*;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::constants::*;
    pub use crate::errors::*;
    pub use crate::timestamp::*;
    pub use crate::identity::*;
    pub use crate::key_store::*;
    pub use crate::replay::*;
    pub use crate::session::*;
    pub use crate::handshake::*;
    pub use crate::eke::*;
    pub use crate::ticket::*;
    pub use crate::messages::*;
    pub use crate::transport::*;
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{client_key, resource_key};
    use bastion_crypto::public_key_from_der;
    use std::time::Duration;

    #[test]
    fn test_ticket_to_established_session() {
        let ttl = Duration::from_secs(60);

        // Client and authority agree on a key
        let client_dh = DiffieHellmanExchange::initiate();
        let offer = client_dh.offer();
        let (reply, authority_side) =
            DiffieHellmanExchange::answer("user", &offer.client_public_key).unwrap();
        let client_side = client_dh.complete(AUTHORITY_PRINCIPAL, &reply).unwrap();

        // Authority already shares a long-term key with the database
        let database_long_term = KeyMaterial::new("database", [3; 32], [4; 16]);

        // Ticket issued under the authority's view of the client key
        let ts = Timestamp::now();
        let ticket = Ticket::issue("user", "database", ts, &database_long_term.cipher()).unwrap();
        let sealed = ticket.seal(&authority_side.cipher()).unwrap();

        let ticket = Ticket::open(&sealed, &client_side.cipher()).unwrap();
        let client_session = ticket.session_cipher().unwrap();

        // Database redeems the nested ticket and issues a challenge
        let inner = InnerTicket::open(&ticket.nested_ticket, &database_long_term.cipher()).unwrap();
        assert_eq!(inner.source, DEFAULT_CLIENT_PRINCIPAL);
        let state = PeerSession::ticket_issued(inner.session_cipher().unwrap(), &inner.source);
        let (state, nonce) = state.challenge().unwrap();

        let server_cipher = state.cipher().unwrap();
        let challenge = seal_protected(
            server_cipher,
            resource_key().private_key(),
            &ChallengePayload {
                nonce,
                server_public_key: resource_key().public_key_der().unwrap(),
            },
        )
        .unwrap();

        // Client answers
        let opened: ChallengePayload = open_unverified(&client_session, &challenge).unwrap();
        let server_key = public_key_from_der(&opened.server_public_key).unwrap();
        assert!(client_session.check(&challenge, &server_key));

        let proof = seal_protected(
            &client_session,
            client_key().private_key(),
            &LivenessProof {
                response: opened.nonce.wrapping_add(1),
                client_public_key: client_key().public_key_der().unwrap(),
            },
        )
        .unwrap();

        // Server verifies with the delivered key and establishes
        let proof: LivenessProof = open_unverified(server_cipher, &proof).unwrap();
        let client_public = public_key_from_der(&proof.client_public_key).unwrap();
        let state = state.confirm(proof.response, client_public, ttl).unwrap();
        assert_eq!(state.state(), SessionState::Established);
    }
}
