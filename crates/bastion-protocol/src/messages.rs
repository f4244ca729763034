//! Wire messages
//!
//! Every frame carries one JSON [`Request`] or [`Response`], tagged by `op`.
//! Byte fields travel as hex strings, timestamps as decimal strings.
//!
//! Payloads after ticket redemption are *protected*: signed with the
//! sender's RSA key, then encrypted under the session key (see
//! [`seal_protected`] and [`open_protected`]).

use bastion_crypto::{RsaPrivateKey, RsaPublicKey, SessionCipher};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::constants::ErrorCode;
use crate::eke::{EkeConfirm, EkeHello, EkeReply};
use crate::errors::{ProtocolError, ProtocolResult};
use crate::handshake::{DhOffer, DhReply};
use crate::session::SessionId;
use crate::timestamp::Timestamp;

/// Operation kinds, one per request variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    DiffieHellmanExchange,
    EncryptedKeyExchange,
    ConfirmKeyExchange,
    RequestTicket,
    RedeemTicket,
    StillAlive,
    Business,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::DiffieHellmanExchange => "diffie_hellman_exchange",
            OperationKind::EncryptedKeyExchange => "encrypted_key_exchange",
            OperationKind::ConfirmKeyExchange => "confirm_key_exchange",
            OperationKind::RequestTicket => "request_ticket",
            OperationKind::RedeemTicket => "redeem_ticket",
            OperationKind::StillAlive => "still_alive",
            OperationKind::Business => "business",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ticket request to the authority
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketRequest {
    pub source: String,
    pub target: String,
    pub timestamp: Timestamp,
}

/// Outer ticket, encrypted for the requester
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketGrant {
    #[serde(with = "hex::serde")]
    pub ticket: Vec<u8>,
}

/// Nested ticket presented to a resource server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketRedemption {
    #[serde(with = "hex::serde")]
    pub nested_ticket: Vec<u8>,
    pub timestamp: Timestamp,
}

/// Signed-then-encrypted payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectedMessage {
    #[serde(with = "hex::serde")]
    pub payload: Vec<u8>,
}

/// Business call on an established session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessCall {
    pub session_id: SessionId,
    #[serde(with = "hex::serde")]
    pub payload: Vec<u8>,
}

/// Error carried back to the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
}

/// Inbound request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    DiffieHellmanExchange(DhOffer),
    EncryptedKeyExchange(EkeHello),
    ConfirmKeyExchange(EkeConfirm),
    RequestTicket(TicketRequest),
    RedeemTicket(TicketRedemption),
    StillAlive(ProtectedMessage),
    Business(BusinessCall),
}

impl Request {
    pub fn kind(&self) -> OperationKind {
        match self {
            Request::DiffieHellmanExchange(_) => OperationKind::DiffieHellmanExchange,
            Request::EncryptedKeyExchange(_) => OperationKind::EncryptedKeyExchange,
            Request::ConfirmKeyExchange(_) => OperationKind::ConfirmKeyExchange,
            Request::RequestTicket(_) => OperationKind::RequestTicket,
            Request::RedeemTicket(_) => OperationKind::RedeemTicket,
            Request::StillAlive(_) => OperationKind::StillAlive,
            Request::Business(_) => OperationKind::Business,
        }
    }
}

/// Outbound response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Response {
    DiffieHellmanExchange(DhReply),
    EncryptedKeyExchange(EkeReply),
    ConfirmKeyExchange,
    RequestTicket(TicketGrant),
    RedeemTicket(ProtectedMessage),
    StillAlive(ProtectedMessage),
    Business(ProtectedMessage),
    Error(ErrorResponse),
}

impl Response {
    /// Wire form of a failed request
    pub fn error(err: &ProtocolError) -> Self {
        Response::Error(ErrorResponse {
            code: err.to_error_code(),
            message: err.to_string(),
        })
    }

    /// Turn an error response back into a [`ProtocolError`]
    pub fn into_result(self) -> ProtocolResult<Response> {
        match self {
            Response::Error(e) => Err(ProtocolError::from_wire(e.code, e.message)),
            other => Ok(other),
        }
    }

    fn op_name(&self) -> &'static str {
        match self {
            Response::DiffieHellmanExchange(_) => "diffie_hellman_exchange",
            Response::EncryptedKeyExchange(_) => "encrypted_key_exchange",
            Response::ConfirmKeyExchange => "confirm_key_exchange",
            Response::RequestTicket(_) => "request_ticket",
            Response::RedeemTicket(_) => "redeem_ticket",
            Response::StillAlive(_) => "still_alive",
            Response::Business(_) => "business",
            Response::Error(_) => "error",
        }
    }

    fn unexpected(self, wanted: &str) -> ProtocolError {
        match self.into_result() {
            Err(e) => e,
            Ok(other) => ProtocolError::InvalidMessage(format!(
                "expected {} response, got {}",
                wanted,
                other.op_name()
            )),
        }
    }

    pub fn into_dh_reply(self) -> ProtocolResult<DhReply> {
        match self {
            Response::DiffieHellmanExchange(reply) => Ok(reply),
            other => Err(other.unexpected("diffie_hellman_exchange")),
        }
    }

    pub fn into_eke_reply(self) -> ProtocolResult<EkeReply> {
        match self {
            Response::EncryptedKeyExchange(reply) => Ok(reply),
            other => Err(other.unexpected("encrypted_key_exchange")),
        }
    }

    pub fn into_confirmation(self) -> ProtocolResult<()> {
        match self {
            Response::ConfirmKeyExchange => Ok(()),
            other => Err(other.unexpected("confirm_key_exchange")),
        }
    }

    pub fn into_ticket_grant(self) -> ProtocolResult<TicketGrant> {
        match self {
            Response::RequestTicket(grant) => Ok(grant),
            other => Err(other.unexpected("request_ticket")),
        }
    }

    pub fn into_challenge(self) -> ProtocolResult<ProtectedMessage> {
        match self {
            Response::RedeemTicket(message) => Ok(message),
            other => Err(other.unexpected("redeem_ticket")),
        }
    }

    pub fn into_liveness_ack(self) -> ProtocolResult<ProtectedMessage> {
        match self {
            Response::StillAlive(message) => Ok(message),
            other => Err(other.unexpected("still_alive")),
        }
    }

    pub fn into_business(self) -> ProtocolResult<ProtectedMessage> {
        match self {
            Response::Business(message) => Ok(message),
            other => Err(other.unexpected("business")),
        }
    }
}

/// Challenge issued on ticket redemption
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengePayload {
    pub nonce: i64,
    /// Server RSA public key, SPKI DER
    #[serde(with = "hex::serde")]
    pub server_public_key: Vec<u8>,
}

/// Client's answer to a challenge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessProof {
    pub response: i64,
    /// Client RSA public key, SPKI DER
    #[serde(with = "hex::serde")]
    pub client_public_key: Vec<u8>,
}

/// Server's acknowledgement of a valid proof
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessAck {
    pub acknowledgement: i64,
    pub session_id: SessionId,
}

/// Ledger operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    Balance {
        holder: String,
        password_hash: String,
    },
    CreateAccount {
        holder: String,
        password_hash: String,
        initial_deposit: i64,
    },
    Deposit {
        holder: String,
        password_hash: String,
        amount: i64,
    },
}

/// Protected body of a business call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessRequest {
    pub timestamp: Timestamp,
    pub operation: Operation,
}

/// Result of a ledger operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Balance { balance: String },
    AccountCreated { holder: String },
    Deposited { balance: String },
    Rejected { reason: String },
}

/// Protected body of a business reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessResponse {
    /// Echo of the request timestamp, binds the reply to its request
    pub request_timestamp: Timestamp,
    pub outcome: Outcome,
}

/// Sign and encrypt a record
pub fn seal_protected<T: Serialize>(
    cipher: &SessionCipher,
    signer: &RsaPrivateKey,
    value: &T,
) -> ProtocolResult<Vec<u8>> {
    let plaintext = serde_json::to_vec(value)?;
    Ok(cipher.protect(signer, &plaintext)?)
}

/// Verify the signature with `signer`, then decrypt and parse
pub fn open_protected<T: DeserializeOwned>(
    cipher: &SessionCipher,
    signer: &RsaPublicKey,
    payload: &[u8],
) -> ProtocolResult<T> {
    if !cipher.check(payload, signer) {
        return Err(ProtocolError::TamperedMessage(
            "signature check failed".into(),
        ));
    }
    open_unverified(cipher, payload)
}

/// Decrypt and parse without checking the signature
///
/// Only for payloads that carry the signer's key themselves; the caller
/// must run `check` with that key before trusting the content.
pub fn open_unverified<T: DeserializeOwned>(
    cipher: &SessionCipher,
    payload: &[u8],
) -> ProtocolResult<T> {
    let plaintext = cipher.unprotect(payload)?;
    Ok(serde_json::from_slice(&plaintext)?)
}
