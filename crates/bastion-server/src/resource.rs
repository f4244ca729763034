//! Resource server role (bank, database)
//!
//! Redeems tickets, answers liveness checks and runs ledger operations on
//! established sessions. On startup it agrees a long-term key with the
//! authority through EKE.

use bastion_crypto::RsaPublicKey;
use bastion_protocol::{
    EkeInitiator, KeyStore, OperationKind, PeerId, ProtectedMessage, ProtocolError,
    ProtocolResult, Request, Response, Transport, AUTHORITY_PRINCIPAL,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::binder::RequestIdentityBinder;
use crate::ledger::Ledger;
use crate::service::Service;
use crate::validator::SessionValidator;

pub struct ResourceService {
    name: String,
    validator: SessionValidator,
    ledger: Arc<Ledger>,
    binder: Arc<RequestIdentityBinder>,
}

impl ResourceService {
    pub fn new(name: impl Into<String>, validator: SessionValidator, ledger: Arc<Ledger>) -> Self {
        Self {
            name: name.into(),
            validator,
            ledger,
            binder: RequestIdentityBinder::new(),
        }
    }

    pub fn validator(&self) -> &SessionValidator {
        &self.validator
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    fn dispatch(&self, remote: SocketAddr, request: Request) -> ProtocolResult<Response> {
        match request {
            Request::RedeemTicket(redemption) => {
                let binding = self.binder.bind(&remote, OperationKind::RedeemTicket);
                let payload = self.validator.authenticate(binding.peer(), &redemption)?;
                Ok(Response::RedeemTicket(ProtectedMessage { payload }))
            }
            Request::StillAlive(message) => {
                let binding = self.binder.bind(&remote, OperationKind::StillAlive);
                let payload = self.validator.still_alive(binding.peer(), &message.payload)?;
                Ok(Response::StillAlive(ProtectedMessage { payload }))
            }
            // Addressed by session id; the binding only counts the call
            Request::Business(call) => {
                let _binding = self.binder.bind(&remote, OperationKind::Business);
                let payload = self.validator.business(&call, |op| self.ledger.execute(op))?;
                Ok(Response::Business(ProtectedMessage { payload }))
            }
            other => Err(ProtocolError::InvalidMessage(format!(
                "{} is not served by {}",
                other.kind(),
                self.name
            ))),
        }
    }
}

impl Service for ResourceService {
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
        self.validator.sweep()
    }

    fn in_flight(&self) -> usize {
        self.binder.in_flight()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Agree a long-term key with the authority and store it
pub async fn bootstrap_with_authority(
    transport: &dyn Transport,
    name: &str,
    authority_key: &RsaPublicKey,
    store: &dyn KeyStore,
) -> ProtocolResult<()> {
    let (initiator, hello) = EkeInitiator::start(name, authority_key)?;
    let reply = transport
        .call(Request::EncryptedKeyExchange(hello))
        .await?
        .into_eke_reply()?;

    let (material, confirm) = initiator.finish(AUTHORITY_PRINCIPAL, &reply)?;
    transport
        .call(Request::ConfirmKeyExchange(confirm))
        .await?
        .into_confirmation()?;

    store.put(&PeerId::named(AUTHORITY_PRINCIPAL), material)?;
    info!("{} shares a long-term key with the authority", name);
    Ok(())
}
