//! Service seam
//!
//! Both server roles answer [`Request`]s through the [`Service`] trait. The
//! listener drives it over TCP; [`LocalTransport`] drives it in-process.
//! Handling is synchronous RSA and modpow work, so callers on the runtime go
//! through [`respond`], which moves it onto the blocking pool.

use async_trait::async_trait;
use bastion_protocol::{ProtocolError, ProtocolResult, Request, Response, Transport};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::error;

/// One server role
pub trait Service: Send + Sync {
    /// Answer one request from `remote`; failures become `Response::Error`
    fn handle(&self, remote: SocketAddr, request: Request) -> Response;

    /// Evict expired state; returns how many entries went away
    fn sweep(&self) -> usize {
        0
    }

    /// Calls currently being handled
    fn in_flight(&self) -> usize {
        0
    }

    /// Short name for logs
    fn name(&self) -> &str;
}

/// Run `service.handle` on the blocking pool
pub async fn respond<S: Service + ?Sized + 'static>(
    service: &Arc<S>,
    remote: SocketAddr,
    request: Request,
) -> Response {
    let service = Arc::clone(service);
    match tokio::task::spawn_blocking(move || service.handle(remote, request)).await {
        Ok(response) => response,
        Err(e) => {
            error!("Handler for {} did not finish: {}", remote, e);
            Response::error(&ProtocolError::Io(std::io::Error::other(e.to_string())))
        }
    }
}

/// In-process transport bound to one fixed remote address
pub struct LocalTransport<S: ?Sized> {
    service: Arc<S>,
    remote: SocketAddr,
}

impl<S: Service + ?Sized> LocalTransport<S> {
    pub fn new(service: Arc<S>, remote: SocketAddr) -> Self {
        Self { service, remote }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }
}

#[async_trait]
impl<S: Service + ?Sized + 'static> Transport for LocalTransport<S> {
    async fn send(&self, request: Request) -> ProtocolResult<Response> {
        Ok(respond(&self.service, self.remote, request).await)
    }
}
