//! Request transport
//!
//! [`Transport`] is the seam between protocol logic and the network. The TCP
//! implementation keeps one connection open, so the server sees a stable
//! remote address for every step of a handshake.

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::constants::DEFAULT_CALL_TIMEOUT_SECS;
use crate::errors::{ProtocolError, ProtocolResult};
use crate::frame::{read_message, write_message};
use crate::messages::{Request, Response};

/// Sends one request and waits for its response
#[async_trait]
pub trait Transport: Send + Sync {
    /// Raw call; error responses are returned as `Response::Error`
    async fn send(&self, request: Request) -> ProtocolResult<Response>;

    /// Call and turn error responses into [`ProtocolError`]s
    async fn call(&self, request: Request) -> ProtocolResult<Response> {
        self.send(request).await?.into_result()
    }
}

/// Framed JSON over a persistent TCP connection
pub struct TcpTransport {
    address: String,
    timeout: Duration,
    stream: Mutex<Option<TcpStream>>,
}

impl TcpTransport {
    pub fn new(address: impl Into<String>) -> Self {
        Self::with_timeout(address, Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS))
    }

    pub fn with_timeout(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
            stream: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Drop the connection; the next call reconnects from a new address
    pub async fn disconnect(&self) {
        self.stream.lock().await.take();
    }

    async fn exchange(stream: &mut TcpStream, request: &Request) -> ProtocolResult<Response> {
        write_message(stream, request).await?;
        read_message(stream)
            .await?
            .ok_or(ProtocolError::ConnectionClosed)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, request: Request) -> ProtocolResult<Response> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.address))
                .await
                .map_err(|_| ProtocolError::Timeout)??;
            stream.set_nodelay(true)?;
            debug!("Connected to {}", self.address);
            *guard = Some(stream);
        }
        let stream = guard.as_mut().ok_or(ProtocolError::ConnectionClosed)?;

        let kind = request.kind();
        let result = match tokio::time::timeout(self.timeout, Self::exchange(stream, &request)).await {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::Timeout),
        };
        if let Err(e) = &result {
            // A broken or desynchronized stream is never reused
            warn!("{} call to {} failed: {}", kind, self.address, e);
            guard.take();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ProtectedMessage, TicketGrant};
    use tokio::net::TcpListener;

    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            while let Ok(Some(request)) = read_message::<_, Request>(&mut socket).await {
                let response = match request {
                    Request::StillAlive(m) => Response::RequestTicket(TicketGrant { ticket: m.payload }),
                    _ => Response::error(&ProtocolError::InvalidMessage("nope".into())),
                };
                write_message(&mut socket, &response).await.unwrap();
            }
        });
        addr.to_string()
    }

    #[tokio::test]
    async fn test_calls_share_one_connection() {
        let transport = TcpTransport::new(echo_server().await);

        for i in 0..3u8 {
            let response = transport
                .call(Request::StillAlive(ProtectedMessage { payload: vec![i] }))
                .await
                .unwrap();
            assert_eq!(response.into_ticket_grant().unwrap().ticket, vec![i]);
        }
    }

    #[tokio::test]
    async fn test_error_response_becomes_error() {
        let transport = TcpTransport::new(echo_server().await);
        let request = Request::Business(crate::messages::BusinessCall {
            session_id: crate::session::SessionId::generate(),
            payload: vec![],
        });

        let raw = transport.send(request.clone()).await.unwrap();
        assert!(matches!(raw, Response::Error(_)));

        let result = transport.call(request).await;
        assert!(matches!(
            result,
            Err(ProtocolError::Remote { .. })
        ));
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = TcpTransport::with_timeout(addr.to_string(), Duration::from_secs(2));
        let result = transport
            .call(Request::StillAlive(ProtectedMessage { payload: vec![] }))
            .await;
        assert!(result.is_err());
    }
}
