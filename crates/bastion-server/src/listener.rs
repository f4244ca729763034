//! TCP Listener
//!
//! Accepts connections with socket configuration and serves framed
//! requests on each of them.

use crate::errors::{ServerError, ServerResult};
use crate::service::{respond, Service};
use bastion_protocol::{read_message, write_message, ProtocolError, Request, Response};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

const BACKLOG: i32 = 1024;

/// TCP listener for a Bastion service
pub struct ServiceListener {
    /// The underlying listener
    listener: TcpListener,
    /// Local address
    local_addr: SocketAddr,
}

impl ServiceListener {
    /// Bind to `addr`
    pub async fn bind(addr: SocketAddr) -> ServerResult<Self> {
        let bind_failed = |e: std::io::Error| ServerError::BindFailed {
            address: addr.to_string(),
            reason: e.to_string(),
        };

        // Create socket with socket2 for advanced options
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(bind_failed)?;

        // Set socket options
        socket.set_reuse_address(true).ok();
        socket.set_nonblocking(true).map_err(bind_failed)?;

        socket.bind(&addr.into()).map_err(bind_failed)?;
        socket.listen(BACKLOG).map_err(bind_failed)?;

        // Convert to tokio listener
        let std_listener: std::net::TcpListener = socket.into();
        let listener = TcpListener::from_std(std_listener)?;

        let local_addr = listener.local_addr()?;

        Ok(Self { listener, local_addr })
    }

    /// Accept one connection
    pub async fn accept(&self) -> ServerResult<(TcpStream, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, addr))
    }

    /// Get local address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Connection info for a client
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Remote address
    pub remote_addr: SocketAddr,
    /// Connection time
    pub connected_at: std::time::Instant,
    /// Requests answered
    pub requests: u64,
    /// Error responses sent
    pub errors: u64,
}

impl ConnectionInfo {
    /// Create new connection info
    pub fn new(remote_addr: SocketAddr) -> Self {
        Self {
            remote_addr,
            connected_at: std::time::Instant::now(),
            requests: 0,
            errors: 0,
        }
    }

    /// Record one answered request
    pub fn record(&mut self, response: &Response) {
        self.requests += 1;
        if matches!(response, Response::Error(_)) {
            self.errors += 1;
        }
    }

    /// Get connection duration
    pub fn duration(&self) -> std::time::Duration {
        self.connected_at.elapsed()
    }
}

/// Serve framed requests until the peer closes the connection
pub async fn serve_connection<S>(
    service: Arc<S>,
    stream: TcpStream,
    remote: SocketAddr,
) -> ServerResult<ConnectionInfo>
where
    S: Service + ?Sized + 'static,
{
    let mut info = ConnectionInfo::new(remote);
    let (mut reader, mut writer) = stream.into_split();

    loop {
        let response = match read_message::<_, Request>(&mut reader).await {
            Ok(Some(request)) => respond(&service, remote, request).await,
            Ok(None) => break,
            // The frame was intact, so the stream is still in sync
            Err(e @ ProtocolError::Serialization(_)) => {
                warn!("Malformed request from {}: {}", remote, e);
                Response::error(&ProtocolError::InvalidMessage(e.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        info.record(&response);
        write_message(&mut writer, &response).await?;
    }

    debug!(
        "Connection from {} closed after {} requests in {:?}",
        remote,
        info.requests,
        info.duration()
    );
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_protocol::{write_frame, ProtectedMessage, ProtocolResult, Transport, TcpTransport};

    struct Echo;

    impl Service for Echo {
        fn handle(&self, _remote: SocketAddr, request: Request) -> Response {
            match request {
                Request::StillAlive(message) => Response::StillAlive(message),
                other => Response::error(&ProtocolError::InvalidMessage(other.kind().to_string())),
            }
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    async fn spawn_echo() -> SocketAddr {
        let listener = ServiceListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr();
        tokio::spawn(async move {
            while let Ok((stream, remote)) = listener.accept().await {
                tokio::spawn(serve_connection(Arc::new(Echo), stream, remote));
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let listener = ServiceListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert_ne!(listener.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let std_conflict = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = std_conflict.local_addr().unwrap();

        let result = ServiceListener::bind(taken).await;
        assert!(matches!(result, Err(ServerError::BindFailed { .. })));
    }

    #[tokio::test]
    async fn test_serves_requests_over_tcp() -> ProtocolResult<()> {
        let addr = spawn_echo().await;
        let transport = TcpTransport::new(addr.to_string());

        for i in 0..3u8 {
            let response = transport
                .call(Request::StillAlive(ProtectedMessage { payload: vec![i] }))
                .await?;
            assert_eq!(response.into_liveness_ack()?.payload, vec![i]);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_malformed_request_gets_error_response() {
        let addr = spawn_echo().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        write_frame(&mut stream, b"{\"op\":\"nonsense\"}").await.unwrap();
        let response: Response = read_message(&mut stream).await.unwrap().unwrap();
        assert!(matches!(response, Response::Error(_)));

        // Connection is still usable
        write_message(&mut stream, &Request::StillAlive(ProtectedMessage { payload: vec![1] }))
            .await
            .unwrap();
        let response: Response = read_message(&mut stream).await.unwrap().unwrap();
        assert!(matches!(response, Response::StillAlive(_)));
    }

    #[test]
    fn test_connection_info_counts() {
        let mut info = ConnectionInfo::new("127.0.0.1:1".parse().unwrap());
        info.record(&Response::ConfirmKeyExchange);
        info.record(&Response::error(&ProtocolError::Timeout));
        assert_eq!(info.requests, 2);
        assert_eq!(info.errors, 1);
    }
}
