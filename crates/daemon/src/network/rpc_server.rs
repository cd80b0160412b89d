//! WebSocket listener for the RPC channel.
//!
//! Each accepted connection gets its own correlation scope in the shared
//! registry. Requests from the client are routed through the
//! [`MessageRouter`]; responses to daemon-initiated calls settle their pending
//! context. When a connection ends, every call still waiting on it is failed.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use protocol::messages::{ErrorCode, ErrorMessage, Ping};
use protocol::{Envelope, Message, ProtocolError, RpcMessageRegistry, PROTOCOL_VERSION};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, StatusCode};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::{authorize, TokenValidator};
use crate::router::MessageRouter;

/// Outbound frames queued per connection before senders wait.
const OUTBOUND_QUEUE: usize = 256;

/// Reason used to fail calls pending on a closed connection.
pub const CONNECTION_CLOSED_REASON: &str = "connection closed";

/// A live client connection.
#[derive(Debug)]
struct ConnectionHandle {
    peer: SocketAddr,
    connected_at: Instant,
    outbound: mpsc::Sender<WsMessage>,
}

/// Live connections and the correlation registry shared by all of them.
pub struct RpcConnections {
    table: DashMap<String, ConnectionHandle>,
    registry: RpcMessageRegistry,
    call_timeout: Duration,
}

impl RpcConnections {
    /// Create an empty table. Daemon-initiated calls wait at most `call_timeout`.
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            table: DashMap::new(),
            registry: RpcMessageRegistry::new(),
            call_timeout,
        }
    }

    /// The correlation registry.
    pub fn registry(&self) -> &RpcMessageRegistry {
        &self.registry
    }

    /// Number of open connections.
    pub fn count(&self) -> usize {
        self.table.len()
    }

    /// Ids of the open connections.
    pub fn ids(&self) -> Vec<String> {
        self.table.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Send `message` to a connection and wait for its reply.
    ///
    /// A reply carrying [`Message::Error`] becomes [`ProtocolError::Remote`].
    pub async fn call(&self, connection_id: &str, message: Message) -> Result<Message, ProtocolError> {
        let outbound = self
            .table
            .get(connection_id)
            .map(|handle| handle.outbound.clone())
            .ok_or_else(|| {
                ProtocolError::ConnectionClosed(format!("no open connection {connection_id}"))
            })?;

        let pending = self.registry.scope(connection_id).register();
        let envelope = Envelope::new(pending.correlation_id(), message);
        let frame = WsMessage::Binary(envelope.to_msgpack()?);
        outbound.send(frame).await.map_err(|_| {
            ProtocolError::ConnectionClosed(format!("connection {connection_id} is closing"))
        })?;

        let reply = pending.wait_timeout(self.call_timeout).await?;
        match reply.payload {
            Message::Error(err) => Err(ProtocolError::Remote {
                correlation_id: reply.correlation_id,
                message: err.message,
            }),
            payload => Ok(payload),
        }
    }

    fn insert(&self, connection_id: &str, handle: ConnectionHandle) {
        self.table.insert(connection_id.to_string(), handle);
    }

    fn remove(&self, connection_id: &str) {
        if let Some((_, handle)) = self.table.remove(connection_id) {
            let aborted = self
                .registry
                .abort_scope_with_remote_error(connection_id, CONNECTION_CLOSED_REASON);
            info!(
                connection_id,
                peer = %handle.peer,
                duration_secs = handle.connected_at.elapsed().as_secs(),
                aborted,
                "RPC connection closed"
            );
        }
    }
}

/// Accepts WebSocket connections and serves RPC requests.
pub struct RpcServer {
    listener: TcpListener,
    router: Arc<MessageRouter>,
    auth: Arc<dyn TokenValidator>,
    connections: Arc<RpcConnections>,
    keepalive_interval: Option<Duration>,
}

impl RpcServer {
    /// Bind the listener. Port 0 picks a free port.
    pub async fn bind(
        addr: SocketAddr,
        router: Arc<MessageRouter>,
        auth: Arc<dyn TokenValidator>,
        connections: Arc<RpcConnections>,
        keepalive_interval: Option<Duration>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            router,
            auth,
            connections,
            keepalive_interval,
        })
    }

    /// The bound address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` is cancelled, then wait for open connections.
    pub async fn run(self, shutdown: CancellationToken) {
        let tracker = TaskTracker::new();
        info!(addr = ?self.listener.local_addr().ok(), "RPC server listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let session = ConnectionSession {
                            router: Arc::clone(&self.router),
                            auth: Arc::clone(&self.auth),
                            connections: Arc::clone(&self.connections),
                            keepalive_interval: self.keepalive_interval,
                            cancel: shutdown.child_token(),
                            tracker: tracker.clone(),
                        };
                        tracker.spawn(session.serve(stream, peer));
                    }
                    Err(e) => warn!(error = %e, "Failed to accept RPC connection"),
                },
            }
        }

        tracker.close();
        tracker.wait().await;
        info!("RPC server stopped");
    }
}

/// Everything one connection task needs.
struct ConnectionSession {
    router: Arc<MessageRouter>,
    auth: Arc<dyn TokenValidator>,
    connections: Arc<RpcConnections>,
    keepalive_interval: Option<Duration>,
    cancel: CancellationToken,
    /// The server's tracker; routed requests run on it so shutdown waits for them.
    tracker: TaskTracker,
}

impl ConnectionSession {
    async fn serve(self, stream: TcpStream, peer: SocketAddr) {
        let auth = Arc::clone(&self.auth);
        let check = move |request: &Request, response: Response| {
            let header = request
                .headers()
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok());
            if authorize(auth.as_ref(), header) {
                Ok(response)
            } else {
                Err(unauthorized_response())
            }
        };

        let ws = match tokio_tungstenite::accept_hdr_async(stream, check).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(%peer, error = %e, "Rejected RPC handshake");
                return;
            }
        };

        let connection_id = Uuid::new_v4().to_string();
        let (mut sink, mut frames) = ws.split();
        let (outbound, mut outbound_rx) = mpsc::channel::<WsMessage>(OUTBOUND_QUEUE);

        self.connections.insert(
            &connection_id,
            ConnectionHandle {
                peer,
                connected_at: Instant::now(),
                outbound: outbound.clone(),
            },
        );
        info!(connection_id = %connection_id, %peer, "RPC connection established");

        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let is_close = matches!(frame, WsMessage::Close(_));
                if let Err(e) = sink.send(frame).await {
                    debug!(error = %e, "Failed to send RPC frame");
                    break;
                }
                if is_close {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let closing = self.cancel.child_token();
        let keepalive = self.keepalive_interval.map(|interval| {
            tokio::spawn(keepalive_loop(
                Arc::clone(&self.connections),
                connection_id.clone(),
                interval,
                closing.clone(),
            ))
        });

        loop {
            tokio::select! {
                _ = closing.cancelled() => {
                    let _ = outbound.send(WsMessage::Close(None)).await;
                    break;
                }
                frame = frames.next() => match frame {
                    Some(Ok(WsMessage::Binary(bytes))) => self.handle_frame(&connection_id, &bytes, &outbound),
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(WsMessage::Text(_))) => {
                        warn!(connection_id = %connection_id, "Ignoring text frame on RPC channel");
                    }
                    Some(Ok(_)) => {
                        // Control frames are answered by the WebSocket layer
                    }
                    Some(Err(e)) => {
                        debug!(connection_id = %connection_id, error = %e, "RPC connection error");
                        break;
                    }
                },
            }
        }

        if let Some(keepalive) = keepalive {
            keepalive.abort();
        }
        self.connections.remove(&connection_id);
        drop(outbound);
        let _ = writer.await;
    }

    fn handle_frame(&self, connection_id: &str, bytes: &[u8], outbound: &mpsc::Sender<WsMessage>) {
        let envelope = match Envelope::from_msgpack(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(connection_id, error = %e, "Dropping undecodable RPC frame");
                return;
            }
        };

        if envelope.version != PROTOCOL_VERSION {
            let reply = envelope.reply(Message::Error(ErrorMessage {
                code: ErrorCode::VersionMismatch,
                message: format!(
                    "protocol version {} is not supported, expected {}",
                    envelope.version, PROTOCOL_VERSION
                ),
                context: None,
                recoverable: false,
            }));
            let outbound = outbound.clone();
            self.tracker
                .spawn(async move { send_envelope(&outbound, reply).await });
            return;
        }

        if envelope.payload.is_response() {
            match self.connections.registry().set_response(envelope) {
                Ok(true) => {}
                Ok(false) => debug!(connection_id, "Response for unknown or expired call"),
                // Already logged by the registry
                Err(_) => {}
            }
            return;
        }

        let router = Arc::clone(&self.router);
        let outbound = outbound.clone();
        let connection_id = connection_id.to_string();
        self.tracker.spawn(async move {
            let payload = match router.route(envelope.payload.clone()).await {
                Ok(Some(response)) => response,
                Ok(None) => return,
                Err(e) => {
                    warn!(connection_id = %connection_id, error = %e, "RPC request failed");
                    Message::Error(e.to_error_message(Some(envelope.correlation_id.clone())))
                }
            };
            send_envelope(&outbound, envelope.reply(payload)).await;
        });
    }
}

/// Pings the client on a fixed interval and cancels `closing` when a ping
/// goes unanswered.
async fn keepalive_loop(
    connections: Arc<RpcConnections>,
    connection_id: String,
    interval: Duration,
    closing: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    // Skip the first immediate tick
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = closing.cancelled() => break,
            _ = ticker.tick() => {
                let ping = Message::Ping(Ping {
                    timestamp: unix_millis(),
                    payload: Vec::new(),
                });
                match connections.call(&connection_id, ping).await {
                    Ok(Message::Pong(_)) => debug!(connection_id = %connection_id, "Keepalive answered"),
                    Ok(other) => {
                        warn!(connection_id = %connection_id, reply = ?other, "Unexpected keepalive reply");
                    }
                    Err(e) => {
                        warn!(connection_id = %connection_id, error = %e, "Keepalive failed, closing connection");
                        closing.cancel();
                        break;
                    }
                }
            }
        }
    }
}

async fn send_envelope(outbound: &mpsc::Sender<WsMessage>, envelope: Envelope) {
    match envelope.to_msgpack() {
        Ok(bytes) => {
            if outbound.send(WsMessage::Binary(bytes)).await.is_err() {
                debug!("Connection closed before reply was sent");
            }
        }
        Err(e) => error!(error = %e, "Failed to encode RPC reply"),
    }
}

fn unauthorized_response() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("unauthorized".to_string()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenValidator;
    use crate::config::FileTransferOptions;
    use crate::files::{FileSystemRpcHandler, FileTransferEndpointService, SandboxedFileSystem};
    use protocol::messages::{Pong, TransferLimitsRequest};
    use tempfile::TempDir;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::HeaderValue;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    const TOKEN: &str = "rpc-token";

    type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

    struct TestServer {
        _dir: TempDir,
        addr: SocketAddr,
        connections: Arc<RpcConnections>,
        shutdown: CancellationToken,
    }

    async fn start_server(keepalive: Option<Duration>) -> TestServer {
        let dir = TempDir::new().unwrap();
        let fs = Arc::new(SandboxedFileSystem::local(dir.path()).unwrap());
        let options = FileTransferOptions {
            max_file_size_bytes: 1234,
            ..FileTransferOptions::default()
        };
        let router = Arc::new(MessageRouter::new(
            Arc::new(FileSystemRpcHandler::new(Arc::clone(&fs))),
            Arc::new(FileTransferEndpointService::new(fs, &options)),
        ));
        let auth: Arc<dyn TokenValidator> = Arc::new(StaticTokenValidator::new([TOKEN]));
        let connections = Arc::new(RpcConnections::new(Duration::from_millis(500)));

        let server = RpcServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            router,
            auth,
            Arc::clone(&connections),
            keepalive,
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(server.run(shutdown.clone()));

        TestServer {
            _dir: dir,
            addr,
            connections,
            shutdown,
        }
    }

    async fn connect(addr: SocketAddr, token: Option<&str>) -> Result<ClientSocket, tokio_tungstenite::tungstenite::Error> {
        let mut request = format!("ws://{addr}/").into_client_request().unwrap();
        if let Some(token) = token {
            request.headers_mut().insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
            );
        }
        tokio_tungstenite::connect_async(request).await.map(|(ws, _)| ws)
    }

    async fn next_envelope(ws: &mut ClientSocket) -> Envelope {
        loop {
            match ws.next().await.unwrap().unwrap() {
                WsMessage::Binary(bytes) => return Envelope::from_msgpack(&bytes).unwrap(),
                _ => continue,
            }
        }
    }

    async fn wait_for_connections(connections: &RpcConnections, expected: usize) {
        for _ in 0..100 {
            if connections.count() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {expected} connections, have {}", connections.count());
    }

    #[tokio::test]
    async fn test_handshake_requires_token() {
        let server = start_server(None).await;

        assert!(connect(server.addr, None).await.is_err());
        assert!(connect(server.addr, Some("wrong")).await.is_err());
        assert!(connect(server.addr, Some(TOKEN)).await.is_ok());

        server.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_request_reply_uses_same_correlation_id() {
        let server = start_server(None).await;
        let mut ws = connect(server.addr, Some(TOKEN)).await.unwrap();

        let request = Envelope::new(
            "req-1",
            Message::TransferLimitsRequest(TransferLimitsRequest {}),
        );
        ws.send(WsMessage::Binary(request.to_msgpack().unwrap()))
            .await
            .unwrap();

        let reply = next_envelope(&mut ws).await;
        assert_eq!(reply.correlation_id, "req-1");
        match reply.payload {
            Message::TransferLimitsResponse(limits) => assert_eq!(limits.max_file_size_bytes, 1234),
            other => panic!("Expected TransferLimitsResponse, got {other:?}"),
        }

        server.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_version_mismatch_reported() {
        let server = start_server(None).await;
        let mut ws = connect(server.addr, Some(TOKEN)).await.unwrap();

        let mut request = Envelope::new("old", Message::TransferLimitsRequest(TransferLimitsRequest {}));
        request.version = PROTOCOL_VERSION + 1;
        ws.send(WsMessage::Binary(request.to_msgpack().unwrap()))
            .await
            .unwrap();

        let reply = next_envelope(&mut ws).await;
        match reply.payload {
            Message::Error(err) => assert_eq!(err.code, ErrorCode::VersionMismatch),
            other => panic!("Expected Error, got {other:?}"),
        }

        server.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_daemon_call_settles_from_client_reply() {
        let server = start_server(None).await;
        let mut ws = connect(server.addr, Some(TOKEN)).await.unwrap();
        wait_for_connections(&server.connections, 1).await;

        let connection_id = server.connections.ids().remove(0);
        let connections = Arc::clone(&server.connections);
        let call = tokio::spawn(async move {
            connections
                .call(
                    &connection_id,
                    Message::Ping(Ping {
                        timestamp: 7,
                        payload: vec![],
                    }),
                )
                .await
        });

        let request = next_envelope(&mut ws).await;
        let reply = request.reply(Message::Pong(Pong {
            timestamp: 7,
            payload: vec![],
        }));
        ws.send(WsMessage::Binary(reply.to_msgpack().unwrap()))
            .await
            .unwrap();

        match call.await.unwrap() {
            Ok(Message::Pong(pong)) => assert_eq!(pong.timestamp, 7),
            other => panic!("Expected Pong, got {other:?}"),
        }
        assert_eq!(server.connections.registry().pending_count(), 0);

        server.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_disconnect_aborts_pending_calls() {
        let server = start_server(None).await;
        let mut ws = connect(server.addr, Some(TOKEN)).await.unwrap();
        wait_for_connections(&server.connections, 1).await;

        let connection_id = server.connections.ids().remove(0);
        let connections = Arc::clone(&server.connections);
        let call = tokio::spawn(async move {
            connections
                .call(
                    &connection_id,
                    Message::Ping(Ping {
                        timestamp: 1,
                        payload: vec![],
                    }),
                )
                .await
        });

        // Receive the ping but never answer it.
        let _ = next_envelope(&mut ws).await;
        ws.close(None).await.unwrap();

        match call.await.unwrap() {
            Err(ProtocolError::Remote { message, .. }) => {
                assert_eq!(message, CONNECTION_CLOSED_REASON)
            }
            other => panic!("Expected remote error, got {other:?}"),
        }
        wait_for_connections(&server.connections, 0).await;
        assert_eq!(server.connections.registry().pending_count(), 0);

        server.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_routed_requests_run_on_server_tracker() {
        let dir = TempDir::new().unwrap();
        let fs = Arc::new(SandboxedFileSystem::local(dir.path()).unwrap());
        let router = Arc::new(MessageRouter::new(
            Arc::new(FileSystemRpcHandler::new(Arc::clone(&fs))),
            Arc::new(FileTransferEndpointService::new(fs, &FileTransferOptions::default())),
        ));
        let tracker = TaskTracker::new();
        let session = ConnectionSession {
            router,
            auth: Arc::new(StaticTokenValidator::new([TOKEN])),
            connections: Arc::new(RpcConnections::new(Duration::from_millis(50))),
            keepalive_interval: None,
            cancel: CancellationToken::new(),
            tracker: tracker.clone(),
        };
        let (outbound, mut outbound_rx) = mpsc::channel(4);

        let request = Envelope::new(
            "tracked",
            Message::Ping(Ping {
                timestamp: 9,
                payload: vec![],
            }),
        );
        session.handle_frame("conn", &request.to_msgpack().unwrap(), &outbound);
        assert_eq!(tracker.len(), 1);

        tracker.close();
        tracker.wait().await;
        let reply = match outbound_rx.try_recv().unwrap() {
            WsMessage::Binary(bytes) => Envelope::from_msgpack(&bytes).unwrap(),
            other => panic!("Expected binary frame, got {other:?}"),
        };
        assert_eq!(reply.correlation_id, "tracked");
        assert!(matches!(reply.payload, Message::Pong(_)));
    }

    #[tokio::test]
    async fn test_call_unknown_connection() {
        let connections = RpcConnections::new(Duration::from_millis(50));
        let result = connections
            .call(
                "missing",
                Message::Ping(Ping {
                    timestamp: 0,
                    payload: vec![],
                }),
            )
            .await;
        assert!(matches!(result, Err(ProtocolError::ConnectionClosed(_))));
    }

    #[tokio::test]
    async fn test_unanswered_keepalive_closes_connection() {
        let server = start_server(Some(Duration::from_millis(50))).await;
        let mut ws = connect(server.addr, Some(TOKEN)).await.unwrap();
        wait_for_connections(&server.connections, 1).await;

        // Drain frames without answering until the server closes the socket.
        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(Ok(frame)) = ws.next().await {
                if matches!(frame, WsMessage::Close(_)) {
                    break;
                }
            }
        })
        .await;
        assert!(drained.is_ok());
        wait_for_connections(&server.connections, 0).await;

        server.shutdown.cancel();
    }
}
