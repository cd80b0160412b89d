//! WebSocket RPC client.
//!
//! One connection per [`RpcClient`]. Calls are tagged with correlation ids from
//! a registry scope owned by the connection; a background read pump settles
//! them as replies arrive, answers keepalive pings from the daemon, and fails
//! every pending call when the connection drops.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use protocol::messages::{
    EnumerateFilesRequest, EnumerateFilesResponse, ErrorCode, ErrorMessage, FilesExistRequest,
    Ping, Pong, RecursionMode, TransferLimits, TransferLimitsRequest,
};
use protocol::transfer::FILES_EXIST_BATCH_SIZE;
use protocol::{Envelope, Message, ProtocolError, RpcMessageRegistry, RpcScope, PROTOCOL_VERSION};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

/// Reason used to fail calls pending on a lost connection.
const CONNECTION_LOST: &str = "connection closed";

/// RPC connection to a daemon.
pub struct RpcClient {
    connection_id: String,
    scope: RpcScope,
    outbound: mpsc::Sender<WsMessage>,
    timeout: Duration,
    /// Cancelled once the read pump has stopped.
    closed: CancellationToken,
    /// Cancelled to stop the read pump.
    shutdown: CancellationToken,
}

impl RpcClient {
    /// Connect and authenticate with the configured bearer credential.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let mut request = config.rpc_url.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&config.bearer())
            .map_err(|_| ClientError::InvalidCredential)?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let connect = tokio_tungstenite::connect_async(request);
        let (ws, _) = tokio::time::timeout(config.connect_timeout, connect)
            .await
            .map_err(|_| {
                ClientError::Timeout(format!("connecting to {}", config.rpc_url))
            })?
            .map_err(|e| match e {
                WsError::Http(response) if response.status() == StatusCode::UNAUTHORIZED => {
                    ClientError::Unauthorized
                }
                other => other.into(),
            })?;

        let connection_id = Uuid::new_v4().to_string();
        let registry = RpcMessageRegistry::new();
        let scope = registry.scope(connection_id.clone());

        let (mut sink, mut frames) = ws.split();
        let (outbound, mut outbound_rx) = mpsc::channel::<WsMessage>(256);
        let closed = CancellationToken::new();
        let shutdown = CancellationToken::new();

        tokio::spawn(async move {
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

        let pump_scope = scope.clone();
        let pump_outbound = outbound.clone();
        let pump_closed = closed.clone();
        let pump_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pump_shutdown.cancelled() => {
                        let _ = pump_outbound.send(WsMessage::Close(None)).await;
                        break;
                    }
                    frame = frames.next() => match frame {
                        Some(Ok(WsMessage::Binary(bytes))) => {
                            handle_frame(&pump_scope, &pump_outbound, &bytes).await;
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(error = %e, "RPC connection error");
                            break;
                        }
                    },
                }
            }

            pump_closed.cancel();
            let aborted = pump_scope.abort_with_remote_error(CONNECTION_LOST);
            info!(connection_id = %pump_scope.id(), aborted, "RPC connection closed");
        });

        info!(connection_id = %connection_id, url = %config.rpc_url, "RPC connection established");

        Ok(Self {
            connection_id,
            scope,
            outbound,
            timeout: config.rpc_timeout,
            closed,
            shutdown,
        })
    }

    /// Identifier of this connection, also sent with uploads.
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Returns true until the connection drops or is closed.
    pub fn is_connected(&self) -> bool {
        !self.closed.is_cancelled()
    }

    /// Number of calls waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.scope.pending_count()
    }

    /// Enumerate files under `directory` matching `pattern`.
    pub async fn enumerate_files(
        &self,
        directory: &str,
        pattern: &str,
        recursion_mode: RecursionMode,
    ) -> Result<EnumerateFilesResponse> {
        let request = Message::EnumerateFilesRequest(EnumerateFilesRequest {
            directory: directory.to_string(),
            pattern: pattern.to_string(),
            recursion_mode,
        });
        match self.call(request).await? {
            Message::EnumerateFilesResponse(response) => Ok(response),
            other => Err(unexpected(&other)),
        }
    }

    /// Check which of `filenames` exist in `directory`.
    ///
    /// Names are sent in batches of [`FILES_EXIST_BATCH_SIZE`] and the answers merged.
    pub async fn files_exist(
        &self,
        directory: &str,
        filenames: &[String],
    ) -> Result<HashMap<String, bool>> {
        let mut exists = HashMap::with_capacity(filenames.len());
        for batch in filenames.chunks(FILES_EXIST_BATCH_SIZE) {
            let request = Message::FilesExistRequest(FilesExistRequest {
                directory: directory.to_string(),
                filenames: batch.to_vec(),
            });
            match self.call(request).await? {
                Message::FilesExistResponse(response) => exists.extend(response.exists),
                other => return Err(unexpected(&other)),
            }
        }
        Ok(exists)
    }

    /// Ask the daemon for its upload limits.
    pub async fn transfer_limits(&self) -> Result<TransferLimits> {
        match self
            .call(Message::TransferLimitsRequest(TransferLimitsRequest {}))
            .await?
        {
            Message::TransferLimitsResponse(limits) => Ok(limits),
            other => Err(unexpected(&other)),
        }
    }

    /// Round-trip a ping, returning the latency.
    pub async fn ping(&self) -> Result<Duration> {
        let started = Instant::now();
        let timestamp = unix_millis();
        match self
            .call(Message::Ping(Ping {
                timestamp,
                payload: Vec::new(),
            }))
            .await?
        {
            Message::Pong(pong) if pong.timestamp == timestamp => Ok(started.elapsed()),
            other => Err(unexpected(&other)),
        }
    }

    /// Close the connection. Pending calls fail with [`ClientError::ConnectionClosed`].
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.closed.cancelled().await;
    }

    async fn call(&self, message: Message) -> Result<Message> {
        if !self.is_connected() {
            return Err(ClientError::ConnectionClosed(CONNECTION_LOST.to_string()));
        }

        let pending = self.scope.register();
        // The pump may have stopped between the check above and registering.
        if !self.is_connected() {
            return Err(ClientError::ConnectionClosed(CONNECTION_LOST.to_string()));
        }

        let bytes = Envelope::new(pending.correlation_id(), message)
            .to_msgpack()
            .map_err(ProtocolError::from)?;
        self.outbound
            .send(WsMessage::Binary(bytes))
            .await
            .map_err(|_| ClientError::ConnectionClosed(CONNECTION_LOST.to_string()))?;

        match pending.wait_timeout(self.timeout).await {
            Ok(reply) => match reply.payload {
                Message::Error(err) => Err(ClientError::Remote {
                    code: err.code,
                    message: err.message,
                }),
                payload => Ok(payload),
            },
            Err(ProtocolError::Remote { message, .. }) if !self.is_connected() => {
                Err(ClientError::ConnectionClosed(message))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Dispatch one inbound frame: settle replies, answer daemon requests.
async fn handle_frame(scope: &RpcScope, outbound: &mpsc::Sender<WsMessage>, bytes: &[u8]) {
    let envelope = match Envelope::from_msgpack(bytes) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "Dropping undecodable RPC frame");
            return;
        }
    };

    if envelope.payload.is_response() {
        if let Ok(false) = scope.registry().set_response(envelope) {
            debug!("Reply for unknown or expired call");
        }
        return;
    }

    let payload = match &envelope.payload {
        Message::Ping(ping) => Message::Pong(Pong {
            timestamp: ping.timestamp,
            payload: ping.payload.clone(),
        }),
        other => {
            debug!(request = ?other, "Unsupported request from daemon");
            Message::Error(ErrorMessage {
                code: if envelope.version == PROTOCOL_VERSION {
                    ErrorCode::InvalidRequest
                } else {
                    ErrorCode::VersionMismatch
                },
                message: "request not supported by client".to_string(),
                context: None,
                recoverable: false,
            })
        }
    };

    match envelope.reply(payload).to_msgpack() {
        Ok(reply) => {
            let _ = outbound.send(WsMessage::Binary(reply)).await;
        }
        Err(e) => warn!(error = %e, "Failed to encode reply"),
    }
}

fn unexpected(message: &Message) -> ClientError {
    ClientError::UnexpectedResponse(format!("{message:?}"))
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
