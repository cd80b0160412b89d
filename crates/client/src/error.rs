//! Error types for the client crate.

use protocol::messages::ErrorCode;
use protocol::ProtocolError;
use thiserror::Error;

/// Errors returned by [`RpcClient`](crate::RpcClient) and
/// [`FileTransferService`](crate::FileTransferService).
#[derive(Debug, Error)]
pub enum ClientError {
    /// A local or remote file does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The daemon rejected the credential.
    #[error("unauthorized: the daemon rejected the credential")]
    Unauthorized,

    /// The daemon refused the path or extension.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The file is larger than the daemon accepts.
    #[error("size limit exceeded: {0}")]
    SizeLimitExceeded(String),

    /// The daemon rejected the request as malformed.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Downloaded bytes did not hash to the advertised checksum.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Checksum advertised by the daemon.
        expected: String,
        /// Checksum of the bytes received.
        actual: String,
    },

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// The RPC connection is gone.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// No reply arrived in time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The daemon answered with an error message.
    #[error("daemon error ({code:?}): {message}")]
    Remote {
        /// Error code reported by the daemon.
        code: ErrorCode,
        /// Error description reported by the daemon.
        message: String,
    },

    /// Protocol-level failure.
    #[error("protocol error: {0}")]
    Protocol(ProtocolError),

    /// HTTP transport failure, including a dropped connection mid-transfer.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket transport failure.
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    /// Local I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A configured URL is unusable.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// The credential cannot be sent as a header value.
    #[error("invalid credential")]
    InvalidCredential,

    /// The daemon answered with something this client does not understand.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Timeout(msg) => ClientError::Timeout(msg),
            ProtocolError::ConnectionClosed(msg) => ClientError::ConnectionClosed(msg),
            other => ClientError::Protocol(other),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::WebSocket(Box::new(err))
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
