//! Message router for dispatching incoming RPC requests to their handlers.
//!
//! This module provides the `MessageRouter` struct that receives protocol
//! messages from a client connection and routes them to the file handler or
//! the transfer service based on message type. Responses arriving from the
//! client are not routed here; the connection settles them through the
//! correlation registry.

use std::sync::Arc;

use protocol::messages::{
    EnumerateFilesRequest, ErrorCode, ErrorMessage, FilesExistRequest, Message, Ping, Pong,
};
use tracing::{debug, warn};

use crate::files::{FileSystemRpcHandler, FileTransferEndpointService, TransferError};

/// Result type for router operations.
pub type RouterResult = Result<Option<Message>, RouterError>;

/// Errors that can occur during message routing.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// File operation error.
    #[error("file error: {0}")]
    File(#[from] TransferError),

    /// Invalid request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RouterError {
    /// Convert the error to a protocol ErrorMessage.
    pub fn to_error_message(&self, context: Option<String>) -> ErrorMessage {
        let (code, recoverable) = match self {
            RouterError::File(e) => match e {
                TransferError::PathTraversal { .. }
                | TransferError::ExtensionNotAllowed { .. } => (ErrorCode::PermissionDenied, false),
                TransferError::NotFound(_) => (ErrorCode::NotFound, false),
                TransferError::InvalidArgument(_)
                | TransferError::InvalidChecksum(_)
                | TransferError::SizeLimitExceeded { .. }
                | TransferError::ChecksumMismatch { .. } => (ErrorCode::InvalidRequest, false),
                TransferError::Unauthorized => (ErrorCode::Unauthorized, false),
                TransferError::Cancelled | TransferError::Io(_) => (ErrorCode::InternalError, true),
            },
            RouterError::InvalidRequest(_) => (ErrorCode::InvalidRequest, false),
            RouterError::Internal(_) => (ErrorCode::InternalError, true),
        };

        ErrorMessage {
            code,
            message: self.to_string(),
            context,
            recoverable,
        }
    }
}

/// Message router that dispatches requests to the file handlers.
///
/// One router is shared by every connection; it holds no per-connection state.
pub struct MessageRouter {
    /// Enumeration and existence checks.
    files: Arc<FileSystemRpcHandler>,
    /// Source of the advertised transfer limits.
    transfer: Arc<FileTransferEndpointService>,
}

impl MessageRouter {
    /// Create a new message router with the given handlers.
    pub fn new(files: Arc<FileSystemRpcHandler>, transfer: Arc<FileTransferEndpointService>) -> Self {
        Self { files, transfer }
    }

    /// Route one request. `Ok(None)` means nothing is sent back.
    pub async fn route(&self, message: Message) -> RouterResult {
        debug!(?message, "Routing message");

        match message {
            Message::EnumerateFilesRequest(req) => self.handle_enumerate(req).await,
            Message::FilesExistRequest(req) => self.handle_files_exist(req).await,
            Message::TransferLimitsRequest(_) => Ok(Some(Message::TransferLimitsResponse(
                self.transfer.limits(),
            ))),
            Message::EnumerateFilesResponse(_)
            | Message::FilesExistResponse(_)
            | Message::TransferLimitsResponse(_) => {
                // These are response messages, not requests - ignore them
                debug!("Ignoring response message received as request");
                Ok(None)
            }

            // Control messages
            Message::Ping(ping) => self.handle_ping(ping).await,
            Message::Pong(_) => {
                debug!("Received pong");
                Ok(None)
            }
            Message::Error(err) => {
                warn!(?err, "Received error from peer");
                Ok(None)
            }
        }
    }

    // =========================================================================
    // File Handlers
    // =========================================================================

    async fn handle_enumerate(&self, req: EnumerateFilesRequest) -> RouterResult {
        let files = Arc::clone(&self.files);
        let response = tokio::task::spawn_blocking(move || files.enumerate_files(&req))
            .await
            .map_err(|e| RouterError::Internal(format!("enumeration task failed: {e}")))?;

        Ok(Some(Message::EnumerateFilesResponse(response)))
    }

    async fn handle_files_exist(&self, req: FilesExistRequest) -> RouterResult {
        let files = Arc::clone(&self.files);
        let response = tokio::task::spawn_blocking(move || files.files_exist(&req))
            .await
            .map_err(|e| RouterError::Internal(format!("existence check task failed: {e}")))??;

        Ok(Some(Message::FilesExistResponse(response)))
    }

    // =========================================================================
    // Control Handlers
    // =========================================================================

    async fn handle_ping(&self, ping: Ping) -> RouterResult {
        debug!(timestamp = ping.timestamp, "Received ping");

        Ok(Some(Message::Pong(Pong {
            timestamp: ping.timestamp,
            payload: ping.payload,
        })))
    }
}
