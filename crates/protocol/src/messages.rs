//! Protocol message definitions for RemoCLI.
//!
//! This module defines all RPC message types exchanged between the daemon and
//! clients over the duplex RPC channel. All messages are serialized using
//! MessagePack and wrapped in an [`Envelope`] carrying the correlation id that
//! routes a response back to its waiting caller.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Envelope wrapper for all protocol messages.
///
/// Requests carry a freshly allocated correlation id; replies reuse the id of
/// the request they answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version for compatibility checking.
    pub version: u8,
    /// Correlation id pairing a request with its response.
    pub correlation_id: String,
    /// The actual message payload.
    pub payload: Message,
}

impl Envelope {
    /// Create a new envelope with the current protocol version.
    pub fn new(correlation_id: impl Into<String>, payload: Message) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            correlation_id: correlation_id.into(),
            payload,
        }
    }

    /// Create a reply envelope that reuses this envelope's correlation id.
    pub fn reply(&self, payload: Message) -> Self {
        Self::new(self.correlation_id.clone(), payload)
    }
}

/// Top-level message enum containing all message types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Message {
    // File system messages
    /// Request to enumerate files matching a glob pattern.
    EnumerateFilesRequest(EnumerateFilesRequest),
    /// Response with the matching files.
    EnumerateFilesResponse(EnumerateFilesResponse),
    /// Request to check which files exist in a directory.
    FilesExistRequest(FilesExistRequest),
    /// Response with the existence map.
    FilesExistResponse(FilesExistResponse),
    /// Request for the daemon's transfer limits.
    TransferLimitsRequest(TransferLimitsRequest),
    /// Response with the daemon's transfer limits.
    TransferLimitsResponse(TransferLimits),

    // Control messages
    /// Ping for keepalive.
    Ping(Ping),
    /// Pong response to ping.
    Pong(Pong),
    /// Error message.
    Error(ErrorMessage),
}

impl Message {
    /// Returns true if this message answers a request rather than initiating one.
    ///
    /// Responses are settled through the correlation registry instead of being
    /// dispatched to a handler.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Message::EnumerateFilesResponse(_)
                | Message::FilesExistResponse(_)
                | Message::TransferLimitsResponse(_)
                | Message::Pong(_)
                | Message::Error(_)
        )
    }
}

// ============================================================================
// File System Messages
// ============================================================================

/// How deep an enumeration descends below the requested directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RecursionMode {
    /// Only the requested directory itself.
    #[default]
    TopDirectoryOnly,
    /// The requested directory and every subdirectory.
    AllDirectories,
}

/// Request to enumerate files under a directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumerateFilesRequest {
    /// Directory relative to the storage root.
    pub directory: String,
    /// Glob pattern (`*`, `?`, `**`). Empty means every file.
    pub pattern: String,
    /// Whether to descend into subdirectories.
    #[serde(default)]
    pub recursion_mode: RecursionMode,
}

/// Response to an enumeration request.
///
/// `files` is always present; it is empty when nothing matches or an error occurred.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EnumerateFilesResponse {
    /// Matching files.
    pub files: Vec<FileInfoEntry>,
    /// Error description if the enumeration failed.
    pub error: Option<String>,
}

/// Metadata for a single enumerated file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfoEntry {
    /// Path relative to the enumerated directory, using `/` separators.
    pub path: String,
    /// File size in bytes.
    pub size: u64,
    /// Creation time (Unix timestamp in seconds), if the platform reports it.
    pub created: Option<u64>,
    /// Last modification time (Unix timestamp in seconds).
    pub modified: Option<u64>,
}

/// Request to check which of the given files exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesExistRequest {
    /// Directory relative to the storage root.
    pub directory: String,
    /// File names to check, relative to `directory`.
    pub filenames: Vec<String>,
}

/// Response mapping each requested file name to whether it exists.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FilesExistResponse {
    /// File name to presence.
    pub exists: HashMap<String, bool>,
}

/// Request for the daemon's transfer limits.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransferLimitsRequest {}

/// Transfer limits advertised by the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLimits {
    /// Maximum accepted upload size in bytes.
    pub max_file_size_bytes: i64,
    /// Accepted extensions, or `None` if every extension is accepted.
    pub allowed_extensions: Option<Vec<String>>,
}

// ============================================================================
// Control Messages
// ============================================================================

/// Ping for keepalive and latency measurement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    /// Timestamp when ping was sent (for latency calculation).
    pub timestamp: u64,
    /// Optional payload for echo.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

/// Pong response to ping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    /// Original timestamp from ping.
    pub timestamp: u64,
    /// Echo of the original payload.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

/// Error message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Error code for programmatic handling.
    pub code: ErrorCode,
    /// Human-readable error message.
    pub message: String,
    /// Optional context (e.g., directory, path).
    pub context: Option<String>,
    /// Whether the error is recoverable.
    pub recoverable: bool,
}

/// Error codes for common error conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Unknown or unspecified error.
    Unknown,
    /// Authentication or authorization failure.
    Unauthorized,
    /// Resource not found.
    NotFound,
    /// Invalid request or parameters.
    InvalidRequest,
    /// Server-side error.
    InternalError,
    /// Request timed out.
    Timeout,
    /// Insufficient permissions, including sandbox escapes.
    PermissionDenied,
    /// Protocol version mismatch.
    VersionMismatch,
}

// ============================================================================
// Serialization helpers
// ============================================================================

impl Envelope {
    /// Serialize the envelope to MessagePack bytes.
    pub fn to_msgpack(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }

    /// Deserialize an envelope from MessagePack bytes.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}
