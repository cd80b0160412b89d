//! Error taxonomy for sandboxed file operations and transfers.

use std::io;

use thiserror::Error;

/// Errors that can occur while validating, reading or writing files.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The caller supplied an empty or malformed argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The path resolves outside the storage root.
    #[error("path traversal denied: '{path}' resolves outside the storage root")]
    PathTraversal { path: String },

    /// The file extension is not on the allow-list.
    #[error("extension '{extension}' is not allowed")]
    ExtensionNotAllowed { extension: String },

    /// The declared or streamed size is above the configured maximum.
    #[error("file size {size} bytes exceeds the limit of {limit} bytes")]
    SizeLimitExceeded { size: i64, limit: i64 },

    /// The stored bytes do not hash to the expected checksum.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// The expected checksum is not a 64 character hex string.
    #[error("invalid checksum '{0}': expected 64 hex characters")]
    InvalidChecksum(String),

    /// The file or directory does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The transfer was cancelled before it completed.
    #[error("transfer cancelled")]
    Cancelled,

    /// The bearer credential is missing or invalid.
    #[error("unauthorized")]
    Unauthorized,

    /// Disk or network failure.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl TransferError {
    /// Returns true for failures that indicate a hostile or misbehaving caller.
    pub fn is_security_event(&self) -> bool {
        matches!(
            self,
            TransferError::PathTraversal { .. }
                | TransferError::ExtensionNotAllowed { .. }
                | TransferError::SizeLimitExceeded { .. }
                | TransferError::ChecksumMismatch { .. }
        )
    }

    /// Maps an I/O error on `path` to `NotFound` when the file is missing.
    pub(crate) fn from_io(path: &std::path::Path, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            TransferError::NotFound(path.display().to_string())
        } else {
            TransferError::Io(err)
        }
    }

    /// Names `requested` instead of the resolved server path.
    ///
    /// Errors that leave the daemon go through this; the resolved form is for logs.
    pub(crate) fn for_caller(self, requested: &str) -> Self {
        match self {
            TransferError::NotFound(_) => TransferError::NotFound(requested.to_string()),
            TransferError::PathTraversal { .. } => TransferError::PathTraversal {
                path: requested.to_string(),
            },
            other => other,
        }
    }
}
