//! Wire contract for the HTTP file transfer channel.
//!
//! File bytes do not travel over the RPC channel. Uploads and downloads use
//! plain HTTP requests whose paths, query parameters and headers are defined
//! here so that the daemon and clients agree on them.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Upload endpoint path.
pub const UPLOAD_PATH: &str = "/api/files/upload";

/// Download endpoint path.
pub const DOWNLOAD_PATH: &str = "/api/files/download";

/// Header carrying the SHA-256 checksum of the file bytes (64 hex characters).
pub const CHECKSUM_HEADER: &str = "X-File-Checksum";

/// Query parameter naming the target path relative to the storage root.
pub const PARAM_FILE_PATH: &str = "filePath";

/// Query parameter identifying the client connection.
pub const PARAM_CONNECTION_ID: &str = "connectionId";

/// Query parameter identifying the transfer within the connection.
pub const PARAM_CORRELATION_ID: &str = "correlationId";

/// Query parameter requesting that an existing target be left untouched.
pub const PARAM_SKIP_EXISTING: &str = "skipExisting";

/// Chunk size used when streaming file bytes (80KB).
pub const TRANSFER_CHUNK_SIZE: usize = 80 * 1024;

/// Maximum number of file names sent in one existence check.
pub const FILES_EXIST_BATCH_SIZE: usize = 100;

/// Length of a hex-encoded SHA-256 checksum.
pub const CHECKSUM_HEX_LEN: usize = 64;

/// Outcome of an upload attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// The file was written and verified.
    Uploaded,
    /// The file was left untouched.
    Skipped,
    /// The upload failed and nothing was stored.
    Error,
}

/// Result body returned by the upload endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    /// Upload outcome.
    pub status: UploadStatus,
    /// Why the file was skipped or the upload failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Number of bytes stored, for successful uploads only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_written: Option<i64>,
}

impl UploadResult {
    /// A successful upload of `bytes_written` bytes.
    pub fn uploaded(bytes_written: i64) -> Self {
        Self {
            status: UploadStatus::Uploaded,
            reason: None,
            bytes_written: Some(bytes_written),
        }
    }

    /// An upload that was deliberately not performed.
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: UploadStatus::Skipped,
            reason: Some(reason.into()),
            bytes_written: None,
        }
    }

    /// A failed upload.
    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            status: UploadStatus::Error,
            reason: Some(reason.into()),
            bytes_written: None,
        }
    }
}

/// Returns true if `value` looks like a hex-encoded SHA-256 checksum.
pub fn is_valid_checksum(value: &str) -> bool {
    value.len() == CHECKSUM_HEX_LEN && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Compares two hex checksums, ignoring case.
pub fn checksums_match(expected: &str, actual: &str) -> bool {
    expected.eq_ignore_ascii_case(actual)
}

/// Finalizes a hasher into a lowercase hex checksum.
pub fn finalize_hex(hasher: Sha256) -> String {
    hex::encode(hasher.finalize())
}

/// Computes the lowercase hex SHA-256 checksum of an in-memory buffer.
pub fn checksum_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    finalize_hex(hasher)
}

/// Hashes everything `reader` yields, returning the checksum and byte count.
pub async fn hash_reader<R>(reader: &mut R) -> std::io::Result<(String, u64)>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; TRANSFER_CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        total += read as u64;
    }
    Ok((finalize_hex(hasher), total))
}
