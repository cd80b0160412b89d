//! Maximum file size enforcement.

use super::error::TransferError;

/// Enforces one byte limit on declared lengths and on streamed byte counts.
#[derive(Debug, Clone, Copy)]
pub struct FileSizeValidator {
    max_file_size_bytes: i64,
}

impl FileSizeValidator {
    /// Create a validator with the given limit in bytes.
    pub fn new(max_file_size_bytes: i64) -> Self {
        Self { max_file_size_bytes }
    }

    /// The configured limit.
    pub fn limit(&self) -> i64 {
        self.max_file_size_bytes
    }

    /// Check a declared content length. Unknown lengths pass; the streaming
    /// check catches them later.
    pub fn validate_content_length(&self, declared: Option<i64>) -> Result<(), TransferError> {
        match declared {
            None => Ok(()),
            Some(len) if len < 0 => Err(TransferError::InvalidArgument(format!(
                "content length must not be negative, got {len}"
            ))),
            Some(len) => self.check(len),
        }
    }

    /// Check the cumulative number of bytes received so far.
    pub fn validate_streaming_bytes(&self, bytes_so_far: i64) -> Result<(), TransferError> {
        self.check(bytes_so_far)
    }

    fn check(&self, size: i64) -> Result<(), TransferError> {
        if size > self.max_file_size_bytes {
            return Err(TransferError::SizeLimitExceeded {
                size,
                limit: self.max_file_size_bytes,
            });
        }
        Ok(())
    }
}
