//! Streaming uploads and downloads against the sandboxed storage root.
//!
//! Uploads are written to a hidden temp file next to the target, hashed and
//! size-checked while streaming, and renamed over the target only after every
//! check passes. A failed, rejected or cancelled upload never leaves a partial
//! file at the target path.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use protocol::messages::TransferLimits;
use protocol::transfer::{
    checksums_match, finalize_hex, hash_reader, is_valid_checksum, TRANSFER_CHUNK_SIZE,
};
use protocol::UploadResult;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::TransferError;
use super::extension_validator::ExtensionValidator;
use super::sandbox::{FileSystem, SandboxedFileSystem};
use super::size_validator::FileSizeValidator;
use crate::config::FileTransferOptions;

/// Reason reported when `skip_existing` leaves a file untouched.
pub const SKIPPED_EXISTING_REASON: &str = "file already exists";

const PARTIAL_SUFFIX: &str = ".partial";

/// Returns true for the hidden temp files of uploads still in flight.
pub(crate) fn is_partial_upload(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(PARTIAL_SUFFIX)
}

/// Parameters of a single upload.
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    /// Target path relative to the storage root.
    pub file_path: String,
    /// Client connection the upload belongs to, for logging.
    pub connection_id: Option<String>,
    /// Client-side transfer id, for logging.
    pub correlation_id: Option<String>,
    /// Declared body length, if known.
    pub content_length: Option<i64>,
    /// Expected SHA-256 of the body as 64 hex characters.
    pub expected_checksum: Option<String>,
    /// Leave an existing target untouched and report it as skipped.
    pub skip_existing: bool,
}

impl UploadRequest {
    pub fn new(file_path: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            ..Default::default()
        }
    }

    pub fn with_content_length(mut self, length: i64) -> Self {
        self.content_length = Some(length);
        self
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.expected_checksum = Some(checksum.into());
        self
    }

    pub fn with_skip_existing(mut self, skip: bool) -> Self {
        self.skip_existing = skip;
        self
    }

    pub fn with_connection(
        mut self,
        connection_id: Option<String>,
        correlation_id: Option<String>,
    ) -> Self {
        self.connection_id = connection_id;
        self.correlation_id = correlation_id;
        self
    }
}

/// An opened download, positioned at the start of the file.
#[derive(Debug)]
pub struct DownloadHandle {
    /// The file, ready to stream.
    pub file: File,
    /// File length in bytes.
    pub length: u64,
    /// Lowercase hex SHA-256 of the file contents.
    pub checksum: String,
}

/// Upload and download operations behind the HTTP transfer endpoints.
pub struct FileTransferEndpointService {
    fs: Arc<SandboxedFileSystem>,
    extensions: ExtensionValidator,
    sizes: FileSizeValidator,
}

impl FileTransferEndpointService {
    /// Create a service over the shared sandbox with the configured limits.
    pub fn new(fs: Arc<SandboxedFileSystem>, options: &FileTransferOptions) -> Self {
        Self {
            fs,
            extensions: ExtensionValidator::new(options.allowed_extensions.as_deref()),
            sizes: FileSizeValidator::new(options.max_file_size_bytes),
        }
    }

    /// The sandbox all operations go through.
    pub fn filesystem(&self) -> &Arc<SandboxedFileSystem> {
        &self.fs
    }

    /// Limits advertised to clients.
    pub fn limits(&self) -> TransferLimits {
        TransferLimits {
            max_file_size_bytes: self.sizes.limit(),
            allowed_extensions: self.extensions.allowed().map(|list| list.to_vec()),
        }
    }

    /// Stream `body` into the file named by `request`.
    ///
    /// Returns `skipped` when `skip_existing` is set and the target exists.
    /// Any error leaves the target untouched and removes the temp file.
    /// Errors name `request.file_path`, never the resolved server path.
    pub async fn upload<R>(
        &self,
        request: &UploadRequest,
        body: R,
        cancel: &CancellationToken,
    ) -> Result<UploadResult, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        let result = self.try_upload(request, body, cancel).await;
        match &result {
            Ok(outcome) => {
                info!(
                    path = %request.file_path,
                    connection_id = ?request.connection_id,
                    correlation_id = ?request.correlation_id,
                    status = ?outcome.status,
                    bytes = ?outcome.bytes_written,
                    "Upload finished"
                );
            }
            Err(e) if e.is_security_event() => {
                warn!(
                    path = %request.file_path,
                    connection_id = ?request.connection_id,
                    correlation_id = ?request.correlation_id,
                    error = %e,
                    "Upload rejected"
                );
            }
            Err(e) => {
                debug!(
                    path = %request.file_path,
                    correlation_id = ?request.correlation_id,
                    error = %e,
                    "Upload failed"
                );
            }
        }
        result.map_err(|e| e.for_caller(&request.file_path))
    }

    async fn try_upload<R>(
        &self,
        request: &UploadRequest,
        body: R,
        cancel: &CancellationToken,
    ) -> Result<UploadResult, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        let requested = request.file_path.clone();
        let target = self.blocking(move |fs| fs.resolve(&requested)).await?;
        let file_name = target
            .file_name()
            .and_then(|name| name.to_str())
            .filter(|_| target != self.fs.root())
            .ok_or_else(|| {
                TransferError::InvalidArgument(format!(
                    "upload target must name a file: {}",
                    request.file_path
                ))
            })?
            .to_string();

        self.extensions.validate_extension(&file_name)?;
        self.sizes.validate_content_length(request.content_length)?;

        if let Some(expected) = &request.expected_checksum {
            if !is_valid_checksum(expected) {
                return Err(TransferError::InvalidChecksum(expected.clone()));
            }
        }

        let temp_path = target.with_file_name(format!(
            ".{}.{}{}",
            file_name,
            Uuid::new_v4().simple(),
            PARTIAL_SUFFIX
        ));
        let prepared = {
            let target = target.clone();
            let temp_path = temp_path.clone();
            let file_path = request.file_path.clone();
            let skip_existing = request.skip_existing;
            self.blocking(move |fs| {
                if fs.directory_exists(&target)? {
                    return Err(TransferError::InvalidArgument(format!(
                        "upload target is a directory: {file_path}"
                    )));
                }

                // Last writer wins when two uploads race past this check.
                if skip_existing && fs.file_exists(&target)? {
                    return Ok(None);
                }

                let parent = target.parent().unwrap_or_else(|| fs.root());
                fs.create_directory(parent)?;
                fs.create_write(&temp_path).map(Some)
            })
            .await?
        };
        let Some(file) = prepared else {
            return Ok(UploadResult::skipped(SKIPPED_EXISTING_REASON));
        };

        let partial = PartialUpload::new(Arc::clone(&self.fs), temp_path);
        let written = match self
            .stream_to_file(File::from_std(file), body, request, cancel)
            .await
        {
            Ok(written) => written,
            Err(e) => {
                partial.discard().await;
                return Err(e);
            }
        };

        partial.commit(&target).await?;
        Ok(UploadResult::uploaded(written))
    }

    async fn stream_to_file<R>(
        &self,
        mut file: File,
        mut body: R,
        request: &UploadRequest,
        cancel: &CancellationToken,
    ) -> Result<i64, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; TRANSFER_CHUNK_SIZE];
        let mut total: i64 = 0;

        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                read = body.read(&mut buffer) => read?,
            };
            if read == 0 {
                break;
            }

            total = total.saturating_add(read as i64);
            self.sizes.validate_streaming_bytes(total)?;

            hasher.update(&buffer[..read]);
            file.write_all(&buffer[..read]).await?;
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Some(declared) = request.content_length {
            if declared != total {
                return Err(TransferError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("body ended after {total} of {declared} bytes"),
                )));
            }
        }

        let actual = finalize_hex(hasher);
        if let Some(expected) = &request.expected_checksum {
            if !checksums_match(expected, &actual) {
                return Err(TransferError::ChecksumMismatch {
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        Ok(total)
    }

    /// Open `file_path` for download and compute its checksum.
    pub async fn open_download(&self, file_path: &str) -> Result<DownloadHandle, TransferError> {
        let requested = file_path.to_string();
        let opened = self
            .blocking(move |fs| {
                let target = fs.resolve(&requested)?;
                if !fs.file_exists(&target)? {
                    return Ok(None);
                }
                fs.open_read(&target).map(Some)
            })
            .await
            .map_err(|e| {
                if e.is_security_event() {
                    warn!(path = %file_path, error = %e, "Download rejected");
                }
                e.for_caller(file_path)
            })?;

        let Some(file) = opened else {
            debug!(path = %file_path, "Download target missing or not a file");
            return Err(TransferError::NotFound(file_path.to_string()));
        };

        let mut file = File::from_std(file);
        let (checksum, length) = hash_reader(&mut file).await?;
        file.seek(SeekFrom::Start(0)).await?;

        debug!(path = %file_path, length, "Download opened");
        Ok(DownloadHandle {
            file,
            length,
            checksum,
        })
    }

    /// Run synchronous sandbox work on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> Result<T, TransferError>
    where
        F: FnOnce(&SandboxedFileSystem) -> Result<T, TransferError> + Send + 'static,
        T: Send + 'static,
    {
        let fs = Arc::clone(&self.fs);
        tokio::task::spawn_blocking(move || op(&fs))
            .await
            .map_err(|e| TransferError::Io(std::io::Error::other(e)))?
    }
}

/// The hidden temp file of an upload in flight.
///
/// Removed on `discard`, renamed over the target on `commit`, and removed in
/// the background if the upload future is dropped before either.
struct PartialUpload {
    fs: Arc<SandboxedFileSystem>,
    path: Option<PathBuf>,
}

impl PartialUpload {
    fn new(fs: Arc<SandboxedFileSystem>, path: PathBuf) -> Self {
        Self {
            fs,
            path: Some(path),
        }
    }

    async fn commit(mut self, target: &Path) -> Result<(), TransferError> {
        let Some(path) = self.path.take() else {
            return Ok(());
        };
        let fs = Arc::clone(&self.fs);
        let target = target.to_path_buf();
        let result = tokio::task::spawn_blocking(move || {
            let moved = fs.move_file(&path, &target);
            if moved.is_err() {
                remove_partial(&fs, &path);
            }
            moved
        })
        .await;
        match result {
            Ok(moved) => moved,
            Err(e) => Err(TransferError::Io(std::io::Error::other(e))),
        }
    }

    async fn discard(mut self) {
        let Some(path) = self.path.take() else {
            return;
        };
        let fs = Arc::clone(&self.fs);
        if let Err(e) = tokio::task::spawn_blocking(move || remove_partial(&fs, &path)).await {
            warn!(error = %e, "Temp file cleanup task failed");
        }
    }
}

impl Drop for PartialUpload {
    fn drop(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };
        debug!(path = ?path, "Upload dropped mid-body, removing temp file");
        let fs = Arc::clone(&self.fs);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || remove_partial(&fs, &path));
            }
            Err(_) => remove_partial(&fs, &path),
        }
    }
}

fn remove_partial(fs: &SandboxedFileSystem, path: &Path) {
    match fs.delete_file(path) {
        Ok(()) | Err(TransferError::NotFound(_)) => {}
        Err(e) => {
            warn!(path = ?path, error = %e, "Failed to cleanup temp file after upload failure");
        }
    }
}
