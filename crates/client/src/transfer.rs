//! Client side of the HTTP file transfer channel.
//!
//! Files are never buffered whole: uploads hash the file in a first pass and
//! then stream it as the request body, downloads hash while writing to disk.
//! The credential travels in the `Authorization` header only.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use protocol::transfer::{
    checksums_match, finalize_hex, hash_reader, is_valid_checksum, CHECKSUM_HEADER,
    DOWNLOAD_PATH, PARAM_CONNECTION_ID, PARAM_CORRELATION_ID, PARAM_FILE_PATH,
    PARAM_SKIP_EXISTING, TRANSFER_CHUNK_SIZE, UPLOAD_PATH,
};
use protocol::UploadResult;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_LENGTH};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::rpc::RpcClient;

/// Reason reported for files skipped because they already exist remotely.
pub const ALREADY_EXISTS_REASON: &str = "file already exists";

/// Called with the cumulative number of bytes transferred.
pub type ProgressCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Per-upload settings.
#[derive(Clone, Default)]
pub struct UploadOptions {
    /// Leave files that already exist on the daemon untouched.
    pub skip_existing: bool,
    /// Skip files larger than this without contacting the daemon.
    pub max_file_size: Option<u64>,
    /// RPC connection the upload belongs to, for daemon-side logs.
    pub connection_id: Option<String>,
    /// Progress reporting.
    pub progress: Option<ProgressCallback>,
}

impl UploadOptions {
    /// Set the skip-existing flag.
    pub fn with_skip_existing(mut self, skip_existing: bool) -> Self {
        self.skip_existing = skip_existing;
        self
    }

    /// Set a local size limit.
    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = Some(max_file_size);
        self
    }

    /// Tag uploads with an RPC connection id.
    pub fn with_connection_id(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    /// Report progress through `callback`.
    pub fn with_progress(mut self, callback: impl Fn(u64) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for UploadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadOptions")
            .field("skip_existing", &self.skip_existing)
            .field("max_file_size", &self.max_file_size)
            .field("connection_id", &self.connection_id)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// One file in a batch upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadItem {
    /// File on the local disk.
    pub local_path: PathBuf,
    /// Target path relative to the daemon's storage root.
    pub remote_path: String,
}

impl UploadItem {
    /// Upload `local_path` to `remote_path`.
    pub fn new(local_path: impl Into<PathBuf>, remote_path: impl Into<String>) -> Self {
        Self {
            local_path: local_path.into(),
            remote_path: remote_path.into(),
        }
    }
}

/// Result for one file of a batch.
#[derive(Debug)]
pub struct BatchUploadOutcome {
    /// Target path as given in the [`UploadItem`].
    pub remote_path: String,
    /// What happened to it.
    pub result: Result<UploadResult>,
}

/// A completed, verified download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadResult {
    /// Bytes written to disk.
    pub bytes_written: u64,
    /// Verified SHA-256 of the file.
    pub checksum: String,
}

/// Uploads and downloads against a daemon's transfer endpoints.
#[derive(Debug, Clone)]
pub struct FileTransferService {
    http: reqwest::Client,
    upload_url: Url,
    download_url: Url,
}

impl FileTransferService {
    /// Build an HTTP client carrying the configured credential on every request.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let mut bearer =
            HeaderValue::from_str(&config.bearer()).map_err(|_| ClientError::InvalidCredential)?;
        bearer.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, bearer);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(Self {
            http,
            upload_url: endpoint(&config.transfer_url, UPLOAD_PATH)?,
            download_url: endpoint(&config.transfer_url, DOWNLOAD_PATH)?,
        })
    }

    /// Upload one file to `remote_path`.
    ///
    /// Returns the daemon's [`UploadResult`] for uploaded, skipped and failed
    /// uploads it accepted for processing. Rejections map to
    /// [`ClientError::Unauthorized`], [`ClientError::Forbidden`],
    /// [`ClientError::SizeLimitExceeded`] and [`ClientError::BadRequest`].
    pub async fn upload_file(
        &self,
        local_path: &Path,
        remote_path: &str,
        options: &UploadOptions,
        cancel: &CancellationToken,
    ) -> Result<UploadResult> {
        let length = local_file_len(local_path).await?;

        if let Some(max) = options.max_file_size {
            if length > max {
                info!(path = %local_path.display(), length, max, "Skipping file over the size limit");
                return Ok(UploadResult::skipped(format!(
                    "file size {length} bytes exceeds the limit of {max} bytes"
                )));
            }
        }

        let checksum = with_cancel(cancel, async {
            let mut file = File::open(local_path).await?;
            let (checksum, _) = hash_reader(&mut file).await?;
            Ok(checksum)
        })
        .await?;

        let file = File::open(local_path).await?;
        let progress = options.progress.clone();
        let mut sent = 0u64;
        let body = ReaderStream::with_capacity(file, TRANSFER_CHUNK_SIZE).map(move |chunk| {
            if let Ok(bytes) = &chunk {
                sent += bytes.len() as u64;
                if let Some(progress) = &progress {
                    progress(sent);
                }
            }
            chunk
        });

        let mut query = vec![
            (PARAM_FILE_PATH, remote_path.to_string()),
            (PARAM_CORRELATION_ID, Uuid::new_v4().to_string()),
        ];
        if let Some(connection_id) = &options.connection_id {
            query.push((PARAM_CONNECTION_ID, connection_id.clone()));
        }
        if options.skip_existing {
            query.push((PARAM_SKIP_EXISTING, "true".to_string()));
        }

        debug!(path = %local_path.display(), remote_path, length, "Uploading file");
        let request = self
            .http
            .post(self.upload_url.clone())
            .query(&query)
            .header(CHECKSUM_HEADER, checksum.as_str())
            .header(CONTENT_LENGTH, length)
            .body(reqwest::Body::wrap_stream(body));

        let response = with_cancel(cancel, async { Ok(request.send().await?) }).await?;
        let status = response.status();
        let body = with_cancel(cancel, async { Ok(response.bytes().await?) }).await?;
        let result = serde_json::from_slice::<UploadResult>(&body).ok();

        match status {
            StatusCode::OK => result.ok_or_else(|| {
                ClientError::UnexpectedResponse("upload response is not an upload result".to_string())
            }),
            StatusCode::UNAUTHORIZED => Err(ClientError::Unauthorized),
            StatusCode::FORBIDDEN => Err(ClientError::Forbidden(reason(result, &body))),
            StatusCode::PAYLOAD_TOO_LARGE => {
                Err(ClientError::SizeLimitExceeded(reason(result, &body)))
            }
            StatusCode::BAD_REQUEST => Err(ClientError::BadRequest(reason(result, &body))),
            other => Err(ClientError::UnexpectedResponse(format!(
                "HTTP {other}: {}",
                reason(result, &body)
            ))),
        }
    }

    /// Upload several files, stopping early only on cancellation.
    ///
    /// With `skip_existing`, names are checked per remote directory through
    /// `rpc` first and files already present are reported as skipped without
    /// being sent.
    pub async fn upload_batch(
        &self,
        rpc: &RpcClient,
        items: &[UploadItem],
        options: &UploadOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<BatchUploadOutcome>> {
        let mut options = options.clone();
        if options.connection_id.is_none() {
            options.connection_id = Some(rpc.connection_id().to_string());
        }

        let existing = if options.skip_existing {
            self.existing_remote_files(rpc, items, cancel).await?
        } else {
            HashSet::new()
        };

        let mut outcomes = Vec::with_capacity(items.len());
        for item in items {
            if cancel.is_cancelled() {
                return Err(ClientError::Cancelled);
            }

            let result = if existing.contains(&normalize_remote(&item.remote_path)) {
                debug!(remote_path = %item.remote_path, "Skipping file already on the daemon");
                Ok(UploadResult::skipped(ALREADY_EXISTS_REASON))
            } else {
                self.upload_file(&item.local_path, &item.remote_path, &options, cancel)
                    .await
            };

            if matches!(result, Err(ClientError::Cancelled)) {
                return Err(ClientError::Cancelled);
            }
            if let Err(e) = &result {
                warn!(remote_path = %item.remote_path, error = %e, "Upload failed");
            }
            outcomes.push(BatchUploadOutcome {
                remote_path: item.remote_path.clone(),
                result,
            });
        }
        Ok(outcomes)
    }

    async fn existing_remote_files(
        &self,
        rpc: &RpcClient,
        items: &[UploadItem],
        cancel: &CancellationToken,
    ) -> Result<HashSet<String>> {
        let mut by_directory: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for item in items {
            let (directory, name) = split_remote(&item.remote_path);
            let names = by_directory.entry(directory).or_default();
            if !names.contains(&name) {
                names.push(name);
            }
        }

        let mut existing = HashSet::new();
        for (directory, names) in by_directory {
            let present = with_cancel(cancel, rpc.files_exist(&directory, &names)).await?;
            existing.extend(
                present
                    .into_iter()
                    .filter(|(_, exists)| *exists)
                    .map(|(name, _)| join_remote(&directory, &name)),
            );
        }
        Ok(existing)
    }

    /// Download `remote_path` to `local_path`, verifying its checksum.
    ///
    /// Bytes go to a temporary sibling first; `local_path` is only replaced once
    /// the checksum matches. Nothing is left behind on failure or cancellation.
    pub async fn download_file(
        &self,
        remote_path: &str,
        local_path: &Path,
        progress: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> Result<DownloadResult> {
        let request = self
            .http
            .get(self.download_url.clone())
            .query(&[(PARAM_FILE_PATH, remote_path)]);
        let response = with_cancel(cancel, async { Ok(request.send().await?) }).await?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::UNAUTHORIZED => return Err(ClientError::Unauthorized),
            StatusCode::NOT_FOUND => return Err(ClientError::NotFound(remote_path.to_string())),
            status => {
                let body = response.bytes().await.unwrap_or_default();
                let result = serde_json::from_slice::<UploadResult>(&body).ok();
                let reason = reason(result, &body);
                return Err(match status {
                    StatusCode::FORBIDDEN => ClientError::Forbidden(reason),
                    StatusCode::BAD_REQUEST => ClientError::BadRequest(reason),
                    other => ClientError::UnexpectedResponse(format!("HTTP {other}: {reason}")),
                });
            }
        }

        let expected = response
            .headers()
            .get(CHECKSUM_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| is_valid_checksum(value))
            .map(str::to_string)
            .ok_or_else(|| {
                ClientError::UnexpectedResponse(format!("missing or invalid {CHECKSUM_HEADER} header"))
            })?;

        if let Some(parent) = local_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp_path = download_temp_path(local_path);

        let streamed = with_cancel(cancel, stream_to_file(response, &temp_path, progress)).await;
        let (actual, bytes_written) = match streamed {
            Ok(done) => done,
            Err(e) => {
                discard(&temp_path).await;
                return Err(e);
            }
        };

        if !checksums_match(&expected, &actual) {
            warn!(remote_path, %expected, %actual, "Downloaded file failed checksum verification");
            discard(&temp_path).await;
            return Err(ClientError::ChecksumMismatch { expected, actual });
        }

        if let Err(e) = tokio::fs::rename(&temp_path, local_path).await {
            discard(&temp_path).await;
            return Err(e.into());
        }

        info!(remote_path, path = %local_path.display(), bytes_written, "Download complete");
        Ok(DownloadResult {
            bytes_written,
            checksum: actual,
        })
    }
}

async fn stream_to_file(
    response: reqwest::Response,
    path: &Path,
    progress: Option<ProgressCallback>,
) -> Result<(String, u64)> {
    let mut file = File::create(path).await?;
    let mut hasher = Sha256::new();
    let mut total = 0u64;

    let mut chunks = response.bytes_stream();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
        total += chunk.len() as u64;
        if let Some(progress) = &progress {
            progress(total);
        }
    }

    file.flush().await?;
    file.sync_all().await?;
    Ok((finalize_hex(hasher), total))
}

async fn local_file_len(path: &Path) -> Result<u64> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() => Ok(metadata.len()),
        Ok(_) => Err(ClientError::NotFound(format!(
            "{} is not a file",
            path.display()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(ClientError::NotFound(path.display().to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

async fn with_cancel<T>(
    cancel: &CancellationToken,
    operation: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ClientError::Cancelled),
        result = operation => result,
    }
}

async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove partial download"),
    }
}

fn endpoint(base: &Url, path: &str) -> Result<Url> {
    base.join(path)
        .map_err(|e| ClientError::InvalidUrl(format!("{base}{path}: {e}")))
}

fn reason(result: Option<UploadResult>, body: &[u8]) -> String {
    result
        .and_then(|r| r.reason)
        .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned())
}

fn download_temp_path(local_path: &Path) -> PathBuf {
    let name = local_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    local_path.with_file_name(format!(".{name}.{}.download", Uuid::new_v4().simple()))
}

fn normalize_remote(path: &str) -> String {
    path.replace('\\', "/").trim_start_matches('/').to_string()
}

/// Splits a remote path into its directory and file name.
fn split_remote(path: &str) -> (String, String) {
    let normalized = normalize_remote(path);
    match normalized.rsplit_once('/') {
        Some((directory, name)) => (directory.to_string(), name.to_string()),
        None => (String::new(), normalized),
    }
}

fn join_remote(directory: &str, name: &str) -> String {
    if directory.is_empty() {
        name.to_string()
    } else {
        format!("{directory}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::transfer::checksum_hex;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    const TOKEN: &str = "transfer-token";

    fn config_for(base: &str) -> ClientConfig {
        ClientConfig::new("ws://127.0.0.1:1/", base, TOKEN).unwrap()
    }

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|w| w == needle)
    }

    /// Reads one full request (head and body) from `stream`.
    async fn read_request(stream: &mut TcpStream) -> String {
        let mut data = Vec::new();
        let mut buf = vec![0u8; 8192];
        loop {
            let n = stream.read(&mut buf).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
            if let Some(end) = find(&data, b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&data[..end]).to_lowercase();
                let length = head
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok());
                match length {
                    Some(length) if data.len() >= end + 4 + length => break,
                    Some(_) => {}
                    None if head.contains("transfer-encoding: chunked") => {
                        if data.ends_with(b"0\r\n\r\n") {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
        String::from_utf8_lossy(&data).into_owned()
    }

    /// Serves one request with a canned response and returns what it received.
    async fn mock_server(
        status: &str,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let status = status.to_string();

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_request(&mut stream).await;

            let mut head = format!(
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n",
                body.len()
            );
            for (name, value) in headers {
                head.push_str(&format!("{name}: {value}\r\n"));
            }
            head.push_str("\r\n");
            let _ = stream.write_all(head.as_bytes()).await;
            let _ = stream.write_all(&body).await;
            let _ = stream.shutdown().await;
            request
        });

        (format!("http://127.0.0.1:{port}"), handle)
    }

    fn json(result: &UploadResult) -> (Vec<(String, String)>, Vec<u8>) {
        (
            vec![("Content-Type".to_string(), "application/json".to_string())],
            serde_json::to_vec(result).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_upload_missing_local_file() {
        let temp_dir = TempDir::new().unwrap();
        let service = FileTransferService::new(&config_for("http://127.0.0.1:1")).unwrap();

        let result = service
            .upload_file(
                &temp_dir.path().join("missing.txt"),
                "missing.txt",
                &UploadOptions::default(),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(ClientError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_upload_over_local_limit_is_skipped_without_sending() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("big.bin");
        std::fs::write(&path, vec![0u8; 2048]).unwrap();

        // Nothing listens on port 1, so any request would fail.
        let service = FileTransferService::new(&config_for("http://127.0.0.1:1")).unwrap();
        let options = UploadOptions::default().with_max_file_size(1024);

        let result = service
            .upload_file(&path, "big.bin", &options, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, protocol::UploadStatus::Skipped);
        assert!(result.reason.unwrap().contains("exceeds"));
    }

    #[tokio::test]
    async fn test_upload_sends_checksum_and_bearer_header() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data.bin");
        let content = vec![42u8; TRANSFER_CHUNK_SIZE * 2 + 100];
        std::fs::write(&path, &content).unwrap();

        let (headers, body) = json(&UploadResult::uploaded(content.len() as i64));
        let (base, server) = mock_server("200 OK", headers, body).await;
        let service = FileTransferService::new(&config_for(&base)).unwrap();

        let reported = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&reported);
        let options = UploadOptions::default()
            .with_skip_existing(true)
            .with_connection_id("conn-1")
            .with_progress(move |sent| seen.store(sent, Ordering::SeqCst));

        let result = service
            .upload_file(&path, "dir/data.bin", &options, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.bytes_written, Some(content.len() as i64));
        assert_eq!(reported.load(Ordering::SeqCst), content.len() as u64);

        let request = server.await.unwrap();
        let request_line = request.lines().next().unwrap();
        assert!(request_line.starts_with("POST /api/files/upload?"));
        assert!(request_line.contains("filePath=dir%2Fdata.bin"));
        assert!(request_line.contains("skipExisting=true"));
        assert!(request_line.contains("connectionId=conn-1"));
        assert!(!request_line.contains(TOKEN));

        let lower = request.to_lowercase();
        assert!(lower.contains(&format!("authorization: bearer {TOKEN}")));
        assert!(lower.contains(&format!("x-file-checksum: {}", checksum_hex(&content))));
    }

    #[tokio::test]
    async fn test_upload_status_mapping() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.txt");
        std::fs::write(&path, b"abc").unwrap();

        let cases = [
            ("401 Unauthorized", "unauthorized"),
            ("403 Forbidden", "path traversal detected"),
            ("413 Payload Too Large", "file size exceeds the limit"),
            ("400 Bad Request", "invalid checksum"),
        ];

        for (status, reason_text) in cases {
            let (headers, body) = json(&UploadResult::error(reason_text));
            let (base, server) = mock_server(status, headers, body).await;
            let service = FileTransferService::new(&config_for(&base)).unwrap();

            let result = service
                .upload_file(&path, "a.txt", &UploadOptions::default(), &CancellationToken::new())
                .await;
            match (status, result) {
                ("401 Unauthorized", Err(ClientError::Unauthorized)) => {}
                ("403 Forbidden", Err(ClientError::Forbidden(r))) => assert_eq!(r, reason_text),
                ("413 Payload Too Large", Err(ClientError::SizeLimitExceeded(r))) => {
                    assert!(r.contains("limit"))
                }
                ("400 Bad Request", Err(ClientError::BadRequest(r))) => assert_eq!(r, reason_text),
                (status, other) => panic!("{status}: unexpected {other:?}"),
            }
            server.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_upload_error_result_is_returned() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.txt");
        std::fs::write(&path, b"abc").unwrap();

        let (headers, body) = json(&UploadResult::error("Checksum mismatch"));
        let (base, _server) = mock_server("200 OK", headers, body).await;
        let service = FileTransferService::new(&config_for(&base)).unwrap();

        let result = service
            .upload_file(&path, "a.txt", &UploadOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, protocol::UploadStatus::Error);
    }

    #[tokio::test]
    async fn test_upload_cancelled() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.txt");
        std::fs::write(&path, b"abc").unwrap();

        let service = FileTransferService::new(&config_for("http://127.0.0.1:1")).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = service
            .upload_file(&path, "a.txt", &UploadOptions::default(), &cancel)
            .await;
        assert!(matches!(result, Err(ClientError::Cancelled)));
    }

    #[tokio::test]
    async fn test_download_verifies_checksum() {
        let temp_dir = TempDir::new().unwrap();
        let content = b"downloaded bytes".to_vec();
        let headers = vec![("X-File-Checksum".to_string(), checksum_hex(&content))];
        let (base, server) = mock_server("200 OK", headers, content.clone()).await;
        let service = FileTransferService::new(&config_for(&base)).unwrap();

        let local = temp_dir.path().join("out").join("file.txt");
        let result = service
            .download_file("file.txt", &local, None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.bytes_written, content.len() as u64);
        assert_eq!(std::fs::read(&local).unwrap(), content);
        let request = server.await.unwrap();
        assert!(request.starts_with("GET /api/files/download?filePath=file.txt"));
        assert_eq!(std::fs::read_dir(local.parent().unwrap()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_download_checksum_mismatch_leaves_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let headers = vec![("X-File-Checksum".to_string(), checksum_hex(b"other"))];
        let (base, _server) = mock_server("200 OK", headers, b"tampered".to_vec()).await;
        let service = FileTransferService::new(&config_for(&base)).unwrap();

        let local = temp_dir.path().join("file.txt");
        let result = service
            .download_file("file.txt", &local, None, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(ClientError::ChecksumMismatch { .. })));
        assert!(!local.exists());
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_download_not_found_and_forbidden() {
        let temp_dir = TempDir::new().unwrap();
        let local = temp_dir.path().join("file.txt");

        let (base, _server) = mock_server("404 Not Found", vec![], b"{}".to_vec()).await;
        let service = FileTransferService::new(&config_for(&base)).unwrap();
        let result = service
            .download_file("missing.txt", &local, None, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ClientError::NotFound(_))));

        let (headers, body) = json(&UploadResult::error("path traversal detected"));
        let (base, _server) = mock_server("403 Forbidden", headers, body).await;
        let service = FileTransferService::new(&config_for(&base)).unwrap();
        let result = service
            .download_file("../../../etc/passwd", &local, None, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ClientError::Forbidden(_))));
        assert!(!local.exists());
    }

    #[test]
    fn test_split_remote() {
        assert_eq!(
            split_remote("a/b/c.txt"),
            ("a/b".to_string(), "c.txt".to_string())
        );
        assert_eq!(
            split_remote("\\a\\c.txt"),
            ("a".to_string(), "c.txt".to_string())
        );
        assert_eq!(split_remote("c.txt"), (String::new(), "c.txt".to_string()));
        assert_eq!(join_remote("", "c.txt"), "c.txt");
        assert_eq!(join_remote("a/b", "c.txt"), "a/b/c.txt");
    }

    #[test]
    fn test_upload_options_debug_hides_callback() {
        let options = UploadOptions::default().with_progress(|_| {});
        assert!(format!("{options:?}").contains("progress: true"));
    }
}
