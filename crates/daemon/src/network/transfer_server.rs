//! HTTP listener for the upload and download endpoints.
//!
//! Every response closes its connection. The bearer credential is checked
//! in middleware before a handler touches the filesystem.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Query, Request, State};
use axum::http::header::{AUTHORIZATION, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{StreamExt, TryStreamExt};
use protocol::transfer::{CHECKSUM_HEADER, DOWNLOAD_PATH, UPLOAD_PATH};
use protocol::UploadResult;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpListener;
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{authorize, TokenValidator};
use crate::files::{FileTransferEndpointService, TransferError, UploadRequest};

/// Most unread request bytes discarded before answering a rejected upload.
const DRAIN_LIMIT_BYTES: u64 = 1024 * 1024;

/// Longest wait for the rest of a rejected request body.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const MISSING_FILE_PATH: &str = "missing filePath parameter";

/// Accepts HTTP connections and serves the transfer endpoints.
pub struct TransferServer {
    listener: TcpListener,
    service: Arc<FileTransferEndpointService>,
    auth: Arc<dyn TokenValidator>,
}

impl TransferServer {
    /// Bind the listener. Port 0 picks a free port.
    pub async fn bind(
        addr: SocketAddr,
        service: Arc<FileTransferEndpointService>,
        auth: Arc<dyn TokenValidator>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            service,
            auth,
        })
    }

    /// The bound address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` is cancelled, then wait for open connections.
    ///
    /// Cancelling `shutdown` also cancels uploads and downloads in flight.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(addr = ?self.listener.local_addr().ok(), "Transfer server listening");

        let app = router(TransferState {
            service: self.service,
            auth: self.auth,
            shutdown: shutdown.clone(),
        });
        if let Err(e) = axum::serve(self.listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
        {
            warn!(error = %e, "Transfer server failed");
        }
        info!("Transfer server stopped");
    }
}

#[derive(Clone)]
struct TransferState {
    service: Arc<FileTransferEndpointService>,
    auth: Arc<dyn TokenValidator>,
    shutdown: CancellationToken,
}

/// Query parameters shared by both endpoints, decoded once by the extractor.
#[derive(Debug, Default, Deserialize)]
struct TransferQuery {
    #[serde(rename = "filePath")]
    file_path: Option<String>,
    #[serde(rename = "connectionId")]
    connection_id: Option<String>,
    #[serde(rename = "correlationId")]
    correlation_id: Option<String>,
    #[serde(rename = "skipExisting")]
    skip_existing: Option<String>,
}

fn router(state: TransferState) -> Router {
    Router::new()
        .route(UPLOAD_PATH, post(upload).put(upload))
        .route(DOWNLOAD_PATH, get(download))
        .layer(middleware::from_fn_with_state(state.clone(), require_bearer))
        .layer(middleware::map_response(close_connection))
        .with_state(state)
}

async fn require_bearer(State(state): State<TransferState>, request: Request, next: Next) -> Response {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    if authorize(state.auth.as_ref(), header) {
        return next.run(request).await;
    }

    // The credential itself is never logged.
    warn!(
        method = %request.method(),
        path = %request.uri().path(),
        "Rejected transfer request without valid credential"
    );
    drain(body_reader(request.into_body())).await;
    UploadFailure(TransferError::Unauthorized).into_response()
}

async fn close_connection(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    response
}

async fn upload(
    State(state): State<TransferState>,
    Query(query): Query<TransferQuery>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let mut body = body_reader(body);
    let Some(file_path) = query.file_path else {
        drain(body).await;
        return UploadFailure(TransferError::InvalidArgument(MISSING_FILE_PATH.to_string()))
            .into_response();
    };

    let mut request = UploadRequest::new(file_path)
        .with_skip_existing(parse_flag(query.skip_existing.as_deref()))
        .with_connection(query.connection_id, query.correlation_id);
    // A chunked body's declared length is meaningless.
    if !headers.contains_key(TRANSFER_ENCODING) {
        request.content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok());
    }
    if let Some(checksum) = headers.get(CHECKSUM_HEADER) {
        request = request.with_checksum(String::from_utf8_lossy(checksum.as_bytes()).trim());
    }

    let cancel = state.shutdown.child_token();
    match state.service.upload(&request, &mut body, &cancel).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => {
            drain(body).await;
            UploadFailure(e).into_response()
        }
    }
}

async fn download(State(state): State<TransferState>, Query(query): Query<TransferQuery>) -> Response {
    let Some(file_path) = query.file_path else {
        return DownloadFailure(TransferError::InvalidArgument(MISSING_FILE_PATH.to_string()))
            .into_response();
    };

    let handle = match state.service.open_download(&file_path).await {
        Ok(handle) => handle,
        Err(e) => return DownloadFailure(e).into_response(),
    };

    debug!(path = %file_path, length = handle.length, "Download started");
    // Shutdown cuts the body short; the client sees a truncated transfer.
    let stream = ReaderStream::new(handle.file.take(handle.length))
        .take_until(state.shutdown.clone().cancelled_owned());
    (
        [
            ("content-type", "application/octet-stream".to_string()),
            ("content-length", handle.length.to_string()),
            (CHECKSUM_HEADER, handle.checksum),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

fn body_reader(body: Body) -> impl AsyncRead + Unpin {
    StreamReader::new(body.into_data_stream().map_err(io::Error::other))
}

/// Discards what is left of a rejected request body.
///
/// Closing a socket with unread input resets the connection, which can
/// destroy the response before the client reads it.
async fn drain<R>(body: R)
where
    R: AsyncRead + Unpin,
{
    let mut rest = body.take(DRAIN_LIMIT_BYTES);
    let _ = tokio::time::timeout(DRAIN_TIMEOUT, tokio::io::copy(&mut rest, &mut tokio::io::sink()))
        .await;
}

fn parse_flag(value: Option<&str>) -> bool {
    value.is_some_and(|v| v.eq_ignore_ascii_case("true") || v == "1")
}

/// A failed upload, answered with an [`UploadResult`] error body.
struct UploadFailure(TransferError);

impl UploadFailure {
    fn status_code(&self) -> StatusCode {
        match &self.0 {
            TransferError::Unauthorized => StatusCode::UNAUTHORIZED,
            TransferError::PathTraversal { .. } | TransferError::ExtensionNotAllowed { .. } => {
                StatusCode::FORBIDDEN
            }
            TransferError::SizeLimitExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            TransferError::InvalidArgument(_) | TransferError::InvalidChecksum(_) => {
                StatusCode::BAD_REQUEST
            }
            // Reported in the body after cleanup.
            TransferError::ChecksumMismatch { .. }
            | TransferError::NotFound(_)
            | TransferError::Cancelled
            | TransferError::Io(_) => StatusCode::OK,
        }
    }
}

impl IntoResponse for UploadFailure {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(UploadResult::error(self.0.to_string()))).into_response()
    }
}

/// A failed download. Downloads have no success body to carry the error in.
struct DownloadFailure(TransferError);

impl DownloadFailure {
    fn status_code(&self) -> StatusCode {
        match &self.0 {
            TransferError::Unauthorized => StatusCode::UNAUTHORIZED,
            TransferError::PathTraversal { .. } => StatusCode::FORBIDDEN,
            TransferError::NotFound(_) => StatusCode::NOT_FOUND,
            TransferError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for DownloadFailure {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(UploadResult::error(self.0.to_string()))).into_response()
    }
}
