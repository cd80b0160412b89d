//! # RemoCLI Client Library
//!
//! Talks to a RemoCLI daemon over its two channels:
//!
//! - [`RpcClient`]: WebSocket RPC for enumeration, existence checks, transfer
//!   limits and keepalive
//! - [`FileTransferService`]: HTTP uploads and downloads with SHA-256
//!   verification, progress reporting and cancellation
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use client::{ClientConfig, FileTransferService, RpcClient, UploadOptions};
//! use protocol::messages::RecursionMode;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> client::Result<()> {
//! let config = ClientConfig::new("ws://127.0.0.1:7420/", "http://127.0.0.1:7421", "token")?;
//!
//! let rpc = RpcClient::connect(&config).await?;
//! let listing = rpc.enumerate_files("logs", "**/*.log", RecursionMode::AllDirectories).await?;
//! println!("{} log files", listing.files.len());
//!
//! let transfers = FileTransferService::new(&config)?;
//! let options = UploadOptions::default().with_skip_existing(true);
//! let result = transfers
//!     .upload_file("report.txt".as_ref(), "reports/report.txt", &options, &CancellationToken::new())
//!     .await?;
//! println!("{:?}", result.status);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod rpc;
pub mod transfer;

pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use rpc::RpcClient;
pub use transfer::{
    BatchUploadOutcome, DownloadResult, FileTransferService, ProgressCallback, UploadItem,
    UploadOptions,
};
