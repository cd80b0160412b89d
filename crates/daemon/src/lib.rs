//! # RemoCLI Daemon Library
//!
//! This crate provides the daemon (server) side of RemoCLI: sandboxed file
//! operations exposed to remote command-line clients.
//!
//! ## Overview
//!
//! - **Sandboxed Filesystem**: every path a client sends is resolved against one
//!   storage root and rejected if it escapes it
//! - **File RPC**: glob enumeration and batched existence checks over a
//!   WebSocket channel carrying MessagePack envelopes
//! - **File Transfer**: streamed, size-limited, checksum-verified uploads and
//!   downloads over plain HTTP
//! - **Correlation**: daemon-initiated calls matched to client replies, failed
//!   in bulk when a connection closes
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Daemon Orchestrator                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌───────────────────────────┐  ┌────────────────────────────┐  │
//! │  │   RPC Server (WebSocket)  │  │  Transfer Server (HTTP)    │  │
//! │  └─────────────┬─────────────┘  └──────────────┬─────────────┘  │
//! │                │          bearer auth          │                │
//! │  ┌─────────────▼─────────────┐                 │                │
//! │  │      Message Router       │                 │                │
//! │  └─────────────┬─────────────┘                 │                │
//! │  ┌─────────────▼─────────────┐  ┌──────────────▼─────────────┐  │
//! │  │   FileSystemRpcHandler    │  │ FileTransferEndpointService│  │
//! │  └─────────────┬─────────────┘  └──────────────┬─────────────┘  │
//! │  ┌─────────────▼───────────────────────────────▼─────────────┐  │
//! │  │          SandboxedFileSystem (PathValidator)              │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load_default()?;
//!     config.apply_env_overrides();
//!
//!     // Create and start the orchestrator
//!     let mut orchestrator = DaemonOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     // The daemon is now accepting connections
//!     tokio::signal::ctrl_c().await?;
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading, validation and defaults
//! - [`auth`]: Bearer token checks
//! - [`files`]: Validators, sandbox, file RPC handler and transfer service
//! - [`network`]: WebSocket RPC and HTTP transfer listeners
//! - [`router`]: Message routing to handlers
//! - [`orchestrator`]: Main daemon coordinator

pub mod auth;
pub mod config;
pub mod files;
pub mod network;
pub mod orchestrator;
pub mod router;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::{Config, ConfigError, FileTransferOptions};

// Re-export auth types for convenience
pub use auth::{StaticTokenValidator, TokenValidator};

// Re-export files types for convenience
pub use files::{
    DownloadHandle, ExtensionValidator, FileSizeValidator, FileSystem, FileSystemRpcHandler,
    FileTransferEndpointService, LocalFileSystem, PathValidator, SandboxedFileSystem,
    TransferError, UploadRequest,
};

// Re-export network types for convenience
pub use network::{RpcConnections, RpcServer, TransferServer};

// Re-export router types for convenience
pub use router::{MessageRouter, RouterError, RouterResult};

// Re-export orchestrator types for convenience
pub use orchestrator::{DaemonOrchestrator, Listener, OrchestratorEvent, OrchestratorState};
