//! Sandboxed file access for RPC handlers and the transfer endpoints.
//!
//! This module provides:
//! - Path, extension and size validation
//! - A filesystem abstraction confined to the storage root
//! - Streaming uploads and downloads with checksum verification
//! - File enumeration and batch existence checks for RPC
//!
//! # Security
//!
//! Every path a caller supplies is resolved against the storage root before
//! any disk access. Traversal attempts, including encoded and backslash
//! variants and symlinks that leave the root, are rejected.

pub mod browser;
pub mod error;
pub mod extension_validator;
pub mod path_validator;
pub mod sandbox;
pub mod size_validator;
pub mod transfer;

pub use browser::FileSystemRpcHandler;
pub use error::TransferError;
pub use extension_validator::ExtensionValidator;
pub use path_validator::PathValidator;
pub use sandbox::{FileSystem, LocalFileSystem, SandboxedFileSystem};
pub use size_validator::FileSizeValidator;
pub use transfer::{DownloadHandle, FileTransferEndpointService, UploadRequest};
