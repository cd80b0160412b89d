//! # RemoCLI Protocol Library
//!
//! This crate provides the wire contract shared by the RemoCLI daemon and its
//! clients.
//!
//! ## Overview
//!
//! - **Message Definitions**: RPC request/response types for file enumeration,
//!   existence checks, transfer limits and keepalive
//! - **Correlation Registry**: matching out-of-order responses to waiting callers,
//!   with timeout, abort and per-connection scope teardown
//! - **Transfer Contract**: HTTP paths, headers, query parameters and the upload
//!   result body used by the file transfer channel
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────┐   ┌──────────────────────────────┐
//! │        RPC Messages          │   │        File Bytes            │
//! │  Envelope { correlation_id } │   │  X-File-Checksum, Bearer     │
//! ├──────────────────────────────┤   ├──────────────────────────────┤
//! │    MessagePack encoding      │   │      Raw HTTP bodies         │
//! ├──────────────────────────────┤   ├──────────────────────────────┤
//! │   WebSocket binary frames    │   │          HTTP/1.1            │
//! └──────────────────────────────┘   └──────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Envelope, Message, RpcMessageRegistry};
//! use protocol::messages::{Pong, TransferLimitsRequest};
//!
//! let registry = RpcMessageRegistry::new();
//! let scope = registry.scope("connection-1");
//!
//! // Register a call and tag the outbound request with its correlation id
//! let pending = scope.register();
//! let request = Envelope::new(
//!     pending.correlation_id(),
//!     Message::TransferLimitsRequest(TransferLimitsRequest {}),
//! );
//! let bytes = request.to_msgpack().unwrap();
//!
//! // The read loop settles the call when the reply arrives
//! let reply = request.reply(Message::Pong(Pong { timestamp: 0, payload: vec![] }));
//! assert!(registry.set_response(reply).unwrap());
//! # let _ = bytes;
//! # let _ = pending;
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Protocol message definitions
//! - [`rpc`]: Correlation registry
//! - [`transfer`]: File transfer wire contract and checksum helpers
//! - [`error`]: Error types

pub mod error;
pub mod messages;
pub mod rpc;
pub mod transfer;

pub use error::{ProtocolError, Result};
pub use messages::{Envelope, Message, PROTOCOL_VERSION};
pub use rpc::{PendingRpc, RpcMessageContext, RpcMessageRegistry, RpcOutcome, RpcScope};
pub use transfer::{UploadResult, UploadStatus};
