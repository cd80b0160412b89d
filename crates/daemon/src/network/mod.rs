//! Network listeners for client connections.
//!
//! The daemon exposes two channels:
//! - a WebSocket RPC channel carrying MessagePack envelopes
//! - an HTTP channel carrying raw file bytes for uploads and downloads
//!
//! Both require a bearer token on every connection.

pub mod rpc_server;
pub mod transfer_server;

// Re-export key types
pub use rpc_server::{RpcConnections, RpcServer, CONNECTION_CLOSED_REASON};
pub use transfer_server::TransferServer;
