//! Connection settings for a RemoCLI daemon.

use std::fmt;
use std::time::Duration;

use url::Url;

use crate::error::{ClientError, Result};

/// Default time to wait for an RPC reply.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time to wait for a connection to be established.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Where the daemon listens and how to authenticate.
#[derive(Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the RPC channel (`ws://` or `wss://`).
    pub rpc_url: Url,
    /// Base URL of the transfer channel (`http://` or `https://`).
    pub transfer_url: Url,
    /// Bearer credential issued out of band.
    pub auth_token: String,
    /// Time to wait for an RPC reply.
    pub rpc_timeout: Duration,
    /// Time to wait for a connection to be established.
    pub connect_timeout: Duration,
}

impl ClientConfig {
    /// Parse and check both URLs.
    pub fn new(rpc_url: &str, transfer_url: &str, auth_token: impl Into<String>) -> Result<Self> {
        let rpc_url = parse_url(rpc_url, &["ws", "wss"])?;
        let transfer_url = parse_url(transfer_url, &["http", "https"])?;
        let auth_token = auth_token.into();
        if auth_token.trim().is_empty() {
            return Err(ClientError::InvalidCredential);
        }

        Ok(Self {
            rpc_url,
            transfer_url,
            auth_token,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    /// Set the RPC reply timeout.
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// `Authorization` header value.
    pub(crate) fn bearer(&self) -> String {
        format!("Bearer {}", self.auth_token)
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("rpc_url", &self.rpc_url.as_str())
            .field("transfer_url", &self.transfer_url.as_str())
            .field("auth_token", &"<redacted>")
            .field("rpc_timeout", &self.rpc_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

fn parse_url(value: &str, schemes: &[&str]) -> Result<Url> {
    let url = Url::parse(value).map_err(|e| ClientError::InvalidUrl(format!("{value}: {e}")))?;
    if !schemes.contains(&url.scheme()) {
        return Err(ClientError::InvalidUrl(format!(
            "{value}: expected scheme {}",
            schemes.join(" or ")
        )));
    }
    if url.query().is_some() {
        return Err(ClientError::InvalidUrl(format!(
            "{value}: query strings are not allowed"
        )));
    }
    Ok(url)
}
