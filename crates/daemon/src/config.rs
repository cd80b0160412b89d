//! Configuration management for the RemoCLI daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/remocli/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("storage_root_path must not be empty")]
    EmptyStorageRoot,

    #[error("max_file_size_bytes must be greater than 0, got {0}")]
    InvalidMaxFileSize(i64),

    #[error("allowed_extensions must not contain empty entries")]
    EmptyExtension,

    #[error("{field} must be a socket address like 127.0.0.1:7420, got {value}")]
    InvalidListenAddress { field: &'static str, value: String },

    #[error("rpc_timeout_secs must be between 1 and 3600 seconds, got {0}")]
    InvalidRpcTimeout(u64),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("at least one non-empty auth token must be configured")]
    MissingAuthToken,
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the RemoCLI daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Listener configuration.
    pub network: NetworkConfig,

    /// File transfer configuration.
    pub transfer: FileTransferOptions,

    /// Security settings.
    pub security: SecurityConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for daemon data (default storage root, logs).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Optional log file; logs are also written to stderr.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

/// Listener configuration for the RPC and transfer endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address of the WebSocket RPC listener.
    pub rpc_listen: String,

    /// Address of the HTTP file transfer listener.
    pub transfer_listen: String,

    /// Seconds to wait for a reply to a daemon-initiated RPC call.
    pub rpc_timeout_secs: u64,

    /// Seconds between keepalive pings to connected clients (0 disables them).
    pub keepalive_interval_secs: u64,
}

/// File transfer options.
///
/// Validated once at startup and shared read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FileTransferOptions {
    /// Directory all file operations are confined to.
    pub storage_root_path: PathBuf,

    /// Maximum accepted upload size in bytes (default: 100MB).
    pub max_file_size_bytes: i64,

    /// Accepted extensions. Absent accepts everything; an empty list accepts nothing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_extensions: Option<Vec<String>>,
}

/// Security settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SecurityConfig {
    /// Bearer credentials accepted on both listeners.
    pub auth_tokens: Vec<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            rpc_listen: "127.0.0.1:7420".to_string(),
            transfer_listen: "127.0.0.1:7421".to_string(),
            rpc_timeout_secs: 30,
            keepalive_interval_secs: 30,
        }
    }
}

impl Default for FileTransferOptions {
    fn default() -> Self {
        Self {
            storage_root_path: default_data_dir().join("storage"),
            max_file_size_bytes: 100 * 1024 * 1024, // 100MB
            allowed_extensions: None,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("remocli")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("remocli")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - REMOCLI_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - REMOCLI_STORAGE_ROOT: Override the storage root directory
    /// - REMOCLI_AUTH_TOKEN: Add an accepted bearer credential
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("REMOCLI_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(root) = std::env::var("REMOCLI_STORAGE_ROOT") {
            if !root.is_empty() {
                tracing::info!("Overriding storage_root_path from environment: {}", root);
                self.transfer.storage_root_path = PathBuf::from(root);
            }
        }

        if let Ok(token) = std::env::var("REMOCLI_AUTH_TOKEN") {
            if !token.is_empty() {
                tracing::info!("Adding auth token from environment");
                if !self.security.auth_tokens.contains(&token) {
                    self.security.auth_tokens.push(token);
                }
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transfer.storage_root_path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyStorageRoot);
        }

        if self.transfer.max_file_size_bytes <= 0 {
            return Err(ConfigError::InvalidMaxFileSize(
                self.transfer.max_file_size_bytes,
            ));
        }

        if let Some(extensions) = &self.transfer.allowed_extensions {
            if extensions
                .iter()
                .any(|ext| ext.trim().trim_start_matches('.').is_empty())
            {
                return Err(ConfigError::EmptyExtension);
            }
        }

        validate_listen_address("rpc_listen", &self.network.rpc_listen)?;
        validate_listen_address("transfer_listen", &self.network.transfer_listen)?;

        if self.network.rpc_timeout_secs < 1 || self.network.rpc_timeout_secs > 3600 {
            return Err(ConfigError::InvalidRpcTimeout(
                self.network.rpc_timeout_secs,
            ));
        }

        // Validate log_level is a known value
        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(
                self.daemon.log_level.clone(),
            ));
        }

        if !self
            .security
            .auth_tokens
            .iter()
            .any(|token| !token.trim().is_empty())
        {
            return Err(ConfigError::MissingAuthToken);
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    ///
    /// The default path is `~/.config/remocli/config.toml`.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        // Create parent directories if needed
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Save configuration to the default path.
    pub fn save_default(&self) -> Result<()> {
        self.save(default_config_path())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn validate_listen_address(field: &'static str, value: &str) -> Result<(), ConfigError> {
    value
        .parse::<SocketAddr>()
        .map(|_| ())
        .map_err(|_| ConfigError::InvalidListenAddress {
            field,
            value: value.to_string(),
        })
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
