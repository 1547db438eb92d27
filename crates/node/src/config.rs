//! Configuration management for the FSBridge node.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/fsbridge/config.toml`.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use protocol::{Bookmark, PayloadCipher};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be non-zero")]
    ZeroPort(&'static str),

    #[error("transport_port and http_port must differ, both are {0}")]
    PortConflict(u16),

    #[error("scan_concurrency must be between 1 and 1024, got {0}")]
    InvalidScanConcurrency(usize),

    #[error("scan_timeout_ms must be between 1 and 60000, got {0}")]
    InvalidScanTimeout(u64),

    #[error("max_chunk_size must be at least 1024 bytes, got {0}")]
    InvalidChunkSize(usize),

    #[error("traverse_batch_size must be greater than 0")]
    InvalidBatchSize,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("no shared secret configured (set security.secret or FSBRIDGE_SECRET)")]
    MissingSecret,

    #[error("secret must be at least 8 bytes")]
    WeakSecret,
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Shortest accepted shared secret.
pub const MIN_SECRET_LEN: usize = 8;

/// Well-known transport port.
pub const DEFAULT_TRANSPORT_PORT: u16 = 52020;

/// Default HTTP streaming port.
pub const DEFAULT_HTTP_PORT: u16 = 52021;

/// Main configuration structure for an FSBridge node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub file: FileConfig,
    pub security: SecurityConfig,
}

/// General node configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    /// Directory for persistent state (identity, permissions).
    pub data_dir: PathBuf,

    /// Name announced to peers.
    pub display_name: String,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Transport, HTTP and scanner settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    pub transport_port: u16,
    pub http_port: u16,

    /// Address both servers bind to.
    pub bind_address: IpAddr,

    /// Connect plus handshake budget per address.
    pub scan_timeout_ms: u64,

    /// Maximum addresses tried at once.
    pub scan_concurrency: usize,

    /// Replies with larger bodies are chunked.
    pub max_chunk_size: usize,
}

/// Filesystem exposure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FileConfig {
    /// Paths returned by `Path.getRootPaths`.
    pub root_paths: Vec<PathBuf>,

    /// Served by `Bookmark.getBookmarks`.
    pub bookmarks: Vec<Bookmark>,

    /// Maximum entries per traversal batch.
    pub traverse_batch_size: usize,
}

/// Security settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SecurityConfig {
    /// Shared payload secret. `FSBRIDGE_SECRET` takes precedence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,

    /// Roles, rules and token bindings. Defaults to `<data_dir>/permissions.json`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions_file: Option<PathBuf>,

    /// Device ids whose handshakes are refused.
    pub blocked_devices: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            display_name: default_display_name(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            transport_port: DEFAULT_TRANSPORT_PORT,
            http_port: DEFAULT_HTTP_PORT,
            bind_address: IpAddr::from([0, 0, 0, 0]),
            scan_timeout_ms: 1000,
            scan_concurrency: 100,
            max_chunk_size: 1024 * 1024, // 1 MiB
        }
    }
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            root_paths: dirs::home_dir().into_iter().collect(),
            bookmarks: Vec::new(),
            traverse_batch_size: 256,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fsbridge")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fsbridge")
}

fn default_display_name() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|name| !name.is_empty())
        .unwrap_or_else(|| "fsbridge-node".to_string())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported variables:
    /// - FSBRIDGE_SECRET: shared payload secret
    /// - FSBRIDGE_LOG_LEVEL: log level (trace, debug, info, warn, error)
    /// - FSBRIDGE_HTTP_PORT: HTTP server port
    pub fn apply_env_overrides(&mut self) {
        if let Ok(secret) = std::env::var("FSBRIDGE_SECRET") {
            if !secret.is_empty() {
                tracing::info!("Using shared secret from environment");
                self.security.secret = Some(secret);
            }
        }

        if let Ok(level) = std::env::var("FSBRIDGE_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.node.log_level = level;
            }
        }

        if let Ok(port) = std::env::var("FSBRIDGE_HTTP_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    tracing::info!("Overriding http_port from environment: {}", port);
                    self.network.http_port = port;
                }
                Err(_) if port.is_empty() => {}
                Err(_) => tracing::warn!("Ignoring invalid FSBRIDGE_HTTP_PORT: {:?}", port),
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let network = &self.network;
        if network.transport_port == 0 {
            return Err(ConfigError::ZeroPort("transport_port"));
        }
        if network.http_port == 0 {
            return Err(ConfigError::ZeroPort("http_port"));
        }
        if network.transport_port == network.http_port {
            return Err(ConfigError::PortConflict(network.http_port));
        }
        if !(1..=1024).contains(&network.scan_concurrency) {
            return Err(ConfigError::InvalidScanConcurrency(network.scan_concurrency));
        }
        if !(1..=60_000).contains(&network.scan_timeout_ms) {
            return Err(ConfigError::InvalidScanTimeout(network.scan_timeout_ms));
        }
        if network.max_chunk_size < 1024 {
            return Err(ConfigError::InvalidChunkSize(network.max_chunk_size));
        }
        if self.file.traverse_batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }

        let level = self.node.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.node.log_level.clone()));
        }

        self.cipher().map(|_| ())
    }

    /// Build the payload cipher from the configured secret.
    pub fn cipher(&self) -> Result<PayloadCipher, ConfigError> {
        match self.security.secret.as_deref() {
            None | Some("") => Err(ConfigError::MissingSecret),
            Some(secret) if secret.len() < MIN_SECRET_LEN => Err(ConfigError::WeakSecret),
            Some(secret) => Ok(PayloadCipher::from_secret(secret)),
        }
    }

    /// Location of the permission store.
    pub fn permissions_path(&self) -> PathBuf {
        self.security
            .permissions_file
            .clone()
            .unwrap_or_else(|| self.node.data_dir.join("permissions.json"))
    }

    /// Location of the sealed device identity.
    pub fn identity_path(&self) -> PathBuf {
        self.node.data_dir.join("identity.bin")
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
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
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

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

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
