//! Configuration management for the Pulse client.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/pulse/config.toml`.
//!
//! ```toml
//! [client]
//! log_level = "info"
//!
//! [connection]
//! server_url = "ws://localhost:8112"
//! role = "user"
//! reconnect_interval_ms = 3000
//! request_timeout_ms = 3000
//!
//! [protocol]
//! max_skew_secs = 5
//!
//! [identity]
//! id = 7
//! exchange_seed = "<64 hex digits>"
//! signing_seed = "<64 hex digits>"
//!
//! [[peers]]
//! id = 0
//! x = "<exchange public key>"
//! ed = "<signing public key>"
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use pulse_protocol::{parse_key, KeyDirectory, LocalIdentity, PeerId, PeerKeys, PeerKeysText};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::Role;

/// Default relay server.
pub const DEFAULT_SERVER_URL: &str = "ws://localhost:8112";

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("server_url must start with ws:// or wss://, got {0}")]
    InvalidServerUrl(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("reconnect_interval_ms must be between 100 and 600000, got {0}")]
    InvalidReconnectInterval(u64),

    #[error("request_timeout_ms must be between 1 and 3600000, got {0}")]
    InvalidRequestTimeout(u64),

    #[error("invalid key in {field}: {reason}")]
    InvalidKey { field: String, reason: String },

    #[error("peer {0} is listed more than once")]
    DuplicatePeer(u32),

    #[error("identity is not configured; run `pulse keygen`")]
    MissingIdentity,
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the Pulse client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Process-level settings.
    pub client: ClientConfig,

    /// Relay connection settings.
    pub connection: ConnectionConfig,

    /// Wire protocol settings.
    pub protocol: ProtocolConfig,

    /// Local identity.
    pub identity: IdentityConfig,

    /// Known peers and their public keys.
    pub peers: Vec<PeerEntry>,
}

/// Process-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Optional file to write logs to in addition to stderr.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

/// Relay connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Base URL of the relay server.
    pub server_url: String,

    /// Endpoint family to connect as.
    pub role: Role,

    /// Fixed delay between reconnect attempts.
    pub reconnect_interval_ms: u64,

    /// Default time to wait for an answer.
    pub request_timeout_ms: u64,
}

/// Wire protocol settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Accepted clock skew of inbound frames (0 disables the check).
    pub max_skew_secs: u64,
}

/// Local identity: numeric id and the two secret seeds, hex encoded.
#[derive(Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct IdentityConfig {
    /// Numeric id assigned by the relay.
    pub id: u32,

    /// X25519 secret seed.
    pub exchange_seed: String,

    /// Ed25519 secret seed.
    pub signing_seed: String,
}

/// A known peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerEntry {
    /// Numeric id of the peer (0 is the relay server).
    pub id: u32,

    /// Public keys, hex or base64url.
    #[serde(flatten)]
    pub keys: PeerKeysText,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            role: Role::User,
            reconnect_interval_ms: 3000,
            request_timeout_ms: 3000,
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self { max_skew_secs: 5 }
    }
}

impl std::fmt::Debug for IdentityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityConfig")
            .field("id", &self.id)
            .field("exchange_seed", &"[REDACTED]")
            .field("signing_seed", &"[REDACTED]")
            .finish()
    }
}

impl IdentityConfig {
    /// Builds the identity section from a local identity.
    pub fn from_identity(id: u32, identity: &LocalIdentity) -> Self {
        Self {
            id,
            exchange_seed: hex::encode(identity.exchange_seed()),
            signing_seed: hex::encode(identity.signing_seed()),
        }
    }

    /// Whether both seeds are present.
    pub fn is_configured(&self) -> bool {
        !self.exchange_seed.is_empty() && !self.signing_seed.is_empty()
    }

    /// Rebuilds the local identity from the configured seeds.
    pub fn to_identity(&self) -> Result<LocalIdentity, ConfigError> {
        if !self.is_configured() {
            return Err(ConfigError::MissingIdentity);
        }
        let exchange = parse_key(&self.exchange_seed).map_err(|e| ConfigError::InvalidKey {
            field: "identity.exchange_seed".to_string(),
            reason: e.to_string(),
        })?;
        let signing = parse_key(&self.signing_seed).map_err(|e| ConfigError::InvalidKey {
            field: "identity.signing_seed".to_string(),
            reason: e.to_string(),
        })?;
        Ok(LocalIdentity::from_seeds(&exchange, &signing))
    }
}

impl PeerEntry {
    /// Creates an entry from parsed keys.
    pub fn new(id: u32, keys: &PeerKeys) -> Self {
        Self {
            id,
            keys: PeerKeysText::from(keys),
        }
    }

    /// Parses the entry's keys.
    pub fn to_keys(&self) -> Result<PeerKeys, ConfigError> {
        PeerKeys::try_from(&self.keys).map_err(|e| ConfigError::InvalidKey {
            field: format!("peers[id={}]", self.id),
            reason: e.to_string(),
        })
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pulse")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PULSE_SERVER_URL: Override relay server URL
    /// - PULSE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("PULSE_SERVER_URL") {
            if !url.is_empty() {
                tracing::info!("Overriding server_url from environment: {}", url);
                self.connection.server_url = url;
            }
        }

        if let Ok(level) = std::env::var("PULSE_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.client.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Key material is checked too, but a missing identity is allowed so
    /// that `keygen` can run against an empty configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = &self.connection.server_url;
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(ConfigError::InvalidServerUrl(url.clone()));
        }

        let level = self.client.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.client.log_level.clone()));
        }

        let interval = self.connection.reconnect_interval_ms;
        if !(100..=600_000).contains(&interval) {
            return Err(ConfigError::InvalidReconnectInterval(interval));
        }

        let timeout = self.connection.request_timeout_ms;
        if !(1..=3_600_000).contains(&timeout) {
            return Err(ConfigError::InvalidRequestTimeout(timeout));
        }

        if self.identity.is_configured() {
            self.identity.to_identity()?;
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if !seen.insert(peer.id) {
                return Err(ConfigError::DuplicatePeer(peer.id));
            }
            peer.to_keys()?;
        }

        Ok(())
    }

    /// Builds the key directory from the configured peers.
    ///
    /// The local identity's own public keys are added under its id unless a
    /// peer entry already covers it.
    pub fn key_directory(&self) -> Result<KeyDirectory, ConfigError> {
        let directory = KeyDirectory::new();
        for peer in &self.peers {
            directory.insert(PeerId(peer.id), peer.to_keys()?);
        }

        if self.identity.is_configured() {
            let own = PeerId(self.identity.id);
            if !directory.contains(own) {
                directory.insert(own, self.identity.to_identity()?.public_keys());
            }
        }

        Ok(directory)
    }

    /// Adds or replaces a peer entry.
    pub fn upsert_peer(&mut self, entry: PeerEntry) {
        match self.peers.iter_mut().find(|p| p.id == entry.id) {
            Some(existing) => *existing = entry,
            None => self.peers.push(entry),
        }
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

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
