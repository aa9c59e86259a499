//! Configuration management for LanShare.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/lanshare/config.toml`.
//!
//! A [`Config`] value is built once at startup and handed to each component
//! at construction; nothing reads configuration from ambient globals.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default port the share server listens on.
pub const DEFAULT_PORT: u16 = 8080;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("port must be between 1 and 65535, got {0}")]
    InvalidPort(u16),

    #[error("shutdown_grace_secs must be between 0 and 300, got {0}")]
    InvalidShutdownGrace(u64),

    #[error("discovery_timeout_ms must be between 1 and 10000, got {0}")]
    InvalidDiscoveryTimeout(u64),

    #[error("scan timeout_ms must be greater than 0, got {0}")]
    InvalidScanTimeout(u64),

    #[error("scan concurrency must be between 1 and 1024, got {0}")]
    InvalidScanConcurrency(usize),

    #[error("tls requires both cert_path and key_path")]
    IncompleteTls,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for LanShare.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General process configuration.
    pub daemon: DaemonConfig,

    /// Share server configuration.
    pub server: ServerConfig,

    /// Optional TLS material for the share server.
    pub tls: TlsConfig,

    /// Gateway port-mapping configuration.
    pub gateway: GatewayConfig,

    /// Access policy storage.
    pub access: AccessConfig,

    /// Port scanner tuning.
    pub scan: ScanConfig,
}

/// General process configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for storing LanShare data (address lists, shared files).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for rolling log files. Logs only go to stderr when unset.
    pub log_dir: Option<PathBuf>,
}

/// Share server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP port to listen on (all interfaces).
    pub port: u16,

    /// Directory served over HTTP. Defaults to `<data_dir>/shared` when unset.
    pub root_dir: Option<PathBuf>,

    /// Start serving as soon as the process launches.
    pub auto_start: bool,

    /// Seconds to wait for in-flight requests when stopping.
    pub shutdown_grace_secs: u64,
}

/// TLS material. Both paths must be set to enable TLS.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM certificate chain.
    pub cert_path: Option<PathBuf>,

    /// PEM private key.
    pub key_path: Option<PathBuf>,
}

/// Gateway port-mapping configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    /// Map the server port on the gateway once the server is running.
    pub upnp_enabled: bool,

    /// Gateway discovery delay in milliseconds.
    pub discovery_timeout_ms: u64,

    /// Description attached to mappings created by LanShare.
    pub description: String,
}

/// Access policy storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AccessConfig {
    /// JSON file holding the allowed addresses. Defaults to `<data_dir>/allowed_ips.json`.
    pub allowed_file: Option<PathBuf>,

    /// JSON file holding the blocked addresses. Defaults to `<data_dir>/blocked_ips.json`.
    pub blocked_file: Option<PathBuf>,
}

/// Port scanner tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScanConfig {
    /// Connect timeout per port in milliseconds.
    pub timeout_ms: u64,

    /// Maximum connects in flight.
    pub concurrency: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            root_dir: None,
            auto_start: false,
            shutdown_grace_secs: 5,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            upnp_enabled: false,
            discovery_timeout_ms: 200,
            description: "LanShare".to_string(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 100,
            concurrency: 64,
        }
    }
}

impl TlsConfig {
    /// Returns the certificate and key paths when TLS is fully configured.
    pub fn material(&self) -> Option<(&Path, &Path)> {
        match (&self.cert_path, &self.key_path) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lanshare")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lanshare")
}

impl Config {
    /// Directory served over HTTP.
    pub fn root_dir(&self) -> PathBuf {
        self.server
            .root_dir
            .clone()
            .unwrap_or_else(|| self.daemon.data_dir.join("shared"))
    }

    /// Path of the allowed-address store.
    pub fn allowed_file(&self) -> PathBuf {
        self.access
            .allowed_file
            .clone()
            .unwrap_or_else(|| self.daemon.data_dir.join("allowed_ips.json"))
    }

    /// Path of the blocked-address store.
    pub fn blocked_file(&self) -> PathBuf {
        self.access
            .blocked_file
            .clone()
            .unwrap_or_else(|| self.daemon.data_dir.join("blocked_ips.json"))
    }

    /// Unix socket a running share listens on for access list commands.
    pub fn control_socket(&self) -> PathBuf {
        self.daemon.data_dir.join("lanshare.sock")
    }

    /// Grace period for in-flight requests on shutdown.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_grace_secs)
    }

    /// Bounded delay for gateway discovery.
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway.discovery_timeout_ms)
    }

    /// Per-port connect timeout for scans.
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan.timeout_ms)
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - LANSHARE_PORT: Override the server port
    /// - LANSHARE_ROOT: Override the served directory
    /// - LANSHARE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("LANSHARE_PORT") {
            if !port.is_empty() {
                match port.parse::<u16>() {
                    Ok(port) => {
                        tracing::info!("Overriding port from environment: {}", port);
                        self.server.port = port;
                    }
                    Err(e) => {
                        tracing::warn!("Ignoring invalid LANSHARE_PORT {:?}: {}", port, e);
                    }
                }
            }
        }

        if let Ok(root) = std::env::var("LANSHARE_ROOT") {
            if !root.is_empty() {
                tracing::info!("Overriding root_dir from environment: {}", root);
                self.server.root_dir = Some(PathBuf::from(root));
            }
        }

        if let Ok(level) = std::env::var("LANSHARE_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::InvalidPort(self.server.port));
        }

        if self.server.shutdown_grace_secs > 300 {
            return Err(ConfigError::InvalidShutdownGrace(
                self.server.shutdown_grace_secs,
            ));
        }

        let discovery = self.gateway.discovery_timeout_ms;
        if discovery == 0 || discovery > 10_000 {
            return Err(ConfigError::InvalidDiscoveryTimeout(discovery));
        }

        if self.scan.timeout_ms == 0 {
            return Err(ConfigError::InvalidScanTimeout(self.scan.timeout_ms));
        }

        if self.scan.concurrency == 0 || self.scan.concurrency > 1024 {
            return Err(ConfigError::InvalidScanConcurrency(self.scan.concurrency));
        }

        if self.tls.cert_path.is_some() != self.tls.key_path.is_some() {
            return Err(ConfigError::IncompleteTls);
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
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
