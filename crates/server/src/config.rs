//! Configuration management for the cloudshelf server.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/cloudshelf/config.toml`.

use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::accounts::Account;
use crate::files::ingest::{DEFAULT_MAX_FILE_SIZE, DEFAULT_UPLOAD_CONCURRENCY};
use crate::files::{ConflictPolicy, IngestOptions};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_file_size must be greater than 0, got {0}")]
    InvalidMaxFileSize(u64),

    #[error("upload_concurrency must be between 1 and 64, got {0}")]
    InvalidUploadConcurrency(usize),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("bind must be a socket address like 127.0.0.1:3000, got {0}")]
    InvalidBind(String),

    #[error("at least one account must have the admin role")]
    NoAdminAccount,

    #[error("duplicate account username: {0}")]
    DuplicateUsername(String),

    #[error("account username must not be empty or contain ':', got {0:?}")]
    InvalidUsername(String),

    #[error("password_sha256 for {0} must be 64 hex characters")]
    InvalidPasswordHash(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Largest accepted `upload_concurrency`.
const MAX_UPLOAD_CONCURRENCY: usize = 64;

/// Main configuration structure for the cloudshelf server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// HTTP server and process configuration.
    pub server: ServerConfig,

    /// Storage namespace configuration.
    pub storage: StorageConfig,

    /// Accounts allowed to sign in.
    pub auth: AuthConfig,
}

/// HTTP server and process configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP server listens on.
    pub bind: String,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for daily rolling log files. Logs go to stderr only when
    /// unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,

    /// Directory for server state (spool files, upload log).
    pub data_dir: PathBuf,

    /// Front-end files served for any path no API route claims.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub static_dir: Option<PathBuf>,
}

/// Storage namespace configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage root. Defaults to `<data_dir>/uploads`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,

    /// Maximum size of a single uploaded file in bytes (default: 500MB).
    pub max_file_size: u64,

    /// Items of one batch committed concurrently.
    pub upload_concurrency: usize,

    /// What to do when an upload's name is already taken.
    pub conflict_policy: ConflictPolicy,

    /// Age in seconds after which leftover staging and trash entries are
    /// swept.
    pub staging_max_age_secs: u64,
}

/// Accounts allowed to sign in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// Configured accounts. With none configured every request is refused.
    pub accounts: Vec<Account>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3000".to_string(),
            log_level: "info".to_string(),
            log_dir: None,
            data_dir: default_data_dir(),
            static_dir: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: None,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            upload_concurrency: DEFAULT_UPLOAD_CONCURRENCY,
            conflict_policy: ConflictPolicy::Rename,
            staging_max_age_secs: 3600, // 1 hour
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cloudshelf")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cloudshelf")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - CLOUDSHELF_STORAGE_ROOT: Override the storage root
    /// - CLOUDSHELF_BIND: Override the listen address
    /// - CLOUDSHELF_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("CLOUDSHELF_STORAGE_ROOT") {
            if !root.is_empty() {
                tracing::info!("Overriding storage root from environment: {}", root);
                self.storage.root = Some(PathBuf::from(root));
            }
        }

        if let Ok(bind) = std::env::var("CLOUDSHELF_BIND") {
            if !bind.is_empty() {
                tracing::info!("Overriding bind from environment: {}", bind);
                self.server.bind = bind;
            }
        }

        if let Ok(level) = std::env::var("CLOUDSHELF_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.server.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.max_file_size == 0 {
            return Err(ConfigError::InvalidMaxFileSize(self.storage.max_file_size));
        }

        let concurrency = self.storage.upload_concurrency;
        if !(1..=MAX_UPLOAD_CONCURRENCY).contains(&concurrency) {
            return Err(ConfigError::InvalidUploadConcurrency(concurrency));
        }

        let level = self.server.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.server.log_level.clone()));
        }

        if self.server.bind.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidBind(self.server.bind.clone()));
        }

        self.validate_accounts()
    }

    fn validate_accounts(&self) -> Result<(), ConfigError> {
        let accounts = &self.auth.accounts;
        let mut seen = HashSet::new();

        for account in accounts {
            if account.username.is_empty() || account.username.contains(':') {
                return Err(ConfigError::InvalidUsername(account.username.clone()));
            }
            if !seen.insert(account.username.as_str()) {
                return Err(ConfigError::DuplicateUsername(account.username.clone()));
            }
            let hash = &account.password_sha256;
            if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(ConfigError::InvalidPasswordHash(account.username.clone()));
            }
        }

        // A non-empty account list needs at least one admin.
        if !accounts.is_empty() && !accounts.iter().any(|a| a.role.is_admin()) {
            return Err(ConfigError::NoAdminAccount);
        }

        Ok(())
    }

    /// Storage root, falling back to `<data_dir>/uploads`.
    pub fn storage_root(&self) -> PathBuf {
        self.storage
            .root
            .clone()
            .unwrap_or_else(|| self.server.data_dir.join("uploads"))
    }

    /// Directory multipart parts are spooled into while a request is read.
    pub fn spool_dir(&self) -> PathBuf {
        self.server.data_dir.join("spool")
    }

    /// Location of the JSON Lines upload log.
    pub fn audit_log_path(&self) -> PathBuf {
        self.server.data_dir.join("uploads.log")
    }

    /// Age after which leftover staging entries are swept.
    pub fn staging_max_age(&self) -> Duration {
        Duration::from_secs(self.storage.staging_max_age_secs)
    }

    /// Ingestion options derived from the storage section.
    pub fn ingest_options(&self) -> IngestOptions {
        IngestOptions {
            max_file_size: self.storage.max_file_size,
            concurrency: self.storage.upload_concurrency,
            conflict_policy: self.storage.conflict_policy,
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
