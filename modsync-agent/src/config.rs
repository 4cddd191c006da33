//! Configuration management for the sync agent.
//!
//! Loads configuration from a TOML file with `MODSYNC_*` environment variable
//! overrides (`MODSYNC_SERVER__URL`, `MODSYNC_SYNC__MAX_WORKERS`, ...). Every
//! field has a default, so an empty or missing file is valid.

use crate::backup::VaultOptions;
use crate::transfer::strategy::{ConnectionQuality, ProfileParams, StrategyMode};
use crate::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "MODSYNC";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// File server base URL
    #[serde(default = "default_server_url")]
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Write buffer size in bytes (default: 128KB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Connect/metadata timeout and per-chunk stall timeout, in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Upper bound on one streaming download, in seconds
    #[serde(default = "default_stream_timeout_secs")]
    pub stream_timeout_secs: u64,

    /// Attempts per file
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base retry delay in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Worker cap for the custom strategy and for parallel ranges
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Local files above this size are compared by size only
    #[serde(default = "default_hash_size_limit")]
    pub hash_size_limit: u64,

    /// How long a fetched manifest is reused, in seconds
    #[serde(default = "default_manifest_ttl_secs")]
    pub manifest_ttl_secs: u64,

    /// Delete local files absent from the remote manifest
    #[serde(default = "default_true")]
    pub delete_unmatched: bool,

    /// Reuse partial temp files from interrupted transfers
    #[serde(default = "default_true")]
    pub resume: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// auto, stable_sequential, balanced_adaptive, fast_optimized or custom
    #[serde(default)]
    pub mode: StrategyMode,

    /// Skip the speed probe and assume this quality
    #[serde(default)]
    pub connection_quality: Option<ConnectionQuality>,

    /// Server resources timed to classify the connection
    #[serde(default = "default_probe_paths")]
    pub probe_paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Snapshot affected files before mutating
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Backups directory (default: `<root>/.modsync_backups`)
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Snapshots to keep
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,

    /// Free space required beyond 120% of the snapshot size, in bytes
    #[serde(default = "default_safety_margin")]
    pub safety_margin_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_server_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_chunk_size() -> usize {
    128 * 1024 // 128KB
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_stream_timeout_secs() -> u64 {
    3600
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_max_workers() -> usize {
    4
}

fn default_hash_size_limit() -> u64 {
    100 * 1024 * 1024 // 100MB
}

fn default_manifest_ttl_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_probe_paths() -> Vec<String> {
    vec![
        "/speed_test_100kb.bin".to_string(),
        "/speed_test_1mb.bin".to_string(),
    ]
}

fn default_max_backups() -> usize {
    5
}

fn default_safety_margin() -> u64 {
    100 * 1024 * 1024 // 100MB
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { url: default_server_url() }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            timeout_secs: default_timeout_secs(),
            stream_timeout_secs: default_stream_timeout_secs(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            max_workers: default_max_workers(),
            hash_size_limit: default_hash_size_limit(),
            manifest_ttl_secs: default_manifest_ttl_secs(),
            delete_unmatched: true,
            resume: true,
        }
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            mode: StrategyMode::default(),
            connection_quality: None,
            probe_paths: default_probe_paths(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            max_backups: default_max_backups(),
            safety_margin_bytes: default_safety_margin(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

impl Config {
    /// Load configuration from an optional TOML file plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::load(Some(path))
    }

    /// Parse a TOML document without consulting the environment.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| SyncError::Config(e.to_string()))
    }

    fn validate(&self) -> Result<()> {
        if self.server.url.trim().is_empty() {
            return Err(SyncError::Config("server.url must not be empty".into()));
        }
        if self.sync.timeout_secs == 0 || self.sync.stream_timeout_secs == 0 {
            return Err(SyncError::Config("timeouts must be positive".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.timeout_secs)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.stream_timeout_secs)
    }

    pub fn manifest_ttl(&self) -> Duration {
        Duration::from_secs(self.sync.manifest_ttl_secs)
    }

    /// Raw values for the `custom` strategy mode.
    pub fn custom_profile_params(&self) -> ProfileParams {
        ProfileParams {
            chunk_size: self.sync.chunk_size,
            max_workers: self.sync.max_workers,
            tier_workers: None,
            retry_count: self.sync.max_retries,
            retry_delay: Duration::from_millis(self.sync.retry_delay_ms),
            timeout_secs: self.sync.timeout_secs,
            resume_enabled: self.sync.resume,
        }
    }

    pub fn vault_options(&self) -> VaultOptions {
        VaultOptions {
            dir: self.backup.dir.clone(),
            max_backups: self.backup.max_backups,
            safety_margin: self.backup.safety_margin_bytes,
        }
    }
}
