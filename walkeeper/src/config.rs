//! Configuration management.
//!
//! Loads configuration from an optional TOML file with `WALKEEPER_`
//! environment variable overrides (`WALKEEPER_STORE__URL`,
//! `WALKEEPER_TRANSFER__CONCURRENCY`, ...).

use crate::utils::errors::{ArchiveError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub codec: CodecConfig,
    #[serde(default)]
    pub wal: WalConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Object store location: `file:///path`, a bare path, or `http(s)://...`
    #[serde(default)]
    pub url: Option<String>,

    /// Prefix prepended to every object key
    #[serde(default)]
    pub prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Number of partitions or segments moved in parallel
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Attempts per object before a transient failure becomes fatal
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Target size of one tar partition in bytes (default: 1GiB)
    #[serde(default = "default_partition_budget")]
    pub partition_budget: u64,

    /// Record a SHA-256 per regular file in the manifest
    #[serde(default = "default_record_checksums")]
    pub record_checksums: bool,

    /// File or directory names never archived
    #[serde(default = "default_exclude_names")]
    pub exclude_names: Vec<String>,

    /// Directories archived as empty structure markers, without contents
    #[serde(default = "default_skip_contents_of")]
    pub skip_contents_of: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecConfig {
    /// Compression algorithm (zstd, none)
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Compression level (1-22 for zstd)
    #[serde(default = "default_compression_level")]
    pub level: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    /// Segments fetched ahead of the one requested (0 disables prefetch)
    #[serde(default = "default_prefetch_window")]
    pub prefetch_window: usize,

    /// Maximum number of completed segments kept in the prefetch cache
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// WAL segment size in bytes (default: 16MiB)
    #[serde(default = "default_segment_size")]
    pub segment_size: u64,

    /// State directory created inside the WAL directory
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// A download whose running file has not been touched for this long is
    /// considered abandoned (default: 15s)
    #[serde(default = "default_stale_running_ms")]
    pub stale_running_ms: u64,

    /// Longest a fetch waits for another process downloading the same
    /// segment (default: 60s)
    #[serde(default = "default_foreign_wait_ms")]
    pub foreign_wait_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_concurrency() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    250
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_partition_budget() -> u64 {
    1024 * 1024 * 1024 // 1GiB
}

fn default_record_checksums() -> bool {
    true
}

fn default_exclude_names() -> Vec<String> {
    vec!["postmaster.pid".to_string(), "postmaster.opts".to_string()]
}

fn default_skip_contents_of() -> Vec<String> {
    vec!["pg_wal".to_string(), "pg_xlog".to_string()]
}

fn default_compression() -> String {
    "zstd".to_string()
}

fn default_compression_level() -> i32 {
    3
}

fn default_prefetch_window() -> usize {
    8
}

fn default_cache_capacity() -> usize {
    32
}

fn default_segment_size() -> u64 {
    16 * 1024 * 1024 // 16MiB
}

fn default_state_dir() -> String {
    ".walkeeper".to_string()
}

fn default_stale_running_ms() -> u64 {
    15_000
}

fn default_foreign_wait_ms() -> u64 {
    60_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            partition_budget: default_partition_budget(),
            record_checksums: default_record_checksums(),
            exclude_names: default_exclude_names(),
            skip_contents_of: default_skip_contents_of(),
        }
    }
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            compression: default_compression(),
            level: default_compression_level(),
        }
    }
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            prefetch_window: default_prefetch_window(),
            cache_capacity: default_cache_capacity(),
            segment_size: default_segment_size(),
            state_dir: default_state_dir(),
            stale_running_ms: default_stale_running_ms(),
            foreign_wait_ms: default_foreign_wait_ms(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl TransferConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl WalConfig {
    pub fn stale_running_after(&self) -> Duration {
        Duration::from_millis(self.stale_running_ms)
    }

    pub fn foreign_wait_limit(&self) -> Duration {
        Duration::from_millis(self.foreign_wait_ms)
    }
}

impl Config {
    /// Load configuration from an optional TOML file layered with the
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix("WALKEEPER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ArchiveError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make transfers misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.transfer.concurrency == 0 {
            return Err(ArchiveError::Config(
                "transfer.concurrency must be at least 1".into(),
            ));
        }
        if self.transfer.max_attempts == 0 {
            return Err(ArchiveError::Config(
                "transfer.max_attempts must be at least 1".into(),
            ));
        }
        if self.backup.partition_budget == 0 {
            return Err(ArchiveError::Config(
                "backup.partition_budget must be positive".into(),
            ));
        }
        let segment_size = self.wal.segment_size;
        if !segment_size.is_power_of_two() || segment_size > (1 << 32) || segment_size < (1 << 20)
        {
            return Err(ArchiveError::Config(format!(
                "wal.segment_size {} must be a power of two between 1MiB and 4GiB",
                segment_size
            )));
        }
        if self.wal.state_dir.is_empty() || self.wal.state_dir.contains('/') {
            return Err(ArchiveError::Config(
                "wal.state_dir must be a single directory name".into(),
            ));
        }
        if self.wal.stale_running_ms == 0 {
            return Err(ArchiveError::Config(
                "wal.stale_running_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    /// The configured store URL, required by every command.
    pub fn store_url(&self) -> Result<&str> {
        self.store
            .url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                ArchiveError::Config(
                    "no object store configured (set store.url, WALKEEPER_STORE__URL or --store)"
                        .into(),
                )
            })
    }
}
