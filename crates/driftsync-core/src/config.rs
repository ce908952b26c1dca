//! Configuration management for driftsync
//!
//! Handles loading and validation of `driftsync.toml` files. Every section
//! and every key is optional; missing values fall back to defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// Flush and retry policy
    #[serde(default)]
    pub sync: SyncConfig,

    /// Session guard settings
    #[serde(default)]
    pub auth: AuthConfig,

    /// Recovery trigger timings
    #[serde(default)]
    pub recovery: RecoveryConfig,

    /// Inspector buffer sizes
    #[serde(default)]
    pub inspector: InspectorConfig,

    /// Durable storage location
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging output
    #[serde(default)]
    pub logging: LogConfig,
}

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected one of: pretty, json")),
        }
    }
}

/// Flush orchestrator policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
    /// Remote table records are written to
    pub table: String,
    /// Failed attempts tolerated before an item is dropped
    pub max_retries: u32,
    /// Coarse liveness timeout for a whole flush session
    pub watchdog_ms: u64,
    /// Hard timeout for each remote upsert
    pub upsert_timeout_ms: u64,
    /// Hard timeout for the remote read during merge
    pub select_timeout_ms: u64,
    /// Hard timeout for best-effort remote deletes
    pub delete_timeout_ms: u64,
    /// Pause before the single in-loop retry of a transient failure
    pub transient_backoff_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            table: "records".to_string(),
            max_retries: 3,
            watchdog_ms: 30_000,
            upsert_timeout_ms: 25_000,
            select_timeout_ms: 25_000,
            delete_timeout_ms: 25_000,
            transient_backoff_ms: 800,
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub fn watchdog(&self) -> Duration {
        Duration::from_millis(self.watchdog_ms)
    }

    #[must_use]
    pub fn upsert_timeout(&self) -> Duration {
        Duration::from_millis(self.upsert_timeout_ms)
    }

    #[must_use]
    pub fn select_timeout(&self) -> Duration {
        Duration::from_millis(self.select_timeout_ms)
    }

    #[must_use]
    pub fn delete_timeout(&self) -> Duration {
        Duration::from_millis(self.delete_timeout_ms)
    }

    #[must_use]
    pub fn transient_backoff(&self) -> Duration {
        Duration::from_millis(self.transient_backoff_ms)
    }
}

/// Session guard settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuthConfig {
    /// Bound on a single refresh call
    pub refresh_timeout_ms: u64,
    /// Sessions expiring within this window are refreshed proactively
    pub refresh_margin_ms: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            refresh_timeout_ms: 10_000,
            refresh_margin_ms: 60_000,
        }
    }
}

/// Recovery trigger timings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Window that collapses bursts of signals into one run
    pub debounce_ms: u64,
    /// Minimum spacing between two executed recovery runs
    pub min_interval_ms: u64,
    /// Pause after the auth warm-up so the network stack can settle
    pub stabilize_delay_ms: u64,
    /// Delay of the follow-up flush when the queue is still non-empty
    pub secondary_retry_ms: u64,
    /// Period of the suspension-detection ticker
    pub tick_interval_ms: u64,
    /// Wall-clock gap between ticks that counts as a suspension
    pub time_jump_threshold_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 1_000,
            min_interval_ms: 2_000,
            stabilize_delay_ms: 1_200,
            secondary_retry_ms: 1_500,
            tick_interval_ms: 5_000,
            time_jump_threshold_ms: 15_000,
        }
    }
}

impl RecoveryConfig {
    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    #[must_use]
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    #[must_use]
    pub fn stabilize_delay(&self) -> Duration {
        Duration::from_millis(self.stabilize_delay_ms)
    }

    #[must_use]
    pub fn secondary_retry(&self) -> Duration {
        Duration::from_millis(self.secondary_retry_ms)
    }

    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Inspector buffer sizes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InspectorConfig {
    /// Entries kept in the log ring
    pub log_capacity: usize,
    /// Lag tolerated by live log subscribers before they miss entries
    pub broadcast_capacity: usize,
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self {
            log_capacity: 200,
            broadcast_capacity: 256,
        }
    }
}

/// Durable storage location
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database path
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            db_path: base.join("driftsync").join("driftsync.db"),
        }
    }
}

impl Config {
    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Load from `path` when given, otherwise from the default location if it
    /// exists, otherwise defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load_from(path);
        }
        match default_config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.table.trim().is_empty() {
            return Err(ConfigError::Invalid("sync.table must not be empty".into()));
        }
        if self.sync.watchdog_ms == 0 {
            return Err(ConfigError::Invalid("sync.watchdog_ms must be >= 1".into()));
        }
        if self.sync.upsert_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "sync.upsert_timeout_ms must be >= 1".into(),
            ));
        }
        if self.sync.upsert_timeout_ms >= self.sync.watchdog_ms {
            return Err(ConfigError::Invalid(
                "sync.upsert_timeout_ms must be shorter than sync.watchdog_ms".into(),
            ));
        }
        if self.recovery.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "recovery.tick_interval_ms must be >= 1".into(),
            ));
        }
        if self.recovery.time_jump_threshold_ms <= self.recovery.tick_interval_ms {
            return Err(ConfigError::Invalid(
                "recovery.time_jump_threshold_ms must exceed recovery.tick_interval_ms".into(),
            ));
        }
        if self.inspector.log_capacity == 0 || self.inspector.broadcast_capacity == 0 {
            return Err(ConfigError::Invalid(
                "inspector capacities must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

/// `$XDG_CONFIG_HOME/driftsync/driftsync.toml` (or platform equivalent)
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("driftsync").join("driftsync.toml"))
}
