//! Configuration management for the synchronizer.
//!
//! Loads configuration from a TOML file; command-line flags are applied on top
//! by the binary.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Delete destination subvolumes and directories with no source counterpart
    #[serde(default)]
    pub delete_strays: bool,

    /// Log the plan without changing the destination
    #[serde(default)]
    pub dry_run: bool,

    /// Ask for confirmation before irreversible batch deletions
    #[serde(default)]
    pub interactive: bool,

    /// Continue with the remaining plan after a failed transfer
    #[serde(default)]
    pub ignore_errors: bool,

    /// Destination path prefixes that are never inspected or deleted
    #[serde(default)]
    pub protected_paths: Vec<String>,

    /// Top-level destination directories kept even without a source match
    #[serde(default = "default_keep_dirs")]
    pub keep_dirs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Log throughput while a stream is running
    #[serde(default = "default_progress")]
    pub progress: bool,

    /// Milliseconds between throughput log lines
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Report filesystem stats after this many completed tasks (0 = start/end only)
    #[serde(default = "default_stats_interval")]
    pub interval: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_keep_dirs() -> Vec<String> {
    vec!["_urbcb_misc_backups".to_string()]
}

fn default_progress() -> bool {
    true
}

fn default_progress_interval_ms() -> u64 {
    5_000
}

fn default_stats_interval() -> usize {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            delete_strays: false,
            dry_run: false,
            interactive: false,
            ignore_errors: false,
            protected_paths: Vec::new(),
            keep_dirs: default_keep_dirs(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            progress: default_progress(),
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval: default_stats_interval(),
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

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl SyncConfig {
    /// True if `path` lies under one of the protected prefixes
    pub fn is_protected(&self, path: &str) -> bool {
        self.protected_paths.iter().any(|prefix| {
            let prefix = prefix.trim_end_matches('/');
            path == prefix || path.starts_with(&format!("{}/", prefix))
        })
    }
}
