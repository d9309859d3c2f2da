use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::constants::MAX_ENQUEUES_PER_RUN;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database. Defaults to the user data dir.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Settings for one watcher/worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Deployment environment this runner serves.
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Maximum concurrent IDLE connections held by this process.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Watcher reconciliation interval in seconds.
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    /// Watch lease TTL in seconds.
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: i64,
    /// IDLE subscriptions are re-issued at this interval to dodge
    /// server-imposed idle-session timeouts.
    #[serde(default = "default_reissue_interval")]
    pub reissue_interval_secs: u64,
    /// Window within which bursts of push notifications collapse into
    /// a single poll trigger.
    #[serde(default = "default_debounce_window")]
    pub debounce_window_secs: i64,
    /// Number of in-process queue workers executing poll passes.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            capacity: default_capacity(),
            scan_interval_secs: default_scan_interval(),
            lease_ttl_secs: default_lease_ttl(),
            reissue_interval_secs: default_reissue_interval(),
            debounce_window_secs: default_debounce_window(),
            workers: default_workers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Seconds between self-scheduled dispatcher ticks in `run` mode.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// Upper bound on jobs submitted per tick.
    #[serde(default = "default_max_enqueues")]
    pub max_enqueues_per_run: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            max_enqueues_per_run: default_max_enqueues(),
        }
    }
}

fn default_environment() -> String {
    "production".to_string()
}

fn default_capacity() -> usize {
    50
}

fn default_scan_interval() -> u64 {
    60
}

fn default_lease_ttl() -> i64 {
    120
}

fn default_reissue_interval() -> u64 {
    25 * 60
}

fn default_debounce_window() -> i64 {
    10
}

fn default_workers() -> usize {
    4
}

fn default_tick_interval() -> u64 {
    30
}

fn default_max_enqueues() -> usize {
    MAX_ENQUEUES_PER_RUN
}

impl Config {
    pub fn config_dir() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("mailsync");
        Ok(dir)
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load the config file, falling back to defaults when absent.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        Ok(config)
    }

    /// Resolve the database path, creating parent directories.
    pub fn database_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.store.path {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            return Ok(path.clone());
        }
        let dir = dirs::data_dir()
            .context("Could not determine data directory")?
            .join("mailsync");
        fs::create_dir_all(&dir)?;
        Ok(dir.join("mailsync.db"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.runner.environment, "production");
        assert!(config.runner.capacity > 0);
        assert!(config.runner.lease_ttl_secs > 0);
        assert!(config.dispatch.max_enqueues_per_run > 0);
    }

    #[test]
    fn parses_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [runner]
            environment = "staging"
            capacity = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.runner.environment, "staging");
        assert_eq!(config.runner.capacity, 10);
        // Unspecified fields keep their defaults
        assert_eq!(config.runner.scan_interval_secs, 60);
        assert_eq!(config.dispatch.tick_interval_secs, 30);
    }
}
