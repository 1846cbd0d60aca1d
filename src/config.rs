//! Engine configuration.
//!
//! Configuration can be loaded from:
//! 1. A TOML file (path in `TASKMILL_CONFIG`, or given explicitly)
//! 2. Environment variables (with `TASKMILL_` prefix)
//!
//! Environment variables override TOML configuration.
//!
//! # Example TOML Configuration
//!
//! ```toml
//! [taskmill]
//! cpu_workers = 4
//! io_workers = 16
//! default_timeout_secs = 120
//! retention_days = 3
//! auto_retry = true
//! ```
//!
//! Retry and timeout policies are code-level objects
//! ([`RetryConfig`](crate::retry::RetryConfig),
//! [`TimeoutConfig`](crate::timeout::TimeoutConfig)) and are passed to the
//! engine builder directly.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::{
    DEFAULT_CANCEL_ACK_TIMEOUT_MS, DEFAULT_CLEANUP_INTERVAL_SECS, DEFAULT_MAX_RETRIES,
    DEFAULT_MAX_TASKS_PER_CHILD, DEFAULT_RETENTION_DAYS, DEFAULT_TIMEOUT_SECS,
    DEFAULT_TIMEOUT_SWEEP_INTERVAL_SECS, ENV_PREFIX,
};
use crate::executor::ExecutorConfig;

/// Environment variable naming the config file read by [`EngineConfig::load`].
pub const CONFIG_PATH_ENV: &str = "TASKMILL_CONFIG";

/// Runtime settings of a [`TaskEngine`](crate::engine::TaskEngine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// CPU pool size. `0` means one per core.
    pub cpu_workers: usize,
    /// IO pool size. `0` means four per core.
    pub io_workers: usize,
    /// Jobs per CPU worker before it is replaced.
    pub max_tasks_per_child: u64,
    /// Fallback hard timeout in seconds.
    pub default_timeout_secs: u64,
    /// Retry budget for tasks submitted without one.
    pub default_max_retries: u32,
    /// Seconds between retention sweeps.
    pub cleanup_interval_secs: u64,
    /// Terminal tasks older than this many days are purged.
    pub retention_days: u64,
    /// Seconds between timeout sweeps.
    pub timeout_sweep_interval_secs: u64,
    /// How long `cancel` waits for a running driver, in milliseconds.
    pub cancel_ack_timeout_ms: u64,
    /// Retry retryable failures without a caller asking.
    pub auto_retry: bool,
    /// Run the cleanup and timeout loops after `start`.
    pub enable_background_tasks: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cpu_workers: 0,
            io_workers: 0,
            max_tasks_per_child: DEFAULT_MAX_TASKS_PER_CHILD,
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
            default_max_retries: DEFAULT_MAX_RETRIES,
            cleanup_interval_secs: DEFAULT_CLEANUP_INTERVAL_SECS,
            retention_days: DEFAULT_RETENTION_DAYS,
            timeout_sweep_interval_secs: DEFAULT_TIMEOUT_SWEEP_INTERVAL_SECS,
            cancel_ack_timeout_ms: DEFAULT_CANCEL_ACK_TIMEOUT_MS,
            auto_retry: false,
            enable_background_tasks: true,
        }
    }
}

impl EngineConfig {
    /// Reads the file named by `TASKMILL_CONFIG` if set, then applies
    /// environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_toml(&read(Path::new(&path))?)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Reads `path` and applies environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::from_toml(&read(path.as_ref())?)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parses the `[taskmill]` table of a TOML document. A missing table
    /// yields the defaults.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        #[derive(Deserialize)]
        struct FullConfig {
            #[serde(default)]
            taskmill: EngineConfig,
        }

        let full: FullConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(full.taskmill)
    }

    /// Applies `TASKMILL_*` environment variables.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(format!("{ENV_PREFIX}{key}")).ok());
    }

    /// Applies overrides from `lookup`, keyed without the prefix.
    /// Unparseable values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn set<T: std::str::FromStr>(slot: &mut T, value: Option<String>, key: &str) {
            let Some(raw) = value else {
                return;
            };
            match raw.parse() {
                Ok(v) => *slot = v,
                Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable config override"),
            }
        }

        set(&mut self.cpu_workers, lookup("CPU_WORKERS"), "CPU_WORKERS");
        set(&mut self.io_workers, lookup("IO_WORKERS"), "IO_WORKERS");
        set(
            &mut self.max_tasks_per_child,
            lookup("MAX_TASKS_PER_CHILD"),
            "MAX_TASKS_PER_CHILD",
        );
        set(
            &mut self.default_timeout_secs,
            lookup("DEFAULT_TIMEOUT_SECS"),
            "DEFAULT_TIMEOUT_SECS",
        );
        set(
            &mut self.cleanup_interval_secs,
            lookup("CLEANUP_INTERVAL_SECS"),
            "CLEANUP_INTERVAL_SECS",
        );
        set(&mut self.retention_days, lookup("RETENTION_DAYS"), "RETENTION_DAYS");
        set(
            &mut self.timeout_sweep_interval_secs,
            lookup("TIMEOUT_SWEEP_INTERVAL_SECS"),
            "TIMEOUT_SWEEP_INTERVAL_SECS",
        );
        set(&mut self.auto_retry, lookup("AUTO_RETRY"), "AUTO_RETRY");
    }

    /// Pool sizing for the executor.
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            cpu_workers: self.cpu_workers,
            io_workers: self.io_workers,
            max_tasks_per_child: self.max_tasks_per_child,
        }
    }

    /// Fallback hard timeout.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    /// Interval of the retention loop.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    /// Age at which terminal tasks are purged.
    pub fn retention(&self) -> chrono::Duration {
        i64::try_from(self.retention_days)
            .ok()
            .and_then(chrono::Duration::try_days)
            .unwrap_or(chrono::Duration::MAX)
    }

    /// Interval of the timeout loop.
    pub fn timeout_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.timeout_sweep_interval_secs.max(1))
    }

    /// How long `cancel` waits for a running driver.
    pub fn cancel_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_ack_timeout_ms)
    }
}

fn read(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        error: e.to_string(),
    })
}

/// Configuration loading error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file '{path}': {error}")]
    Io {
        /// Path to the configuration file.
        path: String,
        /// Error message.
        error: String,
    },
    /// The TOML was malformed or had wrong types.
    #[error("failed to parse config: {0}")]
    Parse(String),
}
