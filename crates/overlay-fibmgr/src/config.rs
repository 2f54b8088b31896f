//! FIB manager configuration.
//!
//! Values come from an optional JSON file; command line flags of the
//! daemon override individual fields afterwards.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FibConfig {
    /// Size of the job worker pool.
    pub worker_count: usize,
    /// Retries of a job failing with a store or backend error.
    pub job_max_retries: u32,
    /// Backoff between two attempts of the same job.
    pub job_retry_backoff_ms: u64,
    /// A BGP batch is flushed as soon as it holds this many routes.
    pub bgp_batch_size: usize,
    /// A non-empty BGP batch is flushed after this window.
    pub bgp_batch_interval_ms: u64,
    /// Upper bound of route paths for a load-balanced BGP route.
    pub max_bgp_ecmp_paths: usize,
    /// Interval at which parked remote installs are retried.
    pub pending_retry_interval_ms: u64,
    pub label_pool: String,
    pub group_pool: String,
    /// FIB rules are installed at `fib_priority_base + prefix length`.
    pub fib_priority_base: u16,
    pub lfib_priority: u16,
    pub tunnel_termination_priority: u16,
    pub subnet_broadcast_drop_priority: u16,
}

impl Default for FibConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            job_max_retries: 3,
            job_retry_backoff_ms: 100,
            bgp_batch_size: 1000,
            bgp_batch_interval_ms: 500,
            max_bgp_ecmp_paths: 2,
            pending_retry_interval_ms: 5000,
            label_pool: "vpnservices".to_string(),
            group_pool: "nexthopgroups".to_string(),
            fib_priority_base: 10,
            lfib_priority: 10,
            tunnel_termination_priority: 5,
            subnet_broadcast_drop_priority: 100,
        }
    }
}

impl FibConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: FibConfig = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid("worker_count must be at least 1".into()));
        }
        if self.bgp_batch_size == 0 {
            return Err(ConfigError::Invalid("bgp_batch_size must be at least 1".into()));
        }
        if self.bgp_batch_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "bgp_batch_interval_ms must be at least 1".into(),
            ));
        }
        if self.max_bgp_ecmp_paths == 0 {
            return Err(ConfigError::Invalid(
                "max_bgp_ecmp_paths must be at least 1".into(),
            ));
        }
        if self.label_pool.is_empty() || self.group_pool.is_empty() {
            return Err(ConfigError::Invalid("ID pool names must not be empty".into()));
        }
        Ok(())
    }

    /// FIB priority for a prefix, longer prefixes win.
    pub fn fib_priority(&self, prefix_len: u8) -> u16 {
        self.fib_priority_base.saturating_add(u16::from(prefix_len))
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.bgp_batch_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.job_retry_backoff_ms)
    }

    pub fn pending_retry_interval(&self) -> Duration {
        Duration::from_millis(self.pending_retry_interval_ms)
    }
}
