use serde::Deserialize;
use std::time::Duration;

use crate::services::retry::RetryPolicy;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// API bind address (e.g., "0.0.0.0:3000"). Unused by the worker.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Seconds between detector polls
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Number of worker slots in the pool
    #[serde(default = "default_worker_capacity")]
    pub worker_capacity: usize,

    /// Upload attempts before a job is marked failed
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Maximum due jobs promoted per detector tick
    #[serde(default = "default_detector_batch_limit")]
    pub detector_batch_limit: i64,

    /// Platform upload endpoint (worker only)
    #[serde(default)]
    pub upload_endpoint: String,

    /// Bearer token for the upload endpoint (worker only)
    #[serde(default)]
    pub upload_api_token: String,

    #[serde(default = "default_upload_timeout_secs")]
    pub upload_timeout_secs: u64,

    /// Prometheus listener of the worker process
    #[serde(default = "default_worker_metrics_addr")]
    pub worker_metrics_addr: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_worker_capacity() -> usize {
    3
}

fn default_retry_ceiling() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_cap_ms() -> u64 {
    60_000
}

fn default_detector_batch_limit() -> i64 {
    100
}

fn default_upload_timeout_secs() -> u64 {
    300
}

fn default_worker_metrics_addr() -> String {
    "0.0.0.0:9100".to_string()
}

/// Scalar settings consumed by the detector, worker pool and pipeline.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub capacity: usize,
    pub batch_limit: i64,
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(default_poll_interval_secs()),
            capacity: default_worker_capacity(),
            batch_limit: default_detector_batch_limit(),
            retry: RetryPolicy::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn scheduler(&self) -> Result<SchedulerConfig, ConfigError> {
        if self.worker_capacity == 0 {
            return Err(ConfigError::Invalid("WORKER_CAPACITY must be at least 1"));
        }
        if self.retry_ceiling == 0 {
            return Err(ConfigError::Invalid("RETRY_CEILING must be at least 1"));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("POLL_INTERVAL_SECS must be at least 1"));
        }
        if self.detector_batch_limit <= 0 {
            return Err(ConfigError::Invalid("DETECTOR_BATCH_LIMIT must be positive"));
        }

        Ok(SchedulerConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            capacity: self.worker_capacity,
            batch_limit: self.detector_batch_limit,
            retry: RetryPolicy::new(
                self.retry_ceiling,
                Duration::from_millis(self.backoff_base_ms),
                Duration::from_millis(self.backoff_cap_ms),
            ),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
