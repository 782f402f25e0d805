//! Configuration records and loaders.
//!
//! Every tunable enters through an explicit, immutable config record with
//! documented defaults; constructors validate at build time and reject
//! bad values with [`ConfigError`] before any work starts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ============================================================
// EXECUTOR / PROCESSOR
// ============================================================

/// Tunables for one executor and its processor.
///
/// | Field | Default | Meaning |
/// |-------|---------|---------|
/// | `queue_capacity` | 100 | Max queued events; also the per-cycle dispatch budget |
/// | `capacity_refresh_time` | 1.0s | Pause between processing cycles |
/// | `interval` | = refresh time | Budget replenishment period |
/// | `limit_requests` | none | Requests admitted per interval |
/// | `limit_tokens` | none | Tokens admitted per interval |
/// | `concurrency_limit` | = queue capacity | Max invocations in flight |
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub queue_capacity: usize,
    /// Seconds between processing cycles.
    pub capacity_refresh_time: f64,
    /// Replenishment period in seconds; defaults to the refresh time.
    pub interval: Option<f64>,
    pub limit_requests: Option<u64>,
    pub limit_tokens: Option<u64>,
    pub concurrency_limit: Option<usize>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            capacity_refresh_time: 1.0,
            interval: None,
            limit_requests: None,
            limit_tokens: None,
            concurrency_limit: None,
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        if self.capacity_refresh_time <= 0.0 {
            return Err(ConfigError::NonPositiveRefreshTime(
                self.capacity_refresh_time,
            ));
        }
        if let Some(interval) = self.interval {
            if interval <= 0.0 {
                return Err(ConfigError::NonPositiveInterval(interval));
            }
        }
        if self.concurrency_limit == Some(0) {
            return Err(ConfigError::ZeroConcurrencyLimit);
        }
        Ok(())
    }

    pub fn refresh_time(&self) -> Duration {
        Duration::from_secs_f64(self.capacity_refresh_time)
    }

    /// The replenishment period, falling back to the refresh time.
    pub fn effective_interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval.unwrap_or(self.capacity_refresh_time))
    }

    /// The in-flight task ceiling, falling back to the queue capacity.
    pub fn concurrency(&self) -> usize {
        self.concurrency_limit.unwrap_or(self.queue_capacity)
    }
}

// ============================================================
// RETRY POLICY
// ============================================================

/// Tunables for the retry wrapper around each invocation.
///
/// Delays are deterministic (no jitter) so test timings stay
/// reproducible.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt; the wrapped call runs at most
    /// `max_retries + 1` times. Zero is rejected.
    pub max_retries: u32,
    /// Seconds for the first backoff step.
    pub base_delay: f64,
    /// Ceiling in seconds for any single sleep, server hints included.
    pub max_delay: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: 1.0,
            max_delay: 60.0,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::ZeroMaxRetries);
        }
        Ok(())
    }

    pub fn max_delay_duration(&self) -> Duration {
        Duration::from_secs_f64(self.max_delay.max(0.0))
    }

    /// `min(base_delay * 2^attempt, max_delay)` as a duration.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.max(0.0) * 2f64.powi(attempt.min(63) as i32);
        Duration::from_secs_f64(exp.min(self.max_delay.max(0.0)))
    }
}

// ============================================================
// JOURNAL SINK
// ============================================================

/// On-disk format for flushed journal files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalFormat {
    Json,
    Csv,
}

/// Tunables for the append-only event journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    pub dir: PathBuf,
    pub prefix: String,
    pub format: JournalFormat,
    /// Buffered records before an automatic flush.
    pub capacity: usize,
    /// Embed a UTC timestamp in flushed file names.
    pub with_timestamp: bool,
    /// Embed a short content hash in flushed file names.
    pub with_hash: bool,
    /// Flush whatever is buffered on shutdown.
    pub dump_at_exit: bool,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/journal"),
            prefix: "events".to_string(),
            format: JournalFormat::Json,
            capacity: 128,
            with_timestamp: true,
            with_hash: true,
            dump_at_exit: true,
        }
    }
}

impl JournalConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::ZeroJournalCapacity);
        }
        Ok(())
    }
}

// ============================================================
// APPLICATION
// ============================================================

/// Top-level application configuration, loadable from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log_dir: String,
    pub log_file: String,
    /// Default `EnvFilter` directive; `RUST_LOG` overrides it.
    pub log_level: String,
    /// File rotation: "never", "daily" or "hourly".
    pub rotation: String,
    pub use_json: bool,
    /// When false, the crate's own target is filtered out of the logs.
    pub enable_tracing: bool,
    pub executor: ExecutorConfig,
    pub retry: RetryConfig,
    pub journal: JournalConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_dir: "./logs".to_string(),
            log_file: "flowgate.log".to_string(),
            log_level: "info".to_string(),
            rotation: "daily".to_string(),
            use_json: false,
            enable_tracing: true,
            executor: ExecutorConfig::default(),
            retry: RetryConfig::default(),
            journal: JournalConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load and validate a YAML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: AppConfig = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.executor.validate()?;
        self.retry.validate()?;
        self.journal.validate()?;
        Ok(())
    }
}
