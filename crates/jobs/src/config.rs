//! Engine configuration: per-queue settings, watchdogs, and host options.
//!
//! JSON, camelCase keys. Durations are given in (possibly fractional) seconds.
//!
//! ```json
//! {
//!   "host": { "shutdownGraceSeconds": 30 },
//!   "queues": {
//!     "export": { "maxConcurrentRunning": 4, "heartbeatTimeoutSeconds": 60 }
//!   },
//!   "watchdogs": {
//!     "watchdog-stale-leases": { "periodSec": 30, "leasePeriodSec": 90 }
//!   }
//! }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fhirq_core::QueueType;

use crate::admission::QueueLimits;
use crate::retry::RetryPolicy;
use crate::types::DEFAULT_MAX_RETRY_COUNT;

/// Environment variable holding the path of the JSON configuration file.
pub const CONFIG_ENV_VAR: &str = "FHIRQ_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Serde adapter: `Duration` as floating-point seconds.
pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

/// Settings of one queue type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueConfig {
    pub enabled: bool,
    /// Fleet-wide cap on live Running jobs.
    pub max_concurrent_running: usize,
    #[serde(rename = "heartbeatTimeoutSeconds", with = "duration_secs")]
    pub heartbeat_timeout: Duration,
    #[serde(rename = "pollPeriodSeconds", with = "duration_secs")]
    pub poll_period: Duration,
    pub max_retry_count: u32,
    /// Jobs one host runs at once for this queue (the `maxCount` of each acquire).
    pub host_concurrency: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent_running: 4,
            heartbeat_timeout: Duration::from_secs(60),
            poll_period: Duration::from_secs(5),
            max_retry_count: DEFAULT_MAX_RETRY_COUNT,
            host_concurrency: 2,
        }
    }
}

impl QueueConfig {
    /// Interval between heartbeats of an in-flight job.
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_timeout / 3
    }
}

/// Settings of one watchdog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatchdogConfig {
    pub enabled: bool,
    #[serde(rename = "periodSec", with = "duration_secs")]
    pub period: Duration,
    /// Lease duration; acts as the heartbeat timeout of the watchdog row.
    #[serde(rename = "leasePeriodSec", with = "duration_secs")]
    pub lease_period: Duration,
    /// Let the holder hand the lease back after each run.
    pub allow_rebalance: bool,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            period: Duration::from_secs(60),
            lease_period: Duration::from_secs(180),
            allow_rebalance: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostConfig {
    /// How long shutdown waits for in-flight handlers after signalling them.
    #[serde(rename = "shutdownGraceSeconds", with = "duration_secs")]
    pub shutdown_grace: Duration,
    /// Backoff for transient job-store errors.
    pub store_retry: RetryPolicy,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            shutdown_grace: Duration::from_secs(30),
            store_retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub host: HostConfig,
    pub queues: HashMap<QueueType, QueueConfig>,
    pub watchdogs: HashMap<QueueType, WatchdogConfig>,
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Load from the file named by `FHIRQ_CONFIG`, or fall back to defaults.
    pub fn load() -> Result<Self, ConfigError> {
        match std::env::var(CONFIG_ENV_VAR) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path),
            _ => {
                tracing::warn!("{CONFIG_ENV_VAR} not set; using default configuration");
                Ok(Self::default())
            }
        }
    }

    pub fn with_queue(mut self, queue_type: QueueType, config: QueueConfig) -> Self {
        self.queues.insert(queue_type, config);
        self
    }

    pub fn with_watchdog(mut self, queue_type: QueueType, config: WatchdogConfig) -> Self {
        self.watchdogs.insert(queue_type, config);
        self
    }

    pub fn queue(&self, queue_type: &QueueType) -> Option<&QueueConfig> {
        self.queues.get(queue_type)
    }

    pub fn watchdog(&self, queue_type: &QueueType) -> Option<&WatchdogConfig> {
        self.watchdogs.get(queue_type)
    }

    /// Enabled queue types, in a stable order.
    pub fn enabled_queues(&self) -> Vec<(&QueueType, &QueueConfig)> {
        let mut queues: Vec<_> = self.queues.iter().filter(|(_, c)| c.enabled).collect();
        queues.sort_by(|a, b| a.0.cmp(b.0));
        queues
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (queue_type, q) in &self.queues {
            if queue_type.is_watchdog() {
                return Err(ConfigError::Invalid(format!(
                    "{queue_type}: watchdog queues are configured under `watchdogs`"
                )));
            }
            if q.heartbeat_timeout.is_zero() {
                return Err(ConfigError::Invalid(format!(
                    "{queue_type}: heartbeatTimeoutSeconds must be positive"
                )));
            }
            if q.poll_period.is_zero() {
                return Err(ConfigError::Invalid(format!(
                    "{queue_type}: pollPeriodSeconds must be positive"
                )));
            }
            if q.enabled && q.max_concurrent_running == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{queue_type}: maxConcurrentRunning must be positive for an enabled queue"
                )));
            }
            if q.enabled && q.host_concurrency == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{queue_type}: hostConcurrency must be positive for an enabled queue"
                )));
            }
        }

        for (queue_type, w) in &self.watchdogs {
            if !queue_type.is_watchdog() {
                return Err(ConfigError::Invalid(format!(
                    "{queue_type}: watchdog keys must use the `watchdog-` prefix"
                )));
            }
            if w.period.is_zero() {
                return Err(ConfigError::Invalid(format!(
                    "{queue_type}: periodSec must be positive"
                )));
            }
            // The holder renews once per period; two missed renewals must not
            // expire the lease.
            if w.lease_period < w.period.saturating_mul(3) {
                return Err(ConfigError::Invalid(format!(
                    "{queue_type}: leasePeriodSec must be at least 3 x periodSec"
                )));
            }
        }

        Ok(())
    }
}

impl QueueLimits for EngineConfig {
    fn max_concurrent_running(&self, queue_type: &QueueType) -> Option<usize> {
        if queue_type.is_watchdog() {
            // Single row per watchdog; the lease itself is the limit.
            return Some(1);
        }
        self.queues.get(queue_type).map(|q| q.max_concurrent_running)
    }
}
