//! Backoff for transient job-store errors.
//!
//! Only [`JobStoreError::is_transient`] errors are retried. Lease conflicts never
//! come through here: a `Lost` outcome is a value, not an error, and the only
//! reaction to it is to stop.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::duration_secs;
use crate::store::JobStoreError;

/// How often and how patiently a store call is retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Retries after the first call; 0 disables retrying.
    pub max_retries: u32,
    /// Delay before the first retry, doubled for each one after.
    #[serde(rename = "baseDelaySeconds", with = "duration_secs")]
    pub base_delay: Duration,
    /// Upper bound on any single delay, jitter included.
    #[serde(rename = "maxDelaySeconds", with = "duration_secs")]
    pub max_delay: Duration,
    /// Add up to half of `base_delay` at random, so hosts that failed together
    /// do not retry together.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// The same delay before every retry.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
            jitter: false,
        }
    }

    /// Delay before retry number `retry` (0-indexed).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        let capped = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        if !self.jitter {
            return capped;
        }

        let half_base = u64::try_from(self.base_delay.as_millis() / 2).unwrap_or(u64::MAX);
        let headroom = u64::try_from(self.max_delay.saturating_sub(capped).as_millis()).unwrap_or(0);
        let limit = half_base.min(headroom);
        if limit == 0 {
            return capped;
        }
        capped + Duration::from_millis(rand::rng().random_range(0..limit))
    }
}

/// Run `op`, retrying transient store errors with the policy's backoff.
///
/// Non-transient errors and the last transient error are returned unchanged.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut op: F,
) -> Result<T, JobStoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, JobStoreError>>,
{
    let mut retry = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && retry < policy.max_retries => {
                let delay = policy.backoff(retry);
                retry += 1;
                warn!(
                    operation,
                    retry,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient job store error, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
