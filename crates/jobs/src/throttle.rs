//! Advisory pacing of long job bodies against the downstream datastore.
//!
//! A handler owns one controller per running job:
//!
//! ```text
//! initialize(job, capacity_hint)
//! loop {
//!     update_datastore_usage()
//!     sleep(throttle_delay())
//!     process(throttle_batch_size() items)
//! }
//! ```
//!
//! Nothing here blocks or rejects work; the handler decides how to use the
//! returned delay and batch size.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::debug;

use fhirq_core::JobId;

use crate::types::Job;

/// One reading of downstream load.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageSample {
    /// Reported consumed capacity as a fraction of provisioned (0.0..).
    pub consumed_fraction: Option<f64>,
    /// Requests the datastore rejected or throttled since the previous sample.
    pub throttled_requests: u64,
    /// Requests issued since the previous sample.
    pub total_requests: u64,
}

impl UsageSample {
    /// Share of issued requests that were throttled, in `0.0..=1.0`.
    ///
    /// Throttling reported without a request count is treated as total.
    pub fn rejection_rate(&self) -> f64 {
        match (self.throttled_requests, self.total_requests) {
            (0, _) => 0.0,
            (_, 0) => 1.0,
            (throttled, total) => (throttled.min(total) as f64) / total as f64,
        }
    }

    /// Load estimate of this sample.
    ///
    /// Any throttled request means saturation (at least 1.0); the rejection
    /// rate is added on top so heavier throttling moves a smoothed estimate faster.
    fn utilization(&self) -> f64 {
        let consumed = self.consumed_fraction.unwrap_or(0.0).max(0.0);
        if self.throttled_requests == 0 {
            return consumed;
        }
        consumed.max(1.0 + self.rejection_rate())
    }
}

/// Source of downstream load signals.
pub trait UsageSampler: Send + Sync + std::fmt::Debug {
    fn sample(&self) -> UsageSample;
}

/// Pacing contract consulted by job bodies between units of work.
pub trait ThrottleController: Send + Sync + std::fmt::Debug {
    /// Reset state for `job`. `capacity_hint` seeds the baseline batch size.
    fn initialize(&self, job: &Job, capacity_hint: Option<usize>);

    /// Sample downstream load and adjust the estimate.
    fn update_datastore_usage(&self);

    /// Zero when healthy, growing under load.
    fn throttle_delay(&self) -> Duration;

    /// Shrinks under load, recovers with headroom.
    fn throttle_batch_size(&self) -> usize;
}

/// Constant pacing for stores without load signals.
#[derive(Debug, Clone, Copy)]
pub struct NoopThrottleController {
    batch_size: usize,
}

impl NoopThrottleController {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }
}

impl Default for NoopThrottleController {
    fn default() -> Self {
        Self::new(ThrottleConfig::default().default_batch_size)
    }
}

impl ThrottleController for NoopThrottleController {
    fn initialize(&self, _job: &Job, _capacity_hint: Option<usize>) {}

    fn update_datastore_usage(&self) {}

    fn throttle_delay(&self) -> Duration {
        Duration::ZERO
    }

    fn throttle_batch_size(&self) -> usize {
        self.batch_size
    }
}

/// Tuning of [`AdaptiveThrottleController`].
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottleConfig {
    /// Utilization above which the controller backs off (0.0-1.0).
    pub target_utilization: f64,
    /// EWMA weight of the newest sample (0.0-1.0).
    pub smoothing: f64,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub default_batch_size: usize,
    /// Additive recovery per healthy sample.
    pub batch_increase_step: usize,
    /// Delay at full saturation.
    pub max_delay: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            target_utilization: 0.8,
            smoothing: 0.3,
            min_batch_size: 10,
            max_batch_size: 1000,
            default_batch_size: 100,
            batch_increase_step: 10,
            max_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
struct ThrottleState {
    job_id: Option<JobId>,
    batch_size: usize,
    utilization: f64,
    delay: Duration,
}

/// AIMD controller: halve the batch when the smoothed utilization exceeds the
/// target, grow it by a fixed step otherwise.
pub struct AdaptiveThrottleController {
    config: ThrottleConfig,
    sampler: Arc<dyn UsageSampler>,
    state: Mutex<ThrottleState>,
}

impl std::fmt::Debug for AdaptiveThrottleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveThrottleController")
            .field("config", &self.config)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl AdaptiveThrottleController {
    pub fn new(config: ThrottleConfig, sampler: Arc<dyn UsageSampler>) -> Self {
        let batch_size = clamp_batch(&config, config.default_batch_size);
        Self {
            config,
            sampler,
            state: Mutex::new(ThrottleState {
                job_id: None,
                batch_size,
                utilization: 0.0,
                delay: Duration::ZERO,
            }),
        }
    }

    /// Smoothed utilization estimate.
    pub fn utilization(&self) -> f64 {
        self.state().utilization
    }

    fn state(&self) -> MutexGuard<'_, ThrottleState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn clamp_batch(config: &ThrottleConfig, size: usize) -> usize {
    let min = config.min_batch_size.max(1);
    size.clamp(min, config.max_batch_size.max(min))
}

impl ThrottleController for AdaptiveThrottleController {
    fn initialize(&self, job: &Job, capacity_hint: Option<usize>) {
        let mut state = self.state();
        state.job_id = Some(job.id);
        state.batch_size = clamp_batch(
            &self.config,
            capacity_hint.unwrap_or(self.config.default_batch_size),
        );
        state.utilization = 0.0;
        state.delay = Duration::ZERO;
        debug!(job_id = %job.id, batch_size = state.batch_size, "throttle initialized");
    }

    fn update_datastore_usage(&self) {
        let sample = self.sampler.sample();
        let alpha = self.config.smoothing.clamp(0.0, 1.0);
        let target = self.config.target_utilization.clamp(0.0, 1.0);

        let mut state = self.state();
        state.utilization = alpha * sample.utilization() + (1.0 - alpha) * state.utilization;

        if state.utilization > target {
            state.batch_size = clamp_batch(&self.config, state.batch_size / 2);
            let headroom = (1.0 - target).max(f64::EPSILON);
            let pressure = ((state.utilization - target) / headroom).clamp(0.0, 1.0);
            state.delay = self.config.max_delay.mul_f64(pressure);
        } else {
            state.batch_size = clamp_batch(
                &self.config,
                state.batch_size.saturating_add(self.config.batch_increase_step),
            );
            state.delay = Duration::ZERO;
        }

        debug!(
            job_id = ?state.job_id,
            utilization = state.utilization,
            batch_size = state.batch_size,
            delay_ms = state.delay.as_millis() as u64,
            throttled = sample.throttled_requests,
            total = sample.total_requests,
            "datastore usage updated"
        );
    }

    fn throttle_delay(&self) -> Duration {
        self.state().delay
    }

    fn throttle_batch_size(&self) -> usize {
        self.state().batch_size
    }
}
