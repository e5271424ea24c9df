//! Per-queue-type ceiling on concurrently running jobs.
//!
//! Stores consult the controller inside the same critical section (or database
//! transaction) that claims jobs, so two racing `acquire` calls cannot both
//! observe headroom and overshoot the cap.

use std::collections::HashMap;
use std::sync::Arc;

use fhirq_core::QueueType;

/// Source of the configured `maxConcurrentRunning` per queue type.
pub trait QueueLimits: Send + Sync + std::fmt::Debug {
    /// `None` means the queue type is not capped.
    fn max_concurrent_running(&self, queue_type: &QueueType) -> Option<usize>;
}

/// Fixed limits, mostly for tests and embedded use.
#[derive(Debug, Clone, Default)]
pub struct StaticLimits {
    limits: HashMap<QueueType, usize>,
}

impl StaticLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, queue_type: QueueType, max_concurrent_running: usize) -> Self {
        self.limits.insert(queue_type, max_concurrent_running);
        self
    }
}

impl QueueLimits for StaticLimits {
    fn max_concurrent_running(&self, queue_type: &QueueType) -> Option<usize> {
        self.limits.get(queue_type).copied()
    }
}

/// Admission controller shared by a store.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    limits: Arc<dyn QueueLimits>,
}

impl AdmissionController {
    pub fn new(limits: Arc<dyn QueueLimits>) -> Self {
        Self { limits }
    }

    pub fn unlimited() -> Self {
        Self::new(Arc::new(StaticLimits::new()))
    }

    pub fn limit(&self, queue_type: &QueueType) -> Option<usize> {
        self.limits.max_concurrent_running(queue_type)
    }

    /// `maxConcurrentRunning - currentRunningCount`, floored at zero.
    ///
    /// `live_running` must only count jobs whose lease has not gone stale; a stale
    /// job is a claim candidate, not an occupant.
    pub fn available_slots(&self, queue_type: &QueueType, live_running: usize) -> usize {
        match self.limit(queue_type) {
            Some(max) => max.saturating_sub(live_running),
            None => usize::MAX,
        }
    }
}
