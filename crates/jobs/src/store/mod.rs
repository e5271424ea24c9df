//! Job store boundary: the claim protocol and the read APIs.
//!
//! ## Mutation paths
//!
//! A job record only changes through:
//! - `enqueue` / `enqueue_batch` (creation)
//! - `acquire`, `heartbeat`, `complete`, `fail`, `release` (the claim protocol, fenced by the run token)
//! - `request_cancel` / `request_cancel_group` (out-of-band, fenced by the record version)
//!
//! Every other method is read-only.
//!
//! ## Implementations
//!
//! - [`InMemoryJobStore`]: single critical section, for tests/dev and single-process use
//! - [`PostgresJobStore`]: one transaction per claim batch with a per-queue advisory lock

pub mod in_memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value as JsonValue;

use fhirq_core::{DomainError, ExpectedVersion, GroupId, JobId, QueueType, RunToken, TenantId};

use crate::group::{GroupProgress, GroupStatus};
use crate::types::{
    CompleteOutcome, EnqueueRequest, FailOutcome, Failure, HeartbeatOutcome, Job, JobStatus,
    ReleaseOutcome,
};

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;

/// Job store error.
///
/// Lease conflicts are not errors: they surface as `Lost` outcomes.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("group not found: {0}")]
    GroupNotFound(GroupId),
    /// Exclusive enqueue collision or stale expected version.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation failed: {0}")]
    Validation(String),
    /// Transient: connection loss, timeouts, serialization failures. Retry with backoff.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl JobStoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, JobStoreError::Unavailable(_))
    }
}

impl From<DomainError> for JobStoreError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Conflict(msg) => JobStoreError::Conflict(msg),
            other => JobStoreError::Validation(other.to_string()),
        }
    }
}

/// Filter for tenant-scoped job listings.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub queue_type: Option<QueueType>,
    pub status: Option<JobStatus>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn queue(mut self, queue_type: QueueType) -> Self {
        self.queue_type = Some(queue_type);
        self
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub(crate) fn matches(&self, job: &Job) -> bool {
        self.queue_type.as_ref().is_none_or(|q| &job.queue_type == q)
            && self.status.is_none_or(|s| job.status == s)
    }
}

/// Per-queue counters, across tenants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    /// Running with a live lease.
    pub running: usize,
    /// Running with an expired lease (reclaimable).
    pub stale: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl QueueStats {
    pub(crate) fn record(&mut self, job: &Job, now: chrono::DateTime<chrono::Utc>, timeout: Duration) {
        match job.status {
            JobStatus::Queued => self.queued += 1,
            JobStatus::Running if job.is_stale(now, timeout) => self.stale += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
    }
}

/// Durable job store.
///
/// Implementations must:
/// - claim atomically per job: a record is handed to exactly one caller per claim
/// - evaluate admission (`maxConcurrentRunning`) atomically with the claim
/// - reject heartbeat/complete/fail for any token but the current one, without mutating
/// - leave already-claimed jobs valid and owned when a batch claim fails midway
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a queued job.
    async fn enqueue(&self, request: EnqueueRequest) -> Result<JobId, JobStoreError>;

    /// Create several queued jobs atomically (all or nothing).
    async fn enqueue_batch(
        &self,
        requests: Vec<EnqueueRequest>,
    ) -> Result<Vec<JobId>, JobStoreError>;

    /// Claim up to `max_count` queued or stale jobs of `queue_type`.
    ///
    /// Returns only the jobs now owned by the caller, each with a fresh run token.
    /// An empty result is not an error.
    async fn acquire(
        &self,
        queue_type: &QueueType,
        max_count: usize,
        heartbeat_timeout: Duration,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Renew the lease, optionally replacing the checkpoint context.
    async fn heartbeat(
        &self,
        job_id: JobId,
        run_token: RunToken,
        context: Option<JsonValue>,
    ) -> Result<HeartbeatOutcome, JobStoreError>;

    async fn complete(
        &self,
        job_id: JobId,
        run_token: RunToken,
        result: JsonValue,
    ) -> Result<CompleteOutcome, JobStoreError>;

    async fn fail(
        &self,
        job_id: JobId,
        run_token: RunToken,
        failure: Failure,
    ) -> Result<FailOutcome, JobStoreError>;

    /// Return a held job to the queue without consuming its retry budget.
    ///
    /// For interruptions the job itself did not cause (host shutdown, watchdog
    /// hand-off). A pending cancel request terminates it as Cancelled instead.
    async fn release(
        &self,
        job_id: JobId,
        run_token: RunToken,
        reason: &str,
    ) -> Result<ReleaseOutcome, JobStoreError>;

    /// Queued → Cancelled; Running → `cancel_requested`; terminal → unchanged.
    async fn request_cancel(
        &self,
        job_id: JobId,
        expected_version: ExpectedVersion,
    ) -> Result<Job, JobStoreError>;

    /// Request cancellation of every member; returns how many records changed.
    async fn request_cancel_group(&self, group_id: GroupId) -> Result<usize, JobStoreError>;

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    async fn list_group(&self, group_id: GroupId) -> Result<Vec<Job>, JobStoreError>;

    async fn list_jobs(
        &self,
        tenant_id: TenantId,
        filter: JobFilter,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Advisory snapshot of the admission headroom for `queue_type`.
    async fn available_slots(
        &self,
        queue_type: &QueueType,
        heartbeat_timeout: Duration,
    ) -> Result<usize, JobStoreError>;

    async fn queue_stats(
        &self,
        queue_type: &QueueType,
        heartbeat_timeout: Duration,
    ) -> Result<QueueStats, JobStoreError>;

    async fn group_progress(&self, group_id: GroupId) -> Result<GroupProgress, JobStoreError> {
        let members = self.list_group(group_id).await?;
        if members.is_empty() {
            return Err(JobStoreError::GroupNotFound(group_id));
        }
        Ok(GroupProgress::from_jobs(&members))
    }

    async fn group_status(&self, group_id: GroupId) -> Result<GroupStatus, JobStoreError> {
        Ok(self.group_progress(group_id).await?.status())
    }
}
