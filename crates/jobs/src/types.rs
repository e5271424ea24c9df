//! Core job record and the state transitions of the claim protocol.
//!
//! The transition methods on [`Job`] are `pub(crate)`: stores apply them to a
//! record under their own atomicity guarantee, nothing else may call them.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use fhirq_core::{GroupId, JobId, QueueType, RunToken, TenantId};

/// Retry budget applied when an enqueue request does not carry one.
pub const DEFAULT_MAX_RETRY_COUNT: u32 = 3;

/// Attempt records kept per job; older entries are dropped first.
pub const MAX_ATTEMPT_HISTORY: usize = 32;

/// Job execution status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed
    Queued,
    /// Claimed by a worker holding the current run token
    Running,
    /// Finished successfully, `result` is set
    Completed,
    /// Exhausted retries or failed fatally
    Failed,
    /// Cancelled through the out-of-band cancel path
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an execution attempt ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Completed,
    /// Failed and returned to the queue
    Requeued,
    Failed,
    Cancelled,
    /// Heartbeat went stale and the job was reclaimed
    Abandoned,
    /// Handed back by its holder without charging the retry budget
    Released,
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub error: Option<String>,
    pub details: Option<JsonValue>,
}

/// A job: the sole persistent entity of the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub queue_type: QueueType,
    pub group_id: Option<GroupId>,
    pub status: JobStatus,
    /// Higher values are claimed first.
    pub priority: Option<i32>,
    /// Opaque handler input.
    pub definition: JsonValue,
    /// Opaque handler output, set only on Completed.
    pub result: Option<JsonValue>,
    /// Checkpoint payload updated through heartbeats.
    pub context: Option<JsonValue>,
    /// Last liveness signal while Running; enqueue/requeue time otherwise.
    pub heartbeat_at: DateTime<Utc>,
    pub run_token: Option<RunToken>,
    pub retry_count: u32,
    pub max_retry_count: u32,
    pub cancel_requested: bool,
    /// Optimistic-concurrency token for out-of-band writes.
    ///
    /// Bumped by every status transition and cancel request; heartbeats leave it
    /// alone so a cancel request is not starved by a busy job.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub history: Vec<AttemptRecord>,
}

/// Input of `Enqueue`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub tenant_id: TenantId,
    pub queue_type: QueueType,
    pub group_id: Option<GroupId>,
    pub priority: Option<i32>,
    pub definition: JsonValue,
    /// Falls back to the queue configuration, then [`DEFAULT_MAX_RETRY_COUNT`].
    pub max_retry_count: Option<u32>,
    /// Reject the enqueue when a non-terminal job of the same queue type and
    /// tenant already exists.
    pub exclusive: bool,
}

impl EnqueueRequest {
    pub fn new(tenant_id: TenantId, queue_type: QueueType, definition: JsonValue) -> Self {
        Self {
            tenant_id,
            queue_type,
            group_id: None,
            priority: None,
            definition,
            max_retry_count: None,
            exclusive: false,
        }
    }

    pub fn in_group(mut self, group_id: GroupId) -> Self {
        self.group_id = Some(group_id);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_retry_count(mut self, max_retry_count: u32) -> Self {
        self.max_retry_count = Some(max_retry_count);
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }
}

/// Failure report passed to `Fail`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub retryable: bool,
    pub message: String,
    /// Captured diagnostics attached to the attempt record.
    pub details: Option<JsonValue>,
}

impl Failure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
            details: None,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: JsonValue) -> Self {
        self.details = Some(details);
        self
    }
}

/// Result of `Heartbeat`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Lease renewed. `cancel_requested` mirrors the stored flag.
    Alive { cancel_requested: bool },
    /// Ownership moved elsewhere; abort without further side effects.
    Lost,
}

/// Result of `Complete`.
#[derive(Debug, Clone, PartialEq)]
pub enum CompleteOutcome {
    /// The stored result (the first one on a repeated call).
    Completed(JsonValue),
    Lost,
}

/// Result of `Fail`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Returned to the queue for another attempt.
    Requeued { retry_count: u32 },
    Failed,
    /// A cancel had been requested; the job terminated as Cancelled.
    Cancelled,
    Lost,
}

/// Result of `Release`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Back in the queue with its retry count unchanged.
    Released,
    /// A cancel had been requested; the job terminated as Cancelled.
    Cancelled,
    Lost,
}

/// What a claim did to a candidate record.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ClaimTransition {
    Claimed,
    /// Reclaim exceeded the retry budget.
    Exhausted,
    /// Reclaim found a pending cancel request.
    Cancelled,
}

pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

impl Job {
    /// Create a queued job from an enqueue request.
    pub fn new(request: EnqueueRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            tenant_id: request.tenant_id,
            queue_type: request.queue_type,
            group_id: request.group_id,
            status: JobStatus::Queued,
            priority: request.priority,
            definition: request.definition,
            result: None,
            context: None,
            heartbeat_at: now,
            run_token: None,
            retry_count: 0,
            max_retry_count: request.max_retry_count.unwrap_or(DEFAULT_MAX_RETRY_COUNT),
            cancel_requested: false,
            version: 1,
            created_at: now,
            started_at: None,
            completed_at: None,
            history: Vec::new(),
        }
    }

    /// Running with a heartbeat older than `heartbeat_timeout`.
    pub fn is_stale(&self, now: DateTime<Utc>, heartbeat_timeout: Duration) -> bool {
        self.status == JobStatus::Running && now - self.heartbeat_at > to_chrono(heartbeat_timeout)
    }

    /// Running with a live lease.
    pub fn is_live(&self, now: DateTime<Utc>, heartbeat_timeout: Duration) -> bool {
        self.status == JobStatus::Running && !self.is_stale(now, heartbeat_timeout)
    }

    pub fn is_claimable(&self, now: DateTime<Utc>, heartbeat_timeout: Duration) -> bool {
        self.status == JobStatus::Queued || self.is_stale(now, heartbeat_timeout)
    }

    fn holds(&self, token: RunToken) -> bool {
        self.run_token == Some(token)
    }

    /// Ordering key for candidate selection: priority first, then stalest heartbeat.
    pub(crate) fn claim_order(&self) -> (std::cmp::Reverse<i32>, DateTime<Utc>, JobId) {
        (
            std::cmp::Reverse(self.priority.unwrap_or(0)),
            self.heartbeat_at,
            self.id,
        )
    }

    fn close_attempt(
        &mut self,
        now: DateTime<Utc>,
        outcome: AttemptOutcome,
        error: Option<String>,
        details: Option<JsonValue>,
    ) {
        let started_at = self.started_at.unwrap_or(self.heartbeat_at);
        self.history.push(AttemptRecord {
            attempt: self.retry_count + 1,
            started_at,
            finished_at: now,
            outcome,
            error,
            details,
        });
        if self.history.len() > MAX_ATTEMPT_HISTORY {
            let excess = self.history.len() - MAX_ATTEMPT_HISTORY;
            self.history.drain(..excess);
        }
    }

    fn terminate(&mut self, now: DateTime<Utc>, status: JobStatus) {
        self.status = status;
        self.completed_at = Some(now);
        self.version += 1;
    }

    /// Claim (or reclaim) the job for `token`.
    pub(crate) fn claim(&mut self, now: DateTime<Utc>, token: RunToken) -> ClaimTransition {
        if self.status == JobStatus::Running {
            self.close_attempt(
                now,
                AttemptOutcome::Abandoned,
                Some("heartbeat expired".to_string()),
                None,
            );
            self.run_token = None;

            if self.cancel_requested {
                self.terminate(now, JobStatus::Cancelled);
                return ClaimTransition::Cancelled;
            }
            let next = self.retry_count + 1;
            if next > self.max_retry_count {
                self.terminate(now, JobStatus::Failed);
                return ClaimTransition::Exhausted;
            }
            self.retry_count = next;
        }

        self.status = JobStatus::Running;
        self.run_token = Some(token);
        self.heartbeat_at = now;
        self.started_at = Some(now);
        self.version += 1;
        ClaimTransition::Claimed
    }

    pub(crate) fn heartbeat(
        &mut self,
        now: DateTime<Utc>,
        token: RunToken,
        context: Option<JsonValue>,
    ) -> HeartbeatOutcome {
        if self.status != JobStatus::Running || !self.holds(token) {
            return HeartbeatOutcome::Lost;
        }
        self.heartbeat_at = now;
        if context.is_some() {
            self.context = context;
        }
        HeartbeatOutcome::Alive {
            cancel_requested: self.cancel_requested,
        }
    }

    pub(crate) fn complete(
        &mut self,
        now: DateTime<Utc>,
        token: RunToken,
        result: JsonValue,
    ) -> CompleteOutcome {
        if !self.holds(token) {
            return CompleteOutcome::Lost;
        }
        match self.status {
            JobStatus::Running => {
                self.close_attempt(now, AttemptOutcome::Completed, None, None);
                self.result = Some(result.clone());
                self.heartbeat_at = now;
                self.terminate(now, JobStatus::Completed);
                CompleteOutcome::Completed(result)
            }
            JobStatus::Completed => {
                CompleteOutcome::Completed(self.result.clone().unwrap_or(JsonValue::Null))
            }
            _ => CompleteOutcome::Lost,
        }
    }

    pub(crate) fn fail(
        &mut self,
        now: DateTime<Utc>,
        token: RunToken,
        failure: Failure,
    ) -> FailOutcome {
        if self.status != JobStatus::Running || !self.holds(token) {
            return FailOutcome::Lost;
        }

        if self.cancel_requested {
            self.close_attempt(
                now,
                AttemptOutcome::Cancelled,
                Some(failure.message),
                failure.details,
            );
            self.run_token = None;
            self.terminate(now, JobStatus::Cancelled);
            return FailOutcome::Cancelled;
        }

        let next = self.retry_count + 1;
        if failure.retryable && next <= self.max_retry_count {
            self.close_attempt(
                now,
                AttemptOutcome::Requeued,
                Some(failure.message),
                failure.details,
            );
            self.retry_count = next;
            self.status = JobStatus::Queued;
            self.run_token = None;
            self.heartbeat_at = now;
            self.version += 1;
            return FailOutcome::Requeued { retry_count: next };
        }

        self.close_attempt(
            now,
            AttemptOutcome::Failed,
            Some(failure.message),
            failure.details,
        );
        self.run_token = None;
        self.terminate(now, JobStatus::Failed);
        FailOutcome::Failed
    }

    /// Hand a held job back to the queue. Unlike a retryable `fail`, the retry
    /// count is left alone: the attempt was interrupted, not unsuccessful.
    pub(crate) fn release(
        &mut self,
        now: DateTime<Utc>,
        token: RunToken,
        reason: &str,
    ) -> ReleaseOutcome {
        if self.status != JobStatus::Running || !self.holds(token) {
            return ReleaseOutcome::Lost;
        }
        self.run_token = None;

        if self.cancel_requested {
            self.close_attempt(now, AttemptOutcome::Cancelled, Some(reason.to_string()), None);
            self.terminate(now, JobStatus::Cancelled);
            return ReleaseOutcome::Cancelled;
        }

        self.close_attempt(now, AttemptOutcome::Released, Some(reason.to_string()), None);
        self.status = JobStatus::Queued;
        self.heartbeat_at = now;
        self.version += 1;
        ReleaseOutcome::Released
    }

    /// Out-of-band cancel request. Returns `true` when the record changed.
    pub(crate) fn request_cancel(&mut self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Queued => {
                self.cancel_requested = true;
                self.terminate(now, JobStatus::Cancelled);
                true
            }
            JobStatus::Running if !self.cancel_requested => {
                self.cancel_requested = true;
                self.version += 1;
                true
            }
            _ => false,
        }
    }
}
