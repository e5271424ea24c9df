//! Handler contract: what a job body sees of the engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fhirq_core::{JobId, RunToken};

use crate::retry::{RetryPolicy, retry_transient};
use crate::store::JobStore;
use crate::types::{HeartbeatOutcome, Job};

/// Error returned by a job body.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Worth another attempt while retries remain.
    #[error("retryable: {0}")]
    Retryable(String),
    /// Never retried, whatever the remaining budget.
    #[error("fatal: {0}")]
    Fatal(String),
    /// Stopped at a safe point after a cancellation signal.
    #[error("cancelled")]
    Cancelled,
    /// Ownership moved to another worker; the host performs no further writes.
    #[error("lease lost")]
    LeaseLost,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        HandlerError::Retryable(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        HandlerError::Fatal(message.into())
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            HandlerError::Retryable(_) => "retryable",
            HandlerError::Fatal(_) => "fatal",
            HandlerError::Cancelled => "cancelled",
            HandlerError::LeaseLost => "lease_lost",
            HandlerError::Other(_) => "error",
        }
    }
}

/// A job body for one queue type.
///
/// Execution is at-least-once: a handler that stalls past the heartbeat timeout
/// may be re-run elsewhere while still running here, so side effects must be
/// idempotent or fenced by the run token.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, job: Job, ctx: JobContext) -> Result<JsonValue, HandlerError>;
}

/// Per-execution handle passed to a handler.
#[derive(Clone)]
pub struct JobContext {
    job_id: JobId,
    run_token: RunToken,
    store: Arc<dyn JobStore>,
    retry: RetryPolicy,
    cancel: CancellationToken,
    cancel_requested: Arc<AtomicBool>,
    lease_lost: Arc<AtomicBool>,
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("cancel_requested", &self.cancel_requested())
            .field("lease_lost", &self.lease_lost())
            .finish_non_exhaustive()
    }
}

impl JobContext {
    pub(crate) fn new(
        job: &Job,
        run_token: RunToken,
        store: Arc<dyn JobStore>,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job_id: job.id,
            run_token,
            store,
            retry,
            cancel,
            cancel_requested: Arc::new(AtomicBool::new(job.cancel_requested)),
            lease_lost: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn run_token(&self) -> RunToken {
        self.run_token
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub(crate) fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Signalled on host shutdown, on an out-of-band cancel request, and when
    /// the lease is lost.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Whether cancellation came from an explicit cancel request (as opposed to
    /// host shutdown).
    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    pub fn lease_lost(&self) -> bool {
        self.lease_lost.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` (or `Err(LeaseLost)`) once a cancellation signal arrived.
    pub fn ensure_active(&self) -> Result<(), HandlerError> {
        if self.lease_lost() {
            Err(HandlerError::LeaseLost)
        } else if self.is_cancelled() {
            Err(HandlerError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Renew the lease and store `context` as the job's checkpoint.
    pub async fn checkpoint(&self, context: JsonValue) -> Result<(), HandlerError> {
        self.renew(Some(context)).await
    }

    /// Renew the lease without touching the checkpoint.
    pub async fn heartbeat(&self) -> Result<(), HandlerError> {
        self.renew(None).await
    }

    async fn renew(&self, context: Option<JsonValue>) -> Result<(), HandlerError> {
        if self.lease_lost() {
            return Err(HandlerError::LeaseLost);
        }
        let store = &self.store;
        let outcome = retry_transient(&self.retry, "heartbeat", || {
            store.heartbeat(self.job_id, self.run_token, context.clone())
        })
        .await
        .map_err(|e| HandlerError::retryable(format!("heartbeat failed: {e}")))?;
        self.observe(outcome);
        if self.lease_lost() {
            Err(HandlerError::LeaseLost)
        } else {
            Ok(())
        }
    }

    /// Apply a heartbeat outcome to the local signals.
    pub(crate) fn observe(&self, outcome: HeartbeatOutcome) {
        match outcome {
            HeartbeatOutcome::Alive {
                cancel_requested: true,
            } => {
                if !self.cancel_requested.swap(true, Ordering::SeqCst) {
                    info!(job_id = %self.job_id, "cancel requested, signalling handler");
                }
                self.cancel.cancel();
            }
            HeartbeatOutcome::Alive { .. } => {}
            HeartbeatOutcome::Lost => {
                if !self.lease_lost.swap(true, Ordering::SeqCst) {
                    warn!(job_id = %self.job_id, "lease lost, aborting handler");
                }
                self.cancel.cancel();
            }
        }
    }
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Job, JobContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<JsonValue, HandlerError>> + Send + 'static,
{
    async fn execute(&self, job: Job, ctx: JobContext) -> Result<JsonValue, HandlerError> {
        (self.0)(job, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryJobStore;
    use crate::types::EnqueueRequest;
    use fhirq_core::{ExpectedVersion, QueueType, TenantId};
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(60);

    async fn running_job(store: &Arc<dyn JobStore>) -> Job {
        store
            .enqueue(EnqueueRequest::new(
                TenantId::new(),
                QueueType::Export,
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        store
            .acquire(&QueueType::Export, 1, TIMEOUT)
            .await
            .unwrap()
            .remove(0)
    }

    fn context(job: &Job, store: &Arc<dyn JobStore>) -> JobContext {
        JobContext::new(
            job,
            job.run_token.unwrap(),
            store.clone(),
            RetryPolicy::no_retry(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn checkpoint_stores_context() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::unlimited());
        let job = running_job(&store).await;
        let ctx = context(&job, &store);

        ctx.checkpoint(serde_json::json!({"page": 3})).await.unwrap();

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.context, Some(serde_json::json!({"page": 3})));
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test]
    async fn checkpoint_surfaces_cancel_request() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::unlimited());
        let job = running_job(&store).await;
        let ctx = context(&job, &store);

        store.request_cancel(job.id, ExpectedVersion::Any).await.unwrap();
        ctx.heartbeat().await.unwrap();

        assert!(ctx.is_cancelled());
        assert!(ctx.cancel_requested());
        assert!(matches!(ctx.ensure_active(), Err(HandlerError::Cancelled)));
    }

    #[tokio::test]
    async fn checkpoint_after_reclaim_reports_lease_lost() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::unlimited());
        let job = running_job(&store).await;
        let ctx = JobContext::new(
            &job,
            RunToken::new(),
            store.clone(),
            RetryPolicy::no_retry(),
            CancellationToken::new(),
        );

        let err = ctx.checkpoint(serde_json::json!({"page": 1})).await.unwrap_err();
        assert!(matches!(err, HandlerError::LeaseLost));
        assert!(ctx.lease_lost());
        assert!(ctx.is_cancelled());

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.context, None);
    }
}
