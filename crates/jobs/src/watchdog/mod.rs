//! Self-leasing singleton maintenance tasks.
//!
//! A watchdog is a queue type with exactly one non-terminal row. Every fleet
//! instance runs a [`Watchdog`] loop for it; each period the loop either renews
//! the lease it holds or tries to `acquire` the row with `leasePeriodSec` as the
//! heartbeat timeout. Only the holder runs the task. A crashed holder stops
//! heartbeating and the row is reclaimed by whoever polls next.
//!
//! With `allowRebalance` the holder releases its row back to Queued after each
//! run, so the next cycle is open to any instance. The row is reused: a watchdog
//! never accumulates more than one record.
//!
//! The holder renews only at the start of each cycle (and while the task runs),
//! so configuration requires `leasePeriodSec >= 3 * periodSec`.

pub mod stale_leases;

pub use stale_leases::StaleLeaseReporter;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fhirq_core::{QueueType, RunToken, TenantId};

use crate::config::WatchdogConfig;
use crate::host::lease::LeaseKeeper;
use crate::host::{HandlerError, JobContext};
use crate::retry::{RetryPolicy, retry_transient};
use crate::store::{JobStore, JobStoreError};
use crate::types::{EnqueueRequest, HeartbeatOutcome, Job, ReleaseOutcome};

/// Retry budget of a watchdog row; reclaiming a crashed holder must never exhaust it.
pub const WATCHDOG_MAX_RETRY_COUNT: u32 = i32::MAX as u32;

/// A periodic maintenance action.
#[async_trait]
pub trait WatchdogTask: Send + Sync {
    /// The `watchdog-*` queue type of this task's row.
    fn queue_type(&self) -> QueueType;

    /// One run, executed by the lease holder only.
    async fn run(&self, ctx: &JobContext) -> Result<(), HandlerError>;
}

#[derive(Debug, Clone)]
struct Lease {
    job: Job,
    token: RunToken,
}

/// Lease loop of one watchdog on one instance.
pub struct Watchdog {
    task: Arc<dyn WatchdogTask>,
    queue_type: QueueType,
    store: Arc<dyn JobStore>,
    config: WatchdogConfig,
    retry: RetryPolicy,
    lease: Option<Lease>,
}

impl Watchdog {
    pub fn new(
        task: Arc<dyn WatchdogTask>,
        store: Arc<dyn JobStore>,
        config: WatchdogConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            queue_type: task.queue_type(),
            task,
            store,
            config,
            retry,
            lease: None,
        }
    }

    pub fn holds_lease(&self) -> bool {
        self.lease.is_some()
    }

    /// Run one cycle every `periodSec` until `shutdown`, then hand the lease back.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(queue = %self.queue_type, period_ms = self.config.period.as_millis() as u64, "watchdog started");

        let mut interval = tokio::time::interval(self.config.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(err) = self.cycle(&shutdown).await {
                warn!(queue = %self.queue_type, error = %err, "watchdog cycle failed");
            }
        }

        if let Some(lease) = self.lease.take() {
            if let Err(err) = self.hand_off(lease).await {
                warn!(queue = %self.queue_type, error = %err, "failed to release watchdog lease");
            }
        }
        info!(queue = %self.queue_type, "watchdog stopped");
    }

    /// Renew or take the lease, then run the task if this instance holds it.
    pub async fn cycle(&mut self, shutdown: &CancellationToken) -> Result<(), JobStoreError> {
        let lease = match self.lease.take() {
            Some(lease) => {
                let store = &self.store;
                let outcome = retry_transient(&self.retry, "heartbeat", || {
                    store.heartbeat(lease.job.id, lease.token, None)
                })
                .await?;
                if outcome == HeartbeatOutcome::Lost {
                    warn!(queue = %self.queue_type, job_id = %lease.job.id, "watchdog lease lost");
                    return Ok(());
                }
                lease
            }
            None => match self.try_acquire().await? {
                Some(lease) => {
                    info!(queue = %self.queue_type, job_id = %lease.job.id, retry_count = lease.job.retry_count, "watchdog lease acquired");
                    lease
                }
                None => {
                    debug!(queue = %self.queue_type, "watchdog lease held elsewhere");
                    return Ok(());
                }
            },
        };

        let ctx = JobContext::new(
            &lease.job,
            lease.token,
            self.store.clone(),
            self.retry.clone(),
            shutdown.child_token(),
        );
        let done = CancellationToken::new();
        let keeper = tokio::spawn(
            LeaseKeeper::new(ctx.clone(), self.config.lease_period / 3).run(done.clone()),
        );

        let task = self.task.clone();
        let task_ctx = ctx.clone();
        let result = tokio::spawn(async move { task.run(&task_ctx).await }).await;

        done.cancel();
        if let Err(err) = keeper.await {
            warn!(queue = %self.queue_type, error = %err, "watchdog heartbeat ticker ended abnormally");
        }

        if ctx.lease_lost() {
            warn!(queue = %self.queue_type, job_id = %lease.job.id, "watchdog lease lost during run");
            return Ok(());
        }
        match result {
            Ok(Ok(())) => debug!(queue = %self.queue_type, "watchdog task ran"),
            Ok(Err(err)) => warn!(queue = %self.queue_type, error = %err, "watchdog task failed"),
            Err(err) => warn!(queue = %self.queue_type, error = %err, "watchdog task panicked"),
        }

        if self.config.allow_rebalance {
            self.hand_off(lease).await?;
        } else {
            self.lease = Some(lease);
        }
        Ok(())
    }

    async fn try_acquire(&self) -> Result<Option<Lease>, JobStoreError> {
        self.ensure_row().await?;
        let store = &self.store;
        let queue_type = &self.queue_type;
        let lease_period = self.config.lease_period;
        let jobs = retry_transient(&self.retry, "acquire", || {
            store.acquire(queue_type, 1, lease_period)
        })
        .await?;
        Ok(jobs
            .into_iter()
            .next()
            .and_then(|job| job.run_token.map(|token| Lease { job, token })))
    }

    /// Make sure the single non-terminal row exists.
    async fn ensure_row(&self) -> Result<(), JobStoreError> {
        let name = self.queue_type.to_string();
        let request = EnqueueRequest::new(
            TenantId::SYSTEM,
            self.queue_type.clone(),
            serde_json::json!({ "watchdog": name }),
        )
        .with_max_retry_count(WATCHDOG_MAX_RETRY_COUNT)
        .exclusive();

        let store = &self.store;
        match retry_transient(&self.retry, "enqueue", || store.enqueue(request.clone())).await {
            Ok(job_id) => {
                debug!(queue = %self.queue_type, job_id = %job_id, "watchdog row created");
                Ok(())
            }
            Err(JobStoreError::Conflict(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Put the held row back in the queue for whoever polls next.
    async fn hand_off(&self, lease: Lease) -> Result<(), JobStoreError> {
        let store = &self.store;
        let outcome = retry_transient(&self.retry, "release", || {
            store.release(lease.job.id, lease.token, "watchdog lease handed off")
        })
        .await?;
        match outcome {
            ReleaseOutcome::Released => {
                debug!(queue = %self.queue_type, job_id = %lease.job.id, "watchdog lease released")
            }
            ReleaseOutcome::Cancelled => {
                warn!(queue = %self.queue_type, job_id = %lease.job.id, "watchdog row was cancelled; a new one is created on the next cycle")
            }
            ReleaseOutcome::Lost => {
                warn!(queue = %self.queue_type, job_id = %lease.job.id, "watchdog lease lost before release")
            }
        }
        Ok(())
    }
}
