//! Worker host: claims jobs per queue type and runs them on registered handlers.
//!
//! ## Per job
//!
//! ```text
//! acquire ──> spawn handler ──┬─> Ok(result)        ──> Complete
//!             spawn ticker    ├─> Err(Fatal)        ──> Fail(retryable=false)
//!                             ├─> Err(LeaseLost)    ──> (nothing)
//!                             ├─> Err(on shutdown)  ──> Release
//!                             ├─> Err(other)/panic  ──> Fail(retryable=true)
//!                             └─> lease lost        ──> (nothing)
//! ```
//!
//! ## Shutdown
//!
//! The shutdown token stops every poll loop and is the parent of each job's
//! cancellation token. Handlers are never aborted; `WorkerHostHandle::shutdown`
//! waits for them up to the configured grace period. A handler that gives up
//! because of shutdown is released back to the queue with its retry budget
//! untouched.

pub mod handler;
pub(crate) mod lease;

pub use handler::{FnHandler, HandlerError, JobContext, JobHandler};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::Semaphore;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use fhirq_core::QueueType;

use crate::config::{EngineConfig, QueueConfig};
use crate::retry::{RetryPolicy, retry_transient};
use crate::store::JobStore;
use crate::types::{CompleteOutcome, FailOutcome, Failure, Job, ReleaseOutcome};
use crate::watchdog::{Watchdog, WatchdogTask};
use lease::LeaseKeeper;

/// Host runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HostStats {
    pub jobs_claimed: u64,
    pub jobs_completed: u64,
    pub jobs_requeued: u64,
    pub jobs_released: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub leases_lost: u64,
    pub handler_panics: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

#[derive(Debug)]
struct StatsCell {
    started: Instant,
    stats: Mutex<HostStats>,
}

impl StatsCell {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            stats: Mutex::new(HostStats::default()),
        }
    }

    fn update(&self, f: impl FnOnce(&mut HostStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut stats);
    }

    fn snapshot(&self) -> HostStats {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

/// Worker host builder.
pub struct WorkerHost {
    name: String,
    store: Arc<dyn JobStore>,
    config: EngineConfig,
    handlers: HashMap<QueueType, Arc<dyn JobHandler>>,
    watchdogs: Vec<Arc<dyn WatchdogTask>>,
}

impl WorkerHost {
    pub fn new(store: Arc<dyn JobStore>, config: EngineConfig) -> Self {
        Self {
            name: "worker-host".to_string(),
            store,
            config,
            handlers: HashMap::new(),
            watchdogs: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Register the handler of a queue type (replacing any previous one).
    pub fn register_handler<H>(&mut self, queue_type: QueueType, handler: H)
    where
        H: JobHandler + 'static,
    {
        self.handlers.insert(queue_type, Arc::new(handler));
    }

    pub fn register_handler_arc(&mut self, queue_type: QueueType, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(queue_type, handler);
    }

    /// Register a maintenance task; it runs only if its watchdog is configured and enabled.
    pub fn register_watchdog<T>(&mut self, task: T)
    where
        T: WatchdogTask + 'static,
    {
        self.watchdogs.push(Arc::new(task));
    }

    /// Start every poll loop and watchdog on the current tokio runtime.
    pub fn spawn(self) -> WorkerHostHandle {
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let stats = Arc::new(StatsCell::new());
        let retry = self.config.host.store_retry.clone();

        for (queue_type, queue_config) in self.config.enabled_queues() {
            let Some(handler) = self.handlers.get(queue_type) else {
                warn!(host = %self.name, queue = %queue_type, "queue enabled but no handler registered");
                continue;
            };
            let poller = QueuePoller {
                host: self.name.clone(),
                queue_type: queue_type.clone(),
                config: queue_config.clone(),
                store: self.store.clone(),
                handler: handler.clone(),
                retry: retry.clone(),
                stats: stats.clone(),
                tracker: tracker.clone(),
            };
            tracker.spawn(poller.run(shutdown.clone()));
        }

        for queue_type in self.handlers.keys() {
            if self.config.queue(queue_type).is_none() {
                warn!(host = %self.name, queue = %queue_type, "handler registered for unconfigured queue");
            }
        }

        for task in self.watchdogs {
            let queue_type = task.queue_type();
            match self.config.watchdog(&queue_type) {
                Some(wd) if wd.enabled => {
                    let watchdog = Watchdog::new(task, self.store.clone(), wd.clone(), retry.clone());
                    tracker.spawn(watchdog.run(shutdown.clone()));
                }
                _ => debug!(host = %self.name, queue = %queue_type, "watchdog not enabled"),
            }
        }

        info!(host = %self.name, "worker host started");

        WorkerHostHandle {
            name: self.name,
            shutdown,
            tracker,
            stats,
            grace: self.config.host.shutdown_grace,
        }
    }
}

/// Outcome of a graceful shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every handler exited within the grace period.
    pub drained: bool,
    /// Tasks still running when the grace period elapsed.
    pub abandoned: usize,
}

/// Handle to control a running host.
#[derive(Debug)]
pub struct WorkerHostHandle {
    name: String,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    stats: Arc<StatsCell>,
    grace: Duration,
}

impl WorkerHostHandle {
    pub fn stats(&self) -> HostStats {
        self.stats.snapshot()
    }

    /// Token whose cancellation starts shutdown (e.g. from a signal handler).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop claiming, signal in-flight handlers and wait up to the grace period.
    pub async fn shutdown(self) -> ShutdownReport {
        info!(host = %self.name, running = self.tracker.len(), "worker host shutting down");
        self.shutdown.cancel();
        self.tracker.close();

        let report = match tokio::time::timeout(self.grace, self.tracker.wait()).await {
            Ok(()) => ShutdownReport {
                drained: true,
                abandoned: 0,
            },
            Err(_) => {
                let abandoned = self.tracker.len();
                warn!(host = %self.name, abandoned, grace_ms = self.grace.as_millis() as u64, "shutdown grace period elapsed");
                ShutdownReport {
                    drained: false,
                    abandoned,
                }
            }
        };
        info!(host = %self.name, drained = report.drained, "worker host stopped");
        report
    }

    /// Wait for the shutdown token (set externally), then shut down.
    pub async fn run_until_shutdown(self) -> ShutdownReport {
        self.shutdown.cancelled().await;
        self.shutdown().await
    }
}

/// Poll loop of one queue type.
struct QueuePoller {
    host: String,
    queue_type: QueueType,
    config: QueueConfig,
    store: Arc<dyn JobStore>,
    handler: Arc<dyn JobHandler>,
    retry: RetryPolicy,
    stats: Arc<StatsCell>,
    tracker: TaskTracker,
}

impl QueuePoller {
    async fn run(self, shutdown: CancellationToken) {
        info!(host = %self.host, queue = %self.queue_type, concurrency = self.config.host_concurrency, "queue poller started");

        let slots = Arc::new(Semaphore::new(self.config.host_concurrency));
        let mut interval = tokio::time::interval(self.config.poll_period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let free = slots.available_permits();
            if free == 0 {
                continue;
            }

            let store = &self.store;
            let queue_type = &self.queue_type;
            let timeout = self.config.heartbeat_timeout;
            let jobs = match retry_transient(&self.retry, "acquire", || {
                store.acquire(queue_type, free, timeout)
            })
            .await
            {
                Ok(jobs) => jobs,
                Err(err) => {
                    error!(host = %self.host, queue = %self.queue_type, error = %err, "acquire failed");
                    continue;
                }
            };

            for job in jobs {
                let Ok(permit) = slots.clone().acquire_owned().await else {
                    break;
                };
                let Some(run_token) = job.run_token else {
                    error!(job_id = %job.id, "acquired job without run token");
                    continue;
                };
                self.stats.update(|s| {
                    s.jobs_claimed += 1;
                    s.current_running += 1;
                });
                debug!(host = %self.host, job_id = %job.id, queue = %self.queue_type, retry_count = job.retry_count, "claimed job");

                let run = JobRun {
                    ctx: JobContext::new(
                        &job,
                        run_token,
                        self.store.clone(),
                        self.retry.clone(),
                        shutdown.child_token(),
                    ),
                    job,
                    handler: self.handler.clone(),
                    heartbeat_interval: self.config.heartbeat_interval(),
                    stats: self.stats.clone(),
                };
                self.tracker.spawn(async move {
                    run.execute().await;
                    drop(permit);
                });
            }
        }

        info!(host = %self.host, queue = %self.queue_type, "queue poller stopped");
    }
}

/// One claimed job, from dispatch to the final claim-protocol call.
struct JobRun {
    job: Job,
    ctx: JobContext,
    handler: Arc<dyn JobHandler>,
    heartbeat_interval: Duration,
    stats: Arc<StatsCell>,
}

enum HandlerOutcome {
    Success(JsonValue),
    Failure(Failure),
    /// Stopped by host shutdown rather than by a fault of its own.
    Interrupted(String),
    LeaseLost,
}

impl JobRun {
    async fn execute(self) {
        let JobRun {
            job,
            ctx,
            handler,
            heartbeat_interval,
            stats,
        } = self;
        let job_id = job.id;

        let done = CancellationToken::new();
        let ticker = tokio::spawn(LeaseKeeper::new(ctx.clone(), heartbeat_interval).run(done.clone()));

        let handler_ctx = ctx.clone();
        let joined = tokio::spawn(async move { handler.execute(job, handler_ctx).await }).await;

        done.cancel();
        if let Err(err) = ticker.await {
            warn!(job_id = %job_id, error = %err, "heartbeat ticker ended abnormally");
        }

        let outcome = match joined {
            _ if ctx.lease_lost() => HandlerOutcome::LeaseLost,
            Ok(Ok(result)) => HandlerOutcome::Success(result),
            Ok(Err(HandlerError::LeaseLost)) => HandlerOutcome::LeaseLost,
            Ok(Err(HandlerError::Fatal(message))) => HandlerOutcome::Failure(
                Failure::fatal(message.clone())
                    .with_details(serde_json::json!({ "kind": "fatal", "error": message })),
            ),
            Ok(Err(err)) if ctx.is_cancelled() && !ctx.cancel_requested() => {
                HandlerOutcome::Interrupted(err.to_string())
            }
            Ok(Err(err)) => {
                let message = err.to_string();
                HandlerOutcome::Failure(Failure::retryable(message.clone()).with_details(
                    serde_json::json!({
                        "kind": err.kind(),
                        "error": message,
                        "chain": error_chain(&err),
                    }),
                ))
            }
            Err(join_err) => {
                stats.update(|s| s.handler_panics += 1);
                let message = panic_message(join_err);
                error!(job_id = %job_id, panic = %message, "handler panicked");
                HandlerOutcome::Failure(
                    Failure::retryable(format!("handler panicked: {message}"))
                        .with_details(serde_json::json!({ "kind": "panic", "error": message })),
                )
            }
        };

        settle(&ctx, outcome, &stats).await;
        stats.update(|s| s.current_running = s.current_running.saturating_sub(1));
    }
}

/// Route a handler outcome through Complete/Fail/Release.
async fn settle(ctx: &JobContext, outcome: HandlerOutcome, stats: &StatsCell) {
    let job_id = ctx.job_id();
    let run_token = ctx.run_token();
    let store = ctx.store();
    let retry = ctx.retry_policy();

    match outcome {
        HandlerOutcome::LeaseLost => {
            stats.update(|s| s.leases_lost += 1);
            warn!(job_id = %job_id, "lease lost, dropping handler outcome");
        }
        HandlerOutcome::Success(result) => {
            match retry_transient(retry, "complete", || {
                store.complete(job_id, run_token, result.clone())
            })
            .await
            {
                Ok(CompleteOutcome::Completed(_)) => {
                    stats.update(|s| s.jobs_completed += 1);
                    info!(job_id = %job_id, "job completed");
                }
                Ok(CompleteOutcome::Lost) => {
                    stats.update(|s| s.leases_lost += 1);
                    warn!(job_id = %job_id, "lease lost before completion was recorded");
                }
                Err(err) => {
                    error!(job_id = %job_id, error = %err, "failed to record completion; job will be reclaimed");
                }
            }
        }
        HandlerOutcome::Interrupted(message) => {
            let reason = format!("host shutdown: {message}");
            match retry_transient(retry, "release", || store.release(job_id, run_token, &reason)).await {
                Ok(ReleaseOutcome::Released) => {
                    stats.update(|s| s.jobs_released += 1);
                    info!(job_id = %job_id, "job released on shutdown");
                }
                Ok(ReleaseOutcome::Cancelled) => {
                    stats.update(|s| s.jobs_cancelled += 1);
                    info!(job_id = %job_id, "job cancelled");
                }
                Ok(ReleaseOutcome::Lost) => {
                    stats.update(|s| s.leases_lost += 1);
                    warn!(job_id = %job_id, "lease lost before release was recorded");
                }
                Err(err) => {
                    error!(job_id = %job_id, error = %err, "failed to release job; it will be reclaimed");
                }
            }
        }
        HandlerOutcome::Failure(failure) => {
            let retryable = failure.retryable;
            let message = failure.message.clone();
            match retry_transient(retry, "fail", || store.fail(job_id, run_token, failure.clone())).await {
                Ok(FailOutcome::Requeued { retry_count }) => {
                    stats.update(|s| s.jobs_requeued += 1);
                    warn!(job_id = %job_id, retry_count, error = %message, "job failed, requeued");
                }
                Ok(FailOutcome::Failed) => {
                    stats.update(|s| s.jobs_failed += 1);
                    error!(job_id = %job_id, retryable, error = %message, "job failed");
                }
                Ok(FailOutcome::Cancelled) => {
                    stats.update(|s| s.jobs_cancelled += 1);
                    info!(job_id = %job_id, "job cancelled");
                }
                Ok(FailOutcome::Lost) => {
                    stats.update(|s| s.leases_lost += 1);
                    warn!(job_id = %job_id, "lease lost before failure was recorded");
                }
                Err(err) => {
                    error!(job_id = %job_id, error = %err, "failed to record failure; job will be reclaimed");
                }
            }
        }
    }
}

fn error_chain(err: &HandlerError) -> Vec<String> {
    let mut chain = Vec::new();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        chain.push(cause.to_string());
        source = cause.source();
    }
    chain
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
