//! Durable, multi-tenant background job engine.
//!
//! ## Design
//!
//! - A job is a persistent record in a [`JobStore`]; ownership is a lease fenced by a run token
//! - Workers claim jobs with `acquire`, renew the lease with heartbeats and finish with
//!   `complete` or `fail`
//! - A job whose heartbeat goes stale is reclaimed by the next `acquire` on its queue type
//! - Per-queue admission (`maxConcurrentRunning`) is evaluated atomically with the claim
//! - Execution is at-least-once: handlers must be idempotent or checkpoint their progress
//!
//! ## Components
//!
//! - [`JobStore`]: claim protocol and read APIs ([`InMemoryJobStore`], [`PostgresJobStore`])
//! - [`WorkerHost`]: per-instance polling loops, lease keeping and outcome routing
//! - [`OrchestratorHandler`]: fan-out of child job groups
//! - [`Watchdog`]: self-leasing singleton maintenance tasks
//! - [`AdaptiveThrottleController`]: batch sizing against datastore pressure
//! - [`JobService`]: validated enqueue and query API

pub mod admission;
pub mod clock;
pub mod config;
pub mod group;
pub mod host;
pub mod orchestrator;
pub mod retry;
pub mod service;
pub mod store;
pub mod throttle;
pub mod types;
pub mod watchdog;

mod integration_tests;

pub use admission::{AdmissionController, QueueLimits, StaticLimits};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, EngineConfig, HostConfig, QueueConfig, WatchdogConfig};
pub use group::{GroupProgress, GroupStatus};
pub use host::{
    FnHandler, HandlerError, HostStats, JobContext, JobHandler, ShutdownReport, WorkerHost,
    WorkerHostHandle,
};
pub use orchestrator::{ChildPlanner, ChildSpec, OrchestrationMode, OrchestratorHandler};
pub use retry::{RetryPolicy, retry_transient};
pub use service::JobService;
pub use store::{InMemoryJobStore, JobFilter, JobStore, JobStoreError, PostgresJobStore, QueueStats};
pub use throttle::{
    AdaptiveThrottleController, NoopThrottleController, ThrottleConfig, ThrottleController,
    UsageSample, UsageSampler,
};
pub use types::{
    AttemptOutcome, AttemptRecord, CompleteOutcome, EnqueueRequest, FailOutcome, Failure,
    HeartbeatOutcome, Job, JobStatus,
};
pub use watchdog::{StaleLeaseReporter, Watchdog, WatchdogTask};
