//! End-to-end tests: service → store → worker host → handlers.
//!
//! Verifies:
//! - Jobs complete, retry and fail through the host
//! - A crashed worker's job is reclaimed and finished by another host
//! - Cancellation reaches a running handler through its heartbeat
//! - Orchestrators fan out child groups that other handlers drain
//! - Admission holds across two hosts sharing one store
//! - Watchdogs run under the host

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{Value as JsonValue, json};

    use fhirq_core::{ExpectedVersion, GroupId, JobId, QueueType, TenantId};

    use crate::clock::ManualClock;
    use crate::config::{EngineConfig, QueueConfig, WatchdogConfig};
    use crate::group::GroupStatus;
    use crate::host::{FnHandler, HandlerError, JobContext, WorkerHost};
    use crate::orchestrator::{ChildPlanner, ChildSpec, OrchestratorHandler};
    use crate::retry::RetryPolicy;
    use crate::service::JobService;
    use crate::store::{InMemoryJobStore, JobFilter, JobStore};
    use crate::types::{AttemptOutcome, EnqueueRequest, Job, JobStatus};
    use crate::watchdog::StaleLeaseReporter;

    fn queue(heartbeat_timeout: Duration) -> QueueConfig {
        QueueConfig {
            heartbeat_timeout,
            poll_period: Duration::from_millis(10),
            max_retry_count: 3,
            host_concurrency: 4,
            max_concurrent_running: 100,
            ..QueueConfig::default()
        }
    }

    fn config(queues: &[QueueType]) -> EngineConfig {
        let mut config = EngineConfig::default();
        for q in queues {
            config = config.with_queue(q.clone(), queue(Duration::from_secs(30)));
        }
        config.host.shutdown_grace = Duration::from_secs(2);
        config.host.store_retry = RetryPolicy::fixed(2, Duration::from_millis(1));
        config
    }

    fn in_memory(config: &EngineConfig) -> Arc<dyn JobStore> {
        Arc::new(InMemoryJobStore::new(Arc::new(config.clone())))
    }

    async fn wait_for<F>(store: &Arc<dyn JobStore>, id: JobId, done: F) -> Job
    where
        F: Fn(&Job) -> bool,
    {
        for _ in 0..300 {
            let job = store.get_job(id).await.unwrap().unwrap();
            if done(&job) {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never reached the expected state");
    }

    #[tokio::test]
    async fn enqueued_job_runs_to_completion() {
        let config = config(&[QueueType::Export]);
        let store = in_memory(&config);
        let service = JobService::new(store.clone(), Arc::new(config.clone()));
        let tenant = TenantId::new();

        let id = service
            .enqueue(EnqueueRequest::new(tenant, QueueType::Export, json!({"type": "Patient"})))
            .await
            .unwrap();

        let mut host = WorkerHost::new(store.clone(), config);
        host.register_handler(
            QueueType::Export,
            FnHandler(|job: Job, ctx: JobContext| async move {
                ctx.checkpoint(json!({"page": 1})).await?;
                Ok::<_, HandlerError>(json!({"exported": job.definition["type"]}))
            }),
        );
        let handle = host.spawn();

        let job = wait_for(&store, id, |j| j.status == JobStatus::Completed).await;
        assert_eq!(job.result, Some(json!({"exported": "Patient"})));
        assert_eq!(job.context, Some(json!({"page": 1})));
        assert_eq!(job.history.len(), 1);
        assert_eq!(job.history[0].outcome, AttemptOutcome::Completed);

        let listed = service
            .list_jobs(tenant, JobFilter::default().status(JobStatus::Completed))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);

        assert!(handle.shutdown().await.drained);
    }

    #[tokio::test]
    async fn transient_handler_error_is_retried() {
        let config = config(&[QueueType::BulkUpdate]);
        let store = in_memory(&config);
        let id = store
            .enqueue(EnqueueRequest::new(TenantId::new(), QueueType::BulkUpdate, json!({})))
            .await
            .unwrap();

        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = attempts.clone();
        let mut host = WorkerHost::new(store.clone(), config);
        host.register_handler(
            QueueType::BulkUpdate,
            FnHandler(move |_job: Job, _ctx: JobContext| {
                let seen = seen.clone();
                async move {
                    if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                        return Err(HandlerError::retryable("datastore busy"));
                    }
                    Ok(json!({"updated": 10}))
                }
            }),
        );
        let handle = host.spawn();

        let job = wait_for(&store, id, |j| j.status == JobStatus::Completed).await;
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.history[0].outcome, AttemptOutcome::Requeued);
        assert_eq!(job.history[0].error.as_deref(), Some("retryable: datastore busy"));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn crashed_worker_job_is_reclaimed_by_another_host() {
        let clock = ManualClock::default();
        let config = config(&[QueueType::Reindex]);
        let store: Arc<dyn JobStore> = Arc::new(
            InMemoryJobStore::new(Arc::new(config.clone())).with_clock(Arc::new(clock.clone())),
        );
        let id = store
            .enqueue(EnqueueRequest::new(TenantId::new(), QueueType::Reindex, json!({})))
            .await
            .unwrap();

        // A worker claims the job and dies without heartbeating.
        let crashed = store
            .acquire(&QueueType::Reindex, 1, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(crashed.len(), 1);
        let stale_token = crashed[0].run_token.unwrap();
        clock.advance(Duration::from_secs(31));

        let mut host = WorkerHost::new(store.clone(), config);
        host.register_handler(
            QueueType::Reindex,
            FnHandler(|_job: Job, _ctx: JobContext| async move {
                Ok::<_, HandlerError>(json!({"reindexed": true}))
            }),
        );
        let handle = host.spawn();

        let job = wait_for(&store, id, |j| j.status == JobStatus::Completed).await;
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.history[0].outcome, AttemptOutcome::Abandoned);
        assert_ne!(job.run_token, Some(stale_token));
        handle.shutdown().await;

        // The crashed worker wakes up: its writes are rejected.
        let late = store.complete(id, stale_token, json!({"late": true})).await.unwrap();
        assert_eq!(late, crate::types::CompleteOutcome::Lost);
        let after = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(after.result, Some(json!({"reindexed": true})));
    }

    #[tokio::test]
    async fn cancel_request_reaches_running_handler() {
        let mut config = config(&[]);
        config = config.with_queue(QueueType::BulkDelete, queue(Duration::from_millis(150)));
        let store = in_memory(&config);
        let service = JobService::new(store.clone(), Arc::new(config.clone()));

        let id = service
            .enqueue(EnqueueRequest::new(TenantId::new(), QueueType::BulkDelete, json!({})))
            .await
            .unwrap();

        let mut host = WorkerHost::new(store.clone(), config);
        host.register_handler(
            QueueType::BulkDelete,
            FnHandler(|_job: Job, ctx: JobContext| async move {
                while ctx.ensure_active().is_ok() {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Err::<JsonValue, _>(HandlerError::Cancelled)
            }),
        );
        let handle = host.spawn();

        wait_for(&store, id, |j| j.status == JobStatus::Running).await;
        let job = service.request_cancel(id, ExpectedVersion::Any).await.unwrap();
        assert!(job.cancel_requested);

        let job = wait_for(&store, id, |j| j.status == JobStatus::Cancelled).await;
        assert_eq!(job.history.last().unwrap().outcome, AttemptOutcome::Cancelled);
        assert_eq!(handle.stats().jobs_cancelled, 1);
        handle.shutdown().await;
    }

    struct OnePerType;

    #[async_trait]
    impl ChildPlanner for OnePerType {
        async fn plan(&self, parent: &Job) -> Result<Vec<ChildSpec>, HandlerError> {
            let types = parent.definition["types"].as_array().cloned().unwrap_or_default();
            Ok(types
                .into_iter()
                .map(|t| ChildSpec::new(QueueType::SubscriptionProcessing, json!({"type": t})))
                .collect())
        }
    }

    #[tokio::test]
    async fn orchestrator_fans_out_and_children_complete() {
        let config = config(&[
            QueueType::SubscriptionOrchestrator,
            QueueType::SubscriptionProcessing,
        ]);
        let store = in_memory(&config);
        let tenant = TenantId::new();
        let parent = store
            .enqueue(EnqueueRequest::new(
                tenant,
                QueueType::SubscriptionOrchestrator,
                json!({"types": ["Patient", "Observation", "Encounter"]}),
            ))
            .await
            .unwrap();

        let mut host = WorkerHost::new(store.clone(), config);
        host.register_handler(
            QueueType::SubscriptionOrchestrator,
            OrchestratorHandler::fire_and_forget(OnePerType),
        );
        host.register_handler(
            QueueType::SubscriptionProcessing,
            FnHandler(|job: Job, _ctx: JobContext| async move {
                Ok::<_, HandlerError>(json!({"notified": job.definition["type"]}))
            }),
        );
        let handle = host.spawn();

        let parent = wait_for(&store, parent, |j| j.status == JobStatus::Completed).await;
        let result = parent.result.unwrap();
        let group_id: GroupId = result["groupId"].as_str().unwrap().parse().unwrap();
        assert_eq!(result["childCount"], 3);

        for _ in 0..300 {
            if store.group_status(group_id).await.unwrap() == GroupStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let progress = store.group_progress(group_id).await.unwrap();
        assert_eq!(progress.completed, 3);
        assert_eq!(progress.status(), GroupStatus::Completed);

        let children = store.list_group(group_id).await.unwrap();
        assert!(children.iter().all(|c| c.tenant_id == tenant));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn admission_cap_holds_across_hosts() {
        let mut config = config(&[]);
        config = config.with_queue(
            QueueType::Import,
            QueueConfig {
                max_concurrent_running: 2,
                ..queue(Duration::from_secs(30))
            },
        );
        let store = in_memory(&config);
        let tenant = TenantId::new();
        let mut ids = Vec::new();
        for n in 0..8 {
            ids.push(
                store
                    .enqueue(EnqueueRequest::new(tenant, QueueType::Import, json!({"n": n})))
                    .await
                    .unwrap(),
            );
        }

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for name in ["host-a", "host-b"] {
            let running = running.clone();
            let peak = peak.clone();
            let mut host = WorkerHost::new(store.clone(), config.clone()).with_name(name);
            host.register_handler(
                QueueType::Import,
                FnHandler(move |_job: Job, _ctx: JobContext| {
                    let running = running.clone();
                    let peak = peak.clone();
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, HandlerError>(JsonValue::Null)
                    }
                }),
            );
            handles.push(host.spawn());
        }

        for id in ids {
            wait_for(&store, id, |j| j.status == JobStatus::Completed).await;
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        for handle in handles {
            handle.shutdown().await;
        }
    }

    #[tokio::test]
    async fn watchdog_runs_under_the_host() {
        let mut config = config(&[QueueType::Export]);
        config = config.with_watchdog(
            StaleLeaseReporter::watchdog_queue(),
            WatchdogConfig {
                enabled: true,
                period: Duration::from_millis(20),
                lease_period: Duration::from_secs(5),
                allow_rebalance: false,
            },
        );
        let store = in_memory(&config);

        let mut host = WorkerHost::new(store.clone(), config.clone());
        host.register_watchdog(StaleLeaseReporter::from_config(&config));
        let handle = host.spawn();

        let mut report = None;
        for _ in 0..300 {
            let rows = store
                .list_jobs(TenantId::SYSTEM, JobFilter::default())
                .await
                .unwrap();
            if let Some(context) = rows.first().and_then(|r| r.context.clone()) {
                report = Some((rows.len(), rows[0].status, context));
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let (rows, status, context) = report.expect("watchdog never checkpointed");
        assert_eq!(rows, 1);
        assert_eq!(status, JobStatus::Running);
        assert_eq!(context["queues"]["export"]["queued"], 0);

        handle.shutdown().await;
        let rows = store
            .list_jobs(TenantId::SYSTEM, JobFilter::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, JobStatus::Queued);
    }
}
