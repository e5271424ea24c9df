//! In-memory job store.
//!
//! One mutex guards the whole job table, so every claim, admission check and
//! conditional write is trivially atomic. Intended for tests/dev and for
//! single-process deployments.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use fhirq_core::{ExpectedVersion, GroupId, JobId, QueueType, RunToken, TenantId};

use super::{JobFilter, JobStore, JobStoreError, QueueStats};
use crate::admission::{AdmissionController, QueueLimits};
use crate::clock::{Clock, SystemClock};
use crate::types::{
    ClaimTransition, CompleteOutcome, EnqueueRequest, FailOutcome, Failure, HeartbeatOutcome, Job,
    ReleaseOutcome,
};

/// In-memory job store for tests/dev.
#[derive(Debug)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<JobId, Job>>,
    admission: AdmissionController,
    clock: Arc<dyn Clock>,
}

impl InMemoryJobStore {
    pub fn new(limits: Arc<dyn QueueLimits>) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            admission: AdmissionController::new(limits),
            clock: Arc::new(SystemClock),
        }
    }

    /// Store without admission caps.
    pub fn unlimited() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            admission: AdmissionController::unlimited(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .lock()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))
    }

    fn check_exclusive(
        jobs: &HashMap<JobId, Job>,
        pending: &[Job],
        request: &EnqueueRequest,
    ) -> Result<(), JobStoreError> {
        if !request.exclusive {
            return Ok(());
        }
        let clash = jobs.values().chain(pending.iter()).any(|j| {
            j.queue_type == request.queue_type
                && j.tenant_id == request.tenant_id
                && !j.status.is_terminal()
        });
        if clash {
            return Err(JobStoreError::Conflict(format!(
                "an active {} job already exists for tenant {}",
                request.queue_type, request.tenant_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<JobId, JobStoreError> {
        let ids = self.enqueue_batch(vec![request]).await?;
        ids.into_iter()
            .next()
            .ok_or_else(|| JobStoreError::Storage("enqueue produced no job".to_string()))
    }

    async fn enqueue_batch(
        &self,
        requests: Vec<EnqueueRequest>,
    ) -> Result<Vec<JobId>, JobStoreError> {
        let now = self.clock.now();
        let mut jobs = self.lock()?;

        let mut pending: Vec<Job> = Vec::with_capacity(requests.len());
        for request in requests {
            Self::check_exclusive(&jobs, &pending, &request)?;
            pending.push(Job::new(request, now));
        }

        let ids: Vec<JobId> = pending.iter().map(|j| j.id).collect();
        for job in pending {
            debug!(job_id = %job.id, queue = %job.queue_type, group_id = ?job.group_id, "job enqueued");
            jobs.insert(job.id, job);
        }
        Ok(ids)
    }

    async fn acquire(
        &self,
        queue_type: &QueueType,
        max_count: usize,
        heartbeat_timeout: Duration,
    ) -> Result<Vec<Job>, JobStoreError> {
        if max_count == 0 {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let mut jobs = self.lock()?;

        let live_running = jobs
            .values()
            .filter(|j| &j.queue_type == queue_type && j.is_live(now, heartbeat_timeout))
            .count();
        let wanted = max_count.min(self.admission.available_slots(queue_type, live_running));
        if wanted == 0 {
            return Ok(Vec::new());
        }

        let mut candidates: Vec<&Job> = jobs
            .values()
            .filter(|j| &j.queue_type == queue_type && j.is_claimable(now, heartbeat_timeout))
            .collect();
        candidates.sort_by_key(|j| j.claim_order());
        let candidate_ids: Vec<JobId> = candidates.into_iter().map(|j| j.id).collect();

        let mut claimed = Vec::with_capacity(wanted);
        for id in candidate_ids {
            if claimed.len() == wanted {
                break;
            }
            let Some(job) = jobs.get_mut(&id) else {
                continue;
            };
            let reclaim = job.status == crate::types::JobStatus::Running;
            match job.claim(now, RunToken::new()) {
                ClaimTransition::Claimed => {
                    if reclaim {
                        info!(job_id = %job.id, queue = %queue_type, retry_count = job.retry_count, "reclaimed stale job");
                    }
                    claimed.push(job.clone());
                }
                ClaimTransition::Exhausted => {
                    warn!(job_id = %job.id, queue = %queue_type, retry_count = job.retry_count, "stale job exhausted its retries, marked failed");
                }
                ClaimTransition::Cancelled => {
                    info!(job_id = %job.id, queue = %queue_type, "stale job had a pending cancel request, marked cancelled");
                }
            }
        }

        Ok(claimed)
    }

    async fn heartbeat(
        &self,
        job_id: JobId,
        run_token: RunToken,
        context: Option<JsonValue>,
    ) -> Result<HeartbeatOutcome, JobStoreError> {
        let now = self.clock.now();
        let mut jobs = self.lock()?;
        Ok(match jobs.get_mut(&job_id) {
            Some(job) => job.heartbeat(now, run_token, context),
            None => HeartbeatOutcome::Lost,
        })
    }

    async fn complete(
        &self,
        job_id: JobId,
        run_token: RunToken,
        result: JsonValue,
    ) -> Result<CompleteOutcome, JobStoreError> {
        let now = self.clock.now();
        let mut jobs = self.lock()?;
        Ok(match jobs.get_mut(&job_id) {
            Some(job) => job.complete(now, run_token, result),
            None => CompleteOutcome::Lost,
        })
    }

    async fn fail(
        &self,
        job_id: JobId,
        run_token: RunToken,
        failure: Failure,
    ) -> Result<FailOutcome, JobStoreError> {
        let now = self.clock.now();
        let mut jobs = self.lock()?;
        Ok(match jobs.get_mut(&job_id) {
            Some(job) => job.fail(now, run_token, failure),
            None => FailOutcome::Lost,
        })
    }

    async fn release(
        &self,
        job_id: JobId,
        run_token: RunToken,
        reason: &str,
    ) -> Result<ReleaseOutcome, JobStoreError> {
        let now = self.clock.now();
        let mut jobs = self.lock()?;
        Ok(match jobs.get_mut(&job_id) {
            Some(job) => job.release(now, run_token, reason),
            None => ReleaseOutcome::Lost,
        })
    }

    async fn request_cancel(
        &self,
        job_id: JobId,
        expected_version: ExpectedVersion,
    ) -> Result<Job, JobStoreError> {
        let now = self.clock.now();
        let mut jobs = self.lock()?;
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        expected_version.check(job.version)?;
        if job.request_cancel(now) {
            info!(job_id = %job_id, status = %job.status, "cancel requested");
        }
        Ok(job.clone())
    }

    async fn request_cancel_group(&self, group_id: GroupId) -> Result<usize, JobStoreError> {
        let now = self.clock.now();
        let mut jobs = self.lock()?;
        let mut changed = 0;
        for job in jobs.values_mut().filter(|j| j.group_id == Some(group_id)) {
            if job.request_cancel(now) {
                changed += 1;
            }
        }
        info!(group_id = %group_id, changed, "group cancel requested");
        Ok(changed)
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.lock()?.get(&job_id).cloned())
    }

    async fn list_group(&self, group_id: GroupId) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.lock()?;
        let mut members: Vec<Job> = jobs
            .values()
            .filter(|j| j.group_id == Some(group_id))
            .cloned()
            .collect();
        members.sort_by_key(|j| (j.created_at, j.id));
        Ok(members)
    }

    async fn list_jobs(
        &self,
        tenant_id: TenantId,
        filter: JobFilter,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.lock()?;
        let mut result: Vec<Job> = jobs
            .values()
            .filter(|j| j.tenant_id == tenant_id && filter.matches(j))
            .cloned()
            .collect();
        result.sort_by_key(|j| (j.created_at, j.id));
        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    async fn available_slots(
        &self,
        queue_type: &QueueType,
        heartbeat_timeout: Duration,
    ) -> Result<usize, JobStoreError> {
        let now = self.clock.now();
        let jobs = self.lock()?;
        let live_running = jobs
            .values()
            .filter(|j| &j.queue_type == queue_type && j.is_live(now, heartbeat_timeout))
            .count();
        Ok(self.admission.available_slots(queue_type, live_running))
    }

    async fn queue_stats(
        &self,
        queue_type: &QueueType,
        heartbeat_timeout: Duration,
    ) -> Result<QueueStats, JobStoreError> {
        let now = self.clock.now();
        let jobs = self.lock()?;
        let mut stats = QueueStats::default();
        for job in jobs.values().filter(|j| &j.queue_type == queue_type) {
            stats.record(job, now, heartbeat_timeout);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::StaticLimits;
    use crate::clock::ManualClock;
    use crate::group::GroupStatus;
    use crate::types::JobStatus;

    const TIMEOUT: Duration = Duration::from_secs(60);

    fn setup(limits: StaticLimits) -> (Arc<InMemoryJobStore>, ManualClock) {
        let clock = ManualClock::default();
        let store = InMemoryJobStore::new(Arc::new(limits))
            .with_clock(Arc::new(clock.clone()))
            .arc();
        (store, clock)
    }

    fn export(tenant: TenantId) -> EnqueueRequest {
        EnqueueRequest::new(tenant, QueueType::Export, serde_json::json!({"since": "2024-01-01"}))
    }

    #[tokio::test]
    async fn acquire_returns_queued_and_stale_jobs_with_fresh_tokens() {
        let (store, clock) = setup(StaticLimits::new());
        let tenant = TenantId::new();

        // Two jobs that end up Running with a 90s old heartbeat.
        store.enqueue(export(tenant)).await.unwrap();
        store.enqueue(export(tenant)).await.unwrap();
        let stale = store.acquire(&QueueType::Export, 2, TIMEOUT).await.unwrap();
        assert_eq!(stale.len(), 2);
        clock.advance(Duration::from_secs(90));

        for _ in 0..3 {
            store.enqueue(export(tenant)).await.unwrap();
        }

        let claimed = store.acquire(&QueueType::Export, 5, TIMEOUT).await.unwrap();
        assert_eq!(claimed.len(), 5);
        assert!(claimed.iter().all(|j| j.status == JobStatus::Running));
        assert!(claimed.iter().all(|j| j.heartbeat_at == clock.now()));

        for old in &stale {
            let fresh = claimed.iter().find(|j| j.id == old.id).unwrap();
            assert_eq!(fresh.retry_count, old.retry_count + 1);
            assert_ne!(fresh.run_token, old.run_token);
        }
        let reclaimed = claimed.iter().filter(|j| j.retry_count == 1).count();
        assert_eq!(reclaimed, 2);
    }

    #[tokio::test]
    async fn stalest_jobs_are_claimed_first() {
        let (store, clock) = setup(StaticLimits::new());
        let tenant = TenantId::new();

        let first = store.enqueue(export(tenant)).await.unwrap();
        clock.advance(Duration::from_secs(1));
        let second = store.enqueue(export(tenant)).await.unwrap();

        let claimed = store.acquire(&QueueType::Export, 1, TIMEOUT).await.unwrap();
        assert_eq!(claimed[0].id, first);
        let claimed = store.acquire(&QueueType::Export, 1, TIMEOUT).await.unwrap();
        assert_eq!(claimed[0].id, second);
    }

    #[tokio::test]
    async fn priority_outranks_age() {
        let (store, clock) = setup(StaticLimits::new());
        let tenant = TenantId::new();

        store.enqueue(export(tenant)).await.unwrap();
        clock.advance(Duration::from_secs(1));
        let urgent = store.enqueue(export(tenant).with_priority(10)).await.unwrap();

        let claimed = store.acquire(&QueueType::Export, 1, TIMEOUT).await.unwrap();
        assert_eq!(claimed[0].id, urgent);
    }

    #[tokio::test]
    async fn live_running_job_is_not_claimable() {
        let (store, clock) = setup(StaticLimits::new());
        store.enqueue(export(TenantId::new())).await.unwrap();
        store.acquire(&QueueType::Export, 1, TIMEOUT).await.unwrap();

        clock.advance(Duration::from_secs(59));
        assert!(store.acquire(&QueueType::Export, 1, TIMEOUT).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_acquires_hand_out_a_single_job_once() {
        let (store, _clock) = setup(StaticLimits::new());
        store.enqueue(EnqueueRequest::new(
            TenantId::new(),
            QueueType::Reindex,
            serde_json::json!({}),
        ))
        .await
        .unwrap();

        let a = {
            let store = store.clone();
            tokio::spawn(async move { store.acquire(&QueueType::Reindex, 1, TIMEOUT).await })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move { store.acquire(&QueueType::Reindex, 1, TIMEOUT).await })
        };
        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();

        assert_eq!(a.len() + b.len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_with_stale_token_is_lost_and_changes_nothing() {
        let (store, clock) = setup(StaticLimits::new());
        let id = store.enqueue(export(TenantId::new())).await.unwrap();
        let first = store.acquire(&QueueType::Export, 1, TIMEOUT).await.unwrap();
        let stale_token = first[0].run_token.unwrap();

        clock.advance(Duration::from_secs(90));
        store.acquire(&QueueType::Export, 1, TIMEOUT).await.unwrap();
        let before = store.get_job(id).await.unwrap().unwrap();

        clock.advance(Duration::from_secs(1));
        let outcome = store.heartbeat(id, stale_token, Some(serde_json::json!({"page": 9}))).await.unwrap();
        assert_eq!(outcome, HeartbeatOutcome::Lost);

        let complete = store.complete(id, stale_token, serde_json::json!({})).await.unwrap();
        assert_eq!(complete, CompleteOutcome::Lost);

        let after = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(after, before);

        let release = store.release(id, stale_token, "host shutdown").await.unwrap();
        assert_eq!(release, ReleaseOutcome::Lost);
        assert_eq!(store.get_job(id).await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn released_job_frees_its_slot_and_keeps_its_budget() {
        let (store, _clock) = setup(StaticLimits::new().with(QueueType::Export, 1));
        let id = store.enqueue(export(TenantId::new()).with_max_retry_count(0)).await.unwrap();

        let held = store.acquire(&QueueType::Export, 1, TIMEOUT).await.unwrap();
        let token = held[0].run_token.unwrap();
        assert_eq!(store.available_slots(&QueueType::Export, TIMEOUT).await.unwrap(), 0);

        let outcome = store.release(id, token, "host shutdown").await.unwrap();
        assert_eq!(outcome, ReleaseOutcome::Released);
        assert_eq!(store.available_slots(&QueueType::Export, TIMEOUT).await.unwrap(), 1);

        let again = store.acquire(&QueueType::Export, 1, TIMEOUT).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, id);
        assert_eq!(again[0].retry_count, 0);
        assert_ne!(again[0].run_token, Some(token));
    }

    #[tokio::test]
    async fn heartbeat_updates_context_without_changing_status() {
        let (store, clock) = setup(StaticLimits::new());
        let id = store.enqueue(export(TenantId::new())).await.unwrap();
        let job = store.acquire(&QueueType::Export, 1, TIMEOUT).await.unwrap().remove(0);

        clock.advance(Duration::from_secs(10));
        let outcome = store
            .heartbeat(id, job.run_token.unwrap(), Some(serde_json::json!({"cursor": "abc"})))
            .await
            .unwrap();
        assert_eq!(outcome, HeartbeatOutcome::Alive { cancel_requested: false });

        let stored = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Running);
        assert_eq!(stored.context, Some(serde_json::json!({"cursor": "abc"})));
        assert_eq!(stored.heartbeat_at, clock.now());
    }

    #[tokio::test]
    async fn job_reclaimed_past_budget_ends_failed() {
        let (store, clock) = setup(StaticLimits::new());
        let id = store
            .enqueue(export(TenantId::new()).with_max_retry_count(2))
            .await
            .unwrap();

        assert_eq!(store.acquire(&QueueType::Export, 1, TIMEOUT).await.unwrap().len(), 1);
        for _ in 0..2 {
            clock.advance(Duration::from_secs(90));
            assert_eq!(store.acquire(&QueueType::Export, 1, TIMEOUT).await.unwrap().len(), 1);
        }
        clock.advance(Duration::from_secs(90));
        assert!(store.acquire(&QueueType::Export, 1, TIMEOUT).await.unwrap().is_empty());

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 2);
    }

    #[tokio::test]
    async fn admission_cap_bounds_claims() {
        let (store, clock) = setup(StaticLimits::new().with(QueueType::Import, 2));
        let tenant = TenantId::new();
        for _ in 0..5 {
            store
                .enqueue(EnqueueRequest::new(tenant, QueueType::Import, serde_json::json!({})))
                .await
                .unwrap();
        }

        assert_eq!(store.acquire(&QueueType::Import, 5, TIMEOUT).await.unwrap().len(), 2);
        assert!(store.acquire(&QueueType::Import, 5, TIMEOUT).await.unwrap().is_empty());
        assert_eq!(store.available_slots(&QueueType::Import, TIMEOUT).await.unwrap(), 0);

        // Stale jobs free their slot for reclamation.
        clock.advance(Duration::from_secs(90));
        assert_eq!(store.available_slots(&QueueType::Import, TIMEOUT).await.unwrap(), 2);
        assert_eq!(store.acquire(&QueueType::Import, 5, TIMEOUT).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn concurrent_acquires_respect_admission_cap() {
        let (store, _clock) = setup(StaticLimits::new().with(QueueType::BulkDelete, 3));
        let tenant = TenantId::new();
        for _ in 0..20 {
            store
                .enqueue(EnqueueRequest::new(tenant, QueueType::BulkDelete, serde_json::json!({})))
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.acquire(&QueueType::BulkDelete, 2, TIMEOUT).await.unwrap().len()
            }));
        }
        let mut total = 0;
        for h in handles {
            total += h.await.unwrap();
        }
        assert_eq!(total, 3);

        let stats = store.queue_stats(&QueueType::BulkDelete, TIMEOUT).await.unwrap();
        assert_eq!(stats.running, 3);
        assert_eq!(stats.queued, 17);
    }

    #[tokio::test]
    async fn exclusive_enqueue_rejects_second_active_job() {
        let (store, _clock) = setup(StaticLimits::new());
        let tenant = TenantId::new();

        store.enqueue(export(tenant).exclusive()).await.unwrap();
        let err = store.enqueue(export(tenant).exclusive()).await.unwrap_err();
        assert!(matches!(err, JobStoreError::Conflict(_)));

        // Other tenants are unaffected.
        store.enqueue(export(TenantId::new()).exclusive()).await.unwrap();
    }

    #[tokio::test]
    async fn batch_enqueue_is_all_or_nothing() {
        let (store, _clock) = setup(StaticLimits::new());
        let tenant = TenantId::new();

        let err = store
            .enqueue_batch(vec![export(tenant).exclusive(), export(tenant).exclusive()])
            .await
            .unwrap_err();
        assert!(matches!(err, JobStoreError::Conflict(_)));
        assert!(store.list_jobs(tenant, JobFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_respects_expected_version() {
        let (store, _clock) = setup(StaticLimits::new());
        let id = store.enqueue(export(TenantId::new())).await.unwrap();
        let job = store.get_job(id).await.unwrap().unwrap();

        let err = store
            .request_cancel(id, ExpectedVersion::Exact(job.version + 1))
            .await
            .unwrap_err();
        assert!(matches!(err, JobStoreError::Conflict(_)));

        let cancelled = store
            .request_cancel(id, ExpectedVersion::Exact(job.version))
            .await
            .unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(store.acquire(&QueueType::Export, 1, TIMEOUT).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn group_status_tracks_members() {
        let (store, _clock) = setup(StaticLimits::new());
        let tenant = TenantId::new();
        let group = GroupId::new();
        for _ in 0..3 {
            store.enqueue(export(tenant).in_group(group)).await.unwrap();
        }
        assert_eq!(store.group_status(group).await.unwrap(), GroupStatus::InProgress);

        let claimed = store.acquire(&QueueType::Export, 3, TIMEOUT).await.unwrap();
        for job in &claimed {
            store
                .complete(job.id, job.run_token.unwrap(), serde_json::json!({}))
                .await
                .unwrap();
        }
        assert_eq!(store.group_status(group).await.unwrap(), GroupStatus::Completed);

        assert!(matches!(
            store.group_status(GroupId::new()).await,
            Err(JobStoreError::GroupNotFound(_))
        ));
    }

    #[tokio::test]
    async fn group_cancel_touches_every_active_member() {
        let (store, _clock) = setup(StaticLimits::new());
        let tenant = TenantId::new();
        let group = GroupId::new();
        for _ in 0..3 {
            store.enqueue(export(tenant).in_group(group)).await.unwrap();
        }
        let running = store.acquire(&QueueType::Export, 1, TIMEOUT).await.unwrap().remove(0);

        assert_eq!(store.request_cancel_group(group).await.unwrap(), 3);
        let progress = store.group_progress(group).await.unwrap();
        assert_eq!(progress.cancelled, 2);
        assert_eq!(progress.running, 1);

        let outcome = store
            .heartbeat(running.id, running.run_token.unwrap(), None)
            .await
            .unwrap();
        assert_eq!(outcome, HeartbeatOutcome::Alive { cancel_requested: true });
    }
}
