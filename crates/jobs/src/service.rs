//! Enqueue and query API in front of a job store.
//!
//! Validation happens here, synchronously: a rejected request never creates a job.

use std::sync::Arc;

use tracing::{info, instrument};

use fhirq_core::{ExpectedVersion, GroupId, JobId, QueueType, TenantId};

use crate::config::EngineConfig;
use crate::group::{GroupProgress, GroupStatus};
use crate::store::{JobFilter, JobStore, JobStoreError, QueueStats};
use crate::types::{EnqueueRequest, Job};

#[derive(Clone)]
pub struct JobService {
    store: Arc<dyn JobStore>,
    config: Arc<EngineConfig>,
}

impl std::fmt::Debug for JobService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobService")
            .field("queues", &self.config.queues.len())
            .finish_non_exhaustive()
    }
}

impl JobService {
    pub fn new(store: Arc<dyn JobStore>, config: Arc<EngineConfig>) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    fn prepare(&self, mut request: EnqueueRequest) -> Result<EnqueueRequest, JobStoreError> {
        if request.queue_type.is_watchdog() {
            return Err(JobStoreError::Validation(format!(
                "{} is managed by its watchdog and cannot be enqueued directly",
                request.queue_type
            )));
        }
        let Some(queue) = self.config.queue(&request.queue_type) else {
            return Err(JobStoreError::Validation(format!(
                "queue type {} is not configured",
                request.queue_type
            )));
        };
        if !request.definition.is_object() {
            return Err(JobStoreError::Validation(
                "job definition must be a JSON object".to_string(),
            ));
        }
        if request.max_retry_count.is_none() {
            request.max_retry_count = Some(queue.max_retry_count);
        }
        Ok(request)
    }

    /// `Enqueue(queueType, groupId?, priority?, definition) -> jobId`.
    #[instrument(skip(self, request), fields(queue = %request.queue_type, tenant_id = %request.tenant_id), err)]
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<JobId, JobStoreError> {
        let request = self.prepare(request)?;
        let job_id = self.store.enqueue(request).await?;
        info!(job_id = %job_id, "job enqueued");
        Ok(job_id)
    }

    /// Validate every request first; nothing is created if any is invalid.
    pub async fn enqueue_batch(
        &self,
        requests: Vec<EnqueueRequest>,
    ) -> Result<Vec<JobId>, JobStoreError> {
        let requests = requests
            .into_iter()
            .map(|r| self.prepare(r))
            .collect::<Result<Vec<_>, _>>()?;
        self.store.enqueue_batch(requests).await
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or(JobStoreError::NotFound(job_id))
    }

    pub async fn group_status(&self, group_id: GroupId) -> Result<GroupStatus, JobStoreError> {
        self.store.group_status(group_id).await
    }

    pub async fn group_progress(&self, group_id: GroupId) -> Result<GroupProgress, JobStoreError> {
        self.store.group_progress(group_id).await
    }

    pub async fn list_jobs(
        &self,
        tenant_id: TenantId,
        filter: JobFilter,
    ) -> Result<Vec<Job>, JobStoreError> {
        self.store.list_jobs(tenant_id, filter).await
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn request_cancel(
        &self,
        job_id: JobId,
        expected_version: ExpectedVersion,
    ) -> Result<Job, JobStoreError> {
        self.store.request_cancel(job_id, expected_version).await
    }

    pub async fn request_cancel_group(&self, group_id: GroupId) -> Result<usize, JobStoreError> {
        self.store.request_cancel_group(group_id).await
    }

    /// Counters for a configured queue, using its heartbeat timeout.
    pub async fn queue_stats(&self, queue_type: &QueueType) -> Result<QueueStats, JobStoreError> {
        let queue = self.config.queue(queue_type).ok_or_else(|| {
            JobStoreError::Validation(format!("queue type {queue_type} is not configured"))
        })?;
        self.store.queue_stats(queue_type, queue.heartbeat_timeout).await
    }
}
