//! Orchestrator jobs: fan out a group of child jobs.
//!
//! The group id is checkpointed into the parent's `context` before the children
//! are enqueued, so a reclaimed orchestrator resumes its existing group instead
//! of creating a second one. Children are enqueued as one atomic batch.
//! A parent that plans no children completes at once with `groupId: null`.
//!
//! Modes are chosen per queue type:
//! - `subscription-orchestrator`: fire-and-forget
//! - export-style fan-out: await the group

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use tracing::{info, warn};

use fhirq_core::{GroupId, QueueType};

use crate::group::{GroupProgress, GroupStatus};
use crate::host::{HandlerError, JobContext, JobHandler};
use crate::store::JobStoreError;
use crate::types::{EnqueueRequest, Job};

/// One child job to create.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildSpec {
    pub queue_type: QueueType,
    pub definition: JsonValue,
    pub priority: Option<i32>,
    pub max_retry_count: Option<u32>,
}

impl ChildSpec {
    pub fn new(queue_type: QueueType, definition: JsonValue) -> Self {
        Self {
            queue_type,
            definition,
            priority: None,
            max_retry_count: None,
        }
    }

    fn into_request(self, parent: &Job, group_id: GroupId) -> EnqueueRequest {
        let mut request = EnqueueRequest::new(parent.tenant_id, self.queue_type, self.definition)
            .in_group(group_id);
        request.priority = self.priority.or(parent.priority);
        request.max_retry_count = self.max_retry_count;
        request
    }
}

/// Maps a parent job definition to its children.
#[async_trait]
pub trait ChildPlanner: Send + Sync {
    async fn plan(&self, parent: &Job) -> Result<Vec<ChildSpec>, HandlerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestrationMode {
    /// Complete as soon as the children are enqueued.
    FireAndForget,
    /// Stay running and complete once the group reaches a terminal aggregate.
    AwaitGroup { poll: Duration },
}

/// [`JobHandler`] for orchestrator queue types.
pub struct OrchestratorHandler<P> {
    planner: P,
    mode: OrchestrationMode,
}

impl<P: ChildPlanner> OrchestratorHandler<P> {
    pub fn new(planner: P, mode: OrchestrationMode) -> Self {
        Self { planner, mode }
    }

    pub fn fire_and_forget(planner: P) -> Self {
        Self::new(planner, OrchestrationMode::FireAndForget)
    }

    pub fn await_group(planner: P, poll: Duration) -> Self {
        Self::new(planner, OrchestrationMode::AwaitGroup { poll })
    }

    async fn enqueue_children(
        &self,
        job: &Job,
        group_id: GroupId,
        ctx: &JobContext,
    ) -> Result<usize, HandlerError> {
        let children = self.planner.plan(job).await?;
        let count = children.len();
        if count == 0 {
            return Ok(0);
        }
        ctx.checkpoint(summary(group_id, count, None)).await?;

        let requests: Vec<_> = children
            .into_iter()
            .map(|c| c.into_request(job, group_id))
            .collect();
        ctx.store()
            .enqueue_batch(requests)
            .await
            .map_err(store_error)?;
        info!(job_id = %job.id, group_id = %group_id, children = count, "child group enqueued");
        Ok(count)
    }

    async fn wait_for_group(
        &self,
        job: &Job,
        group_id: GroupId,
        child_count: usize,
        poll: Duration,
        ctx: &JobContext,
    ) -> Result<JsonValue, HandlerError> {
        loop {
            let progress = ctx
                .store()
                .group_progress(group_id)
                .await
                .map_err(store_error)?;

            match progress.status() {
                GroupStatus::Completed => {
                    info!(job_id = %job.id, group_id = %group_id, "child group completed");
                    return Ok(summary(group_id, child_count, Some(progress)));
                }
                GroupStatus::Failed => {
                    return Err(HandlerError::fatal(format!(
                        "{} of {} child jobs in group {group_id} failed",
                        progress.failed, progress.total
                    )));
                }
                GroupStatus::Cancelled => {
                    return Err(HandlerError::fatal(format!(
                        "child group {group_id} was cancelled"
                    )));
                }
                GroupStatus::InProgress => {
                    ctx.checkpoint(summary(group_id, child_count, Some(progress)))
                        .await?;
                }
            }

            tokio::select! {
                _ = ctx.cancelled() => {
                    if ctx.cancel_requested() {
                        let changed = ctx
                            .store()
                            .request_cancel_group(group_id)
                            .await
                            .map_err(store_error)?;
                        info!(job_id = %job.id, group_id = %group_id, changed, "orchestrator cancelled, cancelling child group");
                    }
                    // On shutdown the children keep running; a reclaimed parent resumes polling.
                    return Err(if ctx.lease_lost() {
                        HandlerError::LeaseLost
                    } else {
                        HandlerError::Cancelled
                    });
                }
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }
}

#[async_trait]
impl<P: ChildPlanner> JobHandler for OrchestratorHandler<P> {
    async fn execute(&self, job: Job, ctx: JobContext) -> Result<JsonValue, HandlerError> {
        let (group_id, child_count) = match resume_point(&job) {
            Some((group_id, count)) => {
                let exists = ctx.store().list_group(group_id).await.map_err(store_error)?;
                if exists.is_empty() && count > 0 {
                    warn!(job_id = %job.id, group_id = %group_id, "checkpointed group has no members, re-enqueueing");
                    let count = self.enqueue_children(&job, group_id, &ctx).await?;
                    (group_id, count)
                } else {
                    info!(job_id = %job.id, group_id = %group_id, "resuming orchestrator");
                    (group_id, count)
                }
            }
            None => {
                let group_id = GroupId::new();
                let count = self.enqueue_children(&job, group_id, &ctx).await?;
                (group_id, count)
            }
        };

        if child_count == 0 {
            info!(job_id = %job.id, "no children planned");
            return Ok(json!({ "groupId": null, "childCount": 0, "progress": null }));
        }

        match self.mode {
            OrchestrationMode::FireAndForget => Ok(summary(group_id, child_count, None)),
            OrchestrationMode::AwaitGroup { poll } => {
                self.wait_for_group(&job, group_id, child_count, poll, &ctx).await
            }
        }
    }
}

fn resume_point(job: &Job) -> Option<(GroupId, usize)> {
    let context = job.context.as_ref()?;
    let group_id = context.get("groupId")?.as_str()?.parse().ok()?;
    let count = context.get("childCount")?.as_u64()? as usize;
    Some((group_id, count))
}

/// Shape of both the checkpoint context and the final result.
fn summary(group_id: GroupId, child_count: usize, progress: Option<GroupProgress>) -> JsonValue {
    json!({ "groupId": group_id, "childCount": child_count, "progress": progress })
}

fn store_error(err: JobStoreError) -> HandlerError {
    if err.is_transient() {
        HandlerError::retryable(err.to_string())
    } else {
        HandlerError::Other(anyhow::Error::new(err))
    }
}
