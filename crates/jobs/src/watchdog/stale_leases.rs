//! Built-in watchdog reporting expired leases per queue type.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use fhirq_core::QueueType;

use super::WatchdogTask;
use crate::config::EngineConfig;
use crate::host::{HandlerError, JobContext};
use crate::store::{JobStore, JobStoreError, QueueStats};

/// Read-only: counts queued, live and stale jobs for every configured queue and
/// warns when stale leases pile up. Reclamation itself happens in `acquire`.
#[derive(Debug, Clone)]
pub struct StaleLeaseReporter {
    queues: Vec<(QueueType, Duration)>,
}

impl StaleLeaseReporter {
    pub const NAME: &'static str = "stale-leases";

    pub fn new(queues: Vec<(QueueType, Duration)>) -> Self {
        Self { queues }
    }

    /// Watch every configured queue with its own heartbeat timeout.
    pub fn from_config(config: &EngineConfig) -> Self {
        let mut queues: Vec<_> = config
            .queues
            .iter()
            .map(|(q, c)| (q.clone(), c.heartbeat_timeout))
            .collect();
        queues.sort_by(|a, b| a.0.cmp(&b.0));
        Self::new(queues)
    }

    pub fn watchdog_queue() -> QueueType {
        QueueType::Watchdog(Self::NAME.to_string())
    }

    pub async fn report(
        &self,
        store: &dyn JobStore,
    ) -> Result<Vec<(QueueType, QueueStats)>, JobStoreError> {
        let mut report = Vec::with_capacity(self.queues.len());
        for (queue_type, timeout) in &self.queues {
            let stats = store.queue_stats(queue_type, *timeout).await?;
            if stats.stale > 0 {
                warn!(
                    queue = %queue_type,
                    stale = stats.stale,
                    running = stats.running,
                    queued = stats.queued,
                    "stale leases awaiting reclamation"
                );
            } else {
                debug!(queue = %queue_type, running = stats.running, queued = stats.queued, "no stale leases");
            }
            report.push((queue_type.clone(), stats));
        }
        Ok(report)
    }
}

#[async_trait]
impl WatchdogTask for StaleLeaseReporter {
    fn queue_type(&self) -> QueueType {
        Self::watchdog_queue()
    }

    async fn run(&self, ctx: &JobContext) -> Result<(), HandlerError> {
        let report = self
            .report(ctx.store().as_ref())
            .await
            .map_err(|e| HandlerError::retryable(e.to_string()))?;

        let summary: serde_json::Map<String, serde_json::Value> = report
            .into_iter()
            .map(|(queue_type, stats)| (queue_type.to_string(), json!(stats)))
            .collect();
        ctx.checkpoint(json!({ "queues": summary })).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use fhirq_core::TenantId;

    use crate::clock::ManualClock;
    use crate::config::QueueConfig;
    use crate::store::InMemoryJobStore;
    use crate::types::EnqueueRequest;

    #[tokio::test]
    async fn reports_stale_and_live_leases() {
        let clock = ManualClock::default();
        let store = InMemoryJobStore::unlimited().with_clock(Arc::new(clock.clone()));
        let tenant = TenantId::new();
        for _ in 0..3 {
            store
                .enqueue(EnqueueRequest::new(tenant, QueueType::Export, json!({})))
                .await
                .unwrap();
        }
        store
            .acquire(&QueueType::Export, 2, Duration::from_secs(60))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(61));

        let config = EngineConfig::default()
            .with_queue(QueueType::Export, QueueConfig::default())
            .with_queue(QueueType::Import, QueueConfig::default());
        let reporter = StaleLeaseReporter::from_config(&config);

        let report = reporter.report(&store).await.unwrap();
        assert_eq!(report.len(), 2);
        let (queue, export) = &report[0];
        assert_eq!(queue, &QueueType::Export);
        assert_eq!(export.stale, 2);
        assert_eq!(export.queued, 1);
        assert_eq!(export.running, 0);
        assert_eq!(report[1].1, QueueStats::default());
    }

    #[test]
    fn watchdog_queue_name() {
        assert_eq!(
            StaleLeaseReporter::watchdog_queue().to_string(),
            "watchdog-stale-leases"
        );
    }
}
