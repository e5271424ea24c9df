//! Heartbeat ticker for an in-flight job.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::handler::JobContext;
use crate::retry::retry_transient;

/// Renews the lease of one job on a fixed interval until `done` fires.
///
/// Runs independently of the handler body, so a handler stuck in its own work
/// still heartbeats while a dead process stops and gets reclaimed.
pub(crate) struct LeaseKeeper {
    ctx: JobContext,
    interval: Duration,
}

impl LeaseKeeper {
    pub(crate) fn new(ctx: JobContext, interval: Duration) -> Self {
        Self {
            ctx,
            interval: interval.max(Duration::from_millis(10)),
        }
    }

    /// Tick until `done` is cancelled or the lease is lost.
    ///
    /// Keeps running after a cancel request or host shutdown: the handler is
    /// still executing and must not be reclaimed while it winds down.
    pub(crate) async fn run(self, done: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the claim itself just renewed the lease.
        interval.tick().await;

        let job_id = self.ctx.job_id();
        let run_token = self.ctx.run_token();
        loop {
            tokio::select! {
                _ = done.cancelled() => break,
                _ = interval.tick() => {}
            }

            let store = self.ctx.store();
            match retry_transient(self.ctx.retry_policy(), "heartbeat", || {
                store.heartbeat(job_id, run_token, None)
            })
            .await
            {
                Ok(outcome) => {
                    debug!(job_id = %job_id, ?outcome, "heartbeat");
                    self.ctx.observe(outcome);
                    if self.ctx.lease_lost() {
                        break;
                    }
                }
                Err(err) => {
                    // The lease may still be renewed on a later tick.
                    warn!(job_id = %job_id, error = %err, "heartbeat failed");
                }
            }
        }
    }
}
