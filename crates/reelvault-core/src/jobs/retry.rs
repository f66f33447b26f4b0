//! Retry sweeper: rearm failed jobs or promote them to the DLQ
//!
//! A periodic tick pages through jobs whose retry arm has elapsed. Jobs
//! with budget left go back through the trigger engine (same row, next
//! attempt); exhausted ones are parked in the dead-letter queue. The
//! tick is idempotent: every mutation is a state CAS, so an aborted
//! sweep simply reruns next tick.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::configcache::ConfigCache;
use crate::jobs::dlq::DeadLetterQueue;
use crate::jobs::store::JobStore;
use crate::jobs::trigger::TriggerEngine;
use crate::traits::Clock;
use crate::{Error, Result};

/// Periodic sweep over jobs due for retry
pub struct RetryScheduler {
    store: JobStore,
    configs: Arc<ConfigCache>,
    engine: Arc<TriggerEngine>,
    dlq: DeadLetterQueue,
    clock: Arc<dyn Clock>,
    tick: Duration,
    page: usize,
}

impl RetryScheduler {
    pub fn new(
        store: JobStore,
        configs: Arc<ConfigCache>,
        engine: Arc<TriggerEngine>,
        dlq: DeadLetterQueue,
        clock: Arc<dyn Clock>,
        tick: Duration,
        page: usize,
    ) -> Self {
        Self {
            store,
            configs,
            engine,
            dlq,
            clock,
            tick,
            page: page.max(1),
        }
    }

    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        info!("Starting retry scheduler: tick={:?}, page={}", self.tick, self.page);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(self.tick) => {}
                }

                match self.sweep().await {
                    Ok(0) => {}
                    Ok(n) => debug!("Retry sweep handled {} jobs", n),
                    Err(e) => {
                        // Abort this tick; the next one starts from scratch.
                        warn!("Retry sweep aborted: {}", e);
                    }
                }
            }
            info!("Retry scheduler stopped");
        })
    }

    /// One pass over due jobs. Returns how many were handled.
    pub async fn sweep(&self) -> Result<usize> {
        let now = self.clock.now_ms();
        let due = self.store.list_due_for_retry(now, self.page).await?;
        let retry_config = self.configs.retry();

        let mut handled = 0;
        for job in due {
            let policy = retry_config.policy_for(job.phase);

            let result = if job.attempt + 1 > policy.max_retries {
                let reason = format!(
                    "retries exhausted after {} attempts: {}",
                    job.attempt,
                    job.last_error.as_deref().unwrap_or("unknown error")
                );
                self.dlq.enqueue(&job, &reason).await.map(|_| ())
            } else {
                self.engine.retry_job(job.id).await
            };

            match result {
                Ok(()) => handled += 1,
                // Someone raced us (cancel, concurrent sweep); skip it.
                Err(Error::Conflict { .. }) => {
                    debug!("Retry sweep skipped contested job: id={}", job.id);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(handled)
    }
}
