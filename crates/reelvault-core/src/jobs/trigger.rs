//! Trigger engine: the orchestration core
//!
//! Every submission path funnels through here: imports, manual and bulk
//! requests, after-job fan-out, retry re-enqueues, and DLQ resubmits.
//! The engine writes the queued record before handing the job to a pool,
//! and coalesces against an existing active job instead of duplicating
//! work for a (scene, phase) pair.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::configcache::ConfigCache;
use crate::events::{Event, EventBus, EventKind};
use crate::jobs::dlq::{DeadLetterQueue, Disposition};
use crate::jobs::job::{JobId, JobState};
use crate::jobs::pool::{PhaseCompletion, QueueStatus, WorkerPool};
use crate::jobs::store::{JobPatch, JobStore};
use crate::models::{BulkMode, Phase, SceneId, TriggerType};
use crate::traits::{Clock, SceneRepo};
use crate::{Error, Result};

/// How a submission resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// A fresh job was queued
    Created(JobId),

    /// An active job for the pair already existed; its id is returned
    Coalesced(JobId),
}

impl Submission {
    pub fn job_id(&self) -> JobId {
        match self {
            Submission::Created(id) | Submission::Coalesced(id) => *id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Submission::Created(_))
    }
}

/// Aggregate result of a bulk submission
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BulkOutcome {
    pub submitted: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Accepts submission requests, enforces trigger rules, dispatches into
/// the right worker pool
pub struct TriggerEngine {
    store: JobStore,
    configs: Arc<ConfigCache>,
    events: EventBus,
    scenes: Arc<dyn SceneRepo>,
    dlq: DeadLetterQueue,
    clock: Arc<dyn Clock>,
    pools: HashMap<Phase, WorkerPool>,
    bulk_cap: usize,
}

impl TriggerEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: JobStore,
        configs: Arc<ConfigCache>,
        events: EventBus,
        scenes: Arc<dyn SceneRepo>,
        dlq: DeadLetterQueue,
        clock: Arc<dyn Clock>,
        pools: HashMap<Phase, WorkerPool>,
        bulk_cap: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            configs,
            events,
            scenes,
            dlq,
            clock,
            pools,
            bulk_cap,
        })
    }

    /// Consume completion notices from the pools and launch `after_job`
    /// successors
    pub fn spawn_completion_listener(
        self: &Arc<Self>,
        mut completions: mpsc::Receiver<PhaseCompletion>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    notice = completions.recv() => match notice {
                        Some(notice) => {
                            engine
                                .handle_phase_completed(notice.scene_id, notice.phase)
                                .await;
                        }
                        None => break,
                    },
                }
            }
        })
    }

    /// Called by the ingest collaborator when a scene lands in the
    /// library. Submits metadata if the trigger table says so.
    pub async fn on_import(&self, scene_id: SceneId) -> Result<Option<Submission>> {
        let trigger = self.configs.trigger();
        if trigger.metadata.trigger_type != TriggerType::OnImport {
            return Ok(None);
        }

        let submission = self.submit(scene_id, Phase::Metadata).await?;
        debug!("Import triggered metadata: scene={}", scene_id);
        Ok(Some(submission))
    }

    /// Manual single-scene submission. Idempotent against an existing
    /// active job for the pair.
    pub async fn run_phase(&self, scene_id: SceneId, phase: Phase) -> Result<Submission> {
        self.submit(scene_id, phase).await
    }

    /// Enumerate scenes and submit the phase for each. `missing` skips
    /// scenes whose flag is already set; `all` takes everything.
    pub async fn bulk_run_phase(&self, phase: Phase, mode: BulkMode) -> Result<BulkOutcome> {
        let ids = match mode {
            BulkMode::Missing => self.scenes.list_missing_phase(phase, self.bulk_cap).await?,
            BulkMode::All => self.scenes.list_ids(self.bulk_cap).await?,
        };

        if ids.len() == self.bulk_cap {
            warn!(
                "Bulk enumeration hit the cap: phase={}, cap={}; re-run to cover the rest",
                phase, self.bulk_cap
            );
        }

        let mut outcome = BulkOutcome::default();
        for scene_id in ids {
            match self.submit(scene_id, phase).await {
                Ok(Submission::Created(_)) => outcome.submitted += 1,
                // The existing job wins; the bulk run records a skip.
                Ok(Submission::Coalesced(_)) => outcome.skipped += 1,
                Err(e) => {
                    debug!(
                        "Bulk submit failed: scene={}, phase={}, error={}",
                        scene_id, phase, e
                    );
                    outcome.errors += 1;
                }
            }
        }

        info!(
            "Bulk run: phase={}, mode={:?}, submitted={}, skipped={}, errors={}",
            phase, mode, outcome.submitted, outcome.skipped, outcome.errors
        );
        Ok(outcome)
    }

    /// Fan out to phases configured as `after_job` on the completed one
    pub async fn handle_phase_completed(&self, scene_id: SceneId, phase: Phase) {
        let trigger = self.configs.trigger();
        for successor in trigger.successors_of(phase) {
            match self.submit(scene_id, successor).await {
                Ok(Submission::Created(job_id)) => {
                    debug!(
                        "Chained phase: scene={}, {} -> {}, job={}",
                        scene_id, phase, successor, job_id
                    );
                }
                Ok(Submission::Coalesced(_)) => {}
                Err(e) => {
                    // A scheduled missing-mode sweep will pick this up.
                    warn!(
                        "Chained submit failed: scene={}, phase={}, error={}",
                        scene_id, successor, e
                    );
                }
            }
        }
    }

    /// Cancel a job in any non-terminal state
    pub async fn cancel_job(&self, job_id: JobId) -> Result<()> {
        // The state may move under us (queued -> running), so retry the
        // conditional update against what we last observed.
        for _ in 0..3 {
            let job = self.store.get(job_id).await?;
            if job.state.is_terminal() {
                return Err(Error::conflict(format!(
                    "job {} is already {}",
                    job_id, job.state
                )));
            }

            let now = self.clock.now_ms();
            let result = self
                .store
                .transition(
                    job_id,
                    job.state,
                    JobState::Cancelled,
                    JobPatch::new()
                        .with_finished_at(now)
                        .clearing_next_retry(),
                )
                .await;

            match result {
                Ok(()) => {
                    let mut cancelled = job;
                    cancelled.state = JobState::Cancelled;
                    self.events
                        .publish(Event::for_job(EventKind::PhaseCancelled, &cancelled, now));
                    info!("Job cancelled: id={}", job_id);
                    return Ok(());
                }
                Err(Error::Conflict { code: "STALE_STATE", .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(Error::conflict(format!(
            "job {} kept changing state during cancel",
            job_id
        )))
    }

    /// Re-enqueue a failed/timed-out job (same row, next attempt).
    /// Used by the retry scheduler.
    pub async fn retry_job(&self, job_id: JobId) -> Result<()> {
        let job = self.store.get(job_id).await?;
        if !job.state.is_retryable() {
            return Err(Error::conflict(format!(
                "job {} is {} and cannot be retried",
                job_id, job.state
            )));
        }

        let next_attempt = job.attempt + 1;
        self.store
            .transition(
                job_id,
                job.state,
                JobState::Queued,
                JobPatch::new()
                    .with_attempt(next_attempt)
                    .clearing_next_retry(),
            )
            .await?;

        if let Err(e) = self.pool(job.phase).submit(job_id).await {
            // Park it back as failed with an immediate arm so the next
            // sweep tries again instead of wedging a queued orphan.
            let now = self.clock.now_ms();
            let _ = self
                .store
                .transition(
                    job_id,
                    JobState::Queued,
                    JobState::Failed,
                    JobPatch::new().with_next_retry_at(now),
                )
                .await;
            return Err(e);
        }

        let now = self.clock.now_ms();
        let mut retried = job;
        retried.state = JobState::Queued;
        retried.attempt = next_attempt;
        self.events
            .publish(Event::for_job(EventKind::PhaseRetry, &retried, now));
        info!("Job re-enqueued: id={}, attempt={}", job_id, next_attempt);
        Ok(())
    }

    /// Create a fresh job (attempt 1) from a pending DLQ entry
    pub async fn resubmit_dlq(&self, job_id: JobId) -> Result<JobId> {
        let entry = self.dlq.get(job_id).await?;
        if entry.disposition != Disposition::Pending {
            return Err(Error::conflict(format!(
                "dlq entry {} is already {}",
                job_id, entry.disposition
            )));
        }

        let submission = self.submit(entry.scene_id, entry.phase).await?;
        self.dlq
            .set_disposition(job_id, Disposition::Resubmitted)
            .await?;

        info!(
            "DLQ entry resubmitted: old={}, new={}, scene={}, phase={}",
            job_id,
            submission.job_id(),
            entry.scene_id,
            entry.phase
        );
        Ok(submission.job_id())
    }

    /// Mark a pending DLQ entry abandoned
    pub async fn abandon_dlq(&self, job_id: JobId) -> Result<()> {
        self.dlq.set_disposition(job_id, Disposition::Abandoned).await
    }

    /// Queue/running counts per phase, for status payloads
    pub fn queue_statuses(&self) -> HashMap<Phase, QueueStatus> {
        self.pools
            .iter()
            .map(|(phase, pool)| (*phase, pool.queue_status()))
            .collect()
    }

    fn pool(&self, phase: Phase) -> &WorkerPool {
        self.pools
            .get(&phase)
            .expect("a pool exists for every phase")
    }

    async fn submit(&self, scene_id: SceneId, phase: Phase) -> Result<Submission> {
        self.scenes
            .get(scene_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("scene {}", scene_id)))?;

        match self.store.create(scene_id, phase).await {
            Ok(job) => {
                if let Err(e) = self.pool(phase).submit(job.id).await {
                    // Back the record out so the pair is not wedged.
                    let _ = self.store.delete(job.id).await;
                    return Err(e);
                }
                Ok(Submission::Created(job.id))
            }
            Err(Error::Conflict {
                code: "DUPLICATE_JOB",
                ..
            }) => match self.store.find_active(scene_id, phase).await? {
                Some(existing) => Ok(Submission::Coalesced(existing.id)),
                // The active job finished between insert and lookup.
                None => Err(Error::duplicate_job(format!(
                    "scene {} phase {} settled mid-submit; retry",
                    scene_id, phase
                ))),
            },
            Err(e) => Err(e),
        }
    }
}
