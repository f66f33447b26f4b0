//! Bounded-concurrency worker pool, one per phase
//!
//! Submitters push job ids into a capped queue; `N` workers pull from the
//! shared receiver, claim the job with a state CAS, and drive it through
//! the probe call. Resizing never drops queued or running work, and the
//! pool-wide cancellation token is the only thing allowed to interrupt a
//! job mid-flight.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::configcache::ConfigCache;
use crate::events::{Event, EventBus, EventKind};
use crate::jobs::dlq::DeadLetterQueue;
use crate::jobs::job::{Job, JobId, JobState};
use crate::jobs::store::{JobPatch, JobStore};
use crate::models::{Phase, SceneId};
use crate::probe::{ProbeError, ProbeErrorKind, SpritesSpec, ThumbnailSpec};
use crate::traits::{duration_ms, Clock, MediaProbe, SceneRepo};
use crate::{Error, Result};

/// Notice sent to the trigger engine when a phase finishes cleanly
#[derive(Debug, Clone)]
pub struct PhaseCompletion {
    pub scene_id: SceneId,
    pub phase: Phase,
}

/// Queue depth and in-flight count for one pool
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueStatus {
    pub queued: usize,
    pub running: usize,
}

/// Everything a pool needs besides its own queue
#[derive(Clone)]
pub struct PoolDeps {
    pub store: JobStore,
    pub events: EventBus,
    pub scenes: Arc<dyn SceneRepo>,
    pub probe: Arc<dyn MediaProbe>,
    pub clock: Arc<dyn Clock>,
    pub configs: Arc<ConfigCache>,
    pub dlq: DeadLetterQueue,
}

struct WorkerHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct PoolInner {
    phase: Phase,
    deps: PoolDeps,
    timeout: Duration,
    completions: mpsc::Sender<PhaseCompletion>,

    queue_tx: mpsc::Sender<JobId>,
    queue_rx: Mutex<mpsc::Receiver<JobId>>,

    queued: AtomicUsize,
    running: AtomicUsize,
    accepting: AtomicBool,

    workers: Mutex<Vec<WorkerHandle>>,

    /// Cancelling this aborts in-flight probe calls; only the shutdown
    /// path uses it.
    shutdown: CancellationToken,
}

/// Per-phase job executor with queue visibility
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(
        phase: Phase,
        deps: PoolDeps,
        queue_cap: usize,
        job_timeout: Duration,
        completions: mpsc::Sender<PhaseCompletion>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(queue_cap.max(1));

        Self {
            inner: Arc::new(PoolInner {
                phase,
                deps,
                timeout: job_timeout,
                completions,
                queue_tx,
                queue_rx: Mutex::new(queue_rx),
                queued: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                accepting: AtomicBool::new(true),
                workers: Mutex::new(Vec::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn phase(&self) -> Phase {
        self.inner.phase
    }

    /// Spawn the initial worker set
    pub async fn start(&self, workers: usize) {
        info!("Starting worker pool: phase={}, workers={}", self.inner.phase, workers);
        self.resize(workers).await;
    }

    /// Append a job to the queue. Fails fast when the soft cap is hit or
    /// the pool stopped accepting work.
    pub async fn submit(&self, job_id: JobId) -> Result<()> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(Error::queue_full(format!(
                "{} pool is shutting down",
                self.inner.phase
            )));
        }

        self.inner.queued.fetch_add(1, Ordering::SeqCst);
        match self.inner.queue_tx.try_send(job_id) {
            Ok(()) => Ok(()),
            Err(_) => {
                self.inner.queued.fetch_sub(1, Ordering::SeqCst);
                Err(Error::queue_full(format!(
                    "{} queue is at capacity",
                    self.inner.phase
                )))
            }
        }
    }

    /// Grow or shrink the worker set without touching queued or running
    /// jobs. A shrunk-away worker finishes its current job first.
    pub async fn resize(&self, target: usize) {
        let mut workers = self.inner.workers.lock().await;
        let current = workers.len();

        if target > current {
            for _ in current..target {
                workers.push(self.spawn_worker());
            }
            info!("Pool resized up: phase={}, workers={}", self.inner.phase, target);
        } else if target < current {
            for handle in workers.drain(target..) {
                handle.token.cancel();
                // The worker exits after its current job; no need to wait.
                drop(handle.handle);
            }
            info!("Pool resized down: phase={}, workers={}", self.inner.phase, target);
        }
    }

    pub async fn worker_count(&self) -> usize {
        self.inner.workers.lock().await.len()
    }

    pub fn queue_status(&self) -> QueueStatus {
        QueueStatus {
            queued: self.inner.queued.load(Ordering::SeqCst),
            running: self.inner.running.load(Ordering::SeqCst),
        }
    }

    /// Stop accepting work, wait for the queue to empty within the grace
    /// period, then cancel whatever is left and join the workers.
    pub async fn drain(&self, grace: Duration) {
        self.inner.accepting.store(false, Ordering::SeqCst);

        let deadline = Instant::now() + grace;
        loop {
            let status = self.queue_status();
            if status.queued == 0 && status.running == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    "Drain grace elapsed: phase={}, queued={}, running={}",
                    self.inner.phase, status.queued, status.running
                );
                break;
            }
            sleep(Duration::from_millis(25)).await;
        }

        self.inner.shutdown.cancel();

        let mut workers = self.inner.workers.lock().await;
        for handle in workers.drain(..) {
            handle.token.cancel();
            let _ = handle.handle.await;
        }
        info!("Pool drained: phase={}", self.inner.phase);
    }

    fn spawn_worker(&self) -> WorkerHandle {
        let token = self.inner.shutdown.child_token();
        let inner = self.inner.clone();
        let worker_token = token.clone();

        let handle = tokio::spawn(async move {
            loop {
                let job_id = {
                    let mut rx = inner.queue_rx.lock().await;
                    tokio::select! {
                        _ = worker_token.cancelled() => break,
                        received = rx.recv() => match received {
                            Some(id) => id,
                            None => break,
                        },
                    }
                };

                inner.queued.fetch_sub(1, Ordering::SeqCst);
                inner.running.fetch_add(1, Ordering::SeqCst);
                execute(&inner, job_id).await;
                inner.running.fetch_sub(1, Ordering::SeqCst);

                if worker_token.is_cancelled() {
                    break;
                }
            }
            debug!("Worker exited: phase={}", inner.phase);
        });

        WorkerHandle { token, handle }
    }
}

enum Outcome {
    Success,
    Failed(ProbeError),
    TimedOut,
    Shutdown,
}

/// Drive one job: claim, probe, record the result
async fn execute(inner: &Arc<PoolInner>, job_id: JobId) {
    let store = &inner.deps.store;

    let job = match store.get(job_id).await {
        Ok(job) => job,
        Err(e) => {
            warn!("Dequeued unknown job: id={}, error={}", job_id, e);
            return;
        }
    };

    let started_at = inner.deps.clock.now_ms();
    let claim = store
        .transition(
            job_id,
            JobState::Queued,
            JobState::Running,
            JobPatch::new().with_started_at(started_at),
        )
        .await;
    if claim.is_err() {
        // Cancelled while queued, or another worker won the claim.
        debug!("Skipping job, claim lost: id={}", job_id);
        return;
    }

    let mut running = job.clone();
    running.state = JobState::Running;
    running.started_at = Some(started_at);
    inner.deps.events.publish(Event::for_job(
        EventKind::PhaseStarted,
        &running,
        started_at,
    ));

    let outcome = run_probe(inner, &running).await;
    let finished_at = inner.deps.clock.now_ms();

    match outcome {
        Outcome::Success => {
            if let Err(e) = inner
                .deps
                .scenes
                .set_phase_flag(running.scene_id, running.phase)
                .await
            {
                // The artifact exists; a missing flag only means a later
                // bulk "missing" run will re-derive it.
                warn!(
                    "Failed to set phase flag: scene={}, phase={}, error={}",
                    running.scene_id, running.phase, e
                );
            }

            if complete(inner, &running, finished_at).await {
                let _ = inner
                    .completions
                    .send(PhaseCompletion {
                        scene_id: running.scene_id,
                        phase: running.phase,
                    })
                    .await;
            }
        }
        Outcome::TimedOut => {
            let message = format!("timed out after {}s", inner.timeout.as_secs());
            let retry_at = finished_at + next_delay_ms(inner, &running);
            let moved = store
                .transition(
                    job_id,
                    JobState::Running,
                    JobState::TimedOut,
                    JobPatch::new()
                        .with_last_error(&message)
                        .with_next_retry_at(retry_at),
                )
                .await;
            if moved.is_ok() {
                running.state = JobState::TimedOut;
                running.last_error = Some(message);
                inner.deps.events.publish(Event::for_job(
                    EventKind::PhaseTimedOut,
                    &running,
                    finished_at,
                ));
            }
        }
        Outcome::Failed(probe_err) => {
            fail(inner, &mut running, probe_err, finished_at).await;
        }
        Outcome::Shutdown => {
            // Rearm immediately so the sweeper picks it up next start.
            let moved = store
                .transition(
                    job_id,
                    JobState::Running,
                    JobState::Failed,
                    JobPatch::new()
                        .with_last_error("shutdown")
                        .with_next_retry_at(finished_at),
                )
                .await;
            if moved.is_ok() {
                running.state = JobState::Failed;
                running.last_error = Some("shutdown".to_string());
                inner.deps.events.publish(Event::for_job(
                    EventKind::PhaseFailed,
                    &running,
                    finished_at,
                ));
            }
        }
    }
}

async fn run_probe(inner: &Arc<PoolInner>, job: &Job) -> Outcome {
    let path = match inner.deps.scenes.path(job.scene_id).await {
        Ok(Some(path)) => path,
        Ok(None) => {
            return Outcome::Failed(ProbeError::permanent(format!(
                "scene {} has no path",
                job.scene_id
            )))
        }
        Err(e) => return Outcome::Failed(ProbeError::transient(e.to_string())),
    };

    let probe = inner.deps.probe.clone();
    let phase = job.phase;
    let call = async move {
        match phase {
            Phase::Metadata => probe.metadata(&path).await.map(|_| ()),
            Phase::Thumbnail => probe
                .thumbnail(&path, &ThumbnailSpec::default())
                .await
                .map(|_| ()),
            Phase::Sprites => probe
                .sprites(&path, &SpritesSpec::default())
                .await
                .map(|_| ()),
        }
    };

    tokio::select! {
        _ = inner.shutdown.cancelled() => Outcome::Shutdown,
        result = timeout(inner.timeout, call) => match result {
            Err(_) => Outcome::TimedOut,
            Ok(Ok(())) => Outcome::Success,
            Ok(Err(probe_err)) => Outcome::Failed(probe_err),
        },
    }
}

async fn complete(inner: &Arc<PoolInner>, job: &Job, finished_at: i64) -> bool {
    let moved = inner
        .deps
        .store
        .transition(
            job.id,
            JobState::Running,
            JobState::Completed,
            JobPatch::new().with_finished_at(finished_at),
        )
        .await;

    match moved {
        Ok(()) => {
            let mut done = job.clone();
            done.state = JobState::Completed;
            done.finished_at = Some(finished_at);
            inner.deps.events.publish(Event::for_job(
                EventKind::PhaseCompleted,
                &done,
                finished_at,
            ));
            info!(
                "Job completed: id={}, scene={}, phase={}, attempt={}",
                job.id, job.scene_id, job.phase, job.attempt
            );
            true
        }
        Err(e) => {
            debug!("Completion CAS lost: id={}, error={}", job.id, e);
            false
        }
    }
}

async fn fail(inner: &Arc<PoolInner>, job: &mut Job, probe_err: ProbeError, finished_at: i64) {
    let store = &inner.deps.store;

    match probe_err.kind {
        ProbeErrorKind::Transient => {
            let retry_at = finished_at + next_delay_ms(inner, job);
            let moved = store
                .transition(
                    job.id,
                    JobState::Running,
                    JobState::Failed,
                    JobPatch::new()
                        .with_last_error(&probe_err.message)
                        .with_next_retry_at(retry_at),
                )
                .await;
            if moved.is_ok() {
                job.state = JobState::Failed;
                job.last_error = Some(probe_err.message.clone());
                inner
                    .deps
                    .events
                    .publish(Event::for_job(EventKind::PhaseFailed, job, finished_at));
                warn!(
                    "Job failed: id={}, phase={}, attempt={}, error={}",
                    job.id, job.phase, job.attempt, probe_err.message
                );
            }
        }
        ProbeErrorKind::Permanent => {
            let moved = store
                .transition(
                    job.id,
                    JobState::Running,
                    JobState::Failed,
                    JobPatch::new().with_last_error(&probe_err.message),
                )
                .await;
            if moved.is_err() {
                return;
            }

            job.state = JobState::Failed;
            job.last_error = Some(probe_err.message.clone());
            inner
                .deps
                .events
                .publish(Event::for_job(EventKind::PhaseFailed, job, finished_at));

            if let Err(e) = inner.deps.dlq.enqueue(job, &probe_err.message).await {
                error!("Failed to dead-letter job: id={}, error={}", job.id, e);
            }
        }
    }
}

fn next_delay_ms(inner: &Arc<PoolInner>, job: &Job) -> i64 {
    let retry = inner.deps.configs.retry();
    duration_ms(retry.policy_for(job.phase).delay_for_attempt(job.attempt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::testutil::{MockProbe, MockScenes};
    use crate::traits::SystemClock;

    async fn fixtures(probe: Arc<MockProbe>) -> (WorkerPool, JobStore, mpsc::Receiver<PhaseCompletion>, Arc<MockScenes>) {
        let db = Db::open_in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = JobStore::new(db.clone(), clock.clone());
        let configs = ConfigCache::load(db.clone()).await.unwrap();
        let scenes = Arc::new(MockScenes::with_scenes(&[1, 2, 3, 4, 5]));
        let (tx, rx) = mpsc::channel(16);

        let deps = PoolDeps {
            store: store.clone(),
            events: EventBus::new(64),
            scenes: scenes.clone(),
            probe,
            clock: clock.clone(),
            configs,
            dlq: DeadLetterQueue::new(db, clock),
        };
        let pool = WorkerPool::new(
            Phase::Metadata,
            deps,
            8,
            Duration::from_secs(30),
            tx,
        );
        (pool, store, rx, scenes)
    }

    async fn wait_for_state(store: &JobStore, id: JobId, state: JobState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if store.get(id).await.unwrap().state == state {
                    break;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job never reached expected state");
    }

    #[tokio::test]
    async fn test_job_runs_to_completion() {
        let probe = Arc::new(MockProbe::succeeding());
        let (pool, store, mut completions, scenes) = fixtures(probe).await;
        pool.start(1).await;

        let job = store.create(1, Phase::Metadata).await.unwrap();
        pool.submit(job.id).await.unwrap();

        wait_for_state(&store, job.id, JobState::Completed).await;
        let done = store.get(job.id).await.unwrap();
        assert!(done.started_at.is_some());
        assert!(done.finished_at.is_some());

        let notice = completions.recv().await.unwrap();
        assert_eq!(notice.scene_id, 1);
        assert_eq!(notice.phase, Phase::Metadata);

        assert!(scenes.get(1).await.unwrap().unwrap().has_metadata);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded_by_worker_count() {
        let probe = Arc::new(MockProbe::succeeding().with_delay(Duration::from_millis(50)));
        let (pool, store, _completions, _scenes) = fixtures(probe.clone()).await;
        pool.start(1).await;

        let mut ids = Vec::new();
        for scene in 1..=4 {
            let job = store.create(scene, Phase::Metadata).await.unwrap();
            pool.submit(job.id).await.unwrap();
            ids.push(job.id);
        }

        for id in ids {
            wait_for_state(&store, id, JobState::Completed).await;
        }
        assert_eq!(probe.max_concurrent(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_arms_retry() {
        let probe = Arc::new(MockProbe::failing_transient("busy"));
        let (pool, store, _completions, _scenes) = fixtures(probe).await;
        pool.start(1).await;

        let job = store.create(2, Phase::Metadata).await.unwrap();
        pool.submit(job.id).await.unwrap();

        wait_for_state(&store, job.id, JobState::Failed).await;
        let failed = store.get(job.id).await.unwrap();
        assert!(failed.next_retry_at.is_some());
        assert_eq!(failed.last_error.as_deref(), Some("busy"));
    }

    #[tokio::test]
    async fn test_permanent_failure_goes_straight_to_dlq() {
        let probe = Arc::new(MockProbe::failing_permanent("corrupt header"));
        let (pool, store, _completions, _scenes) = fixtures(probe).await;
        pool.start(1).await;

        let job = store.create(3, Phase::Metadata).await.unwrap();
        pool.submit(job.id).await.unwrap();

        wait_for_state(&store, job.id, JobState::Dlq).await;
    }

    #[tokio::test]
    async fn test_queue_full_fails_fast() {
        let probe = Arc::new(MockProbe::succeeding().with_delay(Duration::from_millis(200)));
        let (pool, store, _completions, _scenes) = fixtures(probe).await;
        // No workers: nothing drains the queue (capacity 8).
        let mut accepted: i64 = 0;
        loop {
            let job = store.create(accepted + 100, Phase::Metadata).await.unwrap();
            match pool.submit(job.id).await {
                Ok(()) => accepted += 1,
                Err(e) => {
                    assert_eq!(e.code(), "QUEUE_FULL");
                    break;
                }
            }
            assert!(accepted <= 8, "soft cap never engaged");
        }
        assert_eq!(accepted, 8);
    }

    #[tokio::test]
    async fn test_resize_changes_worker_count() {
        let probe = Arc::new(MockProbe::succeeding());
        let (pool, _store, _completions, _scenes) = fixtures(probe).await;
        pool.start(2).await;
        assert_eq!(pool.worker_count().await, 2);

        pool.resize(5).await;
        assert_eq!(pool.worker_count().await, 5);

        pool.resize(1).await;
        assert_eq!(pool.worker_count().await, 1);
    }

    #[tokio::test]
    async fn test_drain_finishes_queued_work() {
        let probe = Arc::new(MockProbe::succeeding().with_delay(Duration::from_millis(10)));
        let (pool, store, _completions, _scenes) = fixtures(probe).await;
        pool.start(2).await;

        let mut ids = Vec::new();
        for scene in 1..=5 {
            let job = store.create(scene, Phase::Metadata).await.unwrap();
            pool.submit(job.id).await.unwrap();
            ids.push(job.id);
        }

        pool.drain(Duration::from_secs(5)).await;

        for id in ids {
            assert_eq!(store.get(id).await.unwrap().state, JobState::Completed);
        }

        // New submissions are refused after drain.
        let late = store.create(77, Phase::Metadata).await.unwrap();
        assert!(pool.submit(late.id).await.is_err());
    }
}
