//! Durable job store backed by sqlite
//!
//! Every state write goes through a conditional update keyed on the
//! observed state, so transitions on a single job are serialized and a
//! losing writer sees a stale-state conflict instead of clobbering.

use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::db::Db;
use crate::jobs::job::{truncate_error, Job, JobId, JobState};
use crate::models::{Phase, SceneId};
use crate::traits::Clock;
use crate::{Error, Result};

/// Field changes applied alongside a state transition
#[derive(Debug, Default, Clone)]
pub struct JobPatch {
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,

    /// `Some(Some(t))` arms a retry, `Some(None)` clears the arm
    pub next_retry_at: Option<Option<i64>>,

    pub last_error: Option<String>,
    pub attempt: Option<u32>,
}

impl JobPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_started_at(mut self, at: i64) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn with_finished_at(mut self, at: i64) -> Self {
        self.finished_at = Some(at);
        self
    }

    pub fn with_next_retry_at(mut self, at: i64) -> Self {
        self.next_retry_at = Some(Some(at));
        self
    }

    pub fn clearing_next_retry(mut self) -> Self {
        self.next_retry_at = Some(None);
        self
    }

    pub fn with_last_error(mut self, message: impl AsRef<str>) -> Self {
        self.last_error = Some(truncate_error(message.as_ref()));
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }
}

/// Persistent record of every phase-job attempt
#[derive(Clone)]
pub struct JobStore {
    db: Db,
    clock: Arc<dyn Clock>,
}

impl JobStore {
    pub fn new(db: Db, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Insert a fresh queued job. Fails with a duplicate-job conflict if
    /// a queued or running job already exists for the pair.
    pub async fn create(&self, scene_id: SceneId, phase: Phase) -> Result<Job> {
        let job = Job::new(scene_id, phase, self.clock.now_ms());

        let inserted = sqlx::query(
            "INSERT INTO jobs (id, scene_id, phase, state, attempt, submitted_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(job.id.to_string())
        .bind(job.scene_id)
        .bind(job.phase.as_str())
        .bind(job.state.as_str())
        .bind(job.attempt as i64)
        .bind(job.submitted_at)
        .execute(self.db.pool())
        .await;

        match inserted {
            Ok(_) => Ok(job),
            Err(sqlx::Error::Database(db_err))
                if db_err.kind() == sqlx::error::ErrorKind::UniqueViolation =>
            {
                Err(Error::duplicate_job(format!(
                    "active job already exists for scene {} phase {}",
                    scene_id, phase
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, id: JobId) -> Result<Job> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(self.db.pool())
            .await?;

        match row {
            Some(row) => row_to_job(&row),
            None => Err(Error::not_found(format!("job {}", id))),
        }
    }

    /// The queued or running job for a pair, if any
    pub async fn find_active(&self, scene_id: SceneId, phase: Phase) -> Result<Option<Job>> {
        let row = sqlx::query(
            "SELECT * FROM jobs \
             WHERE scene_id = ?1 AND phase = ?2 AND state IN ('queued', 'running')",
        )
        .bind(scene_id)
        .bind(phase.as_str())
        .fetch_optional(self.db.pool())
        .await?;

        row.map(|r| row_to_job(&r)).transpose()
    }

    /// Compare-and-set state transition. Zero rows updated means the
    /// observed state differs from `from`.
    pub async fn transition(
        &self,
        id: JobId,
        from: JobState,
        to: JobState,
        patch: JobPatch,
    ) -> Result<()> {
        let current = self.get(id).await?;

        let started_at = patch.started_at.or(current.started_at);
        let finished_at = patch.finished_at.or(current.finished_at);
        let next_retry_at = match patch.next_retry_at {
            Some(value) => value,
            None => current.next_retry_at,
        };
        let last_error = patch.last_error.or(current.last_error);
        let attempt = patch.attempt.unwrap_or(current.attempt);

        let updated = sqlx::query(
            "UPDATE jobs SET state = ?1, started_at = ?2, finished_at = ?3, \
             next_retry_at = ?4, last_error = ?5, attempt = ?6 \
             WHERE id = ?7 AND state = ?8",
        )
        .bind(to.as_str())
        .bind(started_at)
        .bind(finished_at)
        .bind(next_retry_at)
        .bind(last_error)
        .bind(attempt as i64)
        .bind(id.to_string())
        .bind(from.as_str())
        .execute(self.db.pool())
        .await?;

        if updated.rows_affected() == 0 {
            let observed = self.get(id).await?;
            return Err(Error::stale_state(format!(
                "job {} is {} (expected {})",
                id, observed.state, from
            )));
        }

        debug!("Job transition: id={}, from={}, to={}", id, from, to);
        Ok(())
    }

    pub async fn list_active(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE state IN ('queued', 'running') \
             ORDER BY submitted_at DESC",
        )
        .fetch_all(self.db.pool())
        .await?;

        rows.iter().map(row_to_job).collect()
    }

    pub async fn list_by_phase(&self, phase: Phase, limit: usize) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE phase = ?1 ORDER BY submitted_at DESC LIMIT ?2",
        )
        .bind(phase.as_str())
        .bind(limit as i64)
        .fetch_all(self.db.pool())
        .await?;

        rows.iter().map(row_to_job).collect()
    }

    /// One page of job history, newest first, plus the total row count
    pub async fn page_history(&self, page: usize, limit: usize) -> Result<(Vec<Job>, i64)> {
        let limit = limit.clamp(1, 500);
        let offset = page.saturating_mul(limit);

        let rows = sqlx::query(
            "SELECT * FROM jobs ORDER BY submitted_at DESC, id DESC LIMIT ?1 OFFSET ?2",
        )
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(self.db.pool())
        .await?;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
            .fetch_one(self.db.pool())
            .await?;

        let jobs = rows.iter().map(row_to_job).collect::<Result<Vec<_>>>()?;
        Ok((jobs, total))
    }

    /// Failed or timed-out jobs whose retry arm has elapsed. The
    /// max-retries cutoff is the sweeper's call, not the store's.
    pub async fn list_due_for_retry(&self, now_ms: i64, limit: usize) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT * FROM jobs \
             WHERE state IN ('failed', 'timed_out') \
               AND next_retry_at IS NOT NULL AND next_retry_at <= ?1 \
             ORDER BY next_retry_at ASC LIMIT ?2",
        )
        .bind(now_ms)
        .bind(limit as i64)
        .fetch_all(self.db.pool())
        .await?;

        rows.iter().map(row_to_job).collect()
    }

    /// Job counts per state, for status payloads
    pub async fn counts_by_state(&self) -> Result<HashMap<JobState, i64>> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobs GROUP BY state")
            .fetch_all(self.db.pool())
            .await?;

        let mut counts = HashMap::new();
        for row in rows {
            let state = JobState::parse(row.get::<String, _>("state").as_str())?;
            counts.insert(state, row.get::<i64, _>("n"));
        }
        Ok(counts)
    }

    /// Delete terminal jobs finished before the retention window.
    /// Returns the number of rows removed.
    pub async fn gc(&self, retention_days: u32) -> Result<u64> {
        let cutoff = self.clock.now_ms() - i64::from(retention_days) * 86_400_000;

        let deleted = sqlx::query(
            "DELETE FROM jobs \
             WHERE state IN ('completed', 'cancelled', 'dlq') \
               AND finished_at IS NOT NULL AND finished_at < ?1",
        )
        .bind(cutoff)
        .execute(self.db.pool())
        .await?;

        Ok(deleted.rows_affected())
    }

    /// Remove a job record outright. Only used to back out a queued row
    /// whose pool submission failed.
    pub async fn delete(&self, id: JobId) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE id = ?1")
            .bind(id.to_string())
            .execute(self.db.pool())
            .await?;
        Ok(())
    }
}

fn row_to_job(row: &SqliteRow) -> Result<Job> {
    let id: String = row.get("id");
    let id = JobId::parse_str(&id)
        .map_err(|e| Error::internal(format!("corrupt job id {}: {}", id, e)))?;

    Ok(Job {
        id,
        scene_id: row.get("scene_id"),
        phase: Phase::parse(row.get::<String, _>("phase").as_str())?,
        state: JobState::parse(row.get::<String, _>("state").as_str())?,
        attempt: row.get::<i64, _>("attempt") as u32,
        submitted_at: row.get("submitted_at"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        next_retry_at: row.get("next_retry_at"),
        last_error: row.get("last_error"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::SystemClock;

    async fn store() -> JobStore {
        let db = Db::open_in_memory().await.unwrap();
        db.migrate().await.unwrap();
        JobStore::new(db, Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = store().await;
        let job = store.create(7, Phase::Metadata).await.unwrap();

        let fetched = store.get(job.id).await.unwrap();
        assert_eq!(fetched.scene_id, 7);
        assert_eq!(fetched.phase, Phase::Metadata);
        assert_eq!(fetched.state, JobState::Queued);
        assert_eq!(fetched.attempt, 1);
    }

    #[tokio::test]
    async fn test_create_conflicts_on_active_pair() {
        let store = store().await;
        store.create(7, Phase::Metadata).await.unwrap();

        let err = store.create(7, Phase::Metadata).await.unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_JOB");

        // A different phase for the same scene is not a conflict.
        store.create(7, Phase::Thumbnail).await.unwrap();
    }

    #[tokio::test]
    async fn test_transition_cas() {
        let store = store().await;
        let job = store.create(1, Phase::Sprites).await.unwrap();

        store
            .transition(
                job.id,
                JobState::Queued,
                JobState::Running,
                JobPatch::new().with_started_at(10),
            )
            .await
            .unwrap();

        // Losing a race is a stale-state conflict.
        let err = store
            .transition(job.id, JobState::Queued, JobState::Running, JobPatch::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "STALE_STATE");

        store
            .transition(
                job.id,
                JobState::Running,
                JobState::Completed,
                JobPatch::new().with_finished_at(20),
            )
            .await
            .unwrap();

        let done = store.get(job.id).await.unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.duration_ms(), Some(10));
    }

    #[tokio::test]
    async fn test_retry_cycle_reuses_row() {
        let store = store().await;
        let job = store.create(3, Phase::Thumbnail).await.unwrap();

        store
            .transition(
                job.id,
                JobState::Queued,
                JobState::Running,
                JobPatch::new().with_started_at(1),
            )
            .await
            .unwrap();
        store
            .transition(
                job.id,
                JobState::Running,
                JobState::Failed,
                JobPatch::new()
                    .with_next_retry_at(100)
                    .with_last_error("boom"),
            )
            .await
            .unwrap();

        let due = store.list_due_for_retry(100, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, job.id);

        let not_yet = store.list_due_for_retry(99, 10).await.unwrap();
        assert!(not_yet.is_empty());

        // Re-enqueue keeps the row, bumps the attempt, clears the arm.
        store
            .transition(
                job.id,
                JobState::Failed,
                JobState::Queued,
                JobPatch::new().with_attempt(2).clearing_next_retry(),
            )
            .await
            .unwrap();

        let requeued = store.get(job.id).await.unwrap();
        assert_eq!(requeued.attempt, 2);
        assert!(requeued.next_retry_at.is_none());
        assert!(store.list_due_for_retry(1_000, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pagination_is_newest_first() {
        let store = store().await;
        for scene in 0..5 {
            store.create(scene, Phase::Metadata).await.unwrap();
        }

        let (first_page, total) = store.page_history(0, 2).await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(first_page.len(), 2);
        assert!(first_page[0].submitted_at >= first_page[1].submitted_at);

        let (last_page, _) = store.page_history(2, 2).await.unwrap();
        assert_eq!(last_page.len(), 1);
    }

    #[tokio::test]
    async fn test_gc_only_reaps_old_terminal_jobs() {
        let store = store().await;
        let old = store.create(1, Phase::Metadata).await.unwrap();
        store
            .transition(
                old.id,
                JobState::Queued,
                JobState::Running,
                JobPatch::new().with_started_at(0),
            )
            .await
            .unwrap();
        store
            .transition(
                old.id,
                JobState::Running,
                JobState::Completed,
                JobPatch::new().with_finished_at(0),
            )
            .await
            .unwrap();

        let live = store.create(2, Phase::Metadata).await.unwrap();

        let reaped = store.gc(30).await.unwrap();
        assert_eq!(reaped, 1);
        assert!(store.get(old.id).await.is_err());
        assert!(store.get(live.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_counts_by_state() {
        let store = store().await;
        store.create(1, Phase::Metadata).await.unwrap();
        store.create(2, Phase::Metadata).await.unwrap();

        let counts = store.counts_by_state().await.unwrap();
        assert_eq!(counts.get(&JobState::Queued), Some(&2));
        assert!(counts.get(&JobState::Running).is_none());
    }
}
