//! Dead-letter queue for jobs whose retry budget is exhausted

use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

use crate::db::Db;
use crate::jobs::job::{truncate_error, Job, JobId, JobState};
use crate::models::Phase;
use crate::traits::Clock;
use crate::{Error, Result};

/// What an operator decided about a dead letter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    Pending,
    Resubmitted,
    Abandoned,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Pending => "pending",
            Disposition::Resubmitted => "resubmitted",
            Disposition::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Disposition::Pending),
            "resubmitted" => Ok(Disposition::Resubmitted),
            "abandoned" => Ok(Disposition::Abandoned),
            other => Err(Error::validation(format!("unknown disposition: {}", other))),
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal job record parked in the DLQ
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub job_id: JobId,
    pub scene_id: i64,
    pub phase: Phase,
    pub attempt: u32,
    pub reason: String,
    pub disposition: Disposition,
    pub enqueued_at: i64,
}

/// DLQ counters used in handler and SSE payloads
#[derive(Debug, Clone, Default, Serialize)]
pub struct DlqStats {
    pub pending: i64,
    pub resubmitted: i64,
    pub abandoned: i64,
}

/// Tail of permanently-failed jobs
#[derive(Clone)]
pub struct DeadLetterQueue {
    db: Db,
    clock: Arc<dyn Clock>,
}

impl DeadLetterQueue {
    pub fn new(db: Db, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Park a failed/timed-out job. Flips the job row to `dlq` and
    /// writes the DLQ entry in one transaction, so the job cannot be
    /// swept into the DLQ twice.
    pub async fn enqueue(&self, job: &Job, reason: &str) -> Result<DlqEntry> {
        let now = self.clock.now_ms();
        let reason = truncate_error(reason);

        let mut tx = self.db.pool().begin().await?;

        let updated = sqlx::query(
            "UPDATE jobs SET state = ?1, finished_at = ?2, next_retry_at = NULL, last_error = ?3 \
             WHERE id = ?4 AND state IN ('failed', 'timed_out')",
        )
        .bind(JobState::Dlq.as_str())
        .bind(now)
        .bind(&reason)
        .bind(job.id.to_string())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(Error::stale_state(format!(
                "job {} is no longer eligible for the dead-letter queue",
                job.id
            )));
        }

        sqlx::query(
            "INSERT INTO dlq (job_id, scene_id, phase, attempt, reason, disposition, enqueued_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)",
        )
        .bind(job.id.to_string())
        .bind(job.scene_id)
        .bind(job.phase.as_str())
        .bind(job.attempt as i64)
        .bind(&reason)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        warn!(
            "Job dead-lettered: id={}, scene={}, phase={}, attempts={}, reason={}",
            job.id, job.scene_id, job.phase, job.attempt, reason
        );

        Ok(DlqEntry {
            job_id: job.id,
            scene_id: job.scene_id,
            phase: job.phase,
            attempt: job.attempt,
            reason,
            disposition: Disposition::Pending,
            enqueued_at: now,
        })
    }

    pub async fn get(&self, job_id: JobId) -> Result<DlqEntry> {
        let row = sqlx::query("SELECT * FROM dlq WHERE job_id = ?1")
            .bind(job_id.to_string())
            .fetch_optional(self.db.pool())
            .await?;

        match row {
            Some(row) => row_to_entry(&row),
            None => Err(Error::not_found(format!("dlq entry {}", job_id))),
        }
    }

    /// One page, optionally filtered by disposition, newest first
    pub async fn list(
        &self,
        disposition: Option<Disposition>,
        page: usize,
        limit: usize,
    ) -> Result<(Vec<DlqEntry>, i64)> {
        let limit = limit.clamp(1, 500);
        let offset = page.saturating_mul(limit);

        let (rows, total) = match disposition {
            Some(d) => {
                let rows = sqlx::query(
                    "SELECT * FROM dlq WHERE disposition = ?1 \
                     ORDER BY enqueued_at DESC LIMIT ?2 OFFSET ?3",
                )
                .bind(d.as_str())
                .bind(limit as i64)
                .bind(offset as i64)
                .fetch_all(self.db.pool())
                .await?;

                let total: i64 =
                    sqlx::query_scalar("SELECT COUNT(*) FROM dlq WHERE disposition = ?1")
                        .bind(d.as_str())
                        .fetch_one(self.db.pool())
                        .await?;
                (rows, total)
            }
            None => {
                let rows = sqlx::query(
                    "SELECT * FROM dlq ORDER BY enqueued_at DESC LIMIT ?1 OFFSET ?2",
                )
                .bind(limit as i64)
                .bind(offset as i64)
                .fetch_all(self.db.pool())
                .await?;

                let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dlq")
                    .fetch_one(self.db.pool())
                    .await?;
                (rows, total)
            }
        };

        let entries = rows.iter().map(row_to_entry).collect::<Result<Vec<_>>>()?;
        Ok((entries, total))
    }

    /// Move a pending entry to a decided disposition. Conflicts if the
    /// entry was already decided.
    pub async fn set_disposition(&self, job_id: JobId, to: Disposition) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE dlq SET disposition = ?1 WHERE job_id = ?2 AND disposition = 'pending'",
        )
        .bind(to.as_str())
        .bind(job_id.to_string())
        .execute(self.db.pool())
        .await?;

        if updated.rows_affected() == 0 {
            // Distinguish missing from already-decided.
            let entry = self.get(job_id).await?;
            return Err(Error::conflict(format!(
                "dlq entry {} is already {}",
                job_id, entry.disposition
            )));
        }
        Ok(())
    }

    pub async fn stats(&self) -> Result<DlqStats> {
        let rows = sqlx::query("SELECT disposition, COUNT(*) AS n FROM dlq GROUP BY disposition")
            .fetch_all(self.db.pool())
            .await?;

        let mut stats = DlqStats::default();
        for row in rows {
            let n: i64 = row.get("n");
            match Disposition::parse(row.get::<String, _>("disposition").as_str())? {
                Disposition::Pending => stats.pending = n,
                Disposition::Resubmitted => stats.resubmitted = n,
                Disposition::Abandoned => stats.abandoned = n,
            }
        }
        Ok(stats)
    }
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<DlqEntry> {
    let id: String = row.get("job_id");
    let job_id = JobId::parse_str(&id)
        .map_err(|e| Error::internal(format!("corrupt dlq job id {}: {}", id, e)))?;

    Ok(DlqEntry {
        job_id,
        scene_id: row.get("scene_id"),
        phase: Phase::parse(row.get::<String, _>("phase").as_str())?,
        attempt: row.get::<i64, _>("attempt") as u32,
        reason: row.get("reason"),
        disposition: Disposition::parse(row.get::<String, _>("disposition").as_str())?,
        enqueued_at: row.get("enqueued_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::{JobPatch, JobStore};
    use crate::traits::SystemClock;

    async fn fixtures() -> (JobStore, DeadLetterQueue) {
        let db = Db::open_in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        (
            JobStore::new(db.clone(), clock.clone()),
            DeadLetterQueue::new(db, clock),
        )
    }

    async fn failed_job(store: &JobStore, scene: i64) -> Job {
        let job = store.create(scene, Phase::Sprites).await.unwrap();
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
                JobPatch::new().with_last_error("kaput"),
            )
            .await
            .unwrap();
        store.get(job.id).await.unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_parks_job() {
        let (store, dlq) = fixtures().await;
        let job = failed_job(&store, 8).await;

        let entry = dlq.enqueue(&job, "retries exhausted").await.unwrap();
        assert_eq!(entry.disposition, Disposition::Pending);

        let parked = store.get(job.id).await.unwrap();
        assert_eq!(parked.state, JobState::Dlq);
        assert!(parked.next_retry_at.is_none());

        // Double enqueue is a stale-state conflict.
        assert!(dlq.enqueue(&job, "again").await.is_err());
    }

    #[tokio::test]
    async fn test_disposition_transitions() {
        let (store, dlq) = fixtures().await;
        let job = failed_job(&store, 8).await;
        dlq.enqueue(&job, "gone").await.unwrap();

        dlq.set_disposition(job.id, Disposition::Abandoned)
            .await
            .unwrap();

        // Already decided.
        let err = dlq
            .set_disposition(job.id, Disposition::Resubmitted)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 409);

        // Unknown entry.
        let err = dlq
            .set_disposition(JobId::new_v4(), Disposition::Abandoned)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_list_and_stats() {
        let (store, dlq) = fixtures().await;
        for scene in 1..=3 {
            let job = failed_job(&store, scene).await;
            dlq.enqueue(&job, "nope").await.unwrap();
        }
        let decided = dlq.list(None, 0, 10).await.unwrap().0[0].job_id;
        dlq.set_disposition(decided, Disposition::Abandoned)
            .await
            .unwrap();

        let (pending, total) = dlq.list(Some(Disposition::Pending), 0, 10).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(pending.len(), 2);

        let stats = dlq.stats().await.unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.resubmitted, 0);
    }
}
