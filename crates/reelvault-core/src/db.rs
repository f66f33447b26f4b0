//! Sqlite pool management and schema migration

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::info;

use crate::Result;

/// Shared handle to the sqlite database
#[derive(Clone)]
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    /// Open (creating if missing) the database at `path`
    pub async fn open(path: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        info!("Opened database: path={}", path);

        Ok(Self { pool })
    }

    /// In-memory database for tests. Single connection, so every query
    /// sees the same store.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist yet
    pub async fn migrate(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id            TEXT PRIMARY KEY,
                scene_id      INTEGER NOT NULL,
                phase         TEXT NOT NULL,
                state         TEXT NOT NULL,
                attempt       INTEGER NOT NULL DEFAULT 1,
                submitted_at  INTEGER NOT NULL,
                started_at    INTEGER,
                finished_at   INTEGER,
                next_retry_at INTEGER,
                last_error    TEXT
            )
            "#,
            // At most one queued/running job per (scene, phase); inserts
            // racing an active pair fail with a unique violation.
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS jobs_active_pair
                ON jobs(scene_id, phase)
                WHERE state IN ('queued', 'running')
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS jobs_submitted
                ON jobs(submitted_at DESC)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS jobs_retry
                ON jobs(state, next_retry_at)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS dlq (
                job_id      TEXT PRIMARY KEY,
                scene_id    INTEGER NOT NULL,
                phase       TEXT NOT NULL,
                attempt     INTEGER NOT NULL,
                reason      TEXT NOT NULL,
                disposition TEXT NOT NULL DEFAULT 'pending',
                enqueued_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS scenes (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                path          TEXT NOT NULL UNIQUE,
                has_metadata  INTEGER NOT NULL DEFAULT 0,
                has_thumbnail INTEGER NOT NULL DEFAULT 0,
                has_sprites   INTEGER NOT NULL DEFAULT 0,
                created_at    INTEGER NOT NULL
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let db = Db::open_in_memory().await.unwrap();
        db.migrate().await.unwrap();
        db.migrate().await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_active_pair_index_rejects_duplicates() {
        let db = Db::open_in_memory().await.unwrap();
        db.migrate().await.unwrap();

        sqlx::query(
            "INSERT INTO jobs (id, scene_id, phase, state, attempt, submitted_at) \
             VALUES ('a', 1, 'metadata', 'queued', 1, 0)",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let dup = sqlx::query(
            "INSERT INTO jobs (id, scene_id, phase, state, attempt, submitted_at) \
             VALUES ('b', 1, 'metadata', 'running', 1, 0)",
        )
        .execute(db.pool())
        .await;
        assert!(dup.is_err());

        // Terminal rows for the same pair are fine.
        sqlx::query(
            "INSERT INTO jobs (id, scene_id, phase, state, attempt, submitted_at) \
             VALUES ('c', 1, 'metadata', 'completed', 1, 0)",
        )
        .execute(db.pool())
        .await
        .unwrap();
    }
}
