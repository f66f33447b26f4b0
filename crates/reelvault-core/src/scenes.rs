//! Sqlite-backed scene catalog
//!
//! The ingest core only reads scenes through the `SceneRepo` port; this
//! is the concrete catalog the rest of the application (scanner, HTTP
//! layer) writes to.

use async_trait::async_trait;
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::db::Db;
use crate::models::{Phase, Scene, SceneId};
use crate::traits::{Clock, SceneRepo};
use crate::Result;

type DeleteHook = Box<dyn Fn(SceneId) + Send + Sync>;

/// Scene catalog over the shared sqlite database
#[derive(Clone)]
pub struct SqliteSceneRepo {
    db: Db,
    clock: Arc<dyn Clock>,
    delete_hooks: Arc<Mutex<Vec<DeleteHook>>>,
}

impl SqliteSceneRepo {
    pub fn new(db: Db, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            clock,
            delete_hooks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a callback fired after a scene row is deleted; the path
    /// cache uses this to invalidate its entry.
    pub fn on_delete(&self, hook: impl Fn(SceneId) + Send + Sync + 'static) {
        self.delete_hooks
            .lock()
            .expect("scene hooks poisoned")
            .push(Box::new(hook));
    }

    /// Register a file, returning the scene id. Re-registering an
    /// existing path returns the existing id.
    pub async fn register(&self, path: &Path) -> Result<(SceneId, bool)> {
        let path_str = path.to_string_lossy();

        if let Some(row) = sqlx::query("SELECT id FROM scenes WHERE path = ?1")
            .bind(path_str.as_ref())
            .fetch_optional(self.db.pool())
            .await?
        {
            return Ok((row.get("id"), false));
        }

        let result = sqlx::query("INSERT INTO scenes (path, created_at) VALUES (?1, ?2)")
            .bind(path_str.as_ref())
            .bind(self.clock.now_ms())
            .execute(self.db.pool())
            .await?;

        let id = result.last_insert_rowid();
        info!("Scene registered: id={}, path={}", id, path.display());
        Ok((id, true))
    }

    /// Remove a scene and fire the delete hooks
    pub async fn delete(&self, id: SceneId) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM scenes WHERE id = ?1")
            .bind(id)
            .execute(self.db.pool())
            .await?;

        let removed = deleted.rows_affected() > 0;
        if removed {
            let hooks = self.delete_hooks.lock().expect("scene hooks poisoned");
            for hook in hooks.iter() {
                hook(id);
            }
        }
        Ok(removed)
    }

    pub async fn count(&self) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM scenes")
            .fetch_one(self.db.pool())
            .await?;
        Ok(count)
    }
}

fn flag_column(phase: Phase) -> &'static str {
    match phase {
        Phase::Metadata => "has_metadata",
        Phase::Thumbnail => "has_thumbnail",
        Phase::Sprites => "has_sprites",
    }
}

#[async_trait]
impl SceneRepo for SqliteSceneRepo {
    async fn get(&self, id: SceneId) -> Result<Option<Scene>> {
        let row = sqlx::query("SELECT * FROM scenes WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;

        Ok(row.map(|row| Scene {
            id: row.get("id"),
            path: row.get("path"),
            has_metadata: row.get::<i64, _>("has_metadata") != 0,
            has_thumbnail: row.get::<i64, _>("has_thumbnail") != 0,
            has_sprites: row.get::<i64, _>("has_sprites") != 0,
        }))
    }

    async fn list_missing_phase(&self, phase: Phase, limit: usize) -> Result<Vec<SceneId>> {
        let query = format!(
            "SELECT id FROM scenes WHERE {} = 0 ORDER BY id LIMIT ?1",
            flag_column(phase)
        );
        let rows = sqlx::query(&query)
            .bind(limit as i64)
            .fetch_all(self.db.pool())
            .await?;

        Ok(rows.iter().map(|row| row.get("id")).collect())
    }

    async fn list_ids(&self, limit: usize) -> Result<Vec<SceneId>> {
        let rows = sqlx::query("SELECT id FROM scenes ORDER BY id LIMIT ?1")
            .bind(limit as i64)
            .fetch_all(self.db.pool())
            .await?;

        Ok(rows.iter().map(|row| row.get("id")).collect())
    }

    async fn set_phase_flag(&self, id: SceneId, phase: Phase) -> Result<()> {
        let query = format!("UPDATE scenes SET {} = 1 WHERE id = ?1", flag_column(phase));
        sqlx::query(&query).bind(id).execute(self.db.pool()).await?;
        Ok(())
    }

    async fn path(&self, id: SceneId) -> Result<Option<PathBuf>> {
        let row = sqlx::query("SELECT path FROM scenes WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;

        Ok(row.map(|row| PathBuf::from(row.get::<String, _>("path"))))
    }
}
