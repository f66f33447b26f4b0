//! Collaborator ports consumed by the ingest core
//!
//! The core never touches library tables or media bytes directly; it goes
//! through these traits so the surrounding application (and the tests)
//! can supply their own implementations.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::{Phase, Scene, SceneId};
use crate::probe::{MediaInfo, ProbeError, SpritesSpec, ThumbnailSpec};
use crate::Result;

/// Read access to the scene catalog plus the phase-flag writeback
#[async_trait]
pub trait SceneRepo: Send + Sync {
    async fn get(&self, id: SceneId) -> Result<Option<Scene>>;

    /// Scenes whose `phase` artifact does not exist yet
    async fn list_missing_phase(&self, phase: Phase, limit: usize) -> Result<Vec<SceneId>>;

    async fn list_ids(&self, limit: usize) -> Result<Vec<SceneId>>;

    /// Record that the derivation artifact for `phase` now exists
    async fn set_phase_flag(&self, id: SceneId, phase: Phase) -> Result<()>;

    async fn path(&self, id: SceneId) -> Result<Option<PathBuf>>;
}

/// Opaque media inspection / artifact generation collaborator.
///
/// Failures carry a kind so the worker can classify retry-vs-DLQ without
/// string matching.
#[async_trait]
pub trait MediaProbe: Send + Sync {
    async fn metadata(&self, path: &Path) -> std::result::Result<MediaInfo, ProbeError>;

    async fn thumbnail(
        &self,
        path: &Path,
        spec: &ThumbnailSpec,
    ) -> std::result::Result<PathBuf, ProbeError>;

    async fn sprites(
        &self,
        path: &Path,
        spec: &SpritesSpec,
    ) -> std::result::Result<PathBuf, ProbeError>;
}

/// Injected time source so schedulers and stores are testable
pub trait Clock: Send + Sync {
    /// Milliseconds since the unix epoch
    fn now_ms(&self) -> i64;
}

/// Wall clock backed by chrono
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Library-wide scan collaborator fired by the `scan` trigger slot
#[async_trait]
pub trait LibraryScanner: Send + Sync {
    async fn scan(&self) -> Result<ScanSummary>;
}

/// Outcome of one library sweep
#[derive(Debug, Clone, Default)]
pub struct ScanSummary {
    pub discovered: usize,
    pub imported: usize,
    pub errors: usize,
}

/// Convert a duration to whole milliseconds, saturating
pub fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}
