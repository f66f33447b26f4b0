//! Test doubles for the collaborator ports
//!
//! Compiled for unit tests and, behind the `testutil` feature, for
//! downstream integration suites.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::models::{Phase, Scene, SceneId};
use crate::probe::{MediaInfo, ProbeError, SpritesSpec, ThumbnailSpec};
use crate::traits::{Clock, MediaProbe, SceneRepo};
use crate::Result;

/// Clock that follows the tokio clock, so tests running under paused
/// time see timestamps move with `tokio::time::advance` instead of the
/// wall. Construct inside a runtime.
pub struct VirtualClock {
    start: tokio::time::Instant,
    base_ms: i64,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self {
            start: tokio::time::Instant::now(),
            base_ms: 1_700_000_000_000,
        }
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for VirtualClock {
    fn now_ms(&self) -> i64 {
        self.base_ms + self.start.elapsed().as_millis() as i64
    }
}

/// In-memory scene catalog
pub struct MockScenes {
    scenes: Mutex<HashMap<SceneId, Scene>>,
    path_lookups: AtomicU64,
}

impl MockScenes {
    pub fn new() -> Self {
        Self {
            scenes: Mutex::new(HashMap::new()),
            path_lookups: AtomicU64::new(0),
        }
    }

    /// Seed scenes with synthetic paths and no flags set
    pub fn with_scenes(ids: &[SceneId]) -> Self {
        let scenes = Self::new();
        for &id in ids {
            scenes.insert(id, format!("/media/scene-{}.mp4", id));
        }
        scenes
    }

    pub fn insert(&self, id: SceneId, path: impl Into<String>) {
        self.scenes.lock().unwrap().insert(
            id,
            Scene {
                id,
                path: path.into(),
                has_metadata: false,
                has_thumbnail: false,
                has_sprites: false,
            },
        );
    }

    pub async fn set_flag(&self, id: SceneId, phase: Phase) {
        let mut scenes = self.scenes.lock().unwrap();
        if let Some(scene) = scenes.get_mut(&id) {
            match phase {
                Phase::Metadata => scene.has_metadata = true,
                Phase::Thumbnail => scene.has_thumbnail = true,
                Phase::Sprites => scene.has_sprites = true,
            }
        }
    }

    /// How many times `path` hit the backing map
    pub fn path_lookups(&self) -> u64 {
        self.path_lookups.load(Ordering::SeqCst)
    }
}

impl Default for MockScenes {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SceneRepo for MockScenes {
    async fn get(&self, id: SceneId) -> Result<Option<Scene>> {
        Ok(self.scenes.lock().unwrap().get(&id).cloned())
    }

    async fn list_missing_phase(&self, phase: Phase, limit: usize) -> Result<Vec<SceneId>> {
        let scenes = self.scenes.lock().unwrap();
        let mut ids: Vec<SceneId> = scenes
            .values()
            .filter(|scene| !scene.has_phase(phase))
            .map(|scene| scene.id)
            .collect();
        ids.sort_unstable();
        ids.truncate(limit);
        Ok(ids)
    }

    async fn list_ids(&self, limit: usize) -> Result<Vec<SceneId>> {
        let scenes = self.scenes.lock().unwrap();
        let mut ids: Vec<SceneId> = scenes.keys().copied().collect();
        ids.sort_unstable();
        ids.truncate(limit);
        Ok(ids)
    }

    async fn set_phase_flag(&self, id: SceneId, phase: Phase) -> Result<()> {
        self.set_flag(id, phase).await;
        Ok(())
    }

    async fn path(&self, id: SceneId) -> Result<Option<PathBuf>> {
        self.path_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .scenes
            .lock()
            .unwrap()
            .get(&id)
            .map(|scene| PathBuf::from(&scene.path)))
    }
}

enum ProbeBehavior {
    Succeed,
    FailTransient(String),
    FailPermanent(String),
    /// Fail transiently n times, then succeed
    FailNTimes(AtomicU32, String),
}

/// Scriptable probe with concurrency accounting
pub struct MockProbe {
    behavior: ProbeBehavior,
    delay: Option<Duration>,
    calls: AtomicU64,
    current: AtomicUsize,
    max_concurrent: AtomicUsize,
}

impl MockProbe {
    fn with_behavior(behavior: ProbeBehavior) -> Self {
        Self {
            behavior,
            delay: None,
            calls: AtomicU64::new(0),
            current: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
        }
    }

    pub fn succeeding() -> Self {
        Self::with_behavior(ProbeBehavior::Succeed)
    }

    pub fn failing_transient(message: impl Into<String>) -> Self {
        Self::with_behavior(ProbeBehavior::FailTransient(message.into()))
    }

    pub fn failing_permanent(message: impl Into<String>) -> Self {
        Self::with_behavior(ProbeBehavior::FailPermanent(message.into()))
    }

    pub fn failing_n_times(n: u32, message: impl Into<String>) -> Self {
        Self::with_behavior(ProbeBehavior::FailNTimes(AtomicU32::new(n), message.into()))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of in-flight probe calls observed
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    async fn run(&self) -> std::result::Result<(), ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(current, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let result = match &self.behavior {
            ProbeBehavior::Succeed => Ok(()),
            ProbeBehavior::FailTransient(message) => Err(ProbeError::transient(message.clone())),
            ProbeBehavior::FailPermanent(message) => Err(ProbeError::permanent(message.clone())),
            ProbeBehavior::FailNTimes(remaining, message) => {
                let left = remaining
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if left {
                    Err(ProbeError::transient(message.clone()))
                } else {
                    Ok(())
                }
            }
        };

        self.current.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[async_trait]
impl MediaProbe for MockProbe {
    async fn metadata(&self, _path: &Path) -> std::result::Result<MediaInfo, ProbeError> {
        self.run().await?;
        Ok(MediaInfo {
            duration_s: 60.0,
            width: 1920,
            height: 1080,
            codec: "h264".to_string(),
            bitrate: 4_000_000,
        })
    }

    async fn thumbnail(
        &self,
        path: &Path,
        _spec: &ThumbnailSpec,
    ) -> std::result::Result<PathBuf, ProbeError> {
        self.run().await?;
        Ok(path.with_extension("jpg"))
    }

    async fn sprites(
        &self,
        path: &Path,
        _spec: &SpritesSpec,
    ) -> std::result::Result<PathBuf, ProbeError> {
        self.run().await?;
        Ok(path.with_extension("sprites.jpg"))
    }
}
