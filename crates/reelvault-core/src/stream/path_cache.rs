//! Scene-path LRU cache
//!
//! Range requests arrive in bursts; resolving the scene's file path from
//! the database on every one is wasted work. Entries are evicted on
//! scene deletion through the repo's delete hook.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::models::SceneId;
use crate::traits::SceneRepo;
use crate::{Error, Result};

/// LRU map of `SceneId -> absolute path`
pub struct ScenePathCache {
    inner: Mutex<LruCache<SceneId, PathBuf>>,
    scenes: Arc<dyn SceneRepo>,
    hits: Mutex<u64>,
    misses: Mutex<u64>,
}

impl ScenePathCache {
    pub fn new(capacity: usize, scenes: Arc<dyn SceneRepo>) -> Arc<Self> {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is nonzero");
        Arc::new(Self {
            inner: Mutex::new(LruCache::new(capacity)),
            scenes,
            hits: Mutex::new(0),
            misses: Mutex::new(0),
        })
    }

    /// Resolve a scene's path, hitting the repo only on cache miss
    pub async fn path(&self, scene_id: SceneId) -> Result<PathBuf> {
        if let Some(path) = self.peek(scene_id) {
            *self.hits.lock().expect("path cache poisoned") += 1;
            return Ok(path);
        }
        *self.misses.lock().expect("path cache poisoned") += 1;

        let path = self
            .scenes
            .path(scene_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("scene {}", scene_id)))?;

        self.inner
            .lock()
            .expect("path cache poisoned")
            .put(scene_id, path.clone());
        Ok(path)
    }

    /// Drop a cached entry; wired to the scene-delete hook
    pub fn invalidate(&self, scene_id: SceneId) {
        self.inner
            .lock()
            .expect("path cache poisoned")
            .pop(&scene_id);
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = *self.hits.lock().expect("path cache poisoned");
        let misses = *self.misses.lock().expect("path cache poisoned");
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    fn peek(&self, scene_id: SceneId) -> Option<PathBuf> {
        self.inner
            .lock()
            .expect("path cache poisoned")
            .get(&scene_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockScenes;

    #[tokio::test]
    async fn test_cache_hits_after_first_lookup() {
        let scenes = Arc::new(MockScenes::with_scenes(&[1]));
        let cache = ScenePathCache::new(8, scenes.clone());

        let first = cache.path(1).await.unwrap();
        let second = cache.path(1).await.unwrap();
        assert_eq!(first, second);
        assert!(cache.hit_rate() > 0.0);
        assert_eq!(scenes.path_lookups(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let scenes = Arc::new(MockScenes::with_scenes(&[1]));
        let cache = ScenePathCache::new(8, scenes.clone());

        cache.path(1).await.unwrap();
        cache.invalidate(1);
        cache.path(1).await.unwrap();
        assert_eq!(scenes.path_lookups(), 2);
    }

    #[tokio::test]
    async fn test_unknown_scene_is_not_found() {
        let scenes = Arc::new(MockScenes::with_scenes(&[]));
        let cache = ScenePathCache::new(8, scenes);
        let err = cache.path(9).await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_capacity_eviction() {
        let scenes = Arc::new(MockScenes::with_scenes(&[1, 2, 3]));
        let cache = ScenePathCache::new(2, scenes.clone());

        cache.path(1).await.unwrap();
        cache.path(2).await.unwrap();
        cache.path(3).await.unwrap(); // evicts scene 1
        cache.path(1).await.unwrap();
        assert_eq!(scenes.path_lookups(), 4);
    }
}
