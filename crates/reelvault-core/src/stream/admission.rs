//! Concurrency admission for range streaming
//!
//! Slots are keyed by (client IP, scene): a browser firing several
//! parallel range requests for one asset holds a single slot. The
//! per-IP limit counts distinct scenes, the global limit counts distinct
//! pairs across everyone. Slots release through an RAII guard that rides
//! the response body.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::models::SceneId;
use crate::{Error, Result};

/// Per-IP and global stream limiter
#[derive(Debug)]
pub struct StreamAdmission {
    max_global: usize,
    max_per_ip: usize,

    /// Distinct (ip, scene) pairs currently streaming
    global: AtomicUsize,

    /// ip -> scene -> refcount of requests sharing the slot
    by_ip: Mutex<HashMap<IpAddr, HashMap<SceneId, usize>>>,
}

impl StreamAdmission {
    pub fn new(max_global: usize, max_per_ip: usize) -> Arc<Self> {
        Arc::new(Self {
            max_global,
            max_per_ip,
            global: AtomicUsize::new(0),
            by_ip: Mutex::new(HashMap::new()),
        })
    }

    /// Claim a slot for this request. Sharing an existing (ip, scene)
    /// pair always succeeds; a new pair must fit under both limits.
    pub fn acquire(self: &Arc<Self>, ip: IpAddr, scene_id: SceneId) -> Result<StreamSlot> {
        {
            let mut by_ip = self.by_ip.lock().expect("admission table poisoned");
            let scenes = by_ip.entry(ip).or_default();

            if let Some(refcount) = scenes.get_mut(&scene_id) {
                *refcount += 1;
            } else {
                if scenes.len() >= self.max_per_ip {
                    debug!("Stream rejected, per-IP limit: ip={}, scene={}", ip, scene_id);
                    return Err(Error::stream_limit());
                }
                if self.global.load(Ordering::SeqCst) >= self.max_global {
                    debug!("Stream rejected, global limit: ip={}, scene={}", ip, scene_id);
                    return Err(Error::stream_limit());
                }
                scenes.insert(scene_id, 1);
                self.global.fetch_add(1, Ordering::SeqCst);
            }
        }

        Ok(StreamSlot {
            admission: self.clone(),
            ip,
            scene_id,
        })
    }

    /// Distinct pairs currently held
    pub fn global_count(&self) -> usize {
        self.global.load(Ordering::SeqCst)
    }

    /// Distinct scenes held by one IP
    pub fn count_for_ip(&self, ip: IpAddr) -> usize {
        self.by_ip
            .lock()
            .expect("admission table poisoned")
            .get(&ip)
            .map(|scenes| scenes.len())
            .unwrap_or(0)
    }

    fn release(&self, ip: IpAddr, scene_id: SceneId) {
        let mut by_ip = self.by_ip.lock().expect("admission table poisoned");
        let Some(scenes) = by_ip.get_mut(&ip) else {
            return;
        };
        let Some(refcount) = scenes.get_mut(&scene_id) else {
            return;
        };

        *refcount -= 1;
        if *refcount == 0 {
            scenes.remove(&scene_id);
            self.global.fetch_sub(1, Ordering::SeqCst);
            if scenes.is_empty() {
                by_ip.remove(&ip);
            }
        }
    }
}

/// Held admission slot; dropping it releases the share
#[derive(Debug)]
pub struct StreamSlot {
    admission: Arc<StreamAdmission>,
    ip: IpAddr,
    scene_id: SceneId,
}

impl Drop for StreamSlot {
    fn drop(&mut self) {
        self.admission.release(self.ip, self.scene_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn test_same_pair_shares_one_slot() {
        let admission = StreamAdmission::new(8, 2);

        let a = admission.acquire(ip(1), 100).unwrap();
        let b = admission.acquire(ip(1), 100).unwrap();
        assert_eq!(admission.count_for_ip(ip(1)), 1);
        assert_eq!(admission.global_count(), 1);

        drop(a);
        // The pair survives until the last sharer leaves.
        assert_eq!(admission.global_count(), 1);
        drop(b);
        assert_eq!(admission.global_count(), 0);
        assert_eq!(admission.count_for_ip(ip(1)), 0);
    }

    #[test]
    fn test_per_ip_limit_counts_distinct_scenes() {
        let admission = StreamAdmission::new(8, 2);

        let _a = admission.acquire(ip(1), 100).unwrap();
        let _b = admission.acquire(ip(1), 101).unwrap();
        assert_eq!(admission.count_for_ip(ip(1)), 2);

        // A third distinct scene from the same IP is refused.
        let err = admission.acquire(ip(1), 102).unwrap_err();
        assert_eq!(err.code(), "STREAM_LIMIT_EXCEEDED");

        // Another IP is unaffected.
        let _c = admission.acquire(ip(2), 102).unwrap();
    }

    #[test]
    fn test_global_limit() {
        let admission = StreamAdmission::new(2, 8);

        let _a = admission.acquire(ip(1), 100).unwrap();
        let _b = admission.acquire(ip(2), 101).unwrap();

        let err = admission.acquire(ip(3), 102).unwrap_err();
        assert_eq!(err.status_code(), 503);

        // Sharing an existing pair still works at the global cap.
        let _shared = admission.acquire(ip(1), 100).unwrap();
    }

    #[test]
    fn test_release_restores_capacity() {
        let admission = StreamAdmission::new(1, 1);

        let slot = admission.acquire(ip(1), 100).unwrap();
        assert!(admission.acquire(ip(2), 101).is_err());

        drop(slot);
        assert!(admission.acquire(ip(2), 101).is_ok());
    }
}
