use linked_hash_map::LinkedHashMap;
use parking_lot::Mutex;

use crate::common::types::FrameId;

/// LRU (Least Recently Used) page replacement policy.
///
/// Tracks frames that are eligible for eviction, i.e. frames whose pin
/// count has dropped to zero. The least recently unpinned frame is the
/// victim. Insertion order in the backing map gives O(1) victim selection
/// and O(1) removal by frame id.
pub struct LruReplacer {
    inner: Mutex<LruInner>,
}

struct LruInner {
    // Front of the map is the eviction candidate, back is most recent.
    lru_map: LinkedHashMap<FrameId, ()>,
    capacity: usize,
}

impl LruReplacer {
    pub fn new(pool_size: usize) -> Self {
        Self {
            inner: Mutex::new(LruInner {
                lru_map: LinkedHashMap::with_capacity(pool_size),
                capacity: pool_size,
            }),
        }
    }

    /// Remove and return the least recently unpinned frame, if any.
    pub fn victim(&self) -> Option<FrameId> {
        let mut inner = self.inner.lock();
        inner.lru_map.pop_front().map(|(frame_id, ())| frame_id)
    }

    /// A frame became in-use: drop it from the eligible set. No-op if the
    /// frame is not tracked.
    pub fn pin(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        inner.lru_map.remove(&frame_id);
    }

    /// A frame's pin count reached zero: track it as most recently used.
    /// Unpinning an already-tracked frame is a no-op, and the insert is
    /// rejected when the replacer is at capacity.
    pub fn unpin(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        if inner.lru_map.contains_key(&frame_id) {
            return;
        }
        if inner.lru_map.len() >= inner.capacity {
            return;
        }
        inner.lru_map.insert(frame_id, ());
    }

    /// Number of frames currently eligible for eviction.
    pub fn size(&self) -> usize {
        self.inner.lock().lru_map.len()
    }
}
