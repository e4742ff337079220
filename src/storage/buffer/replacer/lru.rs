use linked_hash_map::LinkedHashMap;

use crate::common::types::FrameId;

/// LRU (Least Recently Used) page replacement policy.
///
/// Every tracked frame sits in access order, oldest first. Pinned frames stay
/// tracked so their position reflects their last access, but only frames
/// marked evictable are handed out as victims.
pub struct LRUReplacer {
    entries: LinkedHashMap<FrameId, bool>,
}

impl LRUReplacer {
    pub fn new(pool_size: usize) -> Self {
        Self {
            entries: LinkedHashMap::with_capacity(pool_size),
        }
    }

    /// Record that a frame has been accessed
    pub fn record_access(&mut self, frame_id: FrameId) {
        let evictable = self.entries.remove(&frame_id).unwrap_or(false);
        self.entries.insert(frame_id, evictable);
    }

    pub fn set_evictable(&mut self, frame_id: FrameId, evictable: bool) {
        match self.entries.get_mut(&frame_id) {
            Some(flag) => *flag = evictable,
            None => {
                self.entries.insert(frame_id, evictable);
            }
        }
    }

    /// Remove a frame from the replacer
    pub fn remove(&mut self, frame_id: FrameId) {
        self.entries.remove(&frame_id);
    }

    /// Victim selection: the least recently accessed evictable frame
    pub fn victim(&mut self) -> Option<FrameId> {
        let victim = self
            .entries
            .iter()
            .find(|&(_, &evictable)| evictable)
            .map(|(&frame_id, _)| frame_id)?;
        self.entries.remove(&victim);
        Some(victim)
    }

    pub fn evictable_count(&self) -> usize {
        self.entries.values().filter(|&&evictable| evictable).count()
    }
}
