//! Per-track identity labels, refreshed at a fixed frame interval.

use std::collections::HashMap;

use tracing::debug;

#[derive(Clone, Debug)]
struct CachedIdentity {
    label: String,
    resolved_at: u64,
    last_seen: u64,
}

/// Caches the face-match result for each track so the matcher runs at most
/// once every `interval` frames per person. Tracks not seen for
/// `eviction_frames` frames are forgotten.
#[derive(Debug)]
pub struct IdentityCache {
    entries: HashMap<u64, CachedIdentity>,
    interval: u64,
    eviction_frames: u64,
}

impl IdentityCache {
    pub fn new(interval: u64, eviction_frames: u64) -> Self {
        Self {
            entries: HashMap::new(),
            interval: interval.max(1),
            eviction_frames: eviction_frames.max(1),
        }
    }

    /// Label for `track_id` at `frame_index`, calling `resolve` only when the
    /// track is new or its label is at least `interval` frames old.
    pub fn label_for<F>(&mut self, track_id: u64, frame_index: u64, resolve: F) -> String
    where
        F: FnOnce() -> String,
    {
        let interval = self.interval;
        match self.entries.get_mut(&track_id) {
            Some(entry) if frame_index.saturating_sub(entry.resolved_at) < interval => {
                entry.last_seen = frame_index;
                entry.label.clone()
            }
            Some(entry) => {
                entry.label = resolve();
                entry.resolved_at = frame_index;
                entry.last_seen = frame_index;
                entry.label.clone()
            }
            None => {
                let label = resolve();
                self.entries.insert(
                    track_id,
                    CachedIdentity {
                        label: label.clone(),
                        resolved_at: frame_index,
                        last_seen: frame_index,
                    },
                );
                label
            }
        }
    }

    /// Drop tracks unseen for `eviction_frames` frames. Returns how many went.
    pub fn evict_stale(&mut self, frame_index: u64) -> usize {
        let horizon = self.eviction_frames;
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| frame_index.saturating_sub(entry.last_seen) < horizon);
        let evicted = before - self.entries.len();
        if evicted > 0 {
            debug!(evicted, remaining = self.entries.len(), "identity cache evicted stale tracks");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
