use std::collections::{HashMap, VecDeque};

use crate::constants::{DEDUP_CAPACITY, DEDUP_WINDOW_MS};

/// Receiver-side de-duplication of envelope ids.
///
/// Delivery is at-least-once and SYNC replays may resend messages the
/// receiver already saw, so receivers drop ids seen within the window.
/// Entries are evicted by age on every check and by insertion order once
/// `capacity` is reached.
pub struct DedupWindow {
    /// id → first-seen timestamp (ms)
    seen: HashMap<String, u64>,
    order: VecDeque<String>,
    capacity: usize,
    window_ms: u64,
}

impl DedupWindow {
    pub fn new() -> Self {
        Self::with_limits(DEDUP_CAPACITY, DEDUP_WINDOW_MS)
    }

    pub fn with_limits(capacity: usize, window_ms: u64) -> Self {
        Self {
            seen: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            window_ms,
        }
    }

    /// Returns true the first time `id` is observed inside the window and
    /// records it; returns false for a duplicate.
    pub fn check_and_insert(&mut self, id: &str, now_ms: u64) -> bool {
        self.evict_expired(now_ms);

        if self.seen.contains_key(id) {
            return false;
        }

        while self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }

        self.seen.insert(id.to_string(), now_ms);
        self.order.push_back(id.to_string());
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains_key(id)
    }

    /// Number of tracked ids (for testing/monitoring).
    pub fn size(&self) -> usize {
        self.seen.len()
    }

    fn evict_expired(&mut self, now_ms: u64) {
        while let Some(front) = self.order.front() {
            let expired = self
                .seen
                .get(front)
                .map(|ts| now_ms.saturating_sub(*ts) >= self.window_ms)
                .unwrap_or(true);
            if !expired {
                break;
            }
            if let Some(id) = self.order.pop_front() {
                self.seen.remove(&id);
            }
        }
    }
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self::new()
    }
}
