//! # Duplicate Suppression
//!
//! Bounded set-membership test used by the router to drop replayed
//! `routeMessage`/`forwardMessage` request ids before they re-enter the
//! forwarding logic on cyclic or overlapping paths.
//!
//! The detector keeps a `HashSet` of seen keys plus a FIFO queue of
//! `(timestamp, key, sender)` entries. Cleanup pops from the front of the
//! queue whenever it exceeds the value cap or the oldest entry's age
//! exceeds the time window, keeping set and queue consistent.
//!
//! This is *probabilistic, bounded-memory* suppression: if one key is added
//! twice, popping its first FIFO entry removes it from the set while the
//! second entry is still queued, so the key can read as fresh again while
//! logically in-window. Accepted imprecision, traded for hard memory
//! bounds.

use std::collections::{HashSet, VecDeque};

use tokio::time::{Duration, Instant};

use crate::messages::RequestId;
use crate::peer::PeerId;

/// Default maximum number of tracked keys.
pub const DEFAULT_MAX_VALUES: usize = 100_000;

/// Default age bound for tracked keys.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(100);

struct SeenEntry {
    at: Instant,
    key: RequestId,
    /// Recorded for diagnostics; cleanup ignores it.
    #[allow(dead_code)]
    sender: PeerId,
}

/// Time-and-count-windowed duplicate detector over request ids.
pub struct DuplicateDetector {
    seen: HashSet<RequestId>,
    queue: VecDeque<SeenEntry>,
    max_values: usize,
    max_age: Duration,
}

impl DuplicateDetector {
    pub fn new(max_values: usize, max_age: Duration) -> Self {
        Self {
            seen: HashSet::new(),
            queue: VecDeque::new(),
            max_values,
            max_age,
        }
    }

    /// Record a key as seen and run window cleanup.
    pub fn add(&mut self, key: RequestId, sender: PeerId) {
        self.seen.insert(key);
        self.queue.push_back(SeenEntry {
            at: Instant::now(),
            key,
            sender,
        });
        self.cleanup();
    }

    /// Pure membership test; does not mutate the window.
    pub fn is_duplicate(&self, key: &RequestId) -> bool {
        self.seen.contains(key)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.queue.clear();
    }

    fn cleanup(&mut self) {
        let now = Instant::now();
        while let Some(oldest) = self.queue.front() {
            let over_capacity = self.queue.len() > self.max_values;
            let expired = now.duration_since(oldest.at) > self.max_age;
            if !over_capacity && !expired {
                break;
            }
            let entry = self.queue.pop_front().expect("front checked above");
            self.seen.remove(&entry.key);
        }
    }
}

impl Default for DuplicateDetector {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_VALUES, DEFAULT_MAX_AGE)
    }
}
