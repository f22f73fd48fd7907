// Dedup Filter - Time-windowed "have I seen this message" set
//
// Entries are stamped with the monotonic time they were last admitted.
// Instead of a timer per entry, a full sweep runs at most once per window.

use crate::protocol::MessageHash;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Default dedup window
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(60);

struct FilterState {
    records: HashMap<MessageHash, Instant>,
    last_sweep: Instant,
}

/// Suppresses messages already processed within a trailing window
///
/// An entry blocks re-admission while its age is strictly below the window;
/// once the age reaches the window the hash is admitted again.
pub struct DedupFilter {
    window: Duration,
    state: Mutex<FilterState>,
}

impl DedupFilter {
    /// Create a filter with the given window
    pub fn new(window: Duration) -> Self {
        Self::starting_at(window, Instant::now())
    }

    /// Create a filter whose sweep clock starts at `now`
    pub fn starting_at(window: Duration, now: Instant) -> Self {
        Self {
            window,
            state: Mutex::new(FilterState {
                records: HashMap::new(),
                last_sweep: now,
            }),
        }
    }

    /// Get the window
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record `hash`; returns true if it was not seen within the window
    pub fn check(&self, hash: &MessageHash) -> bool {
        self.check_at(hash, Instant::now())
    }

    /// Like [`check`](Self::check) with an explicit current time
    pub fn check_at(&self, hash: &MessageHash, now: Instant) -> bool {
        let mut state = self.state.lock();

        if let Some(seen_at) = state.records.get(hash) {
            if now.saturating_duration_since(*seen_at) < self.window {
                return false;
            }
        }
        state.records.insert(*hash, now);

        if now.saturating_duration_since(state.last_sweep) > self.window {
            let window = self.window;
            let before = state.records.len();
            state
                .records
                .retain(|_, seen_at| now.saturating_duration_since(*seen_at) <= window);
            state.last_sweep = now;
            tracing::trace!(
                purged = before - state.records.len(),
                remaining = state.records.len(),
                "dedup filter swept"
            );
        }

        true
    }

    /// Number of tracked hashes, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Check if no hash is tracked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DedupFilter {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW)
    }
}
