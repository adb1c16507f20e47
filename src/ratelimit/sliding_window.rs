//! Sliding-window hit log.

use std::collections::BTreeMap;

/// An exact sliding-window counter for a single key.
///
/// Each hit is recorded at its millisecond timestamp; hits landing in the
/// same millisecond share one entry. Memory and cleanup cost grow with the
/// number of distinct timestamps inside the window. A bucketed log (fixed
/// sub-windows of, say, a tenth of the window) trades precision for a
/// constant footprint and is an acceptable substitute.
#[derive(Debug, Clone)]
pub struct SlidingWindowCounter {
    /// Hit counts keyed by epoch milliseconds, oldest first
    hits: BTreeMap<u64, u64>,
    /// Window length in milliseconds
    window_ms: u64,
}

impl SlidingWindowCounter {
    /// Create an empty counter.
    pub fn new(window_ms: u64) -> Self {
        Self {
            hits: BTreeMap::new(),
            window_ms,
        }
    }

    /// Record one hit at `now_ms`.
    pub fn increment(&mut self, now_ms: u64) {
        *self.hits.entry(now_ms).or_insert(0) += 1;
    }

    /// Drop entries that are `window_ms` or more older than `now_ms`.
    ///
    /// Returns the number of hits removed.
    pub fn cleanup(&mut self, now_ms: u64) -> u64 {
        let Some(cutoff) = now_ms.checked_sub(self.window_ms) else {
            return 0;
        };

        // Everything at or before the cutoff has left the window.
        let live = self.hits.split_off(&(cutoff + 1));
        let expired = std::mem::replace(&mut self.hits, live);
        expired.values().sum()
    }

    /// Number of hits inside the window ending at `now_ms`.
    pub fn hits(&mut self, now_ms: u64) -> u64 {
        self.cleanup(now_ms);
        self.hits.values().sum()
    }

    /// Remove one hit from the newest live entry.
    ///
    /// Returns `false` when the window holds no hits.
    pub fn remove_latest(&mut self, now_ms: u64) -> bool {
        self.cleanup(now_ms);

        let Some(mut newest) = self.hits.last_entry() else {
            return false;
        };
        if *newest.get() > 1 {
            *newest.get_mut() -= 1;
        } else {
            newest.remove();
        }
        true
    }

    /// Number of distinct timestamps held.
    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}
