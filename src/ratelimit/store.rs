//! Per-key state registries.
//!
//! The orchestrator only talks to [`LimiterStore`], so a single-lock map and a
//! sharded concurrent map can be swapped without touching admission logic.

use std::collections::{BTreeMap, HashMap};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::sliding_window::SlidingWindowCounter;
use super::token_bucket::TokenBucket;
use crate::config::{Algorithm, RateLimitConfig};

/// The algorithm state for one key.
#[derive(Debug, Clone)]
pub enum Limiter {
    TokenBucket(TokenBucket),
    SlidingWindow(SlidingWindowCounter),
}

impl Limiter {
    /// Create a fresh limiter for the configured algorithm.
    pub fn for_config(config: &RateLimitConfig, now_ms: u64) -> Self {
        match config.algorithm {
            Algorithm::TokenBucket => Limiter::TokenBucket(TokenBucket::new(
                config.max_requests,
                config.window_ms,
                now_ms,
            )),
            Algorithm::SlidingWindow => {
                Limiter::SlidingWindow(SlidingWindowCounter::new(config.window_ms))
            }
        }
    }
}

/// Everything tracked for one key.
#[derive(Debug, Clone, Default)]
pub struct KeyState {
    /// Created on the first evaluation of the key
    pub limiter: Option<Limiter>,
    /// Epoch milliseconds at which an active block ends
    pub blocked_until: Option<u64>,
}

impl KeyState {
    /// Whether the entry carries no state worth keeping.
    pub fn is_idle(&self) -> bool {
        self.limiter.is_none() && self.blocked_until.is_none()
    }
}

/// Storage for per-key state.
///
/// Closures passed to `with_key`, `inspect` and `retain` run while the
/// key's lock is held: everything they do to a [`KeyState`] is atomic with
/// respect to other callers, and they must not call back into the store.
pub trait LimiterStore: Send + Sync {
    /// Run `f` on the key's state, creating an empty entry if needed.
    ///
    /// `now_ms` is the caller's current time; bounded stores use it to tell
    /// live blocks from expired ones when making room.
    fn with_key<R>(&self, key: &str, now_ms: u64, f: impl FnOnce(&mut KeyState) -> R) -> R;

    /// Run `f` on the key's state if it exists, without creating it.
    fn inspect<R>(&self, key: &str, f: impl FnOnce(Option<&mut KeyState>) -> R) -> R;

    /// Delete the key. Returns whether it was present.
    fn remove(&self, key: &str) -> bool;

    /// Delete every key.
    fn clear(&self);

    /// Visit every entry, dropping those for which `f` returns `false`.
    ///
    /// Returns the number of entries dropped.
    fn retain(&self, f: impl FnMut(&str, &mut KeyState) -> bool) -> usize;

    /// Number of tracked keys.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A single-lock registry with an optional least-recently-used bound.
///
/// When full, inserting a new key evicts the least recently evaluated key
/// that is not serving a live block. An evicted key starts over as if it had been reset.
/// Blocked keys are never evicted, so the map can briefly exceed its bound
/// when every entry is blocked.
#[derive(Debug, Default)]
pub struct MemoryStore {
    registry: Mutex<Registry>,
    max_keys: Option<usize>,
}

#[derive(Debug, Default)]
struct Registry {
    entries: HashMap<String, Slot>,
    /// Last-use tick -> key, oldest first
    recency: BTreeMap<u64, String>,
    tick: u64,
}

#[derive(Debug)]
struct Slot {
    state: KeyState,
    last_used: u64,
}

impl Registry {
    /// Evict the least recently used key that is not serving a live block.
    fn evict_lru(&mut self, now_ms: u64) -> Option<String> {
        let entries = &self.entries;
        let (tick, key) = self
            .recency
            .iter()
            .find(|(_, key)| {
                entries
                    .get(key.as_str())
                    .map_or(true, |slot| {
                        slot.state.blocked_until.map_or(true, |until| until <= now_ms)
                    })
            })
            .map(|(tick, key)| (*tick, key.clone()))?;

        self.recency.remove(&tick);
        self.entries.remove(&key);
        Some(key)
    }
}

impl MemoryStore {
    /// Create an unbounded store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding at most `max_keys` unblocked keys.
    pub fn bounded(max_keys: usize) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            max_keys: Some(max_keys.max(1)),
        }
    }

    /// Create a store from an optional bound.
    pub fn with_max_keys(max_keys: Option<usize>) -> Self {
        match max_keys {
            Some(max_keys) => Self::bounded(max_keys),
            None => Self::new(),
        }
    }

    pub fn max_keys(&self) -> Option<usize> {
        self.max_keys
    }
}

impl LimiterStore for MemoryStore {
    fn with_key<R>(&self, key: &str, now_ms: u64, f: impl FnOnce(&mut KeyState) -> R) -> R {
        let mut guard = self.registry.lock();
        let registry = &mut *guard;

        registry.tick += 1;
        let tick = registry.tick;

        match registry.entries.get_mut(key) {
            Some(slot) => {
                registry.recency.remove(&slot.last_used);
                registry.recency.insert(tick, key.to_owned());
                slot.last_used = tick;
                f(&mut slot.state)
            }
            None => {
                if let Some(max_keys) = self.max_keys {
                    if registry.entries.len() >= max_keys {
                        match registry.evict_lru(now_ms) {
                            Some(evicted) => {
                                debug!(key = %evicted, "Evicted least recently used key")
                            }
                            None => warn!(
                                max_keys = max_keys,
                                "Registry full of blocked keys, growing past bound"
                            ),
                        }
                    }
                }

                registry.recency.insert(tick, key.to_owned());
                let slot = registry.entries.entry(key.to_owned()).or_insert(Slot {
                    state: KeyState::default(),
                    last_used: tick,
                });
                f(&mut slot.state)
            }
        }
    }

    fn inspect<R>(&self, key: &str, f: impl FnOnce(Option<&mut KeyState>) -> R) -> R {
        let mut registry = self.registry.lock();
        f(registry.entries.get_mut(key).map(|slot| &mut slot.state))
    }

    fn remove(&self, key: &str) -> bool {
        let mut registry = self.registry.lock();
        match registry.entries.remove(key) {
            Some(slot) => {
                registry.recency.remove(&slot.last_used);
                true
            }
            None => false,
        }
    }

    fn clear(&self) {
        let mut registry = self.registry.lock();
        registry.entries.clear();
        registry.recency.clear();
    }

    fn retain(&self, mut f: impl FnMut(&str, &mut KeyState) -> bool) -> usize {
        let mut guard = self.registry.lock();
        let registry = &mut *guard;
        let recency = &mut registry.recency;
        let mut removed = 0;

        registry.entries.retain(|key, slot| {
            let keep = f(key.as_str(), &mut slot.state);
            if !keep {
                recency.remove(&slot.last_used);
                removed += 1;
            }
            keep
        });

        removed
    }

    fn len(&self) -> usize {
        self.registry.lock().entries.len()
    }
}

/// A sharded concurrent registry.
///
/// Keys hashing to different shards never contend. The registry is
/// unbounded; entries leave only through reset or the maintenance sweep.
#[derive(Debug, Default)]
pub struct ShardedStore {
    entries: DashMap<String, KeyState>,
}

impl ShardedStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LimiterStore for ShardedStore {
    fn with_key<R>(&self, key: &str, _now_ms: u64, f: impl FnOnce(&mut KeyState) -> R) -> R {
        if let Some(mut state) = self.entries.get_mut(key) {
            return f(state.value_mut());
        }

        let mut state = self.entries.entry(key.to_owned()).or_default();
        f(state.value_mut())
    }

    fn inspect<R>(&self, key: &str, f: impl FnOnce(Option<&mut KeyState>) -> R) -> R {
        match self.entries.get_mut(key) {
            Some(mut state) => f(Some(state.value_mut())),
            None => f(None),
        }
    }

    fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    fn clear(&self) {
        self.entries.clear();
    }

    fn retain(&self, mut f: impl FnMut(&str, &mut KeyState) -> bool) -> usize {
        let mut removed = 0;
        self.entries.retain(|key, state| {
            let keep = f(key.as_str(), state);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
