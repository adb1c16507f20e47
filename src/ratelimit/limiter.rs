//! Core rate limiter implementation.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

use super::clock::{Clock, SystemClock};
use super::decision::{Decision, RateLimitInfo};
use super::store::{Limiter, LimiterStore, MemoryStore};
use crate::config::{Algorithm, RateLimitConfig};
use crate::error::Result;

/// The admission orchestrator.
///
/// Evaluates requests per key against the configured algorithm, applies
/// blocking penalties and refunds, and keeps the registry tidy. It is
/// `Send + Sync` and meant to be shared behind an [`Arc`].
pub struct RateLimiter<S = MemoryStore, C = SystemClock> {
    /// Immutable admission rules
    config: RateLimitConfig,
    /// Per-key limiter and block state
    store: S,
    /// Source of "now"
    clock: C,
}

impl RateLimiter<MemoryStore, SystemClock> {
    /// Create a rate limiter with an unbounded in-memory registry and the wall clock.
    pub fn new(config: RateLimitConfig) -> Result<Self> {
        Self::with_store(config, MemoryStore::new(), SystemClock)
    }
}

impl<S: LimiterStore, C: Clock> RateLimiter<S, C> {
    /// Create a rate limiter over the given store and clock.
    ///
    /// Fails if the configuration is invalid.
    pub fn with_store(config: RateLimitConfig, store: S, clock: C) -> Result<Self> {
        config.validate()?;

        info!(
            algorithm = ?config.algorithm,
            window_ms = config.window_ms,
            max_requests = config.max_requests,
            block_duration_ms = config.block_duration_ms,
            "Rate limiter configured"
        );

        Ok(Self {
            config,
            store,
            clock,
        })
    }

    /// Decide whether a request for `key` may proceed.
    ///
    /// The block check, the algorithm step and any new block happen in one
    /// critical section for the key.
    pub fn evaluate(&self, key: &str) -> Decision {
        let now = self.clock.now_ms();
        let config = &self.config;

        trace!(key = %key, now_ms = now, "Evaluating admission");

        let (decision, newly_blocked) = self.store.with_key(key, now, |state| {
            if let Some(until) = state.blocked_until {
                if until > now {
                    let info = RateLimitInfo {
                        limit: config.max_requests,
                        remaining: 0,
                        reset_time_ms: until,
                        retry_after_ms: Some(until - now),
                    };
                    return (
                        Decision {
                            allowed: false,
                            info,
                        },
                        false,
                    );
                }
                state.blocked_until = None;
            }

            let limiter = state
                .limiter
                .get_or_insert_with(|| Limiter::for_config(config, now));

            let (allowed, remaining) = match limiter {
                Limiter::TokenBucket(bucket) => {
                    let allowed = bucket.consume(1.0, now);
                    (allowed, bucket.remaining(now))
                }
                Limiter::SlidingWindow(counter) => {
                    // Denied requests still count against the window.
                    counter.increment(now);
                    let hits = counter.hits(now);
                    (
                        hits <= config.max_requests,
                        config.max_requests.saturating_sub(hits),
                    )
                }
            };

            let mut info = RateLimitInfo {
                limit: config.max_requests,
                remaining,
                reset_time_ms: now.saturating_add(config.window_ms),
                retry_after_ms: None,
            };

            let mut newly_blocked = false;
            if !allowed && config.block_duration_ms > 0 {
                state.blocked_until = Some(now.saturating_add(config.block_duration_ms));
                info.retry_after_ms = Some(config.block_duration_ms);
                newly_blocked = true;
            }

            (Decision { allowed, info }, newly_blocked)
        });

        if newly_blocked {
            info!(
                key = %key,
                block_duration_ms = config.block_duration_ms,
                "Rate limit exceeded, key blocked"
            );
        } else if !decision.allowed {
            debug!(
                key = %key,
                retry_after_ms = ?decision.info.retry_after_ms,
                "Rate limit exceeded"
            );
        }

        decision
    }

    /// Report how the admitted work for `key` turned out.
    ///
    /// Refunds the admission when the matching skip flag is set. Returns
    /// whether a refund was made; unknown keys are ignored.
    pub fn report_outcome(&self, key: &str, succeeded: bool) -> bool {
        let refund = if succeeded {
            self.config.skip_successful
        } else {
            self.config.skip_failed
        };
        if !refund {
            return false;
        }

        let now = self.clock.now_ms();
        let refunded = self.store.inspect(key, |state| {
            match state.and_then(|state| state.limiter.as_mut()) {
                Some(Limiter::TokenBucket(bucket)) => {
                    bucket.release(1.0, now);
                    true
                }
                Some(Limiter::SlidingWindow(counter)) => counter.remove_latest(now),
                None => false,
            }
        });

        trace!(key = %key, succeeded = succeeded, refunded = refunded, "Outcome reported");
        refunded
    }

    /// Current metadata for `key` without consuming quota.
    ///
    /// Never creates an entry; an unseen key reports its full quota.
    pub fn info(&self, key: &str) -> RateLimitInfo {
        let now = self.clock.now_ms();
        let config = &self.config;

        self.store.inspect(key, |state| {
            let mut info = RateLimitInfo {
                limit: config.max_requests,
                remaining: config.max_requests,
                reset_time_ms: now.saturating_add(config.window_ms),
                retry_after_ms: None,
            };

            let Some(state) = state else {
                return info;
            };

            if let Some(until) = state.blocked_until.filter(|until| *until > now) {
                info.remaining = 0;
                info.reset_time_ms = until;
                info.retry_after_ms = Some(until - now);
                return info;
            }

            info.remaining = match state.limiter.as_mut() {
                Some(Limiter::TokenBucket(bucket)) => bucket.remaining(now),
                Some(Limiter::SlidingWindow(counter)) => {
                    config.max_requests.saturating_sub(counter.hits(now))
                }
                None => config.max_requests,
            };
            info
        })
    }

    /// Whether `key` is currently serving a block.
    pub fn is_blocked(&self, key: &str) -> bool {
        let now = self.clock.now_ms();
        self.store.inspect(key, |state| {
            state
                .and_then(|state| state.blocked_until)
                .is_some_and(|until| until > now)
        })
    }

    /// Forget everything about `key`.
    pub fn reset(&self, key: &str) {
        if self.store.remove(key) {
            debug!(key = %key, "Rate limit state reset");
        }
    }

    /// Forget every key.
    pub fn reset_all(&self) {
        self.store.clear();
        debug!("All rate limit state reset");
    }

    /// Remove expired blocks. Live limiters are kept.
    ///
    /// Returns the number of blocks lifted.
    pub fn sweep_expired_blocks(&self) -> usize {
        let now = self.clock.now_ms();
        let mut lifted = 0;

        let dropped = self.store.retain(|_, state| {
            if state.blocked_until.is_some_and(|until| until <= now) {
                state.blocked_until = None;
                lifted += 1;
            }
            !state.is_idle()
        });

        if lifted > 0 || dropped > 0 {
            debug!(lifted = lifted, dropped = dropped, "Swept expired blocks");
        }
        lifted
    }

    /// Drop expired hits from every sliding-window log.
    ///
    /// Returns the number of hits removed.
    pub fn prune_windows(&self) -> u64 {
        let now = self.clock.now_ms();
        let mut pruned = 0;

        self.store.retain(|_, state| {
            if let Some(Limiter::SlidingWindow(counter)) = state.limiter.as_mut() {
                pruned += counter.cleanup(now);
            }
            true
        });

        if pruned > 0 {
            trace!(pruned = pruned, "Pruned sliding windows");
        }
        pruned
    }

    /// Number of keys currently tracked.
    pub fn key_count(&self) -> usize {
        self.store.len()
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S: LimiterStore + 'static, C: Clock + 'static> RateLimiter<S, C> {
    /// Start the periodic maintenance task.
    ///
    /// Expired blocks are swept every `sweep_interval_ms`; sliding-window
    /// logs are pruned every `window_ms`. The task holds a weak reference and
    /// ends once the limiter is dropped.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let limiter = Arc::downgrade(self);
        let sweep_every = self.config.sweep_interval();
        let prune_every = match self.config.algorithm {
            Algorithm::SlidingWindow => Some(self.config.window()),
            Algorithm::TokenBucket => None,
        };

        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(sweep_every);
            sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut prune = tokio::time::interval(prune_every.unwrap_or(sweep_every));
            prune.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = sweep.tick() => {
                        let Some(limiter) = limiter.upgrade() else { break };
                        limiter.sweep_expired_blocks();
                    }
                    _ = prune.tick(), if prune_every.is_some() => {
                        let Some(limiter) = limiter.upgrade() else { break };
                        limiter.prune_windows();
                    }
                }
            }

            debug!("Rate limiter dropped, maintenance stopped");
        })
    }
}
