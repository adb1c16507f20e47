//! Continuous-refill token bucket.

/// A token bucket for a single key.
///
/// Tokens refill continuously at `refill_rate` per second up to `capacity`.
/// Every read or mutation refills first, so the bucket never needs a timer.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Tokens currently available, always within `[0, capacity]`
    tokens: f64,
    /// Maximum number of tokens
    capacity: f64,
    /// Tokens restored per second
    refill_rate: f64,
    /// Epoch milliseconds of the last refill
    last_refill: u64,
}

impl TokenBucket {
    /// Create a full bucket admitting `max_requests` per `window_ms`.
    pub fn new(max_requests: u64, window_ms: u64, now_ms: u64) -> Self {
        let capacity = max_requests as f64;
        let window_secs = window_ms as f64 / 1000.0;

        Self {
            tokens: capacity,
            capacity,
            refill_rate: capacity / window_secs,
            last_refill: now_ms,
        }
    }

    /// Add the tokens accrued since the last refill.
    ///
    /// A clock that moved backwards counts as zero elapsed time.
    pub fn refill(&mut self, now_ms: u64) {
        let elapsed_ms = now_ms.saturating_sub(self.last_refill);
        if elapsed_ms == 0 {
            return;
        }

        let accrued = elapsed_ms as f64 / 1000.0 * self.refill_rate;
        self.tokens = (self.tokens + accrued).min(self.capacity);
        self.last_refill = now_ms;
    }

    /// Take `n` tokens if available.
    ///
    /// Returns `true` when the tokens were taken; on `false` the bucket is unchanged.
    pub fn consume(&mut self, n: f64, now_ms: u64) -> bool {
        self.refill(now_ms);

        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Give back `n` tokens, never exceeding capacity.
    pub fn release(&mut self, n: f64, now_ms: u64) {
        self.refill(now_ms);
        self.tokens = (self.tokens + n).min(self.capacity);
    }

    /// Tokens available at `now_ms`.
    pub fn tokens(&mut self, now_ms: u64) -> f64 {
        self.refill(now_ms);
        self.tokens
    }

    /// Whole tokens available at `now_ms`, as reported in response metadata.
    pub fn remaining(&mut self, now_ms: u64) -> u64 {
        self.tokens(now_ms).floor() as u64
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_bucket_is_full() {
        let mut bucket = TokenBucket::new(10, 1000, 0);
        assert_eq!(bucket.tokens(0), 10.0);
        assert_eq!(bucket.refill_rate(), 10.0);
    }

    #[test]
    fn test_refill_correctness() {
        // capacity 5, 1 token per second
        let mut bucket = TokenBucket::new(5, 5000, 0);
        assert_eq!(bucket.refill_rate(), 1.0);

        for _ in 0..5 {
            assert!(bucket.consume(1.0, 0));
        }
        assert!(!bucket.consume(1.0, 0));

        // One second restores exactly one token
        assert!(bucket.consume(1.0, 1000));
        assert!(!bucket.consume(1.0, 1000));

        // Five more seconds refill to capacity, not beyond
        for _ in 0..5 {
            assert!(bucket.consume(1.0, 6000));
        }
        assert!(!bucket.consume(1.0, 6000));
    }

    #[test]
    fn test_failed_consume_does_not_mutate() {
        let mut bucket = TokenBucket::new(2, 2000, 0);
        assert!(bucket.consume(1.0, 0));
        assert!(bucket.consume(0.5, 0));

        assert!(!bucket.consume(1.0, 0));
        assert_eq!(bucket.tokens(0), 0.5);
    }

    #[test]
    fn test_release_clamps_to_capacity() {
        let mut bucket = TokenBucket::new(3, 1000, 0);
        bucket.release(1.0, 0);
        assert_eq!(bucket.tokens(0), 3.0);

        assert!(bucket.consume(1.0, 0));
        bucket.release(5.0, 0);
        assert_eq!(bucket.tokens(0), 3.0);
    }

    #[test]
    fn test_clock_going_backwards_is_ignored() {
        let mut bucket = TokenBucket::new(4, 4000, 10_000);
        assert!(bucket.consume(4.0, 10_000));

        // Earlier timestamp: no refill, no negative tokens
        assert_eq!(bucket.tokens(5_000), 0.0);

        // Refill resumes from the latest observed time
        assert_eq!(bucket.tokens(11_000), 1.0);
    }

    #[test]
    fn test_tokens_stay_within_bounds() {
        let mut bucket = TokenBucket::new(3, 300, 0);
        let mut now = 0;

        for step in 0..200u64 {
            now += step % 7 * 13;
            if step % 3 == 0 {
                bucket.release(1.0, now);
            } else {
                bucket.consume(1.0, now);
            }
            let tokens = bucket.tokens(now);
            assert!((0.0..=bucket.capacity()).contains(&tokens));
        }
    }

    #[test]
    fn test_remaining_is_floored() {
        let mut bucket = TokenBucket::new(2, 2000, 0);
        assert!(bucket.consume(2.0, 0));
        assert_eq!(bucket.remaining(1500), 1);
    }
}
