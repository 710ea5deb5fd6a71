//! Token bucket with continuous refill.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Longest `retry_after` a bucket will report. Buckets that never refill
/// report this value on denial.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Result of a consumption attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Allowed { remaining: f64 },
    Denied { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
    last_accessed: Instant,
}

impl BucketState {
    fn refill(&mut self, now: Instant, capacity: f64, rate: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        // A stale `now` must never move the refill clock backwards.
        if now > self.last_refill {
            self.last_refill = now;
        }
    }
}

/// A point-in-time view of a bucket, taken without consuming.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketSnapshot {
    pub capacity: u32,
    pub tokens: f64,
    /// Time until the bucket is full again, capped at [`MAX_RETRY_AFTER`].
    pub time_until_full: Duration,
}

/// Per-key counter with a capacity and continuous refill.
///
/// All state lives behind the bucket's own lock, so a consumption is atomic
/// with respect to other callers on the same key.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(capacity: u32, refill_rate: f64, now: Instant) -> Self {
        Self::with_tokens(capacity, refill_rate, f64::from(capacity), now)
    }

    /// A bucket starting at `tokens`, clamped into `0..=capacity`.
    pub fn with_tokens(capacity: u32, refill_rate: f64, tokens: f64, now: Instant) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            refill_rate: refill_rate.max(0.0),
            state: Mutex::new(BucketState {
                tokens: tokens.clamp(0.0, f64::from(capacity)),
                last_refill: now,
                last_accessed: now,
            }),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Refill for the time elapsed since the last refill, then take `n` tokens
    /// if that many are available. Insufficient tokens are never clamped.
    pub fn try_consume(&self, n: u32, now: Instant) -> Admission {
        let capacity = f64::from(self.capacity);
        let n = f64::from(n);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.refill(now, capacity, self.refill_rate);
        if now > state.last_accessed {
            state.last_accessed = now;
        }

        if state.tokens >= n {
            state.tokens -= n;
            Admission::Allowed {
                remaining: state.tokens,
            }
        } else {
            Admission::Denied {
                retry_after: self.wait_for(n - state.tokens),
            }
        }
    }

    /// Current state, refilled to `now` but without consuming or touching the
    /// access time.
    pub fn peek(&self, now: Instant) -> BucketSnapshot {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        let capacity = f64::from(self.capacity);
        let tokens = (state.tokens + elapsed * self.refill_rate).min(capacity);
        BucketSnapshot {
            capacity: self.capacity,
            tokens,
            time_until_full: self.wait_for(capacity - tokens),
        }
    }

    /// When the bucket was last consumed from.
    pub fn last_accessed(&self) -> Instant {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_accessed
    }

    /// Time needed to accumulate `deficit` tokens.
    fn wait_for(&self, deficit: f64) -> Duration {
        if deficit <= 0.0 {
            return Duration::ZERO;
        }
        if self.refill_rate <= 0.0 {
            return MAX_RETRY_AFTER;
        }
        Duration::try_from_secs_f64(deficit / self.refill_rate)
            .map_or(MAX_RETRY_AFTER, |d| d.min(MAX_RETRY_AFTER))
    }
}
