//! Per-connection token bucket for inbound frames.
//!
//! The bucket refills lazily: on each call, `floor(elapsed / refill_interval)`
//! tokens are added (capped at capacity) and the refill clock advances by
//! exactly the time those tokens account for, so partial intervals carry over.
//! Refill and decrement happen under one lock.
//!
//! A `false` verdict means the caller drops the frame. The limiter never
//! queues or sleeps.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Default bucket capacity (burst size).
pub const DEFAULT_RATE_LIMIT_CAPACITY: u32 = 50;

/// Default refill interval (one token per interval).
pub const DEFAULT_RATE_LIMIT_REFILL: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

/// Token bucket rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: u32,
    refill_interval: Duration,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    /// Create a full bucket.
    ///
    /// A zero `refill_interval` is treated as one nanosecond so the refill
    /// arithmetic never divides by zero.
    #[must_use]
    pub fn new(capacity: u32, refill_interval: Duration) -> Self {
        let refill_interval = refill_interval.max(Duration::from_nanos(1));
        Self {
            capacity,
            refill_interval,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Bucket capacity.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Refill interval.
    #[must_use]
    pub fn refill_interval(&self) -> Duration {
        self.refill_interval
    }

    /// Take one token if available.
    pub fn allow(&self) -> bool {
        let mut state = self.lock();
        self.refill(&mut state);

        if state.tokens == 0 {
            return false;
        }
        state.tokens -= 1;
        true
    }

    /// Tokens available after a lazy refill.
    pub fn available_tokens(&self) -> u32 {
        let mut state = self.lock();
        self.refill(&mut state);
        state.tokens
    }

    /// Restore full capacity and restart the refill clock.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.tokens = self.capacity;
        state.last_refill = Instant::now();
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill);
        let intervals = elapsed.as_nanos() / self.refill_interval.as_nanos();
        if intervals == 0 {
            return;
        }

        if state.tokens >= self.capacity {
            // A full bucket does not bank time.
            state.last_refill = now;
            return;
        }

        let missing = self.capacity - state.tokens;
        let added = u32::try_from(intervals).map_or(missing, |n| n.min(missing));
        state.tokens += added;

        if state.tokens >= self.capacity {
            state.last_refill = now;
        } else {
            // Keep the remainder of a partial interval for the next call.
            state.last_refill += self.refill_interval.saturating_mul(added);
        }
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        // The state stays consistent at every await-free step, so a poisoned
        // lock is still safe to reuse.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_LIMIT_CAPACITY, DEFAULT_RATE_LIMIT_REFILL)
    }
}
