//! Token bucket pacing reply generation.
//!
//! Refill is computed lazily from elapsed time on each `take()`; there is no
//! background timer. The state lock is held only while refilling and
//! deciding, never across the wait.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::RateLimitConfig;

/// Floor for a single wait so callers never spin.
const MIN_WAIT: Duration = Duration::from_millis(10);
/// Ceiling for a single wait; the loop re-evaluates after it.
const MAX_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    updated: Instant,
}

/// Continuous-refill token bucket.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket. `capacity` is clamped to at least 1.
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            rate: refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: capacity,
                updated: Instant::now(),
            }),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.capacity, config.refill_per_sec)
    }

    /// Wait until one token is available, then consume it.
    pub async fn take(&self) {
        loop {
            let wait = match self.try_take_at(Instant::now()) {
                Ok(()) => return,
                Err(wait) => wait,
            };
            tokio::time::sleep(wait.max(MIN_WAIT)).await;
        }
    }

    /// Non-blocking variant: consume a token if one is available.
    pub fn try_take(&self) -> bool {
        self.try_take_at(Instant::now()).is_ok()
    }

    /// Current token count after refilling up to `now`.
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        state.tokens
    }

    fn try_take_at(&self, now: Instant) -> Result<(), Duration> {
        let mut state = self.state.lock();
        self.refill(&mut state, now);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            debug_assert!(state.tokens >= 0.0 && state.tokens <= self.capacity);
            return Ok(());
        }

        if self.rate <= 0.0 {
            return Err(Duration::from_secs(1));
        }
        let need = (1.0 - state.tokens) / self.rate;
        Err(Duration::try_from_secs_f64(need)
            .unwrap_or(MAX_WAIT)
            .min(MAX_WAIT))
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.updated).as_secs_f64();
        state.updated = now;
        state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
    }
}
