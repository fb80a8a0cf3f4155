use serde::{Deserialize, Serialize};
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use crate::{
    error::{GatewayError, Result},
    utils::TimeSource,
};

/// Capacity and refill rate shared by every bucket of one limiter tier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Maximum number of tokens, also the burst size
    pub capacity: f64,
    /// Tokens added per second
    pub refill_rate: f64,
}

impl BucketConfig {
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
        }
    }

    /// Reject settings that would make a bucket that never admits anything
    pub fn validate(&self, tier: &str) -> Result<()> {
        if !self.capacity.is_finite() || self.capacity < 1.0 {
            return Err(GatewayError::Config(format!(
                "{} limiter capacity must be at least 1, got {}",
                tier, self.capacity
            )));
        }

        if !self.refill_rate.is_finite() || self.refill_rate <= 0.0 {
            return Err(GatewayError::Config(format!(
                "{} limiter refill rate must be positive, got {}",
                tier, self.refill_rate
            )));
        }

        Ok(())
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket with lazy, continuous refill.
///
/// Tokens are fractional. Every call to [`TokenBucket::allow`] first credits
/// `elapsed * refill_rate` tokens (capped at capacity) and then tries to take
/// exactly one. The read-refill-decide-mutate sequence runs under one mutex.
pub struct TokenBucket {
    config: BucketConfig,
    state: Mutex<BucketState>,
    time_source: Arc<dyn TimeSource>,
}

impl TokenBucket {
    /// Create a full bucket
    pub fn new(config: BucketConfig, time_source: Arc<dyn TimeSource>) -> Self {
        let now = time_source.now();

        Self {
            config,
            state: Mutex::new(BucketState {
                tokens: config.capacity,
                last_refill: now,
            }),
            time_source,
        }
    }

    /// Refill, then take one token if at least one is available
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        // Clock read under the lock, and never behind the last refill
        let now = self.time_source.now().max(state.last_refill);

        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.config.refill_rate).min(self.config.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Current token level as of the last refill
    pub fn tokens(&self) -> f64 {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).tokens
    }

    /// Time of the last refill, which is also the last time the bucket was used
    pub fn last_refill(&self) -> Instant {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_refill
    }

    /// How long the bucket has gone without an `allow` call
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_refill())
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("config", &self.config)
            .field("tokens", &self.tokens())
            .finish()
    }
}
