//! Per-connection token buckets.
//!
//! State lives only in the connection that owns it: it is dropped on
//! disconnect and starts full again on reconnect. This is weaker than a
//! cross-process limiter; it only guards a single socket against flooding.

use std::time::Instant;

use crate::config::{BucketConfig, RateLimitConfig};

use super::events::Category;

/// A single token bucket.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(config: BucketConfig, now: Instant) -> Self {
        let capacity = f64::from(config.capacity);
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: config.refill_per_sec.max(0.0),
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token if available.
    pub fn try_take(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// The buckets owned by one connection, one per client-publishable category.
#[derive(Debug, Clone)]
pub struct ConnectionLimiter {
    chat: TokenBucket,
    status: TokenBucket,
}

impl ConnectionLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self::starting_at(config, Instant::now())
    }

    pub fn starting_at(config: &RateLimitConfig, now: Instant) -> Self {
        Self {
            chat: TokenBucket::new(config.chat, now),
            status: TokenBucket::new(config.status, now),
        }
    }

    /// Admission check for one action. Never blocks.
    pub fn admit(&mut self, category: Category) -> bool {
        self.admit_at(category, Instant::now())
    }

    pub fn admit_at(&mut self, category: Category, now: Instant) -> bool {
        match category {
            Category::Chat => self.chat.try_take(now),
            Category::ServiceStatus => self.status.try_take(now),
            // Server-originated only.
            Category::Notification => true,
        }
    }
}
