//! Token bucket rate limiting for route discovery traffic

use crate::time::Timestamp;

/// Continuously refilled token bucket
///
/// Starts full. Tokens accrue at `tokens_per_sec` and never exceed
/// `max_tokens`.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens_per_sec: f64,
    max_tokens: f64,
    available: f64,
    last_refill: Timestamp,
}

impl TokenBucket {
    pub fn new(tokens_per_sec: f64, max_tokens: f64, now: Timestamp) -> Self {
        Self {
            tokens_per_sec,
            max_tokens,
            available: max_tokens,
            last_refill: now,
        }
    }

    /// Take `amount` tokens if available
    ///
    /// The bucket is refilled up to `now` either way; on failure nothing is
    /// taken.
    pub fn consume(&mut self, amount: f64, now: Timestamp) -> bool {
        let elapsed = now.saturating_since(self.last_refill).as_secs_f64();
        self.available = (self.available + elapsed * self.tokens_per_sec).min(self.max_tokens);
        self.last_refill = now;

        if self.available >= amount {
            self.available -= amount;
            true
        } else {
            false
        }
    }

    /// Tokens currently in the bucket, as of the last refill
    pub fn available(&self) -> f64 {
        self.available
    }

    pub fn max_tokens(&self) -> f64 {
        self.max_tokens
    }
}
