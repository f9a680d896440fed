use std::time::Duration;
use tokio::time::Instant;
use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefillConfig {
    /// time between two refills
    pub interval: Duration,
    /// the bucket never holds more tokens than this, and it starts out full
    pub max_tokens: i64,
    /// number of tokens added per elapsed interval
    pub refill: i64,
}

/// Token bucket for admission control. Using tokens may drive the bucket negative, in which case
///  it is 'empty' until enough intervals have passed to refill it.
#[derive(Debug)]
pub struct RateLimitBucket {
    config: RefillConfig,
    tokens: i64,
    last_refill: Instant,
}

impl RateLimitBucket {
    pub fn new(now: Instant, config: RefillConfig) -> Result<RateLimitBucket, TransportError> {
        if config.interval.is_zero() {
            return Err(TransportError::invalid_argument("RefillConfig.interval", "must be greater than zero"));
        }
        if config.max_tokens < 0 {
            return Err(TransportError::invalid_argument("RefillConfig.max_tokens", "must not be negative"));
        }
        if config.refill < 0 {
            return Err(TransportError::invalid_argument("RefillConfig.refill", "must not be negative"));
        }

        Ok(RateLimitBucket {
            config,
            tokens: config.max_tokens,
            last_refill: now,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.tokens < 0
    }

    /// returns `true` if the bucket is empty after using the tokens
    pub fn use_tokens(&mut self, count: i64) -> bool {
        self.tokens -= count;
        self.is_empty()
    }

    pub fn check_refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let intervals = (elapsed.as_nanos() / self.config.interval.as_nanos()).min(u32::MAX as u128) as u32;
        if intervals == 0 {
            return;
        }

        self.tokens = self.tokens
            .saturating_add(self.config.refill.saturating_mul(intervals as i64))
            .min(self.config.max_tokens);
        self.last_refill += self.config.interval * intervals;
    }
}
