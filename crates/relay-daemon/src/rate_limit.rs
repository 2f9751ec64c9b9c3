//! SEND rate limiting: token bucket per agent name.

use std::collections::HashMap;
use std::time::Instant;

use crate::config::RateLimitConfig;

/// Simple token bucket rate limiter per sender.
pub struct RateLimiter {
    buckets: HashMap<String, TokenBucket>,
    capacity: u32,
    refill_per_sec: f64,
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// - `capacity`: max burst tokens
    /// - `refill_per_sec`: steady-state rate (tokens per second)
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            buckets: HashMap::new(),
            capacity,
            refill_per_sec,
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.capacity, config.refill_per_sec)
    }

    /// `Ok` if `agent` may send now, otherwise the wait in ms until the next
    /// token. With no refill the wait is reported as one second.
    pub fn check(&mut self, agent: &str) -> Result<(), u64> {
        self.check_at(agent, Instant::now())
    }

    fn check_at(&mut self, agent: &str, now: Instant) -> Result<(), u64> {
        let capacity = f64::from(self.capacity);
        let bucket = self
            .buckets
            .entry(agent.to_string())
            .or_insert_with(|| TokenBucket {
                tokens: capacity,
                last_refill: now,
            });
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(capacity);
        bucket.last_refill = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(());
        }
        if self.refill_per_sec <= 0.0 {
            return Err(1_000);
        }
        let missing = 1.0 - bucket.tokens;
        Err(((missing / self.refill_per_sec) * 1_000.0).ceil().max(1.0) as u64)
    }

    /// Drop a departed agent's bucket.
    pub fn forget(&mut self, agent: &str) {
        self.buckets.remove(agent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_rate_limiter_allows_within_capacity() {
        let mut rl = RateLimiter::new(5, 1.0);
        for _ in 0..5 {
            assert!(rl.check("alice").is_ok(), "should allow up to capacity");
        }
    }

    #[test]
    fn test_rate_limiter_blocks_over_capacity() {
        let mut rl = RateLimiter::new(3, 0.0);
        for _ in 0..3 {
            let _ = rl.check("alice");
        }
        assert_eq!(rl.check("alice"), Err(1_000), "should block when over capacity");
    }

    #[test]
    fn test_rate_limiter_separate_buckets() {
        let mut rl = RateLimiter::new(1, 0.0);
        assert!(rl.check("alice").is_ok());
        assert!(rl.check("alice").is_err());
        assert!(rl.check("bob").is_ok());
    }

    #[test]
    fn test_retry_after_reflects_refill_rate() {
        let mut rl = RateLimiter::new(1, 2.0);
        let start = Instant::now();
        assert!(rl.check_at("alice", start).is_ok());
        assert_eq!(rl.check_at("alice", start), Err(500));
        assert!(rl.check_at("alice", start + Duration::from_millis(600)).is_ok());
    }

    #[test]
    fn test_forget_resets_bucket() {
        let mut rl = RateLimiter::new(1, 0.0);
        assert!(rl.check("alice").is_ok());
        rl.forget("alice");
        assert!(rl.check("alice").is_ok());
    }
}
