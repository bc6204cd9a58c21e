//! Per-target token buckets bounding how fast plugins hit one target.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: u32, now: Instant) -> Self {
        let capacity = f64::from(rate.max(1));
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec: capacity,
            last_refill: now,
        }
    }

    /// Take one token, or report how long until one is available
    fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(missing / self.refill_per_sec))
        }
    }
}

/// Limits executions per second against each target independently
#[derive(Debug)]
pub struct TargetRateLimiter {
    rate: u32,
    buckets: DashMap<String, Arc<Mutex<TokenBucket>>>,
}

impl TargetRateLimiter {
    pub fn new(rate_per_sec: u32) -> Self {
        Self {
            rate: rate_per_sec.max(1),
            buckets: DashMap::new(),
        }
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Wait until an execution against `target` is allowed
    pub async fn acquire(&self, target: &str) {
        let bucket = self
            .buckets
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(TokenBucket::new(self.rate, Instant::now()))))
            .clone();

        loop {
            let wait = bucket.lock().try_take(Instant::now());
            match wait {
                Ok(()) => return,
                Err(delay) => tokio::time::sleep(delay).await,
            }
        }
    }

    /// Drop the bucket of a finished target
    pub fn forget(&self, target: &str) {
        self.buckets.remove(target);
    }

    pub fn tracked_targets(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_refills_over_time() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(2, start);
        assert!(bucket.try_take(start).is_ok());
        assert!(bucket.try_take(start).is_ok());
        let wait = bucket.try_take(start).unwrap_err();
        assert!(wait <= Duration::from_millis(500));
        assert!(bucket.try_take(start + Duration::from_millis(500)).is_ok());
    }

    #[tokio::test]
    async fn test_burst_then_throttle() {
        let limiter = TargetRateLimiter::new(20);
        let started = std::time::Instant::now();
        for _ in 0..22 {
            limiter.acquire("10.0.0.1").await;
        }
        // Two tokens beyond the burst need roughly 100ms of refill
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_targets_are_independent() {
        let limiter = TargetRateLimiter::new(1);
        limiter.acquire("a").await;
        let started = std::time::Instant::now();
        limiter.acquire("b").await;
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(limiter.tracked_targets(), 2);
        limiter.forget("a");
        assert_eq!(limiter.tracked_targets(), 1);
    }
}
