//! Token-bucket rate limiter for source API requests.
//!
//! The bucket starts full at `capacity` tokens and refills continuously at
//! `rate` tokens per second. Each request consumes one token. Refill and
//! consumption happen under a short lock; waiting happens outside it, so a
//! blocked caller never stalls another caller's bookkeeping.
//!
//! Waiters retry the whole refill-and-check cycle after sleeping, so they
//! behave like a queue of retries rather than a strict FIFO.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Counters exposed for monitoring.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimiterStats {
    pub requests_made: u64,
    /// Acquisitions that had to wait at least once.
    pub requests_throttled: u64,
    pub total_wait_secs: f64,
    pub available_tokens: f64,
    pub capacity: f64,
    pub rate_per_minute: f64,
}

/// Thread-safe token bucket.
pub struct RateLimiter {
    rate: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
    requests_made: AtomicU64,
    requests_throttled: AtomicU64,
    total_wait_micros: AtomicU64,
}

/// Proof that a token was consumed. Dropping it does not return the token.
pub struct Permit;

impl RateLimiter {
    /// Limiter for `requests_per_minute` sustained requests.
    ///
    /// Burst capacity defaults to a tenth of the per-minute quota, with a
    /// floor of 10.
    pub fn new(requests_per_minute: u32, burst_capacity: Option<u32>) -> Self {
        let rpm = requests_per_minute.max(1);
        let capacity = burst_capacity
            .filter(|b| *b > 0)
            .unwrap_or_else(|| (rpm / 10).max(10));
        Self::with_rate(rpm as f64 / 60.0, capacity)
    }

    /// Limiter with an explicit per-second rate.
    pub fn with_rate(per_second: f64, capacity: u32) -> Self {
        let capacity = capacity.max(1) as f64;
        Self {
            rate: per_second.max(f64::MIN_POSITIVE),
            capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            requests_made: AtomicU64::new(0),
            requests_throttled: AtomicU64::new(0),
            total_wait_micros: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.capacity);
        bucket.last_refill = now;
    }

    /// Take one token, waiting for refill if the bucket is empty.
    ///
    /// Returns `false` without consuming a token if `timeout` elapses
    /// first. `None` waits indefinitely.
    pub async fn acquire(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut throttled = false;

        loop {
            let wait = {
                let mut bucket = self.lock();
                self.refill(&mut bucket);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    self.requests_made.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                let needed = Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate);
                match deadline {
                    None => needed,
                    Some(deadline) => {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if remaining.is_zero() {
                            return false;
                        }
                        needed.min(remaining)
                    }
                }
            };

            if !throttled {
                throttled = true;
                self.requests_throttled.fetch_add(1, Ordering::Relaxed);
            }
            self.total_wait_micros
                .fetch_add(wait.as_micros() as u64, Ordering::Relaxed);
            tokio::time::sleep(wait).await;
        }
    }

    /// Wait indefinitely for a token.
    pub async fn permit(&self) -> Permit {
        self.acquire(None).await;
        Permit
    }

    /// Tokens available right now, after refill.
    pub fn available_tokens(&self) -> f64 {
        let mut bucket = self.lock();
        self.refill(&mut bucket);
        bucket.tokens
    }

    pub fn rate_per_minute(&self) -> f64 {
        self.rate * 60.0
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            requests_made: self.requests_made.load(Ordering::Relaxed),
            requests_throttled: self.requests_throttled.load(Ordering::Relaxed),
            total_wait_secs: self.total_wait_micros.load(Ordering::Relaxed) as f64 / 1e6,
            available_tokens: self.available_tokens(),
            capacity: self.capacity,
            rate_per_minute: self.rate_per_minute(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn default_capacity_policy() {
        assert_eq!(RateLimiter::new(150, None).capacity(), 15.0);
        assert_eq!(RateLimiter::new(60, None).capacity(), 10.0);
        assert_eq!(RateLimiter::new(150, Some(4)).capacity(), 4.0);
        assert!((RateLimiter::new(120, None).rate_per_minute() - 120.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn burst_does_not_block_then_waits_one_interval() {
        let limiter = RateLimiter::with_rate(10.0, 5);

        let start = Instant::now();
        for _ in 0..5 {
            assert!(limiter.acquire(None).await);
        }
        assert!(start.elapsed() < Duration::from_millis(50));
        assert_eq!(limiter.stats().requests_throttled, 0);

        let before = Instant::now();
        assert!(limiter.acquire(None).await);
        let waited = before.elapsed();
        assert!(waited >= Duration::from_millis(80), "waited {:?}", waited);
        assert!(waited < Duration::from_millis(400), "waited {:?}", waited);

        let stats = limiter.stats();
        assert_eq!(stats.requests_made, 6);
        assert_eq!(stats.requests_throttled, 1);
        assert!(stats.total_wait_secs > 0.0);
    }

    #[tokio::test]
    async fn timeout_returns_false_without_consuming() {
        let limiter = RateLimiter::with_rate(0.5, 1);
        assert!(limiter.acquire(None).await);

        let start = Instant::now();
        assert!(!limiter.acquire(Some(Duration::from_millis(50))).await);
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(limiter.stats().requests_made, 1);
    }

    #[tokio::test]
    async fn sustained_rate_is_bounded() {
        let limiter = RateLimiter::with_rate(50.0, 1);
        let start = Instant::now();
        for _ in 0..11 {
            limiter.permit().await;
        }
        // One token up front, ten more at 50/s.
        let elapsed = start.elapsed().as_secs_f64();
        assert!(elapsed >= 0.18, "elapsed {}", elapsed);
    }

    #[tokio::test]
    async fn concurrent_callers_share_bucket() {
        let limiter = Arc::new(RateLimiter::with_rate(100.0, 3));
        let mut handles = Vec::new();
        for _ in 0..6 {
            let l = limiter.clone();
            handles.push(tokio::spawn(async move { l.acquire(None).await }));
        }
        for h in handles {
            assert!(h.await.unwrap());
        }
        let stats = limiter.stats();
        assert_eq!(stats.requests_made, 6);
        assert!(stats.available_tokens <= stats.capacity);
    }
}
