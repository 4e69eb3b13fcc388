//! Token-bucket rate limiter shared by all concurrent gateway operations.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket refilling at `rate` tokens per second with a burst capacity
/// of `rate`. `acquire` suspends until a token is available.
pub struct RateLimiter {
    rate: f64,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    pub fn new(ops_per_second: u32) -> Self {
        let rate = f64::from(ops_per_second.max(1));
        Self {
            rate,
            state: Mutex::new(BucketState {
                tokens: rate,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, waiting for a refill when the bucket is empty.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate).min(self.rate);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.rate)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_within_capacity_is_immediate() {
        let limiter = RateLimiter::new(10);
        let start = Instant::now();
        for _ in 0..10 {
            limiter.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_bucket_waits_for_refill() {
        let limiter = RateLimiter::new(10);
        for _ in 0..10 {
            limiter.acquire().await;
        }
        let start = Instant::now();
        limiter.acquire().await;
        // One token refills in 1/10 s.
        assert!(start.elapsed() >= Duration::from_millis(99));
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_is_sustained() {
        let limiter = RateLimiter::new(5);
        let start = Instant::now();
        for _ in 0..15 {
            limiter.acquire().await;
        }
        // 5 burst tokens + 10 refilled at 5/s, about 2 s.
        assert!(start.elapsed() >= Duration::from_millis(1_900));
    }
}
