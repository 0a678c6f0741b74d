//! Per-route call budgets for outbound platform calls.
//!
//! Each route maps to a bucket with a permit count and a reset time. An
//! empty bucket suspends the caller until reset; calls are never dropped
//! and a permit is never spent twice. A global cooldown pauses every
//! bucket uniformly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Call budget for one route.
#[derive(Debug, Clone)]
pub struct RateBucket {
    pub capacity: u32,
    pub remaining: u32,
    pub reset_at: Instant,
}

struct LimiterState {
    buckets: HashMap<String, RateBucket>,
    global_until: Option<Instant>,
}

/// Shared permit accounting across all outbound routes. All mutation goes
/// through this type's own lock; handlers never touch bucket state.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<LimiterState>>,
    default_capacity: u32,
    window: Duration,
}

impl RateLimiter {
    /// `default_capacity` and `window` seed buckets the platform has not
    /// described yet; response headers overwrite both per route.
    pub fn new(default_capacity: u32, window: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LimiterState {
                buckets: HashMap::new(),
                global_until: None,
            })),
            default_capacity: default_capacity.max(1),
            window,
        }
    }

    /// Consume a permit for the route, suspending until one is available.
    pub async fn gate(&self, bucket: &str) {
        loop {
            let wait = {
                let mut state = self.inner.lock().await;
                let now = Instant::now();

                if let Some(until) = state.global_until {
                    if until > now {
                        until - now
                    } else {
                        state.global_until = None;
                        Duration::ZERO
                    }
                } else {
                    let default_capacity = self.default_capacity;
                    let window = self.window;
                    let entry = state
                        .buckets
                        .entry(bucket.to_string())
                        .or_insert_with(|| RateBucket {
                            capacity: default_capacity,
                            remaining: default_capacity,
                            reset_at: now + window,
                        });
                    if entry.reset_at <= now {
                        entry.remaining = entry.capacity;
                        entry.reset_at = now + window;
                    }
                    if entry.remaining > 0 {
                        entry.remaining -= 1;
                        return;
                    }
                    entry.reset_at - now
                }
            };
            if wait > Duration::ZERO {
                debug!(bucket, wait_ms = wait.as_millis() as u64, "Rate bucket empty, suspending");
                sleep(wait).await;
            }
        }
    }

    /// Apply the platform's post-call accounting for a route.
    pub async fn update(&self, bucket: &str, remaining: u32, reset_after: Duration) {
        let mut state = self.inner.lock().await;
        let now = Instant::now();
        let default_capacity = self.default_capacity;
        let window = self.window;
        let entry = state
            .buckets
            .entry(bucket.to_string())
            .or_insert_with(|| RateBucket {
                capacity: default_capacity,
                remaining: default_capacity,
                reset_at: now + window,
            });
        entry.remaining = remaining.min(entry.capacity);
        entry.reset_at = now + reset_after;
    }

    /// Platform-wide throttle: every bucket pauses until the cooldown ends.
    pub async fn set_global_cooldown(&self, cooldown: Duration) {
        let mut state = self.inner.lock().await;
        state.global_until = Some(Instant::now() + cooldown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sixth_call_waits_for_the_reset() {
        let limiter = RateLimiter::new(5, Duration::from_secs(1));
        let started = Instant::now();

        for _ in 0..5 {
            limiter.gate("route").await;
        }
        assert!(started.elapsed() < Duration::from_millis(10));

        limiter.gate("route").await;
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_refills_after_reset() {
        let limiter = RateLimiter::new(5, Duration::from_secs(1));
        for _ in 0..6 {
            limiter.gate("route").await;
        }
        // The reset that admitted the sixth call refilled the bucket;
        // four more permits remain before the next suspension.
        let resumed = Instant::now();
        for _ in 0..4 {
            limiter.gate("route").await;
        }
        assert!(resumed.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn header_update_drains_bucket_until_reset() {
        let limiter = RateLimiter::new(5, Duration::from_secs(1));
        limiter.update("route", 0, Duration::from_secs(5)).await;

        let started = Instant::now();
        limiter.gate("route").await;
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn global_cooldown_pauses_every_bucket() {
        let limiter = RateLimiter::new(5, Duration::from_secs(1));
        limiter.set_global_cooldown(Duration::from_secs(3)).await;

        let started = Instant::now();
        limiter.gate("a").await;
        assert!(started.elapsed() >= Duration::from_secs(3));

        // Cooldown already elapsed; other buckets proceed immediately.
        let after = Instant::now();
        limiter.gate("b").await;
        assert!(after.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn buckets_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(10));
        limiter.gate("a").await;

        let started = Instant::now();
        limiter.gate("b").await;
        assert!(started.elapsed() < Duration::from_millis(10));
    }
}
