//! Failure classification and backoff policy.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with jitter, bounded attempts.
/// Delay for attempt `n` (1-based) is `base * 2^(n-1) + jitter`, capped.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base,
            cap,
        }
    }

    /// Backoff before retrying after the given (1-based) failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let raw = self.base.saturating_mul(2u32.saturating_pow(exp));
        let capped = raw.min(self.cap);
        let jitter_ceil = (self.base.as_millis() as u64 / 2).max(1);
        let jitter = Duration::from_millis(rand::rng().random_range(0..jitter_ceil));
        (capped + jitter).min(self.cap)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(250), Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_secs(60));
        // Jitter adds at most base/2, so attempt deltas still dominate.
        for _ in 0..20 {
            let first = policy.backoff(1);
            let third = policy.backoff(3);
            assert!(first < Duration::from_millis(151));
            assert!(third >= Duration::from_millis(400));
        }
    }

    #[test]
    fn backoff_respects_cap() {
        let policy = RetryPolicy::new(10, Duration::from_millis(500), Duration::from_secs(2));
        for attempt in 1..=10 {
            assert!(policy.backoff(attempt) <= Duration::from_secs(2));
        }
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        let policy = RetryPolicy::new(u32::MAX, Duration::from_secs(1), Duration::from_secs(5));
        assert!(policy.backoff(u32::MAX) <= Duration::from_secs(5));
    }

    #[test]
    fn at_least_one_attempt() {
        let policy = RetryPolicy::new(0, Duration::from_millis(1), Duration::from_millis(10));
        assert_eq!(policy.max_attempts, 1);
    }
}
