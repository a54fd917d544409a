use std::time::Duration;

pub const DEFAULT_RECONNECT_STEP_MS: u64 = 2_000;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Linear reconnect backoff: attempt `n` waits `n * step`, up to `max_attempts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    step_delay_ms: u64,
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(step_delay_ms: u64, max_attempts: u32) -> Self {
        Self {
            step_delay_ms,
            max_attempts,
        }
    }

    pub fn step_delay_ms(&self) -> u64 {
        self.step_delay_ms
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let bounded = u64::from(attempt.min(self.max_attempts));
        Duration::from_millis(self.step_delay_ms.saturating_mul(bounded))
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RECONNECT_STEP_MS, DEFAULT_MAX_RECONNECT_ATTEMPTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scales_linearly_for_attempts() {
        let policy = RetryPolicy::default();
        for attempt in 1..=3 {
            assert_eq!(
                policy.delay_for_attempt(attempt),
                Duration::from_millis(u64::from(attempt) * 2_000)
            );
        }
    }

    #[test]
    fn retries_up_to_max_attempts() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn caps_delay_at_max_attempts() {
        let policy = RetryPolicy::new(1_000, 2);
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(2_000));
    }

    #[test]
    fn zero_attempts_never_retry() {
        let policy = RetryPolicy::new(500, 0);
        assert!(!policy.should_retry(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
    }
}
