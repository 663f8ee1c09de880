//! Caller-side retry policy for whole transactions.

use crate::error::CoreError;
use rand::Rng;
use std::time::Duration;

/// How [`crate::Replica::run_with_retry`] restarts failed transactions.
///
/// Each retry waits an exponentially growing backoff plus a random jitter of
/// up to the same amount, capped at `max_backoff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// Backoff before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound on any single backoff.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub const NEVER: Self = Self {
        max_attempts: 1,
        initial_backoff: Duration::ZERO,
        max_backoff: Duration::ZERO,
    };

    /// Sets the attempt budget.
    #[must_use]
    pub const fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the first backoff.
    #[must_use]
    pub const fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Sets the backoff cap.
    #[must_use]
    pub const fn max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    /// Returns true if `error` after `attempt` (1-based) deserves another try.
    #[must_use]
    pub fn should_retry(&self, attempt: u32, error: &CoreError) -> bool {
        attempt < self.max_attempts && error.is_retryable()
    }

    /// Backoff to sleep after the failed `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_backoff
            .saturating_mul(1 << shift)
            .min(self.max_backoff);
        let base_micros = u64::try_from(base.as_micros()).unwrap_or(u64::MAX);
        let jitter = if base_micros == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=base_micros)
        };
        base.saturating_add(Duration::from_micros(jitter))
            .min(self.max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_only_retryable_errors() {
        let policy = RetryPolicy::default().max_attempts(3);
        let conflict = CoreError::conflict("c", b"k".to_vec());

        assert!(policy.should_retry(1, &conflict));
        assert!(policy.should_retry(2, &conflict));
        assert!(!policy.should_retry(3, &conflict));
        assert!(!policy.should_retry(1, &CoreError::Cancelled));
        assert!(!RetryPolicy::NEVER.should_retry(1, &conflict));
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let policy = RetryPolicy::default()
            .initial_backoff(Duration::from_millis(10))
            .max_backoff(Duration::from_millis(100));

        for _ in 0..20 {
            let first = policy.backoff(1);
            assert!(first >= Duration::from_millis(10));
            assert!(first <= Duration::from_millis(20));

            assert!(policy.backoff(3) >= Duration::from_millis(40));
            assert!(policy.backoff(30) <= Duration::from_millis(100));
        }
    }

    #[test]
    fn zero_backoff_stays_zero() {
        assert_eq!(RetryPolicy::NEVER.backoff(1), Duration::ZERO);
    }
}
