use std::time::Duration;

use chrono::{DateTime, Utc};

/// Exponential retry schedule shared by every operation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    ceiling: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self { base, ceiling }
    }

    /// `min(base * 2^retry_count, ceiling)`, saturating on overflow.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.ceiling)
    }

    /// Earliest time an operation that has failed `retry_count` times may run again.
    pub fn next_attempt_at(&self, now: DateTime<Utc>, retry_count: u32) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay_for(retry_count))
            .unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay() {
        let policy = BackoffPolicy::new(Duration::from_secs(5), Duration::from_secs(300));

        assert_eq!(policy.delay_for(0), Duration::from_secs(5));
        assert_eq!(policy.delay_for(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for(5), Duration::from_secs(160));
        assert_eq!(policy.delay_for(10), Duration::from_secs(300)); // Capped
    }

    #[test]
    fn test_retry_delay_saturates() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for(40), Duration::from_secs(60));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_next_attempt_at() {
        let policy = BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(60));
        let now = Utc::now();
        assert_eq!(
            policy.next_attempt_at(now, 2),
            now + chrono::Duration::milliseconds(2000)
        );
    }
}
