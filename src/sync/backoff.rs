//! Exponential backoff between failed sync cycles.

use std::time::Duration;

/// `base * multiplier^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            base,
            multiplier,
            max,
        }
    }

    /// Delay before the next cycle, where `attempt` counts from zero.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if self.base.is_zero() {
            return Duration::ZERO;
        }
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(1.0).powi(exp);
        let millis = self.base.as_millis() as f64 * factor;
        let max_millis = self.max.as_millis() as f64;

        if !millis.is_finite() || millis >= max_millis {
            self.max
        } else {
            Duration::from_millis(millis as u64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_exponentially() {
        let policy = BackoffPolicy::new(Duration::from_millis(500), 2.0, Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), 3.0, Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_multiplier_below_one_is_flat() {
        let policy = BackoffPolicy::new(Duration::from_secs(2), 0.5, Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(2));
    }
}
