use std::time::Duration;

/// Exponential reconnect schedule: `base * 2^attempt`, capped at
/// `max_delay`, for at most `max_attempts` consecutive failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (zero based), or `None`
    /// once the attempts are used up.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        Some(self.base.saturating_mul(factor).min(self.max_delay))
    }
}

/// Lets the first `burst` consecutive failures through and swallows the
/// rest until a success resets the streak.
#[derive(Debug, Clone)]
pub struct ErrorIndicator {
    burst: usize,
    streak: usize,
}

impl ErrorIndicator {
    pub fn new(burst: usize) -> Self {
        Self { burst, streak: 0 }
    }

    /// Returns whether this failure should be shown.
    pub fn record_failure(&mut self) -> bool {
        self.streak = self.streak.saturating_add(1);
        self.streak <= self.burst
    }

    pub fn record_success(&mut self) {
        self.streak = 0;
    }

    pub fn streak(&self) -> usize {
        self.streak
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_until_capped_then_stop() {
        let policy = ReconnectPolicy {
            base: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            max_attempts: 5,
        };
        let delays: Vec<_> = (0..6).map(|attempt| policy.delay(attempt)).collect();
        assert_eq!(
            delays,
            vec![
                Some(Duration::from_millis(100)),
                Some(Duration::from_millis(200)),
                Some(Duration::from_millis(400)),
                Some(Duration::from_millis(500)),
                Some(Duration::from_millis(500)),
                None,
            ]
        );
    }

    #[test]
    fn huge_attempt_numbers_saturate() {
        let policy = ReconnectPolicy {
            max_attempts: u32::MAX,
            ..ReconnectPolicy::default()
        };
        assert_eq!(policy.delay(40), Some(policy.max_delay));
    }

    #[test]
    fn indicator_surfaces_burst_then_suppresses_until_success() {
        let mut indicator = ErrorIndicator::new(2);
        assert!(indicator.record_failure());
        assert!(indicator.record_failure());
        assert!(!indicator.record_failure());
        assert!(!indicator.record_failure());
        assert_eq!(indicator.streak(), 4);

        indicator.record_success();
        assert!(indicator.record_failure());
    }
}
