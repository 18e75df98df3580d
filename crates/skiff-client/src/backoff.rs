//! Reconnect pacing.

use std::time::Duration;

/// Delay between attempts while failures are few.
pub const BASE_DELAY: Duration = Duration::from_millis(200);

/// Delay once failures keep piling up.
pub const ESCALATED_DELAY: Duration = Duration::from_secs(2);

/// Consecutive failures after which [`ESCALATED_DELAY`] applies.
pub const ESCALATE_AFTER: u32 = 5;

/// After the first few failures, only every this many is logged.
pub const LOG_EVERY: u32 = 50;

/// Consecutive failure counter driving reconnect delays and log throttling.
#[derive(Debug, Default, Clone)]
pub struct Backoff {
    failures: u32,
}

impl Backoff {
    /// A counter with no failures.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Consecutive failures so far.
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn fail(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.delay()
    }

    /// Delay for the current failure count.
    #[must_use]
    pub fn delay(&self) -> Duration {
        if self.failures > ESCALATE_AFTER {
            ESCALATED_DELAY
        } else {
            BASE_DELAY
        }
    }

    /// Whether the latest failure should be logged.
    #[must_use]
    pub fn should_log(&self) -> bool {
        self.failures <= ESCALATE_AFTER || self.failures % LOG_EVERY == 0
    }

    /// Forget past failures after a success.
    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_escalates() {
        let mut backoff = Backoff::new();
        for _ in 0..ESCALATE_AFTER {
            assert_eq!(backoff.fail(), BASE_DELAY);
        }
        assert_eq!(backoff.fail(), ESCALATED_DELAY);
        assert_eq!(backoff.fail(), ESCALATED_DELAY);

        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.fail(), BASE_DELAY);
    }

    #[test]
    fn test_log_throttling() {
        let mut backoff = Backoff::new();
        let logged: Vec<u32> = (0..200)
            .filter_map(|_| {
                backoff.fail();
                backoff.should_log().then_some(backoff.failures())
            })
            .collect();
        assert_eq!(logged, vec![1, 2, 3, 4, 5, 50, 100, 150, 200]);
    }
}
