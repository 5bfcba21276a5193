//! Delay policy between whole-transaction attempts.

use std::time::Duration;

/// Decides how long to wait after a failed attempt.
pub trait Backoff: Send + Sync {
    /// Delay after attempt number `attempt` (1-based) failed.
    fn delay(&self, attempt: u32) -> Duration;
}

/// The same delay after every failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBackoff {
    delay: Duration,
}

impl FixedBackoff {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// No waiting; used in tests.
    pub fn none() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl Default for FixedBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl Backoff for FixedBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_backoff_ignores_attempt() {
        let backoff = FixedBackoff::new(Duration::from_millis(250));
        assert_eq!(backoff.delay(1), Duration::from_millis(250));
        assert_eq!(backoff.delay(7), Duration::from_millis(250));
    }

    #[test]
    fn test_default_backoff_is_five_seconds() {
        assert_eq!(FixedBackoff::default().delay(1), Duration::from_secs(5));
        assert_eq!(FixedBackoff::none().delay(1), Duration::ZERO);
    }
}
