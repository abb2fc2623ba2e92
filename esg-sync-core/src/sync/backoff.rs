//! Exponential reconnect backoff.

use std::time::Duration;

/// Delay unit for the first reconnect attempt.
pub const BASE_DELAY: Duration = Duration::from_millis(1000);
/// Upper bound for any single delay.
pub const MAX_DELAY: Duration = Duration::from_millis(30_000);
/// Consecutive failures tolerated before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Tracks consecutive reconnect failures.
///
/// The delay before attempt `n` is `min(base * 2^n, max)`, so with the
/// defaults five consecutive failures wait 2s, 4s, 8s, 16s and 30s.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts,
            attempt: 0,
        }
    }

    /// Delay for a given attempt number, without changing state.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Records a failure and returns how long to wait before the next attempt.
    ///
    /// Returns `None` once `max_attempts` consecutive attempts have been used up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        self.attempt += 1;
        Some(self.delay_for(self.attempt))
    }

    /// Clears the failure count after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BASE_DELAY, MAX_DELAY, DEFAULT_MAX_ATTEMPTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_five_failures_sequence() {
        let mut backoff = Backoff::default();

        let delays: Vec<u128> = std::iter::from_fn(|| backoff.next_delay())
            .map(|d| d.as_millis())
            .collect();

        assert_eq!(delays, vec![2000, 4000, 8000, 16000, 30000]);
        assert_eq!(backoff.attempt(), 5);
        assert!(backoff.next_delay().is_none());
    }

    #[test]
    fn test_reset_starts_over() {
        let mut backoff = Backoff::default();
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_delay_is_capped() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay_for(0), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(5), MAX_DELAY);
        assert_eq!(backoff.delay_for(40), MAX_DELAY);
    }

    #[test]
    fn test_zero_attempts_never_retries() {
        let mut backoff = Backoff::new(BASE_DELAY, MAX_DELAY, 0);
        assert!(backoff.next_delay().is_none());
    }
}
