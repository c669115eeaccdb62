//! Pluggable delays between conflicted attempts.

use std::fmt;
use std::time::Duration;

/// Decides how long a transaction pauses after a conflicted attempt.
///
/// The execution loop calls [`delay`](BackoffPolicy::delay) with the number
/// of attempts that have already failed and sleeps for the returned duration
/// before retrying; a zero duration yields the thread instead of sleeping.
/// Implementations must be cheap and thread-safe: one policy instance is
/// shared by every transaction of a factory.
pub trait BackoffPolicy: Send + Sync + fmt::Debug {
    /// Returns the pause before the attempt after `attempt` failures.
    fn delay(&self, attempt: u32) -> Duration;
}

/// Doubles the pause with every failed attempt, up to a ceiling.
///
/// This is the engine default: a short base keeps uncontended workloads
/// snappy while the ceiling stops a long conflict streak from putting the
/// thread to sleep for seconds.
///
/// # Examples
///
/// ```
/// use seshat::backoff::{BackoffPolicy, ExponentialBackoff};
/// use std::time::Duration;
///
/// let policy = ExponentialBackoff::new(Duration::from_micros(100), Duration::from_millis(5));
/// assert_eq!(policy.delay(1), Duration::from_micros(100));
/// assert_eq!(policy.delay(2), Duration::from_micros(200));
/// assert_eq!(policy.delay(30), Duration::from_millis(5));
/// ```
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    ceiling: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self { base, ceiling }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_micros(50),
            ceiling: Duration::from_millis(10),
        }
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        // Shifts past 2^16 are already far beyond any sane ceiling.
        let doublings = attempt.saturating_sub(1).min(16);
        self.base
            .saturating_mul(1_u32 << doublings)
            .min(self.ceiling)
    }
}

/// Never sleeps; every conflicted attempt retries after a bare yield.
///
/// Useful in tests and in latency-critical paths where the caller would
/// rather burn a core than wait out a timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackoff;

impl BackoffPolicy for NoBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_never_shrink_as_attempts_grow() {
        let policy = ExponentialBackoff::default();
        let mut last = Duration::ZERO;
        for attempt in 1..64 {
            let delay = policy.delay(attempt);
            assert!(delay >= last);
            last = delay;
        }
    }

    #[test]
    fn ceiling_caps_the_delay() {
        let policy = ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(4));
        assert_eq!(policy.delay(100), Duration::from_millis(4));
        assert_eq!(policy.delay(u32::MAX), Duration::from_millis(4));
    }

    #[test]
    fn no_backoff_is_always_zero() {
        assert_eq!(NoBackoff.delay(1), Duration::ZERO);
        assert_eq!(NoBackoff.delay(1_000), Duration::ZERO);
    }
}
