//! Retry and backoff policy values.
//!
//! Two levels of delay exist: [`RetryDelay`] spaces out retries of a single
//! library pass inside a session, and [`DelayIntervals`] spaces out whole
//! sessions after terminal failures.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default cap on attempts for one library pass.
pub const MAX_ATTEMPTS_COUNT: u32 = 10;

/// How long to wait before a retry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum RetryDelay {
    /// The same delay for every attempt.
    Constant { seconds: f64 },
    /// `initial * multiplier^(attempt - 1)`, capped at `max_delay`.
    #[serde(rename_all = "camelCase")]
    Progressive {
        initial: f64,
        multiplier: f64,
        max_delay: f64,
    },
}

impl RetryDelay {
    /// Per-request retry delay used for transport failures.
    pub const RETRY: RetryDelay = RetryDelay::Progressive {
        initial: 2.5,
        multiplier: 2.0,
        max_delay: 3600.0,
    };

    /// Delay in seconds before attempt number `attempt` (1-based).
    pub fn seconds(&self, attempt: u32) -> f64 {
        match *self {
            RetryDelay::Constant { seconds } => seconds,
            RetryDelay::Progressive {
                initial,
                multiplier,
                max_delay,
            } => {
                if attempt <= 1 {
                    return initial.min(max_delay);
                }
                let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                (initial * multiplier.powi(exponent)).min(max_delay)
            }
        }
    }

    /// [`RetryDelay::seconds`] as a `Duration`.
    pub fn delay(&self, attempt: u32) -> Duration {
        seconds_to_duration(self.seconds(attempt))
    }
}

impl Default for RetryDelay {
    fn default() -> Self {
        Self::RETRY
    }
}

fn seconds_to_duration(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds.max(0.0)).unwrap_or(Duration::MAX)
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay policy between attempts.
    pub delay: RetryDelay,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl RetryConfig {
    /// Create a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            delay: RetryDelay::RETRY,
            jitter: false,
        }
    }

    /// Set the delay policy.
    pub fn with_delay(mut self, delay: RetryDelay) -> Self {
        self.delay = delay;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether another attempt is allowed after `failures` failed attempts.
    pub fn allows_retry(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }

    /// Delay after the `attempt`-th failure.
    ///
    /// A server supplied `retry_after` replaces the configured policy.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<f64>) -> Duration {
        let policy = match retry_after {
            Some(seconds) => RetryDelay::Constant { seconds },
            None => self.delay,
        };
        let seconds = policy.seconds(attempt);

        let seconds = if self.jitter && retry_after.is_none() {
            // +/- 25%
            seconds * (0.75 + rand::random::<f64>() * 0.5)
        } else {
            seconds
        };

        seconds_to_duration(seconds)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(MAX_ATTEMPTS_COUNT)
    }
}

/// Escalating wait tables.
pub struct DelayIntervals;

impl DelayIntervals {
    /// Waits before a new session may start after consecutive failed sessions.
    ///
    /// 30 min, 1 h, 4 h, then 16 h seven times, then 64 h.
    pub fn sync() -> Vec<Duration> {
        let hour = 3600;
        let mut intervals = vec![
            Duration::from_secs(30 * 60),
            Duration::from_secs(hour),
            Duration::from_secs(4 * hour),
        ];
        intervals.extend(std::iter::repeat(Duration::from_secs(16 * hour)).take(7));
        intervals.push(Duration::from_secs(64 * hour));
        intervals
    }

    /// Waits before re-downloading after successive library version conflicts.
    pub fn conflict() -> Vec<Duration> {
        [0, 10, 20, 40, 60]
            .into_iter()
            .map(Duration::from_secs)
            .collect()
    }

    /// Entry `index` of `intervals`, clamped to the last one.
    pub fn clamped(intervals: &[Duration], index: usize) -> Option<Duration> {
        intervals
            .get(index)
            .or_else(|| intervals.last())
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progressive_delay_values() {
        let delay = RetryDelay::Progressive {
            initial: 2.5,
            multiplier: 2.0,
            max_delay: 3600.0,
        };
        assert_eq!(delay.seconds(1), 2.5);
        assert_eq!(delay.seconds(2), 5.0);
        assert_eq!(delay.seconds(5), 40.0);
        assert_eq!(delay.seconds(20), 3600.0);
        assert_eq!(delay.delay(2), Duration::from_secs(5));
    }

    #[test]
    fn test_constant_delay() {
        let delay = RetryDelay::Constant { seconds: 7.0 };
        assert_eq!(delay.seconds(1), 7.0);
        assert_eq!(delay.seconds(9), 7.0);
    }

    #[test]
    fn test_delay_never_overflows() {
        assert_eq!(RetryDelay::RETRY.seconds(u32::MAX), 3600.0);
        let unbounded = RetryDelay::Progressive {
            initial: 1.0,
            multiplier: 10.0,
            max_delay: f64::INFINITY,
        };
        assert_eq!(unbounded.delay(400), Duration::MAX);
    }

    #[test]
    fn test_retry_after_overrides_policy() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for(6, Some(1.5)), Duration::from_millis(1500));
        assert_eq!(config.delay_for(1, None), Duration::from_millis(2500));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let config = RetryConfig::default().with_jitter(true);
        for _ in 0..50 {
            let delay = config.delay_for(2, None);
            assert!(delay >= Duration::from_millis(3750));
            assert!(delay <= Duration::from_millis(6250));
        }
    }

    #[test]
    fn test_attempt_cap() {
        let config = RetryConfig::new(10);
        assert!(config.allows_retry(3));
        assert!(config.allows_retry(9));
        assert!(!config.allows_retry(10));
    }

    #[test]
    fn test_sync_intervals() {
        let intervals = DelayIntervals::sync();
        assert_eq!(intervals.len(), 11);
        assert_eq!(intervals[0], Duration::from_secs(1800));
        assert_eq!(intervals[3], Duration::from_secs(16 * 3600));
        assert_eq!(intervals[9], Duration::from_secs(16 * 3600));
        assert_eq!(intervals[10], Duration::from_secs(64 * 3600));
        assert_eq!(
            DelayIntervals::clamped(&intervals, 40),
            Some(Duration::from_secs(64 * 3600))
        );
        assert_eq!(DelayIntervals::clamped(&[], 0), None);
    }
}
