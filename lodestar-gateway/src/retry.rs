//! Retry policy for forwarding attempts.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy between attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffStrategy {
    /// Retry immediately.
    None,
    /// Same delay before every retry.
    Constant(Duration),
    /// Delay grows by a fixed step per retry.
    Linear { delay: Duration, max: Duration },
    /// Delay multiplies per retry.
    Exponential {
        initial: Duration,
        max: Duration,
        multiplier: f64,
    },
}

impl BackoffStrategy {
    /// Delay before retry number `retry` (0-indexed).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        match self {
            Self::None => Duration::ZERO,
            Self::Constant(d) => *d,
            Self::Linear { delay, max } => delay.saturating_mul(retry + 1).min(*max),
            Self::Exponential {
                initial,
                max,
                multiplier,
            } => {
                let factor = multiplier.powi(retry as i32);
                let millis = (initial.as_millis() as f64 * factor) as u64;
                Duration::from_millis(millis).min(*max)
            }
        }
    }
}

/// Serializable form of [`BackoffStrategy`] with millisecond fields.
///
/// ```toml
/// backoff = { type = "exponential", initial_ms = 50, max_ms = 1000, multiplier = 2.0 }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffConfig {
    #[default]
    None,
    Constant {
        delay_ms: u64,
    },
    Linear {
        delay_ms: u64,
        max_ms: u64,
    },
    Exponential {
        initial_ms: u64,
        max_ms: u64,
        #[serde(default = "default_multiplier")]
        multiplier: f64,
    },
}

fn default_multiplier() -> f64 {
    2.0
}

impl From<&BackoffConfig> for BackoffStrategy {
    fn from(config: &BackoffConfig) -> Self {
        match *config {
            BackoffConfig::None => Self::None,
            BackoffConfig::Constant { delay_ms } => Self::Constant(Duration::from_millis(delay_ms)),
            BackoffConfig::Linear { delay_ms, max_ms } => Self::Linear {
                delay: Duration::from_millis(delay_ms),
                max: Duration::from_millis(max_ms),
            },
            BackoffConfig::Exponential {
                initial_ms,
                max_ms,
                multiplier,
            } => Self::Exponential {
                initial: Duration::from_millis(initial_ms),
                max: Duration::from_millis(max_ms),
                multiplier,
            },
        }
    }
}

/// How often and how patiently a request is forwarded.
///
/// Only connection failures and attempt timeouts are retried; any response
/// from an instance, whatever its status, is final.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Extra attempts after the first.
    pub max_retries: u32,
    /// Bound on each individual attempt.
    pub attempt_timeout: Duration,
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            attempt_timeout: Duration::from_secs(3),
            backoff: BackoffStrategy::None,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, attempt_timeout: Duration) -> Self {
        Self {
            max_retries,
            attempt_timeout,
            backoff: BackoffStrategy::None,
        }
    }

    /// A single attempt with no retries.
    pub fn no_retry(attempt_timeout: Duration) -> Self {
        Self::new(0, attempt_timeout)
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Total attempts allowed.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Whether another attempt may follow attempt number `attempts` (1-indexed).
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts()
    }

    /// Delay before the attempt that follows `attempts` completed attempts.
    pub fn delay_before(&self, attempts: u32) -> Duration {
        self.backoff.delay_for_retry(attempts.saturating_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_budget() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 3);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));

        let once = RetryPolicy::no_retry(Duration::from_millis(100));
        assert!(!once.should_retry(1));
    }

    #[test]
    fn test_backoff_delays() {
        let linear = BackoffStrategy::Linear {
            delay: Duration::from_millis(100),
            max: Duration::from_millis(250),
        };
        assert_eq!(linear.delay_for_retry(0), Duration::from_millis(100));
        assert_eq!(linear.delay_for_retry(1), Duration::from_millis(200));
        assert_eq!(linear.delay_for_retry(5), Duration::from_millis(250));

        let exponential = BackoffStrategy::Exponential {
            initial: Duration::from_millis(50),
            max: Duration::from_secs(1),
            multiplier: 2.0,
        };
        assert_eq!(exponential.delay_for_retry(0), Duration::from_millis(50));
        assert_eq!(exponential.delay_for_retry(2), Duration::from_millis(200));
        assert_eq!(exponential.delay_for_retry(10), Duration::from_secs(1));
    }

    #[test]
    fn test_policy_delay_uses_retry_index() {
        let policy = RetryPolicy::default()
            .with_backoff(BackoffStrategy::Constant(Duration::from_millis(20)));
        assert_eq!(policy.delay_before(1), Duration::from_millis(20));
        assert_eq!(RetryPolicy::default().delay_before(1), Duration::ZERO);
    }

    #[test]
    fn test_backoff_config_from_json() {
        let config: BackoffConfig = serde_json::from_str(
            r#"{"type": "exponential", "initial_ms": 50, "max_ms": 1000}"#,
        )
        .unwrap();
        assert_eq!(
            BackoffStrategy::from(&config),
            BackoffStrategy::Exponential {
                initial: Duration::from_millis(50),
                max: Duration::from_secs(1),
                multiplier: 2.0,
            }
        );
        assert_eq!(BackoffConfig::default(), BackoffConfig::None);
    }
}
