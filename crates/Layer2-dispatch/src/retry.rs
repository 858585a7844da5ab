//! Retry policy with exponential backoff for failed message checks

use corral_foundation::RetrySettings;
use rand::Rng;
use std::time::Duration;

/// What to do after a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after `delay`; `attempt` is 1-based
    Retry { attempt: u32, delay: Duration },
    /// Ceiling reached; counter should be reset
    Exhausted { attempts: u32 },
}

/// Backoff policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_retries: u32,

    /// Delay before the first retry (milliseconds)
    pub initial_delay_ms: u64,

    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,

    /// Maximum delay between retries (milliseconds)
    pub max_delay_ms: u64,

    /// Spread delays by ±20%
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_delay_ms: settings.initial_delay_ms,
            backoff_multiplier: settings.backoff_multiplier,
            max_delay_ms: settings.max_delay_ms,
            jitter: settings.jitter,
        }
    }
}

impl RetryPolicy {
    /// Policy that gives up on the first failure
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped_delay = base_delay.min(self.max_delay_ms as f64);

        let final_delay = if self.jitter {
            capped_delay * rand::thread_rng().gen_range(0.8..=1.2)
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay.max(0.0) as u64)
    }

    /// Decide after the `failures`-th consecutive failure
    pub fn decide(&self, failures: u32) -> RetryDecision {
        if failures > self.max_retries {
            RetryDecision::Exhausted { attempts: failures }
        } else {
            RetryDecision::Retry {
                attempt: failures,
                delay: self.delay_for_attempt(failures),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 5,
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 10_000,
            jitter: false,
        }
    }

    #[test]
    fn test_exponential_delays() {
        let policy = policy();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(8000));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(10_000));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = RetryPolicy {
            jitter: true,
            ..policy()
        };
        for _ in 0..50 {
            let ms = policy.delay_for_attempt(2).as_millis();
            assert!((1600..=2400).contains(&ms), "{} out of band", ms);
        }
    }

    #[test]
    fn test_decide() {
        let policy = policy();
        assert_eq!(
            policy.decide(1),
            RetryDecision::Retry {
                attempt: 1,
                delay: Duration::from_millis(1000)
            }
        );
        assert!(matches!(policy.decide(5), RetryDecision::Retry { .. }));
        assert_eq!(policy.decide(6), RetryDecision::Exhausted { attempts: 6 });
        assert_eq!(
            RetryPolicy::no_retry().decide(1),
            RetryDecision::Exhausted { attempts: 1 }
        );
    }
}
