//! Retry policy and backoff computation for node attempts.
//!
//! Stateless: the engine asks [`RetryHandler::decide`] after every failed
//! attempt and either schedules another attempt after the returned backoff or
//! marks the node terminally failed.

use std::time::Duration;

use relflow_types::config::EngineConfig;

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first. Values below 1 act as 1.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Growth factor per failed attempt. Values below 1.0 act as 1.0.
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
            multiplier: config.backoff_multiplier,
        }
    }

    /// A single attempt; any failure is terminal.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// `max_attempts` attempts separated by a constant `delay`.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff: delay,
            max_backoff: delay,
            multiplier: 1.0,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

// ---------------------------------------------------------------------------
// RetryHandler
// ---------------------------------------------------------------------------

/// What to do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Start another attempt after `backoff`.
    Retry { backoff: Duration },
    /// The node opted out of automatic retry during this attempt.
    RetriesDisabled,
    /// The attempt budget is used up.
    Exhausted,
}

/// Stateless retry logic; all configuration is passed in.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether another attempt may start. `attempt` is 1-based.
    pub fn should_retry(policy: &RetryPolicy, attempt: u32, retries_disabled: bool) -> bool {
        !retries_disabled && attempt < policy.max_attempts.max(1)
    }

    pub fn decide(policy: &RetryPolicy, attempt: u32, retries_disabled: bool) -> RetryDecision {
        if retries_disabled {
            RetryDecision::RetriesDisabled
        } else if Self::should_retry(policy, attempt, false) {
            RetryDecision::Retry {
                backoff: Self::backoff_for(policy, attempt),
            }
        } else {
            RetryDecision::Exhausted
        }
    }

    /// Delay after failed attempt number `attempt`:
    /// `initial * multiplier^(attempt - 1)`, capped at `max_backoff`.
    pub fn backoff_for(policy: &RetryPolicy, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = policy.initial_backoff.as_secs_f64() * policy.multiplier.max(1.0).powi(exponent);
        let cap = policy.max_backoff;
        if !secs.is_finite() || secs >= cap.as_secs_f64() {
            cap
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_should_retry_within_budget() {
        let p = policy();
        assert!(RetryHandler::should_retry(&p, 1, false));
        assert!(RetryHandler::should_retry(&p, 2, false));
        assert!(!RetryHandler::should_retry(&p, 3, false));
    }

    #[test]
    fn test_disabled_retries_never_retry() {
        let p = policy();
        assert!(!RetryHandler::should_retry(&p, 1, true));
        assert_eq!(RetryHandler::decide(&p, 1, true), RetryDecision::RetriesDisabled);
    }

    #[test]
    fn test_decide_exhausted() {
        assert_eq!(RetryHandler::decide(&policy(), 3, false), RetryDecision::Exhausted);
        assert_eq!(
            RetryHandler::decide(&RetryPolicy::no_retry(), 1, false),
            RetryDecision::Exhausted
        );
    }

    #[test]
    fn test_zero_max_attempts_acts_as_one() {
        let p = RetryPolicy {
            max_attempts: 0,
            ..policy()
        };
        assert!(!RetryHandler::should_retry(&p, 1, false));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let p = policy();
        assert_eq!(RetryHandler::backoff_for(&p, 1), Duration::from_millis(100));
        assert_eq!(RetryHandler::backoff_for(&p, 2), Duration::from_millis(200));
        assert_eq!(RetryHandler::backoff_for(&p, 3), Duration::from_millis(350));
        assert_eq!(RetryHandler::backoff_for(&p, 500), Duration::from_millis(350));
    }

    #[test]
    fn test_fixed_policy_is_constant() {
        let p = RetryPolicy::fixed(5, Duration::from_millis(10));
        assert_eq!(RetryHandler::backoff_for(&p, 1), Duration::from_millis(10));
        assert_eq!(RetryHandler::backoff_for(&p, 4), Duration::from_millis(10));
        assert_eq!(
            RetryHandler::decide(&p, 4, false),
            RetryDecision::Retry {
                backoff: Duration::from_millis(10)
            }
        );
    }

    #[test]
    fn test_policy_from_config() {
        let config = EngineConfig {
            max_attempts: 7,
            ..EngineConfig::default()
        };
        let p = RetryPolicy::from_config(&config);
        assert_eq!(p.max_attempts, 7);
        assert_eq!(p.initial_backoff, Duration::from_secs(1));
        assert_eq!(p.max_backoff, Duration::from_secs(60));
    }
}
