//! Backoff policy for restarting a failed source

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use tracing::debug;

/// Upper bound on configured restarts
const MAX_RETRY_ATTEMPTS: u32 = 1000;
/// Upper bound on any configured backoff
const MAX_BACKOFF_SECONDS: u64 = 3600;
/// Upper bound on the growth factor
const MAX_MULTIPLIER: f64 = 100.0;

fn validate_max_retries<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<u32>::deserialize(deserializer)?;
    if let Some(v) = value {
        if v > MAX_RETRY_ATTEMPTS {
            return Err(serde::de::Error::custom(format!(
                "max_retries {} exceeds maximum allowed value {}",
                v, MAX_RETRY_ATTEMPTS
            )));
        }
    }
    Ok(value)
}

fn validate_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let duration = Duration::deserialize(deserializer)?;
    if duration.as_secs() > MAX_BACKOFF_SECONDS {
        return Err(serde::de::Error::custom(format!(
            "duration {:?} exceeds maximum allowed {} seconds",
            duration, MAX_BACKOFF_SECONDS
        )));
    }
    Ok(duration)
}

fn validate_multiplier<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if !value.is_finite() || !(1.0..=MAX_MULTIPLIER).contains(&value) {
        return Err(serde::de::Error::custom(format!(
            "multiplier {} must be finite and between 1.0 and {}",
            value, MAX_MULTIPLIER
        )));
    }
    Ok(value)
}

fn validate_random_factor<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(serde::de::Error::custom(format!(
            "random_factor {} must be finite and between 0.0 and 1.0",
            value
        )));
    }
    Ok(value)
}

/// Exponential backoff between source restarts
///
/// The n-th restart waits `min_backoff * multiplier^(n-1)`, capped at
/// `max_backoff`, plus up to `random_factor` of that as jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Restarts allowed before giving up; `None` restarts forever
    #[serde(deserialize_with = "validate_max_retries")]
    pub max_retries: Option<u32>,
    /// Backoff before the first restart
    #[serde(deserialize_with = "validate_duration")]
    pub min_backoff: Duration,
    /// Backoff ceiling
    #[serde(deserialize_with = "validate_duration")]
    pub max_backoff: Duration,
    /// Growth per consecutive failure
    #[serde(deserialize_with = "validate_multiplier")]
    pub multiplier: f64,
    /// Jitter as a fraction of the backoff
    #[serde(deserialize_with = "validate_random_factor")]
    pub random_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: None,
            min_backoff: Duration::from_secs(3),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            random_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Exponential policy without jitter
    pub fn exponential(max_retries: Option<u32>, min_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries,
            min_backoff,
            max_backoff,
            multiplier: 2.0,
            random_factor: 0.0,
        }
    }

    /// Same delay before every restart
    pub fn fixed(max_retries: Option<u32>, backoff: Duration) -> Self {
        Self {
            max_retries,
            min_backoff: backoff,
            max_backoff: backoff,
            multiplier: 1.0,
            random_factor: 0.0,
        }
    }

    /// Never restart
    pub fn no_retry() -> Self {
        Self {
            max_retries: Some(0),
            ..Default::default()
        }
    }

    /// Delay before restart number `attempt` (1-based); zero for attempt 0
    pub fn next_backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let min = self.min_backoff.as_secs_f64();
        let max = self.max_backoff.as_secs_f64();
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let growth = self.multiplier.powi(exponent);
        let base = if growth.is_finite() {
            (min * growth).min(max)
        } else {
            max
        };

        let jitter = if self.random_factor > 0.0 {
            base * self.random_factor * rand::thread_rng().gen::<f64>()
        } else {
            0.0
        };
        let backoff = Duration::from_secs_f64(base + jitter);

        debug!(attempt, ?backoff, "Calculated restart backoff");
        backoff
    }

    /// Whether restart number `attempt` is still allowed
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_retries.map_or(true, |max| attempt <= max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_matches_restart_settings() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.min_backoff, Duration::from_secs(3));
        assert_eq!(policy.max_backoff, Duration::from_secs(30));
        assert_eq!(policy.random_factor, 0.2);
        assert!(policy.should_retry(10_000));
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = RetryPolicy::exponential(None, Duration::from_secs(3), Duration::from_secs(30));

        assert_eq!(policy.next_backoff(0), Duration::ZERO);
        assert_eq!(policy.next_backoff(1), Duration::from_secs(3));
        assert_eq!(policy.next_backoff(2), Duration::from_secs(6));
        assert_eq!(policy.next_backoff(3), Duration::from_secs(12));
        assert_eq!(policy.next_backoff(5), Duration::from_secs(30));
        assert_eq!(policy.next_backoff(500), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_within_factor() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let backoff = policy.next_backoff(1);
            assert!(backoff >= Duration::from_secs(3));
            assert!(backoff <= Duration::from_secs_f64(3.6));
        }
    }

    #[test]
    fn test_should_retry_with_limit() {
        let policy = RetryPolicy::fixed(Some(2), Duration::from_millis(10));
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::no_retry().should_retry(1));
    }

    #[test]
    fn test_deserialize_validation() {
        let valid = r#"{"max_retries": 5, "min_backoff": {"secs": 1, "nanos": 0}}"#;
        let policy: RetryPolicy = serde_json::from_str(valid).unwrap();
        assert_eq!(policy.max_retries, Some(5));
        assert_eq!(policy.min_backoff, Duration::from_secs(1));
        assert_eq!(policy.max_backoff, Duration::from_secs(30));

        let too_many = r#"{"max_retries": 10000}"#;
        assert!(serde_json::from_str::<RetryPolicy>(too_many).is_err());

        let too_long = r#"{"max_backoff": {"secs": 7200, "nanos": 0}}"#;
        assert!(serde_json::from_str::<RetryPolicy>(too_long).is_err());

        let shrinking = r#"{"multiplier": 0.5}"#;
        assert!(serde_json::from_str::<RetryPolicy>(shrinking).is_err());

        let jitter = r#"{"random_factor": 1.5}"#;
        assert!(serde_json::from_str::<RetryPolicy>(jitter).is_err());
    }
}
