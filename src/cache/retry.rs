//! Retry and backoff decisions for fetches.
//!
//! Mutations never go through this policy: a failed commit is rolled back
//! and surfaced, and only an explicit re-invocation tries again.

use serde::Deserialize;
use std::time::Duration;

use super::error::{CacheError, ErrorClass};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
  Retry(Duration),
  GiveUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
  /// Number of retries after the first attempt
  pub max_attempts: u32,
  #[serde(rename = "base_delay_ms", deserialize_with = "deserialize_millis")]
  pub base_delay: Duration,
  #[serde(rename = "max_delay_ms", deserialize_with = "deserialize_millis")]
  pub max_delay: Duration,
}

fn deserialize_millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let ms = u64::deserialize(deserializer)?;
  Ok(Duration::from_millis(ms))
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay: Duration::from_secs(1),
      max_delay: Duration::from_secs(30),
    }
  }
}

impl RetryPolicy {
  /// A policy that never retries.
  pub fn never() -> Self {
    Self {
      max_attempts: 0,
      ..Self::default()
    }
  }

  /// Whether the fetch that just failed with `error` on its `attempt`-th
  /// retry slot (0 for the first failure) should run again.
  pub fn should_retry(&self, error: &CacheError, attempt: u32) -> bool {
    match error.class() {
      ErrorClass::Authentication | ErrorClass::Permanent => false,
      ErrorClass::Transient => attempt < self.max_attempts,
    }
  }

  /// `base * 2^attempt`, capped at `max_delay`.
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    self
      .base_delay
      .checked_mul(factor)
      .map(|d| d.min(self.max_delay))
      .unwrap_or(self.max_delay)
  }

  pub fn decide(&self, error: &CacheError, attempt: u32) -> RetryDecision {
    if self.should_retry(error, attempt) {
      RetryDecision::Retry(self.delay_for(attempt))
    } else {
      RetryDecision::GiveUp
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_transient_retries_up_to_ceiling() {
    let policy = RetryPolicy::default();
    let err = CacheError::transient("timeout");
    assert!(policy.should_retry(&err, 0));
    assert!(policy.should_retry(&err, 2));
    assert!(!policy.should_retry(&err, 3));
  }

  #[test]
  fn test_auth_and_validation_never_retry() {
    let policy = RetryPolicy::default();
    assert!(!policy.should_retry(&CacheError::authentication("expired"), 0));
    assert!(!policy.should_retry(&CacheError::validation("bad email"), 0));
    assert_eq!(
      policy.decide(&CacheError::from_status(401, "login"), 0),
      RetryDecision::GiveUp
    );
  }

  #[test]
  fn test_exponential_backoff_is_capped() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.delay_for(0), Duration::from_secs(1));
    assert_eq!(policy.delay_for(1), Duration::from_secs(2));
    assert_eq!(policy.delay_for(4), Duration::from_secs(16));
    assert_eq!(policy.delay_for(5), Duration::from_secs(30));
    assert_eq!(policy.delay_for(64), Duration::from_secs(30));
  }

  #[test]
  fn test_policy_from_yaml() {
    let policy: RetryPolicy =
      serde_yaml::from_str("max_attempts: 5\nbase_delay_ms: 200\n").unwrap();
    assert_eq!(policy.max_attempts, 5);
    assert_eq!(policy.base_delay, Duration::from_millis(200));
    assert_eq!(policy.max_delay, Duration::from_secs(30));
  }
}
