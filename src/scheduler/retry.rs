//! Subtask retry policy.
//!
//! Backoff for the delay after attempt `n` (1-based) is
//! `base * 2^(n-1)`, capped at `max`. A gateway-provided `Retry-After`
//! takes precedence when it is longer, still under the cap.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::SubtaskExecutionError;

/// How often and how patiently a subtask is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            max_retries,
            base_backoff: Duration::from_millis(base_backoff_ms),
            max_backoff: Duration::from_millis(max_backoff_ms.max(base_backoff_ms)),
        }
    }

    /// Policy with no waiting, for tests and local runs.
    pub fn immediate(max_retries: u32) -> Self {
        Self::new(max_retries, 0, 0)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Whether another attempt follows a failure of attempt `attempt`.
    pub fn should_retry(&self, attempt: u32, error: &SubtaskExecutionError) -> bool {
        attempt < self.max_attempts() && error.is_retryable()
    }

    /// Delay before the attempt following `attempt`.
    pub fn backoff(&self, attempt: u32, error: &SubtaskExecutionError) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let computed = self
            .base_backoff
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_backoff);
        let hinted = error.retry_after().unwrap_or_default();
        computed.max(hinted).min(self.max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentError;
    use crate::llm::LlmError;

    fn failure() -> SubtaskExecutionError {
        SubtaskExecutionError::Agent(AgentError::Failed("boom".into()))
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(5, 100, 350);
        assert_eq!(policy.backoff(1, &failure()), Duration::from_millis(100));
        assert_eq!(policy.backoff(2, &failure()), Duration::from_millis(200));
        assert_eq!(policy.backoff(3, &failure()), Duration::from_millis(350));
        assert_eq!(policy.backoff(40, &failure()), Duration::from_millis(350));
    }

    #[test]
    fn test_retry_after_hint_respected_under_cap() {
        let policy = RetryPolicy::new(2, 100, 1_000);
        let limited = SubtaskExecutionError::Agent(AgentError::Gateway(LlmError::rate_limited(
            "slow down".into(),
            Some(Duration::from_millis(700)),
        )));
        assert_eq!(policy.backoff(1, &limited), Duration::from_millis(700));
    }

    #[test]
    fn test_attempt_bound() {
        let policy = RetryPolicy::immediate(2);
        assert_eq!(policy.max_attempts(), 3);
        assert!(policy.should_retry(1, &failure()));
        assert!(policy.should_retry(2, &failure()));
        assert!(!policy.should_retry(3, &failure()));
    }

    #[test]
    fn test_permanent_errors_not_retried() {
        let policy = RetryPolicy::immediate(2);
        let rejected = SubtaskExecutionError::Agent(AgentError::Gateway(LlmError::client_error(
            401,
            "bad key".into(),
        )));
        assert!(!policy.should_retry(1, &rejected));
    }
}
