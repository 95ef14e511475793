//! Gateway error taxonomy.
//!
//! Every failure is classified once, at the transport boundary. Callers
//! above the gateway only ask two questions: is it worth another attempt
//! ([`LlmError::is_transient`]), and is the model unreachable altogether
//! ([`LlmError::is_unavailable`]).

use std::time::Duration;

/// Classification of gateway errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LlmErrorKind {
    /// 429
    RateLimited,
    /// 5xx
    ServerError,
    /// Other 4xx: bad request, auth, unknown model
    ClientError,
    /// Connection refused, reset or timed out
    NetworkError,
    /// Unusable response body
    ParseError,
    /// Prompt larger than the model's context window
    ContextExceeded,
    /// No model reachable (missing provider, permanent outage)
    ModelUnavailable,
}

impl LlmErrorKind {
    /// Kind for a non-success HTTP status.
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => LlmErrorKind::RateLimited,
            413 => LlmErrorKind::ContextExceeded,
            400..=499 => LlmErrorKind::ClientError,
            _ => LlmErrorKind::ServerError,
        }
    }

    /// Worth retrying against the same model.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmErrorKind::RateLimited | LlmErrorKind::ServerError | LlmErrorKind::NetworkError
        )
    }

    /// The model could not answer at all.
    pub fn is_unavailable(&self) -> bool {
        self.is_transient() || *self == LlmErrorKind::ModelUnavailable
    }

    fn label(&self) -> &'static str {
        match self {
            LlmErrorKind::RateLimited => "rate limited",
            LlmErrorKind::ServerError => "server error",
            LlmErrorKind::ClientError => "client error",
            LlmErrorKind::NetworkError => "network error",
            LlmErrorKind::ParseError => "unparseable response",
            LlmErrorKind::ContextExceeded => "context exceeded",
            LlmErrorKind::ModelUnavailable => "model unavailable",
        }
    }
}

impl std::fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Error from a model gateway call.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}{}: {message}", status_suffix(.status_code))]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub status_code: Option<u16>,
    pub message: String,
    /// Provider hint from a `Retry-After` header.
    pub retry_after: Option<Duration>,
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default()
}

impl LlmError {
    pub fn new(kind: LlmErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status_code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Classify a failed HTTP exchange.
    pub fn from_http(status: u16, body: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::from_status(status), body).with_status(status)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    pub fn with_retry_after(mut self, delay: Option<Duration>) -> Self {
        self.retry_after = delay;
        self
    }

    pub fn rate_limited(message: String, retry_after: Option<Duration>) -> Self {
        Self::new(LlmErrorKind::RateLimited, message)
            .with_status(429)
            .with_retry_after(retry_after)
    }

    pub fn server_error(status_code: u16, message: String) -> Self {
        Self::new(LlmErrorKind::ServerError, message).with_status(status_code)
    }

    pub fn client_error(status_code: u16, message: String) -> Self {
        Self::new(LlmErrorKind::ClientError, message).with_status(status_code)
    }

    pub fn network_error(message: String) -> Self {
        Self::new(LlmErrorKind::NetworkError, message)
    }

    pub fn parse_error(message: String) -> Self {
        Self::new(LlmErrorKind::ParseError, message)
    }

    pub fn context_exceeded(message: String) -> Self {
        Self::new(LlmErrorKind::ContextExceeded, message)
    }

    pub fn model_unavailable(message: String) -> Self {
        Self::new(LlmErrorKind::ModelUnavailable, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    pub fn is_unavailable(&self) -> bool {
        self.kind.is_unavailable()
    }
}

/// Retry of transient failures inside one gateway call.
///
/// This sits below the scheduler's own per-subtask retries: it only smooths
/// over rate limits and flaky connections within a single `complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportRetry {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Give up once this much time has passed since the first attempt.
    pub deadline: Duration,
}

impl Default for TransportRetry {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            deadline: Duration::from_secs(120),
        }
    }
}

impl TransportRetry {
    /// No transport retries.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based), or `None` to give up.
    ///
    /// # Postconditions
    /// - `None` for non-transient errors and once `max_retries` is reached
    /// - Otherwise `min(max_delay, max(retry_after, base * 2^retry))`
    pub fn delay(&self, retry: u32, error: &LlmError) -> Option<Duration> {
        if !error.is_transient() || retry >= self.max_retries {
            return None;
        }
        let exponential = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(retry.min(16)));
        let hinted = error.retry_after.unwrap_or_default();
        Some(exponential.max(hinted).min(self.max_delay))
    }
}
