//! LLM error types with retry classification.
//!
//! Distinguishes between rate limiting (retry with backoff), unavailability
//! (bounded retry) and invalid requests (fatal for that call).

use std::time::Duration;

use crate::retry::{RetryClass, Retryable};

/// Error from LLM API calls.
#[derive(Debug, Clone)]
pub struct LlmError {
    /// The kind of error
    pub kind: LlmErrorKind,
    /// HTTP status code, if applicable
    pub status_code: Option<u16>,
    /// Error message
    pub message: String,
    /// Suggested retry delay (from Retry-After header)
    pub retry_after: Option<Duration>,
}

impl LlmError {
    /// Create a rate limit error.
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            kind: LlmErrorKind::RateLimited,
            status_code: Some(429),
            message: message.into(),
            retry_after,
        }
    }

    /// Create an error for a request the provider rejected (bad request, auth, unknown model).
    pub fn invalid_request(status_code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            kind: LlmErrorKind::InvalidRequest,
            status_code,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Create an error for a provider that is down or unreachable.
    pub fn unavailable(status_code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            kind: LlmErrorKind::Unavailable,
            status_code,
            message: message.into(),
            retry_after: None,
        }
    }
}

impl std::fmt::Display for LlmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} (HTTP {}): {}", self.kind, code, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for LlmError {}

impl Retryable for LlmError {
    fn retry_class(&self) -> RetryClass {
        match self.kind {
            LlmErrorKind::RateLimited => RetryClass::RateLimited,
            LlmErrorKind::Unavailable => RetryClass::Transient,
            LlmErrorKind::InvalidRequest => RetryClass::Fatal,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}

/// Classification of LLM errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    /// Rate limited (429) - retry with backoff
    RateLimited,
    /// Client error (400, 401, 403, 404) or unparseable reply - fatal for this call
    InvalidRequest,
    /// Server error (5xx) or network failure - bounded retry, then fatal
    Unavailable,
}

impl std::fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmErrorKind::RateLimited => write!(f, "Rate limited"),
            LlmErrorKind::InvalidRequest => write!(f, "Invalid request"),
            LlmErrorKind::Unavailable => write!(f, "Unavailable"),
        }
    }
}

/// Parse HTTP status code into error kind.
pub fn classify_http_status(status: u16) -> LlmErrorKind {
    match status {
        429 => LlmErrorKind::RateLimited,
        408 => LlmErrorKind::Unavailable,
        400..=499 => LlmErrorKind::InvalidRequest,
        _ => LlmErrorKind::Unavailable,
    }
}
