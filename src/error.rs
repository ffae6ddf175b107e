//! Error types for LLM calls, the document store and the pipeline as a whole.
//!
//! Item-level failures are never fatal: the batch scheduler captures a
//! [`PipelineError`] in the failing item's result slot and keeps going. The
//! [`ErrorKind`] classification decides whether the retry wrapper tries again.

use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use thiserror::Error;

/// Matches provider messages that signal quota exhaustion.
static RATE_LIMIT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(rate[ _-]?limit|too many requests|quota|\b429\b)")
        .expect("rate limit pattern is valid")
});

/// Coarse classification used by the retry wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Quota exhausted; retry after a backoff.
    RateLimited,
    /// Timeouts, dropped connections, 5xx responses.
    Transient,
    /// Bad payload, parse or validation failure. Never retried.
    Permanent,
}

/// Errors raised by an LLM completion call.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LlmError {
    /// Build an API error from a status code and body, promoting quota
    /// failures to [`LlmError::RateLimited`].
    pub fn from_status(status: u16, message: String) -> Self {
        if status == 429 || looks_rate_limited(&message) {
            LlmError::RateLimited(message)
        } else {
            LlmError::Api { status, message }
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            LlmError::RateLimited(_) => ErrorKind::RateLimited,
            LlmError::Api { status, .. } if *status >= 500 => ErrorKind::Transient,
            LlmError::Api { .. } => ErrorKind::Permanent,
            LlmError::Network(_) | LlmError::Timeout(_) => ErrorKind::Transient,
            LlmError::InvalidResponse(_) | LlmError::Json(_) => ErrorKind::Permanent,
        }
    }
}

/// Whether a provider message reads like a quota / rate-limit rejection.
pub fn looks_rate_limited(message: &str) -> bool {
    RATE_LIMIT_PATTERN.is_match(message)
}

/// Errors raised by the document store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Write batch holds {0} operations, limit is {1}")]
    BatchTooLarge(usize, usize),
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// An item-level failure captured by the batch scheduler.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Could not parse model output: {0}")]
    Parse(String),

    #[error("Validation failed: {0}")]
    Validation(String),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Llm(e) => e.kind(),
            PipelineError::Store(StoreError::Io(_)) => ErrorKind::Transient,
            PipelineError::Store(_) => ErrorKind::Permanent,
            PipelineError::Parse(_) | PipelineError::Validation(_) => ErrorKind::Permanent,
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        self.kind() == ErrorKind::RateLimited
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_429_is_rate_limited() {
        let err = LlmError::from_status(429, "slow down".to_string());
        assert_eq!(err.kind(), ErrorKind::RateLimited);
    }

    #[test]
    fn test_rate_limit_message_is_rate_limited() {
        let err = LlmError::from_status(400, "Rate limit reached for gpt-4o-mini".to_string());
        assert_eq!(err.kind(), ErrorKind::RateLimited);

        let err = LlmError::from_status(403, "You exceeded your current quota".to_string());
        assert_eq!(err.kind(), ErrorKind::RateLimited);
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(
            LlmError::from_status(503, "overloaded".to_string()).kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            LlmError::from_status(400, "bad request".to_string()).kind(),
            ErrorKind::Permanent
        );
        assert_eq!(
            LlmError::Timeout(Duration::from_secs(30)).kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            LlmError::InvalidResponse("empty".to_string()).kind(),
            ErrorKind::Permanent
        );
    }

    #[test]
    fn test_looks_rate_limited() {
        assert!(looks_rate_limited("Error code: 429"));
        assert!(looks_rate_limited("rate_limit_exceeded"));
        assert!(looks_rate_limited("Too Many Requests"));
        assert!(!looks_rate_limited("invalid JSON schema"));
        assert!(!looks_rate_limited("port 4290 unreachable"));
    }

    #[test]
    fn test_pipeline_error_kind() {
        let err = PipelineError::from(LlmError::RateLimited("429".to_string()));
        assert!(err.is_rate_limit());

        let err = PipelineError::Parse("missing field".to_string());
        assert_eq!(err.kind(), ErrorKind::Permanent);
        assert!(!err.is_rate_limit());
    }
}
