//! Custom error types for rustharvest.
//!
//! Every fallible operation in the library returns `Result<T, HarvestError>`.
//! Absence of data (a missing DOI, a provider without a citation count) is
//! never an error: it is encoded as `None` in the data model.

use std::time::Duration;
use thiserror::Error;

/// Main error type for rustharvest operations.
#[derive(Debug, Error)]
pub enum HarvestError {
    /// Network/HTTP request error (timeouts, connection resets, bad bodies)
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Upstream returned a 5xx status
    #[error("Server error: {code} - {message}")]
    Server {
        /// HTTP status code
        code: u16,
        /// Error message from the provider
        message: String,
    },

    /// Rate limited by external API
    #[error("Rate limited, retry after {retry_after:?}s")]
    RateLimited {
        /// Provider-suggested delay in seconds (`Retry-After` header)
        retry_after: Option<u64>,
    },

    /// External API returned a non-retryable error status
    #[error("API error: {code} - {message}")]
    Api {
        /// HTTP status code
        code: u16,
        /// Error message from API
        message: String,
    },

    /// Local parsing setup failed (patterns, selectors)
    #[error("Parse error: {0}")]
    Parse(String),

    /// Payload could not be parsed into the expected schema
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// File I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV export error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Configuration error
    #[error("Config error: {0}")]
    Config(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),
}

impl HarvestError {
    /// Whether the failure is worth another attempt.
    ///
    /// Timeouts, connection failures, 5xx responses and rate limiting are
    /// transient. Client errors and malformed payloads are not.
    pub fn is_transient(&self) -> bool {
        match self {
            HarvestError::Network(e) => {
                e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
            }
            HarvestError::Server { .. } | HarvestError::RateLimited { .. } => true,
            _ => false,
        }
    }

    /// Delay suggested by the provider, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            HarvestError::RateLimited {
                retry_after: Some(secs),
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
}

/// Result type alias using `HarvestError`
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Extension trait for turning missing payload fields into parse failures
pub trait OptionExt<T> {
    /// Convert Option to Result with a malformed-response message
    fn ok_or_malformed(self, msg: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_malformed(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| HarvestError::MalformedResponse(msg.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(HarvestError::Server {
            code: 503,
            message: "unavailable".to_string()
        }
        .is_transient());
        assert!(HarvestError::RateLimited { retry_after: None }.is_transient());
        assert!(!HarvestError::Api {
            code: 400,
            message: "bad request".to_string()
        }
        .is_transient());
        assert!(!HarvestError::MalformedResponse("x".to_string()).is_transient());
        assert!(!HarvestError::Parse("bad pattern".to_string()).is_transient());
    }

    #[test]
    fn test_retry_after() {
        let err = HarvestError::RateLimited {
            retry_after: Some(7),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(
            HarvestError::RateLimited { retry_after: None }.retry_after(),
            None
        );
    }

    #[test]
    fn test_ok_or_malformed() {
        let missing: Option<u32> = None;
        let err = missing.ok_or_malformed("no count").expect_err("should fail");
        assert!(matches!(err, HarvestError::MalformedResponse(msg) if msg == "no count"));
    }
}
