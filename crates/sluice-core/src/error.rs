use std::time::Duration;

use thiserror::Error;

/// Coarse classification used by retry, failover and throttling decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Timeouts, connection resets, 5xx. Retried with backoff, then failover.
    Transient,
    /// 429 or a quota signal. Retried like `Transient`, also drives throttling.
    RateLimited,
    /// Bad request, auth failure, malformed payload. Never retried.
    Fatal,
}

/// Application-wide error types for Sluice.
#[derive(Error, Debug)]
pub enum AppError {
    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Network/connection error (refused, reset, DNS).
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Upstream API answered with a non-success status.
    #[error("Upstream error (HTTP {status_code}): {message}")]
    UpstreamError { message: String, status_code: u16 },

    /// Upstream rejected the call with a rate-limit or quota signal.
    #[error("Rate limit exceeded")]
    RateLimitExceeded { retry_after: Option<Duration> },

    /// Upstream answered 2xx but the body lacks the expected fields.
    #[error("Malformed upstream response: {0}")]
    MalformedResponse(String),

    /// Every configured region failed for one logical call.
    ///
    /// `rate_limited` is set when any attempt behind it was rejected with a
    /// rate-limit signal.
    #[error("All regions exhausted ({}); last error: {last_error}", .attempted.join(", "))]
    AllRegionsExhausted {
        attempted: Vec<String>,
        last_error: String,
        rate_limited: bool,
    },

    /// Queue transport could not be reached. Transient.
    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    /// Message was already deleted, usually by a competing consumer.
    #[error("Message {0} already deleted")]
    MessageAlreadyDeleted(String),

    /// Poison envelope could not be written; the original must be kept.
    #[error("Failed to move message {message_id} to poison queue: {reason}")]
    PoisonQueueWriteFailed { message_id: String, reason: String },

    /// Message body is not a valid envelope.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Envelope names an operation this pipeline does not handle.
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Durable metrics store failed.
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Configuration is missing or invalid.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Build the error for a non-success upstream status code.
    ///
    /// `429` → rate limited, `5xx` → transient, any other status → fatal.
    pub fn from_status(status_code: u16, message: impl Into<String>) -> Self {
        if status_code == 429 {
            AppError::RateLimitExceeded { retry_after: None }
        } else {
            AppError::UpstreamError {
                message: message.into(),
                status_code,
            }
        }
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            AppError::Timeout(_) | AppError::NetworkError(_) | AppError::QueueUnavailable(_) => {
                FailureKind::Transient
            }
            AppError::RateLimitExceeded { .. } => FailureKind::RateLimited,
            AppError::AllRegionsExhausted { rate_limited, .. } => {
                if *rate_limited {
                    FailureKind::RateLimited
                } else {
                    FailureKind::Transient
                }
            }
            AppError::UpstreamError { status_code, .. } => match *status_code {
                429 => FailureKind::RateLimited,
                408 | 500..=599 => FailureKind::Transient,
                _ => FailureKind::Fatal,
            },
            AppError::Generic(msg) => {
                if msg.contains("timeout") || msg.contains("connect") || msg.contains("reset") {
                    FailureKind::Transient
                } else {
                    FailureKind::Fatal
                }
            }
            _ => FailureKind::Fatal,
        }
    }

    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.failure_kind() != FailureKind::Fatal
    }

    pub fn is_rate_limit(&self) -> bool {
        self.failure_kind() == FailureKind::RateLimited
    }

    /// HTTP-ish status code for throttle bookkeeping, when one is known.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            AppError::UpstreamError { status_code, .. } => Some(*status_code),
            AppError::RateLimitExceeded { .. } => Some(429),
            AppError::AllRegionsExhausted {
                rate_limited: true,
                ..
            } => Some(429),
            _ => None,
        }
    }

    /// Server-provided wait hint attached to a rate-limit rejection.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AppError::RateLimitExceeded { retry_after } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(
            AppError::from_status(429, "slow down").failure_kind(),
            FailureKind::RateLimited
        );
        assert_eq!(
            AppError::from_status(503, "unavailable").failure_kind(),
            FailureKind::Transient
        );
        assert_eq!(
            AppError::from_status(500, "boom").failure_kind(),
            FailureKind::Transient
        );
        assert_eq!(
            AppError::from_status(400, "bad request").failure_kind(),
            FailureKind::Fatal
        );
        assert_eq!(
            AppError::from_status(401, "unauthorized").failure_kind(),
            FailureKind::Fatal
        );
    }

    #[test]
    fn test_retryable_errors() {
        assert!(AppError::NetworkError("reset".into()).is_retryable());
        assert!(AppError::Timeout(30).is_retryable());
        assert!(AppError::RateLimitExceeded { retry_after: None }.is_retryable());
        assert!(AppError::QueueUnavailable("down".into()).is_retryable());
        assert!(!AppError::MalformedResponse("no choices".into()).is_retryable());
        assert!(!AppError::UnknownOperation("noop".into()).is_retryable());
    }

    #[test]
    fn test_rate_limit_helpers() {
        let err = AppError::RateLimitExceeded {
            retry_after: Some(Duration::from_secs(7)),
        };
        assert!(err.is_rate_limit());
        assert_eq!(err.status_code(), Some(429));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert!(!AppError::Timeout(5).is_rate_limit());
    }

    #[test]
    fn test_exhausted_message_lists_regions() {
        let err = AppError::AllRegionsExhausted {
            attempted: vec!["eastus".into(), "westeurope".into()],
            last_error: "HTTP 503".into(),
            rate_limited: false,
        };
        assert_eq!(
            err.to_string(),
            "All regions exhausted (eastus, westeurope); last error: HTTP 503"
        );
        assert_eq!(err.failure_kind(), FailureKind::Transient);
        assert_eq!(err.status_code(), None);
    }

    #[test]
    fn test_exhausted_by_rate_limits_reports_429() {
        let err = AppError::AllRegionsExhausted {
            attempted: vec!["eastus".into()],
            last_error: "Rate limit exceeded".into(),
            rate_limited: true,
        };
        assert!(err.is_rate_limit());
        assert_eq!(err.status_code(), Some(429));
    }
}
