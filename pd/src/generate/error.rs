//! Generation error types

use std::time::Duration;
use thiserror::Error;

/// Errors raised by a `Generator`
#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("API error {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Network error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Generator config error: {0}")]
    Config(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GenerateError {
    /// Check if retrying the same call could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            GenerateError::RateLimited { .. } => true,
            GenerateError::Status { status, .. } => *status >= 500 || *status == 408,
            GenerateError::Request(_) => true,
            GenerateError::Timeout(_) => true,
            GenerateError::InvalidResponse(_) => false,
            GenerateError::Config(_) => false,
            GenerateError::Json(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable() {
        assert!(
            GenerateError::RateLimited {
                retry_after: Duration::from_secs(5)
            }
            .is_retryable()
        );
        assert!(
            GenerateError::Status {
                status: 503,
                message: "unavailable".to_string()
            }
            .is_retryable()
        );
        assert!(
            !GenerateError::Status {
                status: 401,
                message: "unauthorized".to_string()
            }
            .is_retryable()
        );
        assert!(GenerateError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(!GenerateError::Config("missing key".to_string()).is_retryable());
        assert!(!GenerateError::InvalidResponse("empty".to_string()).is_retryable());
    }

    #[test]
    fn test_display() {
        let err = GenerateError::Status {
            status: 500,
            message: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "API error 500: boom");
    }
}
