use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Off-topic question: {0}")]
    OffTopic(String),

    #[error("Restricted operation: {0}")]
    RestrictedOperation(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Classifier error: {0}")]
    Classifier(String),

    #[error("Malformed classification: {0}")]
    MalformedClassification(String),

    #[error("Data source error: {message}")]
    DataSource { message: String, transient: bool },

    #[error("Query build error: {0}")]
    QueryBuild(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl EngineError {
    pub fn transient(message: impl Into<String>) -> Self {
        EngineError::DataSource {
            message: message.into(),
            transient: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        EngineError::DataSource {
            message: message.into(),
            transient: false,
        }
    }

    /// True for data source failures worth retrying (reset, timeout, lost connection).
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::DataSource { transient: true, .. })
    }

    /// Maps the error onto the boundary taxonomy returned to callers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            EngineError::OffTopic(_) => ErrorKind::OffTopic,
            EngineError::RestrictedOperation(_) => ErrorKind::RestrictedOperation,
            EngineError::RateLimited(_) => ErrorKind::RateLimit,
            _ => ErrorKind::InternalError,
        }
    }
}

/// Error categories exposed at the request boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    OffTopic,
    RestrictedOperation,
    RateLimit,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::OffTopic => "off_topic",
            ErrorKind::RestrictedOperation => "restricted_operation",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::InternalError => "internal_error",
        }
    }

    /// HTTP status used by the server binary.
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::InvalidRequest | ErrorKind::OffTopic => 400,
            ErrorKind::RestrictedOperation => 403,
            ErrorKind::RateLimit => 429,
            ErrorKind::InternalError => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(EngineError::OffTopic("x".into()).kind(), ErrorKind::OffTopic);
        assert_eq!(EngineError::RateLimited("x".into()).kind(), ErrorKind::RateLimit);
        assert_eq!(EngineError::transient("reset").kind(), ErrorKind::InternalError);
        assert_eq!(ErrorKind::RestrictedOperation.as_str(), "restricted_operation");
    }

    #[test]
    fn test_transient_flag() {
        assert!(EngineError::transient("connection reset").is_transient());
        assert!(!EngineError::permanent("syntax error").is_transient());
        assert!(!EngineError::Classifier("boom".into()).is_transient());
    }
}
