use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Rate limited by upstream: {0}")]
    RateLimited(String),

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("{operation} gave up after {attempts} attempts ({elapsed:?}): {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        elapsed: Duration,
        #[source]
        source: Box<Error>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid: {0}")]
    Invalid(String),
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout(err.to_string())
        } else if err.is_decode() {
            Error::InvalidResponse(err.to_string())
        } else {
            Error::Http(err.to_string())
        }
    }
}

impl Error {
    /// Transient upstream failures worth another attempt after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Http(_) | Error::RateLimited(_) | Error::Timeout(_) | Error::Io(_)
        )
    }

    /// Conditions the worker cannot recover from by skipping an item.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Auth(_) | Error::Serialization(_) | Error::Config(_) => true,
            Error::RetriesExhausted { source, .. } => source.is_fatal(),
            _ => false,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Http(_) => "HTTP_ERROR",
            Error::RateLimited(_) => "RATE_LIMITED",
            Error::Timeout(_) => "TIMEOUT",
            Error::Rejected { .. } => "REJECTED",
            Error::Auth(_) => "AUTH",
            Error::InvalidResponse(_) => "INVALID_RESPONSE",
            Error::RetriesExhausted { .. } => "RETRIES_EXHAUSTED",
            Error::Io(_) => "IO_ERROR",
            Error::Serialization(_) => "SERIALIZATION",
            Error::Config(_) => "CONFIG",
            Error::Storage(_) => "STORAGE",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Invalid(_) => "INVALID",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(Error::RateLimited("slow down".into()).is_retryable());
        assert!(Error::Http("502".into()).is_retryable());
        assert!(!Error::Rejected { status: 404, message: "gone".into() }.is_retryable());
        assert!(!Error::Auth("bad password".into()).is_retryable());
    }

    #[test]
    fn test_exhausted_inherits_fatality() {
        let exhausted = Error::RetriesExhausted {
            operation: "fetch".into(),
            attempts: 3,
            elapsed: Duration::from_secs(1),
            source: Box::new(Error::Http("503".into())),
        };
        assert!(!exhausted.is_fatal());
        assert!(!exhausted.is_retryable());
        assert_eq!(exhausted.error_code(), "RETRIES_EXHAUSTED");
        assert!(Error::Auth("revoked".into()).is_fatal());
    }
}
