//! Coordination store errors.

use std::time::Duration;

use thiserror::Error;

/// Errors returned by a [`CoordinationStore`](crate::CoordinationStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store cannot be reached.
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),
    /// A call did not complete in time.
    #[error("coordination store call timed out after {0:?}")]
    Timeout(Duration),
    /// A stored value could not be encoded or decoded.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The backend rejected the command.
    #[error("coordination store error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Stable label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::Timeout(_) => "timeout",
            Self::Serialization(_) => "serialization",
            Self::Backend(_) => "backend",
        }
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
        {
            Self::Unavailable(err.to_string())
        } else {
            Self::Backend(err.to_string())
        }
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_labels() {
        assert_eq!(StoreError::Unavailable("x".into()).kind(), "unavailable");
        assert_eq!(StoreError::Timeout(Duration::from_secs(1)).kind(), "timeout");
        assert_eq!(StoreError::Backend("x".into()).kind(), "backend");
    }

    #[test]
    fn redis_io_error_is_unavailable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: StoreError = redis::RedisError::from(io).into();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[test]
    fn redis_type_error_is_backend() {
        let err: StoreError =
            redis::RedisError::from((redis::ErrorKind::TypeError, "bad type")).into();
        assert!(matches!(err, StoreError::Backend(_)));
    }

    #[test]
    fn timeout_display() {
        let err = StoreError::Timeout(Duration::from_millis(250));
        assert_eq!(err.to_string(), "coordination store call timed out after 250ms");
    }
}
