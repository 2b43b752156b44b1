//! Unified error handling for batchd-core

use thiserror::Error;

/// Core error type for batchd-core
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid transition for {entity} {id}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Capacity check failed: {0}")]
    Capacity(String),

    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for batchd-core
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a provider error
    pub fn provider(msg: impl Into<String>) -> Self {
        Error::Provider(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Whether this error is worth retrying through the job queue.
    ///
    /// Validation and transition errors are deterministic; retrying them
    /// only burns attempts.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Database(_)
                | Error::Io(_)
                | Error::Http(_)
                | Error::Amqp(_)
                | Error::Delivery(_)
        )
    }
}

// Convert to String for callers that only carry messages
impl From<Error> for String {
    fn from(err: Error) -> Self {
        err.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::validation("custom_id mismatch");
        assert_eq!(err.to_string(), "Validation error: custom_id mismatch");
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = Error::InvalidTransition {
            entity: "batch",
            id: "b-1".to_string(),
            from: "building".to_string(),
            to: "delivered".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid transition for batch b-1: building -> delivered"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(!Error::validation("bad").is_transient());
        assert!(!Error::not_found("gone").is_transient());
        assert!(Error::Io(std::io::Error::other("disk")).is_transient());
    }
}
