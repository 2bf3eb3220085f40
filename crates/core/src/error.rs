// Central Error Type for the Queue Core

use thiserror::Error;

/// Application-level error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Domain error: {0}")]
    Domain(#[from] crate::domain::DomainError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The worker no longer owns the job (lease expired or job was re-enqueued)
    #[error("Lease lost for job {0}")]
    LeaseLost(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Infrastructure failures that the claim loop retries on its next cycle
    /// without touching the job's retry count.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::Database(_) | AppError::Broker(_))
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

// Note: sqlx::Error and redis::RedisError conversions live in the infra crates
// (orphan rule) and map to AppError::Database / AppError::Broker.

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(AppError::Database("locked".into()).is_transient());
        assert!(AppError::Broker("connection reset".into()).is_transient());
        assert!(!AppError::Validation("bad queue".into()).is_transient());
        assert!(!AppError::LeaseLost("job-1".into()).is_transient());
    }
}
