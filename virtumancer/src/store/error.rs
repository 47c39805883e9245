//! Store error types.

use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Conflict with an existing resource (unique key or already imported).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A different task is already running on the VM.
    #[error("busy: {0}")]
    Busy(String),

    /// Underlying database failure.
    #[error("database: {0}")]
    Database(sqlx::Error),

    /// A JSON column could not be encoded or decoded.
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored value is not one we can interpret.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(db.message().to_string())
            }
            sqlx::Error::RowNotFound => StoreError::NotFound("row".to_string()),
            _ => StoreError::Database(e),
        }
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
