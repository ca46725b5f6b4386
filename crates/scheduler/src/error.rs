use common::ScheduleId;
use thiserror::Error;

/// Errors that can occur when scheduling or delivering delayed dispatches.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// No entry exists for the schedule id.
    #[error("Schedule not found: {0}")]
    NotFound(ScheduleId),

    /// A dequeue was requested with a zero batch size.
    #[error("Batch size must be greater than zero")]
    InvalidBatchSize,

    /// A stored entry could not be decoded.
    #[error("Corrupted schedule entry: {0}")]
    Corrupted(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for schedule operations.
pub type Result<T> = std::result::Result<T, ScheduleError>;
