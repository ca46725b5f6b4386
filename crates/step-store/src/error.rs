use thiserror::Error;

use crate::{SagaId, StepKey, StepStatus, store::Expectation};

/// Errors that can occur when interacting with the step store.
#[derive(Debug, Error)]
pub enum StepStoreError {
    /// A compare-and-write on a step key lost against another writer.
    #[error("Step conflict for {key}: expected {expected}, found {}", display_actual(.actual))]
    Conflict {
        key: StepKey,
        expected: Expectation,
        actual: Option<StepStatus>,
    },

    /// The saga data was modified since it was loaded.
    #[error("Saga data conflict for saga {saga_id}: expected version {expected}, found {actual}")]
    SagaDataConflict {
        saga_id: SagaId,
        expected: u64,
        actual: u64,
    },

    /// The record failed structural validation before being written.
    #[error("Invalid step record: {0}")]
    InvalidRecord(String),

    /// A stored status string could not be parsed.
    #[error("Corrupted step record: {0}")]
    Corrupted(String),

    /// The backing store could not be reached.
    #[error("Step store unavailable: {0}")]
    Unavailable(String),

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

impl StepStoreError {
    /// Returns true for failures a redelivery may get past.
    ///
    /// Conflicts and corrupted data are not transient: retrying the same
    /// write observes the same stored state.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StepStoreError::Unavailable(_) | StepStoreError::Database(_)
        )
    }
}

fn display_actual(actual: &Option<StepStatus>) -> String {
    match actual {
        Some(status) => status.to_string(),
        None => "no record".to_string(),
    }
}

/// Result type for step store operations.
pub type Result<T> = std::result::Result<T, StepStoreError>;
