use async_trait::async_trait;

use crate::{Result, SagaData, SagaId, SagaStepMetadata, StepKey, StepStatus, StepStoreError};

/// What the stored record must look like for a save to go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expectation {
    /// No check is performed (use with caution).
    #[default]
    Any,
    /// No record may exist for the key yet.
    New,
    /// The stored record must currently have this status.
    Status(StepStatus),
}

impl std::fmt::Display for Expectation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expectation::Any => write!(f, "any record"),
            Expectation::New => write!(f, "new record"),
            Expectation::Status(status) => write!(f, "status {status}"),
        }
    }
}

/// Options for saving a step record.
#[derive(Debug, Clone, Copy, Default)]
pub struct SaveOptions {
    pub expectation: Expectation,
}

impl SaveOptions {
    /// Creates options with no check.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates options requiring that no record exists for the key.
    pub fn expect_new() -> Self {
        Self {
            expectation: Expectation::New,
        }
    }

    /// Creates options requiring the stored record to have `status`.
    pub fn expect_status(status: StepStatus) -> Self {
        Self {
            expectation: Expectation::Status(status),
        }
    }

    /// Checks the expectation against the currently stored status.
    pub fn check(&self, key: &StepKey, actual: Option<StepStatus>) -> Result<()> {
        let satisfied = match self.expectation {
            Expectation::Any => true,
            Expectation::New => actual.is_none(),
            Expectation::Status(expected) => actual == Some(expected),
        };
        if satisfied {
            Ok(())
        } else {
            Err(StepStoreError::Conflict {
                key: key.clone(),
                expected: self.expectation,
                actual,
            })
        }
    }
}

/// Core trait for step store implementations.
///
/// The step store and the saga data it keeps next to the steps are the only
/// shared mutable state of the engine. All implementations must be
/// thread-safe (Send + Sync).
#[async_trait]
pub trait StepStore: Send + Sync {
    /// Loads the record for a step identity.
    async fn get(&self, key: &StepKey) -> Result<Option<SagaStepMetadata>>;

    /// Saves a step record atomically.
    ///
    /// The expectation in `options` is checked and the write performed as a
    /// single compare-and-write; a mismatch returns `Conflict`. Writing over
    /// an existing record updates status, payload and `updated_at` only.
    async fn save(&self, metadata: SagaStepMetadata, options: SaveOptions) -> Result<()>;

    /// Returns every step of a saga in insertion order.
    async fn query_by_saga(&self, saga_id: SagaId) -> Result<Vec<SagaStepMetadata>>;

    /// Loads the aggregate state of a saga.
    async fn get_saga_data(&self, saga_id: SagaId) -> Result<Option<SagaData>>;

    /// Saves saga data if its `version` still matches the stored one.
    ///
    /// Returns the new version.
    async fn save_saga_data(&self, data: &SagaData) -> Result<u64>;
}

/// Attempts made by [`StepStoreExt::update_saga_data`] before giving up on a
/// contended saga.
pub const SAGA_DATA_MAX_ATTEMPTS: usize = 8;

/// Extension trait providing convenience methods for step stores.
#[async_trait]
pub trait StepStoreExt: StepStore {
    /// Returns the step records of a saga that have the given status.
    async fn steps_with_status(
        &self,
        saga_id: SagaId,
        status: StepStatus,
    ) -> Result<Vec<SagaStepMetadata>> {
        Ok(self
            .query_by_saga(saga_id)
            .await?
            .into_iter()
            .filter(|step| step.status == status)
            .collect())
    }

    /// Loads, modifies and saves saga data, retrying on version conflicts.
    ///
    /// `apply` returns whether it changed anything; unchanged data that was
    /// already persisted is returned without a write. Missing data is created.
    async fn update_saga_data<F>(&self, saga_id: SagaId, mut apply: F) -> Result<SagaData>
    where
        F: FnMut(&mut SagaData) -> bool + Send,
    {
        let mut last_conflict = None;
        for _ in 0..SAGA_DATA_MAX_ATTEMPTS {
            let mut data = self
                .get_saga_data(saga_id)
                .await?
                .unwrap_or_else(|| SagaData::new(saga_id));
            if !apply(&mut data) && data.version != 0 {
                return Ok(data);
            }
            match self.save_saga_data(&data).await {
                Ok(version) => {
                    data.version = version;
                    return Ok(data);
                }
                Err(conflict @ StepStoreError::SagaDataConflict { .. }) => {
                    tracing::debug!(%saga_id, "saga data changed concurrently, reloading");
                    last_conflict = Some(conflict);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_conflict.unwrap_or_else(|| {
            StepStoreError::Unavailable(format!("saga data for {saga_id} is contended"))
        }))
    }
}

// Blanket implementation for all StepStore implementations
impl<T: StepStore + ?Sized> StepStoreExt for T {}

/// Counts a save refused by its expectation.
pub(crate) fn record_conflict(backend: &'static str) {
    metrics::counter!("saga_step_store_conflicts_total", "backend" => backend).increment(1);
}

/// Validates a record before saving.
pub fn validate_for_save(metadata: &SagaStepMetadata) -> Result<()> {
    if metadata.step_type.trim().is_empty() {
        return Err(StepStoreError::InvalidRecord(
            "step type must not be empty".to_string(),
        ));
    }
    if metadata.handler_type.trim().is_empty() {
        return Err(StepStoreError::InvalidRecord(
            "handler type must not be empty".to_string(),
        ));
    }
    if metadata.parent_message_id == Some(metadata.message_id) {
        return Err(StepStoreError::InvalidRecord(format!(
            "message {} cannot be its own parent",
            metadata.message_id
        )));
    }
    Ok(())
}
