//! Per-saga aggregate state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::SagaId;

/// Aggregate state of one saga run.
///
/// Created on the first step, updated by the dispatcher and the compensation
/// coordinator, and finally marked completed or failed. `version` is the
/// optimistic concurrency token checked by [`crate::StepStore::save_saga_data`];
/// zero means the record has never been saved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaData {
    pub saga_id: SagaId,
    pub version: u64,
    pub is_completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    /// Step type of the first step that failed.
    pub failed_step_type: Option<String>,
    /// Handler type of the first step that failed.
    pub failed_handler_type: Option<String>,
    pub failure_reason: Option<String>,
    pub failed_at: Option<DateTime<Utc>>,
    /// `handler_type/step_type` of every step whose compensation failed.
    pub compensation_failures: Vec<String>,
    /// Domain-specific fields owned by the application.
    #[serde(default)]
    pub extensions: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SagaData {
    /// Creates unsaved state for a new saga run.
    pub fn new(saga_id: SagaId) -> Self {
        let now = Utc::now();
        Self {
            saga_id,
            version: 0,
            is_completed: false,
            completed_at: None,
            failed_step_type: None,
            failed_handler_type: None,
            failure_reason: None,
            failed_at: None,
            compensation_failures: Vec::new(),
            extensions: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true once a failing step has been recorded.
    pub fn is_failed(&self) -> bool {
        self.failed_at.is_some()
    }

    /// Returns true if the saga reached either terminal outcome.
    pub fn is_finished(&self) -> bool {
        self.is_completed || self.is_failed()
    }

    /// Records the failing step.
    ///
    /// Only the first failure is kept; later failures of the same run are
    /// consequences of it. Returns false if a failure was already recorded.
    pub fn mark_failed(
        &mut self,
        step_type: impl Into<String>,
        handler_type: impl Into<String>,
        reason: impl Into<String>,
    ) -> bool {
        if self.is_failed() {
            return false;
        }
        let now = Utc::now();
        self.failed_step_type = Some(step_type.into());
        self.failed_handler_type = Some(handler_type.into());
        self.failure_reason = Some(reason.into());
        self.failed_at = Some(now);
        self.updated_at = now;
        true
    }

    /// Marks the saga completed unless it has already failed.
    ///
    /// Returns true if the state changed.
    pub fn mark_completed(&mut self) -> bool {
        if self.is_finished() {
            return false;
        }
        let now = Utc::now();
        self.is_completed = true;
        self.completed_at = Some(now);
        self.updated_at = now;
        true
    }

    /// Records a step whose compensation failed.
    pub fn record_compensation_failure(&mut self, handler_type: &str, step_type: &str) {
        self.compensation_failures
            .push(format!("{handler_type}/{step_type}"));
        self.updated_at = Utc::now();
    }

    /// Reads a domain-specific field.
    pub fn extension<T: DeserializeOwned>(&self, key: &str) -> Option<serde_json::Result<T>> {
        self.extensions
            .get(key)
            .map(|value| serde_json::from_value(value.clone()))
    }

    /// Writes a domain-specific field.
    pub fn set_extension<T: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: &T,
    ) -> serde_json::Result<()> {
        self.extensions
            .insert(key.into(), serde_json::to_value(value)?);
        self.updated_at = Utc::now();
        Ok(())
    }
}
