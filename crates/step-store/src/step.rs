//! Step metadata records and the step status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{MessageId, SagaId};

/// Execution status of one saga step.
///
/// State transitions:
/// ```text
/// Started ──┬──► Completed ──┬──► Compensated
///           │                └──► CompensationFailed
///           └──► Failed ─────┬──► Compensated
///                            └──► CompensationFailed
/// Started | Failed ──► Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepStatus {
    /// The handler began processing the message.
    Started,

    /// The handler finished successfully.
    Completed,

    /// The handler reported a business failure or raised a fatal error.
    Failed,

    /// The step was rolled back (terminal state).
    Compensated,

    /// Rolling the step back failed (terminal state).
    CompensationFailed,

    /// The step was abandoned before finishing (terminal state).
    Cancelled,
}

impl StepStatus {
    /// Returns true if `next` is reachable from this status in one transition.
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Started, Completed)
                | (Started, Failed)
                | (Completed, Compensated)
                | (Completed, CompensationFailed)
                | (Failed, Compensated)
                | (Failed, CompensationFailed)
                | (Started, Cancelled)
                | (Failed, Cancelled)
        )
    }

    /// Returns true if no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Compensated | StepStatus::CompensationFailed | StepStatus::Cancelled
        )
    }

    /// Returns true if the step ended in a failure an operator should see.
    pub fn is_failure(&self) -> bool {
        matches!(self, StepStatus::Failed | StepStatus::CompensationFailed)
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Started => "Started",
            StepStatus::Completed => "Completed",
            StepStatus::Failed => "Failed",
            StepStatus::Compensated => "Compensated",
            StepStatus::CompensationFailed => "CompensationFailed",
            StepStatus::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error returned when parsing an unknown status name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown step status: {0}")]
pub struct UnknownStepStatus(pub String);

impl std::str::FromStr for StepStatus {
    type Err = UnknownStepStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Started" => Ok(StepStatus::Started),
            "Completed" => Ok(StepStatus::Completed),
            "Failed" => Ok(StepStatus::Failed),
            "Compensated" => Ok(StepStatus::Compensated),
            "CompensationFailed" => Ok(StepStatus::CompensationFailed),
            "Cancelled" => Ok(StepStatus::Cancelled),
            other => Err(UnknownStepStatus(other.to_string())),
        }
    }
}

/// Identity of a step record: one handler processing one message instance
/// within one saga run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepKey {
    pub saga_id: SagaId,
    pub step_type: String,
    pub handler_type: String,
    pub message_id: MessageId,
}

impl StepKey {
    pub fn new(
        saga_id: SagaId,
        step_type: impl Into<String>,
        handler_type: impl Into<String>,
        message_id: MessageId,
    ) -> Self {
        Self {
            saga_id,
            step_type: step_type.into(),
            handler_type: handler_type.into(),
            message_id,
        }
    }
}

impl std::fmt::Display for StepKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.saga_id, self.step_type, self.handler_type, self.message_id
        )
    }
}

/// Persisted record of one step of a saga run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaStepMetadata {
    pub saga_id: SagaId,

    /// Type name of the message that drove this step.
    pub step_type: String,

    /// Type name of the handler that processed the message.
    pub handler_type: String,

    pub message_id: MessageId,

    /// The message that caused this one; `None` for a root step.
    pub parent_message_id: Option<MessageId>,

    pub status: StepStatus,

    /// The exact payload that produced `status`, compared byte for byte when
    /// a redelivery reports the same status again.
    pub payload: Vec<u8>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SagaStepMetadata {
    /// Creates a record for `key` stamped with the current time.
    pub fn new(
        key: StepKey,
        parent_message_id: Option<MessageId>,
        status: StepStatus,
        payload: Vec<u8>,
    ) -> Self {
        let now = Utc::now();
        Self {
            saga_id: key.saga_id,
            step_type: key.step_type,
            handler_type: key.handler_type,
            message_id: key.message_id,
            parent_message_id,
            status,
            payload,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the identity tuple of this record.
    pub fn key(&self) -> StepKey {
        StepKey {
            saga_id: self.saga_id,
            step_type: self.step_type.clone(),
            handler_type: self.handler_type.clone(),
            message_id: self.message_id,
        }
    }

    /// Returns a copy moved to `status` with a fresh `updated_at`.
    ///
    /// Identity, parent and creation time are carried over unchanged.
    pub fn transitioned(&self, status: StepStatus, payload: Vec<u8>) -> Self {
        Self {
            status,
            payload,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }
}
