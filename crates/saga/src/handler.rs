//! The handler contract.

use async_trait::async_trait;
use step_store::StepStatus;

use crate::context::{CompensationContext, InvocationContext};
use crate::error::HandlerError;

/// Result of a handler that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step succeeded; the saga continues.
    Completed,

    /// The step succeeded and was the last step of the saga.
    SagaCompleted,

    /// A business rule rejected the step. Completed steps are compensated.
    Failed { reason: String },
}

impl StepOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        StepOutcome::Failed {
            reason: reason.into(),
        }
    }

    /// Status recorded for the step.
    pub fn status(&self) -> StepStatus {
        match self {
            StepOutcome::Completed | StepOutcome::SagaCompleted => StepStatus::Completed,
            StepOutcome::Failed { .. } => StepStatus::Failed,
        }
    }
}

/// Processes one message type as one step of a saga.
///
/// `handler_type` is persisted in step records and must be stable across
/// deployments: compensation looks handlers up by it.
#[async_trait]
pub trait SagaHandler: Send + Sync {
    fn handler_type(&self) -> &'static str;

    async fn handle(&self, ctx: &mut InvocationContext) -> Result<StepOutcome, HandlerError>;

    /// Rolls back the side effects of a completed step.
    async fn compensate(&self, _ctx: &CompensationContext) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Whether a failed step of this handler has partial side effects that
    /// must be compensated too.
    fn compensates_failed_step(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_status() {
        assert_eq!(StepOutcome::Completed.status(), StepStatus::Completed);
        assert_eq!(StepOutcome::SagaCompleted.status(), StepStatus::Completed);
        assert_eq!(
            StepOutcome::failed("out of stock").status(),
            StepStatus::Failed
        );
    }
}
