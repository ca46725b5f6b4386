//! Compensation of completed steps after a saga fails.

use std::sync::Arc;

use step_store::{SagaId, SagaStepMetadata, StepStatus, StepStore, StepStoreExt};

use crate::context::CompensationContext;
use crate::error::SagaError;
use crate::handler::SagaHandler;
use crate::registry::HandlerRegistry;
use crate::serializer::Serializer;
use crate::validator::{StepValidator, record_transition};

/// Outcome of compensating one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompensatedStep {
    pub step_type: String,
    pub handler_type: String,
    /// `Compensated` or `CompensationFailed`.
    pub status: StepStatus,
    pub error: Option<String>,
}

/// Per-step outcomes of one compensation run, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompensationReport {
    pub saga_id: Option<SagaId>,
    pub steps: Vec<CompensatedStep>,
}

impl CompensationReport {
    pub fn compensated(&self) -> usize {
        self.count(StepStatus::Compensated)
    }

    pub fn failed(&self) -> usize {
        self.count(StepStatus::CompensationFailed)
    }

    /// Returns true if every step was rolled back.
    pub fn is_clean(&self) -> bool {
        self.failed() == 0
    }

    fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }
}

/// Rolls back the completed steps of a failed saga in reverse order.
///
/// Each step is compensated on its own task: a handler error or panic marks
/// that step `CompensationFailed` and the run moves on to the next step.
/// Dropping the caller's future does not abort a compensation in flight.
pub struct CompensationCoordinator<S: StepStore + Clone + 'static> {
    store: S,
    registry: Arc<HandlerRegistry>,
    validator: StepValidator,
    serializer: Arc<dyn Serializer>,
    application_id: String,
}

impl<S: StepStore + Clone + 'static> CompensationCoordinator<S> {
    pub fn new(
        store: S,
        registry: Arc<HandlerRegistry>,
        validator: StepValidator,
        serializer: Arc<dyn Serializer>,
        application_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            registry,
            validator,
            serializer,
            application_id: application_id.into(),
        }
    }

    /// Records the saga as failed by `failed` and compensates every step
    /// still `Completed`, most recent first.
    ///
    /// Safe to call again for the same failure: steps already compensated
    /// are no longer `Completed` and are skipped.
    #[tracing::instrument(
        skip(self, failed),
        fields(saga_id = %failed.saga_id, failed_step = %failed.step_type, handler_type = %failed.handler_type)
    )]
    pub async fn compensate(
        &self,
        failed: &SagaStepMetadata,
        reason: &str,
    ) -> Result<CompensationReport, SagaError> {
        let saga_id = failed.saga_id;
        self.store
            .update_saga_data(saga_id, |data| {
                data.mark_failed(&failed.step_type, &failed.handler_type, reason)
            })
            .await?;

        let mut targets = Vec::new();
        let compensates_itself = self
            .registry
            .handler(&failed.handler_type)
            .map(|handler| handler.compensates_failed_step())
            .unwrap_or(false);
        if compensates_itself {
            if let Some(current) = self.store.get(&failed.key()).await? {
                if current.status == StepStatus::Failed {
                    targets.push(current);
                }
            }
        }
        let mut completed = self
            .store
            .steps_with_status(saga_id, StepStatus::Completed)
            .await?;
        completed.reverse();
        targets.extend(completed);

        let mut report = CompensationReport {
            saga_id: Some(saga_id),
            steps: Vec::with_capacity(targets.len()),
        };
        if targets.is_empty() {
            tracing::debug!("nothing to compensate");
            return Ok(report);
        }

        metrics::counter!("saga_compensations_total").increment(1);
        tracing::info!(steps = targets.len(), reason, "compensating saga");
        for step in targets {
            report.steps.push(self.compensate_step(step, reason).await?);
        }

        if report.is_clean() {
            tracing::info!(compensated = report.compensated(), "saga compensated");
        } else {
            tracing::error!(
                compensated = report.compensated(),
                failed = report.failed(),
                "saga compensation incomplete, manual intervention required"
            );
        }
        Ok(report)
    }

    async fn compensate_step(
        &self,
        step: SagaStepMetadata,
        reason: &str,
    ) -> Result<CompensatedStep, SagaError> {
        let saga_id = step.saga_id;
        let handler = match self.registry.handler(&step.handler_type) {
            Ok(handler) => handler,
            Err(e) => return self.record_failure(&step, e.to_string()).await,
        };

        let ctx = CompensationContext::new(
            step.clone(),
            self.application_id.clone(),
            reason,
            Arc::clone(&self.serializer),
        );
        let task = tokio::spawn(run_compensation(
            self.store.clone(),
            self.validator,
            handler,
            ctx,
        ));
        match task.await {
            Ok(Ok((compensated, None))) => Ok(compensated),
            Ok(Ok((compensated, Some(error)))) => {
                self.note_failure(saga_id, &compensated, &error).await?;
                Ok(compensated)
            }
            Ok(Err(e)) => Err(e),
            Err(join_error) => {
                self.record_failure(&step, format!("compensation panicked: {join_error}"))
                    .await
            }
        }
    }

    async fn record_failure(
        &self,
        step: &SagaStepMetadata,
        error: String,
    ) -> Result<CompensatedStep, SagaError> {
        let recorded = record_transition(
            &self.store,
            &self.validator,
            step,
            StepStatus::CompensationFailed,
        )
        .await?;
        let compensated = CompensatedStep {
            step_type: recorded.step_type,
            handler_type: recorded.handler_type,
            status: StepStatus::CompensationFailed,
            error: Some(error.clone()),
        };
        self.note_failure(step.saga_id, &compensated, &error).await?;
        Ok(compensated)
    }

    async fn note_failure(
        &self,
        saga_id: SagaId,
        step: &CompensatedStep,
        error: &str,
    ) -> Result<(), SagaError> {
        metrics::counter!("saga_compensation_failures_total", "handler" => step.handler_type.clone())
            .increment(1);
        tracing::error!(
            step_type = %step.step_type,
            handler_type = %step.handler_type,
            error,
            "step compensation failed"
        );
        self.store
            .update_saga_data(saga_id, |data| {
                data.record_compensation_failure(&step.handler_type, &step.step_type);
                true
            })
            .await?;
        Ok(())
    }
}

/// Runs one handler's compensation and records its terminal status.
///
/// Returns the handler's error message alongside a `CompensationFailed`
/// outcome.
async fn run_compensation<S: StepStore>(
    store: S,
    validator: StepValidator,
    handler: Arc<dyn SagaHandler>,
    ctx: CompensationContext,
) -> Result<(CompensatedStep, Option<String>), SagaError> {
    let (status, error) = match handler.compensate(&ctx).await {
        Ok(()) => (StepStatus::Compensated, None),
        Err(e) => (StepStatus::CompensationFailed, Some(e.to_string())),
    };
    let recorded = record_transition(&store, &validator, ctx.step(), status).await?;
    tracing::debug!(
        step_type = %recorded.step_type,
        handler_type = %recorded.handler_type,
        %status,
        "step compensation finished"
    );
    Ok((
        CompensatedStep {
            step_type: recorded.step_type,
            handler_type: recorded.handler_type,
            status,
            error: error.clone(),
        },
        error,
    ))
}
