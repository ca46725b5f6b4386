//! Message dispatch: routing, step bookkeeping and handler invocation.

use std::sync::Arc;

use async_trait::async_trait;
use common::MessageEnvelope;
use scheduler::{DueEntryHandler, ScheduledEntry};
use step_store::{
    MessageId, SagaId, SagaStepMetadata, SaveOptions, StepKey, StepStatus, StepStore,
    StepStoreError, StepStoreExt,
};

use crate::config::EngineConfig;
use crate::context::{CancellationSignal, InvocationContext};
use crate::coordinator::{CompensationCoordinator, CompensationReport};
use crate::error::{Result, SagaError};
use crate::handler::{SagaHandler, StepOutcome};
use crate::message::{Route, RoutingKey, SagaMessage};
use crate::middleware::Pipeline;
use crate::registry::HandlerRegistry;
use crate::serializer::{self, JsonSerializer, SerializationContext, Serializer};
use crate::validator::{StepTransition, StepValidator, record_transition};

/// What happened to one handler's step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    SagaCompleted,
    /// The handler reported a business failure; `compensation` lists the
    /// steps that were rolled back.
    Failed {
        reason: String,
        compensation: CompensationReport,
    },
    /// The message was already processed or is being processed; the handler
    /// was not invoked. `status` is the stored status.
    Duplicate { status: StepStatus },
    /// The saga had already failed; the step was recorded as cancelled and
    /// the handler was not invoked.
    Cancelled,
}

/// Result for one handler resolved for a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub step_type: String,
    pub handler_type: String,
    pub message_id: MessageId,
    pub disposition: Disposition,
}

impl StepReport {
    fn new(record: &SagaStepMetadata, disposition: Disposition) -> Self {
        Self {
            step_type: record.step_type.clone(),
            handler_type: record.handler_type.clone(),
            message_id: record.message_id,
            disposition,
        }
    }
}

/// Result of dispatching one message, one entry per resolved handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub saga_id: SagaId,
    pub message_id: MessageId,
    pub steps: Vec<StepReport>,
}

impl DispatchReport {
    /// Returns true if no handler was invoked because every step was a
    /// duplicate.
    pub fn is_duplicate(&self) -> bool {
        !self.steps.is_empty()
            && self
                .steps
                .iter()
                .all(|s| matches!(s.disposition, Disposition::Duplicate { .. }))
    }

    pub fn step(&self, handler_type: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.handler_type == handler_type)
    }
}

/// Routes messages to handlers and keeps the step records in step.
///
/// For every handler resolved for a message the dispatcher:
/// 1. validates and records the step as `Started` with a compare-and-write,
///    so only one of several concurrent deliveries invokes the handler, or
///    as `Cancelled` when the saga has already failed;
/// 2. runs the handler through the middleware pipeline;
/// 3. validates and records the reported outcome;
/// 4. on failure, hands the step to the compensation coordinator.
pub struct SagaDispatcher<S: StepStore + Clone + 'static> {
    store: S,
    registry: Arc<HandlerRegistry>,
    pipeline: Pipeline,
    validator: StepValidator,
    coordinator: CompensationCoordinator<S>,
    serializer: Arc<dyn Serializer>,
    config: EngineConfig,
}

impl<S: StepStore + Clone + 'static> SagaDispatcher<S> {
    pub fn builder(
        store: S,
        registry: impl Into<Arc<HandlerRegistry>>,
    ) -> SagaDispatcherBuilder<S> {
        SagaDispatcherBuilder {
            store,
            registry: registry.into(),
            pipeline: None,
            serializer: None,
            config: EngineConfig::default(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn serializer(&self) -> Arc<dyn Serializer> {
        Arc::clone(&self.serializer)
    }

    /// Dispatches an envelope to every handler registered for its route.
    pub async fn dispatch(&self, envelope: MessageEnvelope) -> Result<DispatchReport> {
        self.dispatch_with_cancellation(envelope, CancellationSignal::new())
            .await
    }

    /// Dispatches an envelope, observing `cancellation` before and between
    /// handler attempts.
    ///
    /// Handlers run in registration order; the first error stops the
    /// dispatch. Once a handler fails the saga, the remaining handlers are
    /// recorded as cancelled without running. Compensation started by a
    /// failure runs to completion even if `cancellation` fires.
    #[tracing::instrument(
        skip(self, envelope, cancellation),
        fields(
            saga_id = %envelope.saga_id,
            message_id = %envelope.message_id,
            message_type = %envelope.message_type
        )
    )]
    pub async fn dispatch_with_cancellation(
        &self,
        envelope: MessageEnvelope,
        cancellation: CancellationSignal,
    ) -> Result<DispatchReport> {
        metrics::counter!("saga_dispatch_total", "kind" => envelope.kind.as_str()).increment(1);

        let route = Route::of_envelope(&envelope);
        let handlers = self.registry.resolve(&route)?.to_vec();
        let envelope = Arc::new(envelope);

        self.store
            .update_saga_data(envelope.saga_id, |_| false)
            .await?;

        let mut steps = Vec::with_capacity(handlers.len());
        for handler in handlers {
            if cancellation.is_cancelled() {
                return Err(SagaError::Cancelled);
            }
            steps.push(self.dispatch_to(&envelope, handler, &cancellation).await?);
        }

        Ok(DispatchReport {
            saga_id: envelope.saga_id,
            message_id: envelope.message_id,
            steps,
        })
    }

    /// Encodes and dispatches a typed message.
    pub async fn dispatch_message<M: SagaMessage>(
        &self,
        saga_id: SagaId,
        parent_message_id: Option<MessageId>,
        message: &M,
    ) -> Result<DispatchReport> {
        let envelope = self.envelope_for(saga_id, parent_message_id, message)?;
        self.dispatch(envelope).await
    }

    /// Encodes and dispatches a response `R` to a command `C`.
    ///
    /// `parent_message_id` is the id of the command being answered.
    pub async fn dispatch_response<C: SagaMessage, R: SagaMessage>(
        &self,
        saga_id: SagaId,
        parent_message_id: MessageId,
        response: &R,
    ) -> Result<DispatchReport> {
        let envelope = self.response_envelope_for::<C, R>(saga_id, parent_message_id, response)?;
        self.dispatch(envelope).await
    }

    /// Builds the envelope for a typed message without dispatching it.
    pub fn envelope_for<M: SagaMessage>(
        &self,
        saga_id: SagaId,
        parent_message_id: Option<MessageId>,
        message: &M,
    ) -> Result<MessageEnvelope> {
        let key = RoutingKey::of::<M>()?;
        let context = SerializationContext::new(key.application_id(), M::MESSAGE_TYPE);
        let (payload, headers) = serializer::encode(self.serializer.as_ref(), message, &context)?;
        Ok(MessageEnvelope::builder()
            .saga_id(saga_id)
            .parent_message_id(parent_message_id)
            .message_type(M::MESSAGE_TYPE)
            .kind(M::KIND)
            .application_id(key.application_id())
            .payload(payload)
            .headers(headers)
            .build())
    }

    /// Builds the envelope for a response `R` to a command `C`.
    pub fn response_envelope_for<C: SagaMessage, R: SagaMessage>(
        &self,
        saga_id: SagaId,
        parent_message_id: MessageId,
        response: &R,
    ) -> Result<MessageEnvelope> {
        RoutingKey::of::<C>()?;
        let key = RoutingKey::of::<R>()?;
        let context = SerializationContext::new(key.application_id(), R::MESSAGE_TYPE);
        let (payload, headers) =
            serializer::encode(self.serializer.as_ref(), response, &context)?;
        Ok(MessageEnvelope::builder()
            .saga_id(saga_id)
            .parent_message_id(Some(parent_message_id))
            .message_type(R::MESSAGE_TYPE)
            .response_to(C::MESSAGE_TYPE)
            .application_id(key.application_id())
            .payload(payload)
            .headers(headers)
            .build())
    }

    /// Abandons every step of a saga that is still `Started` or `Failed`.
    ///
    /// Returns the number of steps cancelled.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_saga(&self, saga_id: SagaId) -> Result<usize> {
        let open: Vec<_> = self
            .store
            .query_by_saga(saga_id)
            .await?
            .into_iter()
            .filter(|s| matches!(s.status, StepStatus::Started | StepStatus::Failed))
            .collect();
        for step in &open {
            record_transition(&self.store, &self.validator, step, StepStatus::Cancelled).await?;
        }
        if !open.is_empty() {
            metrics::counter!("saga_steps_cancelled_total").increment(open.len() as u64);
            tracing::info!(cancelled = open.len(), "saga steps cancelled");
        }
        Ok(open.len())
    }

    async fn dispatch_to(
        &self,
        envelope: &Arc<MessageEnvelope>,
        handler: Arc<dyn SagaHandler>,
        cancellation: &CancellationSignal,
    ) -> Result<StepReport> {
        let key = StepKey::new(
            envelope.saga_id,
            envelope.message_type.as_str(),
            handler.handler_type(),
            envelope.message_id,
        );
        let existing = self.store.get(&key).await?;

        // A redelivery is checked against the status already stored, so a
        // finished step yields Idempotent instead of an invalid restart.
        let requested = match &existing {
            Some(record) if record.status != StepStatus::Started => record.status,
            _ => StepStatus::Started,
        };
        let transition = StepTransition::new(
            key,
            envelope.parent_message_id,
            requested,
            envelope.payload.clone(),
        );
        let validation = self
            .validator
            .validate_with(&self.store, &transition, existing)
            .await?;
        if let Err(e) = validation.verdict.ensure_accepted(&transition) {
            let error = SagaError::from(e);
            metrics::counter!("saga_transitions_rejected_total", "reason" => error.kind())
                .increment(1);
            tracing::warn!(step = %transition.key, error = %error, "step transition rejected");
            return Err(error);
        }

        let saga_failed = match &validation.existing {
            Some(record) if record.status != StepStatus::Started => false,
            _ => self
                .store
                .get_saga_data(envelope.saga_id)
                .await?
                .is_some_and(|data| data.is_failed()),
        };

        let record = match validation.existing {
            None => {
                let status = if saga_failed {
                    StepStatus::Cancelled
                } else {
                    StepStatus::Started
                };
                let record = SagaStepMetadata::new(
                    transition.key,
                    transition.parent_message_id,
                    status,
                    transition.payload,
                );
                match self
                    .store
                    .save(record.clone(), SaveOptions::expect_new())
                    .await
                {
                    Ok(()) if saga_failed => return Ok(self.cancelled(&record)),
                    Ok(()) => record,
                    Err(StepStoreError::Conflict { actual, .. }) => {
                        tracing::debug!(step = %record.key(), "concurrent delivery won the step");
                        metrics::counter!("saga_duplicate_deliveries_total").increment(1);
                        let status = actual.unwrap_or(StepStatus::Started);
                        return Ok(StepReport::new(&record, Disposition::Duplicate { status }));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Some(record) if record.status == StepStatus::Started => {
                if saga_failed {
                    let cancelled = record_transition(
                        &self.store,
                        &self.validator,
                        &record,
                        StepStatus::Cancelled,
                    )
                    .await?;
                    return Ok(self.cancelled(&cancelled));
                }
                tracing::info!(step = %record.key(), "resuming step left in Started");
                record
            }
            Some(record) => {
                metrics::counter!("saga_duplicate_deliveries_total").increment(1);
                tracing::debug!(step = %record.key(), status = %record.status, "duplicate delivery");
                if record.status == StepStatus::Failed {
                    // Finishes a compensation interrupted by an earlier crash.
                    self.coordinator
                        .compensate(&record, "redelivery of failed step")
                        .await?;
                }
                let status = record.status;
                return Ok(StepReport::new(&record, Disposition::Duplicate { status }));
            }
        };

        self.invoke(envelope, handler, record, cancellation).await
    }

    fn cancelled(&self, record: &SagaStepMetadata) -> StepReport {
        metrics::counter!("saga_steps_cancelled_total").increment(1);
        tracing::info!(step = %record.key(), "saga already failed, step cancelled without running");
        StepReport::new(record, Disposition::Cancelled)
    }

    async fn invoke(
        &self,
        envelope: &Arc<MessageEnvelope>,
        handler: Arc<dyn SagaHandler>,
        record: SagaStepMetadata,
        cancellation: &CancellationSignal,
    ) -> Result<StepReport> {
        let mut ctx = InvocationContext::new(
            Arc::clone(envelope),
            handler,
            self.config.application_id.clone(),
            Arc::clone(&self.serializer),
            cancellation.clone(),
        );

        match self.pipeline.invoke(&mut ctx).await {
            Ok(outcome) => self.apply_outcome(record, outcome).await,
            Err(e) if e.is_retryable() => {
                tracing::warn!(step = %record.key(), error = %e, "step left Started for redelivery");
                Err(e)
            }
            Err(e) => {
                let reason = e.to_string();
                let failed =
                    record_transition(&self.store, &self.validator, &record, StepStatus::Failed)
                        .await?;
                let report = self.coordinator.compensate(&failed, &reason).await?;
                tracing::error!(
                    step = %failed.key(),
                    error = %e,
                    compensated = report.compensated(),
                    compensation_failures = report.failed(),
                    "step failed with a fatal error"
                );
                Err(e)
            }
        }
    }

    async fn apply_outcome(
        &self,
        record: SagaStepMetadata,
        outcome: StepOutcome,
    ) -> Result<StepReport> {
        let recorded =
            record_transition(&self.store, &self.validator, &record, outcome.status()).await?;

        let disposition = match outcome {
            StepOutcome::Completed => Disposition::Completed,
            StepOutcome::SagaCompleted => {
                let data = self
                    .store
                    .update_saga_data(recorded.saga_id, |data| data.mark_completed())
                    .await?;
                if data.is_completed {
                    metrics::counter!("saga_completed_total").increment(1);
                    tracing::info!(saga_id = %recorded.saga_id, "saga completed");
                } else {
                    tracing::warn!(
                        saga_id = %recorded.saga_id,
                        "saga already failed, completion not recorded"
                    );
                }
                Disposition::SagaCompleted
            }
            StepOutcome::Failed { reason } => {
                metrics::counter!("saga_failed_total").increment(1);
                let compensation = self.coordinator.compensate(&recorded, &reason).await?;
                Disposition::Failed {
                    reason,
                    compensation,
                }
            }
        };
        Ok(StepReport::new(&recorded, disposition))
    }
}

#[async_trait]
impl<S: StepStore + Clone + 'static> DueEntryHandler for SagaDispatcher<S> {
    type Error = SagaError;

    async fn handle_due(&self, entry: &ScheduledEntry) -> Result<()> {
        self.dispatch(entry.envelope.clone()).await.map(|_| ())
    }

    fn is_retryable(&self, error: &SagaError) -> bool {
        error.is_retryable()
    }
}

/// Builder for [`SagaDispatcher`].
pub struct SagaDispatcherBuilder<S: StepStore + Clone + 'static> {
    store: S,
    registry: Arc<HandlerRegistry>,
    pipeline: Option<Pipeline>,
    serializer: Option<Arc<dyn Serializer>>,
    config: EngineConfig,
}

impl<S: StepStore + Clone + 'static> SagaDispatcherBuilder<S> {
    /// Sets the middleware pipeline. Defaults to [`Pipeline::standard`].
    pub fn pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// Sets the serializer. Defaults to [`JsonSerializer`].
    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> SagaDispatcher<S> {
        let serializer = self
            .serializer
            .unwrap_or_else(|| Arc::new(JsonSerializer::new()));
        let pipeline = self
            .pipeline
            .unwrap_or_else(|| Pipeline::standard(&self.config.retry));
        let validator = StepValidator::new(self.config.max_chain_depth);
        let coordinator = CompensationCoordinator::new(
            self.store.clone(),
            Arc::clone(&self.registry),
            validator,
            Arc::clone(&serializer),
            self.config.application_id.clone(),
        );
        SagaDispatcher {
            store: self.store,
            registry: self.registry,
            pipeline,
            validator,
            coordinator,
            serializer,
            config: self.config,
        }
    }
}
