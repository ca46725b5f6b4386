//! Per-invocation state handed to middleware and handlers.

use std::collections::BTreeMap;
use std::sync::Arc;

use common::{MessageEnvelope, MessageId, SagaId};
use step_store::SagaStepMetadata;
use tokio::sync::watch;

use crate::error::SagaError;
use crate::handler::SagaHandler;
use crate::message::SagaMessage;
use crate::serializer::{self, SerializationContext, Serializer};

/// Cooperative cancellation flag shared between a dispatch and its caller.
///
/// Clones observe the same flag. Cancelling is idempotent.
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl CancellationSignal {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolves once the signal has been cancelled.
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives as long as `self`, so the wait cannot fail.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancellationSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Context of one handler invocation as it travels through the pipeline.
pub struct InvocationContext {
    envelope: Arc<MessageEnvelope>,
    handler: Arc<dyn SagaHandler>,
    application_id: String,
    serializer: Arc<dyn Serializer>,
    cancellation: CancellationSignal,
    attempt: u32,
    last_error: Option<String>,
    properties: BTreeMap<String, String>,
}

impl InvocationContext {
    pub fn new(
        envelope: Arc<MessageEnvelope>,
        handler: Arc<dyn SagaHandler>,
        application_id: impl Into<String>,
        serializer: Arc<dyn Serializer>,
        cancellation: CancellationSignal,
    ) -> Self {
        Self {
            envelope,
            handler,
            application_id: application_id.into(),
            serializer,
            cancellation,
            attempt: 1,
            last_error: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn envelope(&self) -> &MessageEnvelope {
        &self.envelope
    }

    pub fn saga_id(&self) -> SagaId {
        self.envelope.saga_id
    }

    pub fn message_id(&self) -> MessageId {
        self.envelope.message_id
    }

    pub fn parent_message_id(&self) -> Option<MessageId> {
        self.envelope.parent_message_id
    }

    pub fn message_type(&self) -> &str {
        &self.envelope.message_type
    }

    pub fn handler_type(&self) -> &'static str {
        self.handler.handler_type()
    }

    pub(crate) fn handler(&self) -> Arc<dyn SagaHandler> {
        Arc::clone(&self.handler)
    }

    /// Application id of the engine processing the message.
    pub fn application_id(&self) -> &str {
        &self.application_id
    }

    pub fn cancellation(&self) -> &CancellationSignal {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// 1-based attempt number within the current dispatch.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn set_attempt(&mut self, attempt: u32) {
        self.attempt = attempt;
    }

    /// Error reported by the innermost failing layer of the last pass.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn set_last_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }

    pub fn clear_last_error(&mut self) {
        self.last_error = None;
    }

    /// Free-form values middleware can pass to inner layers and handlers.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    /// Decodes the payload as `M`.
    pub fn message<M: SagaMessage>(&self) -> Result<M, SagaError> {
        let context = SerializationContext::new(&self.envelope.application_id, M::MESSAGE_TYPE);
        Ok(serializer::decode(
            self.serializer.as_ref(),
            &self.envelope.payload,
            &context,
            &self.envelope.headers,
        )?)
    }
}

impl std::fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationContext")
            .field("saga_id", &self.envelope.saga_id)
            .field("message_id", &self.envelope.message_id)
            .field("message_type", &self.envelope.message_type)
            .field("handler_type", &self.handler_type())
            .field("attempt", &self.attempt)
            .field("last_error", &self.last_error)
            .finish()
    }
}

/// Context handed to [`SagaHandler::compensate`].
///
/// Compensation does not observe cancellation: once started it runs to a
/// terminal outcome.
pub struct CompensationContext {
    step: SagaStepMetadata,
    application_id: String,
    failure_reason: String,
    serializer: Arc<dyn Serializer>,
}

impl CompensationContext {
    pub fn new(
        step: SagaStepMetadata,
        application_id: impl Into<String>,
        failure_reason: impl Into<String>,
        serializer: Arc<dyn Serializer>,
    ) -> Self {
        Self {
            step,
            application_id: application_id.into(),
            failure_reason: failure_reason.into(),
            serializer,
        }
    }

    pub fn saga_id(&self) -> SagaId {
        self.step.saga_id
    }

    /// The step being rolled back.
    pub fn step(&self) -> &SagaStepMetadata {
        &self.step
    }

    pub fn application_id(&self) -> &str {
        &self.application_id
    }

    /// Why the saga is being compensated.
    pub fn failure_reason(&self) -> &str {
        &self.failure_reason
    }

    /// Decodes the payload the step was recorded with.
    pub fn message<M: SagaMessage>(&self) -> Result<M, SagaError> {
        let context = SerializationContext::for_message::<M>(&self.application_id);
        Ok(serializer::decode(
            self.serializer.as_ref(),
            &self.step.payload,
            &context,
            &self.serializer.headers_for(&self.step),
        )?)
    }
}
