//! Saga error types.

use scheduler::ScheduleError;
use step_store::{MessageId, StepKey, StepStatus, StepStoreError};
use thiserror::Error;

use crate::serializer::SerializerError;

/// A reported step transition the validator refused.
///
/// These indicate a logic or data-integrity defect and are never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// Same key and status were already recorded with another payload.
    #[error("Step {key} already recorded as {status} with a different payload")]
    DuplicateWithDifferentPayload { key: StepKey, status: StepStatus },

    /// The requested status is not reachable from the stored one.
    #[error("Step {key} cannot move from {from} to {to}")]
    InvalidTransition {
        key: StepKey,
        from: StepStatus,
        to: StepStatus,
    },

    /// Following the parent chain of the step leads back to the step itself.
    #[error("Step {key} closes a circular parent chain ({} hops)", .chain.len().saturating_sub(1))]
    CircularChain { key: StepKey, chain: Vec<MessageId> },
}

/// Wiring mistakes detected at startup or on first use.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// A message type is missing its application id declaration.
    #[error("Message type {message_type} does not declare an application id")]
    MissingApplicationId { message_type: &'static str },

    /// Nothing is registered for the route of an incoming message.
    #[error("No handler registered for {route}")]
    UnregisteredRoute { route: String },

    /// A step references a handler type unknown to the registry.
    #[error("Unknown handler type: {0}")]
    UnknownHandler(String),

    /// The same handler type was registered twice for one route.
    #[error("Handler {handler_type} registered twice for {route}")]
    DuplicateHandler { handler_type: String, route: String },

    /// Two different handler instances claim the same handler type name.
    #[error("Handler type {0} is claimed by two different handlers")]
    ConflictingHandlerType(String),
}

/// Infrastructure failure raised by a handler.
///
/// Business failures are not errors; handlers report them as
/// [`crate::StepOutcome::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// May succeed on redelivery (timeouts, unavailable dependencies).
    #[error("transient: {0}")]
    Transient(String),

    /// Will fail again; the step is recorded as failed and compensated.
    #[error("fatal: {0}")]
    Fatal(String),

    /// The handler observed the cancellation signal and stopped.
    #[error("cancelled")]
    Cancelled,
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        HandlerError::Transient(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        HandlerError::Fatal(message.into())
    }

    /// Returns true if redelivering the message may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, HandlerError::Transient(_) | HandlerError::Cancelled)
    }
}

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The validator refused a transition.
    #[error("Transition rejected: {0}")]
    Transition(#[from] TransitionError),

    /// Wiring error.
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// A handler raised an infrastructure error.
    #[error("Handler {handler_type} failed: {source}")]
    Handler {
        handler_type: String,
        #[source]
        source: HandlerError,
    },

    /// Step store error.
    #[error("Step store error: {0}")]
    Store(#[from] StepStoreError),

    /// Serializer error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializerError),

    /// Schedule store error.
    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    /// The dispatch was cancelled before the handler ran to completion.
    #[error("Dispatch cancelled")]
    Cancelled,
}

impl SagaError {
    /// Returns true if the transport should redeliver the message.
    ///
    /// Transition and configuration errors are never retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            SagaError::Handler { source, .. } => source.is_transient(),
            SagaError::Store(e) => e.is_transient(),
            SagaError::Schedule(ScheduleError::Database(_)) => true,
            SagaError::Cancelled => true,
            SagaError::Transition(_)
            | SagaError::Configuration(_)
            | SagaError::Serialization(_)
            | SagaError::Schedule(_) => false,
        }
    }

    /// Returns true if a handler raised a transient error.
    pub fn is_transient_handler_error(&self) -> bool {
        matches!(self, SagaError::Handler { source, .. } if matches!(source, HandlerError::Transient(_)))
    }

    /// Short label used in metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            SagaError::Transition(TransitionError::DuplicateWithDifferentPayload { .. }) => {
                "duplicate_payload"
            }
            SagaError::Transition(TransitionError::InvalidTransition { .. }) => {
                "invalid_transition"
            }
            SagaError::Transition(TransitionError::CircularChain { .. }) => "circular_chain",
            SagaError::Configuration(_) => "configuration",
            SagaError::Handler { .. } => "handler",
            SagaError::Store(_) => "store",
            SagaError::Serialization(_) => "serialization",
            SagaError::Schedule(_) => "schedule",
            SagaError::Cancelled => "cancelled",
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;

#[cfg(test)]
mod tests {
    use super::*;
    use step_store::SagaId;

    fn key() -> StepKey {
        StepKey::new(SagaId::new(), "CreateOrder", "CreateOrderHandler", MessageId::new())
    }

    #[test]
    fn test_transition_errors_are_fatal() {
        let errors = [
            TransitionError::DuplicateWithDifferentPayload {
                key: key(),
                status: StepStatus::Completed,
            },
            TransitionError::InvalidTransition {
                key: key(),
                from: StepStatus::Compensated,
                to: StepStatus::Started,
            },
            TransitionError::CircularChain {
                key: key(),
                chain: vec![MessageId::new(), MessageId::new()],
            },
        ];
        for error in errors {
            assert!(!SagaError::from(error).is_retryable());
        }
    }

    #[test]
    fn test_handler_error_classification() {
        let transient = SagaError::Handler {
            handler_type: "PaymentHandler".into(),
            source: HandlerError::transient("gateway timeout"),
        };
        let fatal = SagaError::Handler {
            handler_type: "PaymentHandler".into(),
            source: HandlerError::fatal("schema mismatch"),
        };
        assert!(transient.is_retryable());
        assert!(transient.is_transient_handler_error());
        assert!(!fatal.is_retryable());
        assert!(!fatal.is_transient_handler_error());
    }

    #[test]
    fn test_store_unavailability_is_retryable() {
        let err = SagaError::from(StepStoreError::Unavailable("down".into()));
        assert!(err.is_retryable());
        assert_eq!(err.kind(), "store");
    }

    #[test]
    fn test_configuration_errors_are_fatal() {
        let err = SagaError::from(ConfigurationError::MissingApplicationId {
            message_type: "CreateOrderCommand",
        });
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("CreateOrderCommand"));
    }
}
