//! Typed saga messages and the routes they are dispatched on.

use common::{MessageEnvelope, MessageKind};
use serde::{Serialize, de::DeserializeOwned};

use crate::error::ConfigurationError;

/// A message type that can drive a saga step.
///
/// `APPLICATION_ID` names the application that owns the message. It has no
/// default value that passes registration: a type that does not declare it
/// is rejected with [`ConfigurationError::MissingApplicationId`].
pub trait SagaMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Logical type name, also used as the step type of records it produces.
    const MESSAGE_TYPE: &'static str;

    /// Owning application.
    const APPLICATION_ID: Option<&'static str> = None;

    const KIND: MessageKind = MessageKind::Command;
}

/// Transport routing key of a message type: `{application_id}.{message_type}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingKey {
    application_id: &'static str,
    message_type: &'static str,
}

impl RoutingKey {
    /// Builds the routing key of `M`, failing if it declares no application id.
    pub fn of<M: SagaMessage>() -> Result<Self, ConfigurationError> {
        let application_id = M::APPLICATION_ID
            .filter(|id| !id.trim().is_empty())
            .ok_or(ConfigurationError::MissingApplicationId {
                message_type: M::MESSAGE_TYPE,
            })?;
        Ok(Self {
            application_id,
            message_type: M::MESSAGE_TYPE,
        })
    }

    pub fn application_id(&self) -> &'static str {
        self.application_id
    }

    pub fn message_type(&self) -> &'static str {
        self.message_type
    }
}

impl std::fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.application_id, self.message_type)
    }
}

/// Dispatch route of an incoming envelope.
///
/// Responses are routed by the pair of the command they answer and their own
/// type, so one response type can be handled differently per command.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Route {
    Message(String),
    Response { command: String, response: String },
}

impl Route {
    pub fn message<M: SagaMessage>() -> Self {
        Route::Message(M::MESSAGE_TYPE.to_string())
    }

    pub fn response<C: SagaMessage, R: SagaMessage>() -> Self {
        Route::Response {
            command: C::MESSAGE_TYPE.to_string(),
            response: R::MESSAGE_TYPE.to_string(),
        }
    }

    /// Derives the route from envelope metadata.
    pub fn of_envelope(envelope: &MessageEnvelope) -> Self {
        match (&envelope.kind, &envelope.response_to) {
            (MessageKind::Response, Some(command)) => Route::Response {
                command: command.clone(),
                response: envelope.message_type.clone(),
            },
            _ => Route::Message(envelope.message_type.clone()),
        }
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Route::Message(message_type) => write!(f, "{message_type}"),
            Route::Response { command, response } => write!(f, "{command}->{response}"),
        }
    }
}
