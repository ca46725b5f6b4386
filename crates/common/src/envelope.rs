use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{MessageId, SagaId};

/// Transport headers attached to a message.
///
/// Ordered so that serialized envelopes are stable.
pub type Headers = BTreeMap<String, String>;

/// What role a message plays in a saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// An instruction addressed to one service.
    Command,
    /// A fact that any number of reactive handlers may observe.
    Event,
    /// The reply to a previously sent command.
    Response,
}

impl MessageKind {
    /// Returns the kind name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Command => "command",
            MessageKind::Event => "event",
            MessageKind::Response => "response",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A serialized message together with the saga identity it travels under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Identity of this message instance. Redeliveries keep it.
    pub message_id: MessageId,

    /// The message that caused this one; `None` for the root step of a saga.
    pub parent_message_id: Option<MessageId>,

    /// The saga run this message belongs to.
    pub saga_id: SagaId,

    /// Type name of the payload (e.g. "CreateOrderCommand").
    pub message_type: String,

    /// For responses, the type name of the command being answered.
    pub response_to: Option<String>,

    pub kind: MessageKind,

    /// Application that owns the message type.
    pub application_id: String,

    /// Encoded payload bytes as produced by the serializer.
    pub payload: Vec<u8>,

    pub headers: Headers,

    /// When the envelope was created.
    pub created_at: DateTime<Utc>,
}

impl MessageEnvelope {
    /// Creates a new envelope builder.
    pub fn builder() -> MessageEnvelopeBuilder {
        MessageEnvelopeBuilder::default()
    }

    /// Returns true if this message starts a saga.
    pub fn is_root(&self) -> bool {
        self.parent_message_id.is_none()
    }
}

/// Builder for constructing message envelopes.
#[derive(Debug, Default)]
pub struct MessageEnvelopeBuilder {
    message_id: Option<MessageId>,
    parent_message_id: Option<MessageId>,
    saga_id: Option<SagaId>,
    message_type: Option<String>,
    response_to: Option<String>,
    kind: Option<MessageKind>,
    application_id: Option<String>,
    payload: Option<Vec<u8>>,
    headers: Headers,
    created_at: Option<DateTime<Utc>>,
}

impl MessageEnvelopeBuilder {
    /// Sets the message ID. If not set, a new ID will be generated.
    pub fn message_id(mut self, id: MessageId) -> Self {
        self.message_id = Some(id);
        self
    }

    /// Sets the parent message ID.
    pub fn parent_message_id(mut self, id: Option<MessageId>) -> Self {
        self.parent_message_id = id;
        self
    }

    pub fn saga_id(mut self, id: SagaId) -> Self {
        self.saga_id = Some(id);
        self
    }

    pub fn message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    /// Marks the envelope as a response to the given command type.
    pub fn response_to(mut self, command_type: impl Into<String>) -> Self {
        self.response_to = Some(command_type.into());
        self.kind = Some(MessageKind::Response);
        self
    }

    /// Sets the message kind. Defaults to [`MessageKind::Command`].
    pub fn kind(mut self, kind: MessageKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn application_id(mut self, application_id: impl Into<String>) -> Self {
        self.application_id = Some(application_id.into());
        self
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Adds a header entry.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Replaces all headers.
    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Sets the creation time. If not set, the current time will be used.
    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Builds the envelope.
    ///
    /// # Panics
    ///
    /// Panics if saga_id, message_type, application_id or payload is not set.
    pub fn build(self) -> MessageEnvelope {
        self.try_build()
            .expect("saga_id, message_type, application_id and payload are required")
    }

    /// Tries to build the envelope, returning None if required fields are missing.
    pub fn try_build(self) -> Option<MessageEnvelope> {
        Some(MessageEnvelope {
            message_id: self.message_id.unwrap_or_default(),
            parent_message_id: self.parent_message_id,
            saga_id: self.saga_id?,
            message_type: self.message_type?,
            response_to: self.response_to,
            kind: self.kind.unwrap_or(MessageKind::Command),
            application_id: self.application_id?,
            payload: self.payload?,
            headers: self.headers,
            created_at: self.created_at.unwrap_or_else(Utc::now),
        })
    }
}
