//! Message serialization contract.
//!
//! The engine never inspects payload bytes itself. It hands values to a
//! [`Serializer`] together with a [`SerializationContext`] and stores whatever
//! bytes come back, so the byte-for-byte payload comparison of the step
//! validator is only as stable as the serializer's output.

use std::time::Duration;

use async_trait::async_trait;
use common::{HealthCheck, Headers};
use step_store::SagaStepMetadata;
use thiserror::Error;

use crate::message::SagaMessage;

pub const CONTENT_TYPE_HEADER: &str = "content-type";
pub const MESSAGE_TYPE_HEADER: &str = "message-type";
pub const APPLICATION_ID_HEADER: &str = "application-id";
pub const SAGA_ID_HEADER: &str = "saga-id";
pub const MESSAGE_ID_HEADER: &str = "message-id";
pub const STEP_STATUS_HEADER: &str = "step-status";

const JSON_CONTENT_TYPE: &str = "application/json";

/// Errors raised while encoding or decoding payloads.
#[derive(Debug, Error)]
pub enum SerializerError {
    #[error("failed to encode {type_name}: {reason}")]
    Encode { type_name: String, reason: String },

    #[error("failed to decode {type_name}: {reason}")]
    Decode { type_name: String, reason: String },

    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),
}

/// Identifies what is being serialized and for whom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializationContext {
    pub application_id: String,
    pub type_name: String,
}

impl SerializationContext {
    pub fn new(application_id: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            application_id: application_id.into(),
            type_name: type_name.into(),
        }
    }

    /// Context for a typed message, using its declared owner when present.
    pub fn for_message<M: SagaMessage>(fallback_application_id: &str) -> Self {
        Self::new(
            M::APPLICATION_ID.unwrap_or(fallback_application_id),
            M::MESSAGE_TYPE,
        )
    }
}

/// Pluggable encoding of message payloads and transport headers.
pub trait Serializer: Send + Sync {
    /// Encodes a value, returning the payload bytes and the headers that
    /// describe them.
    fn serialize(
        &self,
        value: &serde_json::Value,
        context: &SerializationContext,
    ) -> Result<(Vec<u8>, Headers), SerializerError>;

    /// Decodes payload bytes produced by [`Serializer::serialize`].
    fn deserialize(
        &self,
        payload: &[u8],
        context: &SerializationContext,
        headers: &Headers,
    ) -> Result<serde_json::Value, SerializerError>;

    /// Headers describing a persisted step, attached to messages it emits.
    fn headers_for(&self, step: &SagaStepMetadata) -> Headers;

    /// Maps transport-specific header spellings onto the canonical names.
    fn normalize_headers(&self, transport: &Headers) -> Headers;
}

/// Encodes a typed message through a serializer.
pub fn encode<M: SagaMessage>(
    serializer: &dyn Serializer,
    message: &M,
    context: &SerializationContext,
) -> Result<(Vec<u8>, Headers), SerializerError> {
    let value = serde_json::to_value(message).map_err(|e| SerializerError::Encode {
        type_name: context.type_name.clone(),
        reason: e.to_string(),
    })?;
    serializer.serialize(&value, context)
}

/// Decodes a typed message through a serializer.
pub fn decode<M: SagaMessage>(
    serializer: &dyn Serializer,
    payload: &[u8],
    context: &SerializationContext,
    headers: &Headers,
) -> Result<M, SerializerError> {
    let value = serializer.deserialize(payload, context, headers)?;
    serde_json::from_value(value).map_err(|e| SerializerError::Decode {
        type_name: context.type_name.clone(),
        reason: e.to_string(),
    })
}

/// JSON serializer using `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl Serializer for JsonSerializer {
    fn serialize(
        &self,
        value: &serde_json::Value,
        context: &SerializationContext,
    ) -> Result<(Vec<u8>, Headers), SerializerError> {
        let payload = serde_json::to_vec(value).map_err(|e| SerializerError::Encode {
            type_name: context.type_name.clone(),
            reason: e.to_string(),
        })?;

        let mut headers = Headers::new();
        headers.insert(CONTENT_TYPE_HEADER.into(), JSON_CONTENT_TYPE.into());
        headers.insert(MESSAGE_TYPE_HEADER.into(), context.type_name.clone());
        headers.insert(APPLICATION_ID_HEADER.into(), context.application_id.clone());
        Ok((payload, headers))
    }

    fn deserialize(
        &self,
        payload: &[u8],
        context: &SerializationContext,
        headers: &Headers,
    ) -> Result<serde_json::Value, SerializerError> {
        let headers = self.normalize_headers(headers);
        if let Some(content_type) = headers.get(CONTENT_TYPE_HEADER) {
            if !content_type.starts_with(JSON_CONTENT_TYPE) {
                return Err(SerializerError::UnsupportedContentType(
                    content_type.clone(),
                ));
            }
        }
        serde_json::from_slice(payload).map_err(|e| SerializerError::Decode {
            type_name: context.type_name.clone(),
            reason: e.to_string(),
        })
    }

    fn headers_for(&self, step: &SagaStepMetadata) -> Headers {
        let mut headers = Headers::new();
        headers.insert(SAGA_ID_HEADER.into(), step.saga_id.to_string());
        headers.insert(MESSAGE_ID_HEADER.into(), step.message_id.to_string());
        headers.insert(MESSAGE_TYPE_HEADER.into(), step.step_type.clone());
        headers.insert(STEP_STATUS_HEADER.into(), step.status.to_string());
        headers
    }

    fn normalize_headers(&self, transport: &Headers) -> Headers {
        transport
            .iter()
            .map(|(key, value)| {
                let key = key.trim().to_ascii_lowercase().replace('_', "-");
                (key, value.trim().to_string())
            })
            .collect()
    }
}

#[async_trait]
impl HealthCheck for JsonSerializer {
    fn name(&self) -> &'static str {
        "serializer"
    }

    async fn ping(&self, _timeout: Duration) -> bool {
        let context = SerializationContext::new("health", "Ping");
        let sample = serde_json::json!({ "ping": true });
        self.serialize(&sample, &context)
            .and_then(|(payload, headers)| self.deserialize(&payload, &context, &headers))
            .is_ok_and(|value| value == sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{MessageId, SagaId};
    use serde::{Deserialize, Serialize};
    use step_store::{StepKey, StepStatus};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct ProcessPayment {
        order_id: String,
        amount_cents: u64,
    }

    impl SagaMessage for ProcessPayment {
        const MESSAGE_TYPE: &'static str = "ProcessPayment";
        const APPLICATION_ID: Option<&'static str> = Some("payments");
    }

    #[test]
    fn test_json_headers_describe_payload() {
        let serializer = JsonSerializer::new();
        let context = SerializationContext::for_message::<ProcessPayment>("orders");
        let message = ProcessPayment {
            order_id: "o-1".into(),
            amount_cents: 4_200,
        };

        let (payload, headers) = encode(&serializer, &message, &context).unwrap();
        assert_eq!(headers[CONTENT_TYPE_HEADER], "application/json");
        assert_eq!(headers[MESSAGE_TYPE_HEADER], "ProcessPayment");
        assert_eq!(headers[APPLICATION_ID_HEADER], "payments");

        let decoded: ProcessPayment = decode(&serializer, &payload, &context, &headers).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_same_value_encodes_to_same_bytes() {
        let serializer = JsonSerializer::new();
        let context = SerializationContext::new("payments", "ProcessPayment");
        let value = serde_json::json!({ "b": 1, "a": [1, 2] });
        let (first, _) = serializer.serialize(&value, &context).unwrap();
        let (second, _) = serializer.serialize(&value, &context).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_normalize_headers() {
        let serializer = JsonSerializer::new();
        let mut transport = Headers::new();
        transport.insert("Content_Type".into(), " application/json ".into());
        transport.insert("Message-Type".into(), "ProcessPayment".into());

        let normalized = serializer.normalize_headers(&transport);
        assert_eq!(normalized["content-type"], "application/json");
        assert_eq!(normalized["message-type"], "ProcessPayment");
    }

    #[test]
    fn test_rejects_foreign_content_type() {
        let serializer = JsonSerializer::new();
        let context = SerializationContext::new("payments", "ProcessPayment");
        let mut headers = Headers::new();
        headers.insert("Content-Type".into(), "application/protobuf".into());
        assert!(matches!(
            serializer.deserialize(b"{}", &context, &headers),
            Err(SerializerError::UnsupportedContentType(_))
        ));
    }

    #[test]
    fn test_headers_for_step() {
        let serializer = JsonSerializer::new();
        let key = StepKey::new(SagaId::new(), "ProcessPayment", "PaymentHandler", MessageId::new());
        let step = step_store::SagaStepMetadata::new(key.clone(), None, StepStatus::Completed, vec![]);

        let headers = serializer.headers_for(&step);
        assert_eq!(headers[SAGA_ID_HEADER], key.saga_id.to_string());
        assert_eq!(headers[STEP_STATUS_HEADER], "Completed");
    }

    #[tokio::test]
    async fn test_health_check_round_trips_sample() {
        assert!(JsonSerializer::new().ping(Duration::from_millis(10)).await);
    }
}
