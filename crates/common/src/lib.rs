//! Shared types for the saga engine crates.
//!
//! Identifiers are UUID newtypes so a saga id can never be passed where a
//! message id is expected. The [`MessageEnvelope`] is the unit the transport
//! hands to the dispatcher and the scheduler hands back when an entry is due.

pub mod envelope;
pub mod health;
pub mod types;

pub use envelope::{Headers, MessageEnvelope, MessageKind};
pub use health::{HealthCheck, ping_all};
pub use types::{MessageId, SagaId, ScheduleId};
