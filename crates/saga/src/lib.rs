//! Message-driven saga orchestration.
//!
//! Incoming messages are routed to registered [`SagaHandler`]s by the
//! [`SagaDispatcher`]. Every step a handler takes is recorded in a
//! [`step_store::StepStore`] after the [`StepValidator`] accepted the
//! transition, which makes redelivered messages idempotent. When a step
//! fails, the [`CompensationCoordinator`] rolls back the saga's completed
//! steps in reverse order.
//!
//! ```text
//! envelope ─► registry ─► pipeline (middleware … handler) ─► validator ─► store
//!                                                      └─ Failed ─► coordinator
//! ```

pub mod config;
pub mod context;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod message;
pub mod middleware;
pub mod registry;
pub mod serializer;
pub mod validator;

pub use config::{EngineConfig, RetryPolicy};
pub use context::{CancellationSignal, CompensationContext, InvocationContext};
pub use coordinator::{CompensatedStep, CompensationCoordinator, CompensationReport};
pub use dispatcher::{
    DispatchReport, Disposition, SagaDispatcher, SagaDispatcherBuilder, StepReport,
};
pub use error::{ConfigurationError, HandlerError, Result, SagaError, TransitionError};
pub use handler::{SagaHandler, StepOutcome};
pub use message::{Route, RoutingKey, SagaMessage};
pub use middleware::{
    LoggingMiddleware, MetricsMiddleware, Middleware, Next, Pipeline, PipelineBuilder,
    RetryMiddleware, TracingMiddleware,
};
pub use registry::{HandlerRegistry, HandlerRegistryBuilder};
pub use serializer::{JsonSerializer, SerializationContext, Serializer, SerializerError};
pub use validator::{
    StepTransition, StepValidator, TransitionVerdict, Validation, record_transition,
};
