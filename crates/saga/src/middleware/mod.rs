//! Handler invocation pipeline.
//!
//! Middleware wrap the handler invocation in registration order, outermost
//! first. The chain is folded into nested layers once, when the pipeline is
//! built; invoking it allocates nothing per layer.
//!
//! ```text
//! Pipeline::builder()
//!     .with(LoggingMiddleware)       // outermost
//!     .with(RetryMiddleware::default())
//!     .build()                       // handler is innermost
//! ```

mod logging;
mod retry;
mod span;
mod telemetry;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::RetryPolicy;
use crate::context::InvocationContext;
use crate::error::SagaError;
use crate::handler::StepOutcome;

pub use logging::LoggingMiddleware;
pub use retry::RetryMiddleware;
pub use span::TracingMiddleware;
pub use telemetry::MetricsMiddleware;

/// A layer around handler invocation.
///
/// Implementations call `next.run(ctx)` to continue the chain, or return
/// without calling it to short-circuit.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Label reported by [`Pipeline::layers`].
    fn name(&self) -> &'static str {
        "custom"
    }

    async fn handle(
        &self,
        ctx: &mut InvocationContext,
        next: Next<'_>,
    ) -> Result<StepOutcome, SagaError>;
}

#[async_trait]
trait Invoke: Send + Sync {
    async fn invoke(&self, ctx: &mut InvocationContext) -> Result<StepOutcome, SagaError>;
}

/// Innermost layer: the handler itself.
struct HandlerInvoke;

#[async_trait]
impl Invoke for HandlerInvoke {
    async fn invoke(&self, ctx: &mut InvocationContext) -> Result<StepOutcome, SagaError> {
        if ctx.is_cancelled() {
            return Err(SagaError::Cancelled);
        }
        let handler = ctx.handler();
        let handler_type = handler.handler_type();
        handler
            .handle(ctx)
            .await
            .map_err(|source| SagaError::Handler {
                handler_type: handler_type.to_string(),
                source,
            })
    }
}

struct Layer {
    middleware: Arc<dyn Middleware>,
    next: Arc<dyn Invoke>,
}

#[async_trait]
impl Invoke for Layer {
    async fn invoke(&self, ctx: &mut InvocationContext) -> Result<StepOutcome, SagaError> {
        self.middleware
            .handle(
                ctx,
                Next {
                    inner: self.next.as_ref(),
                },
            )
            .await
    }
}

/// The remainder of the chain below a middleware.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    inner: &'a dyn Invoke,
}

impl Next<'_> {
    /// Invokes the rest of the chain.
    ///
    /// A failing result is recorded in the context's `last_error` before it
    /// is returned; a success clears it.
    pub async fn run(&self, ctx: &mut InvocationContext) -> Result<StepOutcome, SagaError> {
        let result = self.inner.invoke(ctx).await;
        match &result {
            Ok(_) => ctx.clear_last_error(),
            Err(e) => ctx.set_last_error(e.to_string()),
        }
        result
    }
}

/// A composed middleware chain ending in the handler.
#[derive(Clone)]
pub struct Pipeline {
    entry: Arc<dyn Invoke>,
    layers: Vec<&'static str>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Pipeline with no middleware.
    pub fn empty() -> Self {
        PipelineBuilder::default().build()
    }

    /// Logging outermost, then the span, metrics, and in-process retry
    /// around the handler.
    pub fn standard(retry: &RetryPolicy) -> Self {
        Self::builder()
            .with(LoggingMiddleware)
            .with(TracingMiddleware)
            .with(MetricsMiddleware)
            .with(RetryMiddleware::from_policy(retry))
            .build()
    }

    /// Number of middleware layers.
    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    /// Layer names, outermost first.
    pub fn layers(&self) -> &[&'static str] {
        &self.layers
    }

    /// Runs the context's handler through every layer.
    pub async fn invoke(&self, ctx: &mut InvocationContext) -> Result<StepOutcome, SagaError> {
        Next {
            inner: self.entry.as_ref(),
        }
        .run(ctx)
        .await
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::empty()
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("layers", &self.layers)
            .finish()
    }
}

/// Builder for [`Pipeline`].
#[derive(Default)]
pub struct PipelineBuilder {
    middleware: Vec<Arc<dyn Middleware>>,
}

impl PipelineBuilder {
    /// Appends a middleware inside the ones added before it.
    pub fn with(self, middleware: impl Middleware + 'static) -> Self {
        self.with_shared(Arc::new(middleware))
    }

    pub fn with_shared(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn build(self) -> Pipeline {
        let layers = self.middleware.iter().map(|m| m.name()).collect();
        let entry = self
            .middleware
            .into_iter()
            .rev()
            .fold(Arc::new(HandlerInvoke) as Arc<dyn Invoke>, |next, middleware| {
                Arc::new(Layer { middleware, next }) as Arc<dyn Invoke>
            });
        Pipeline { entry, layers }
    }
}
