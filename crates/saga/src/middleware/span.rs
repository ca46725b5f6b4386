use async_trait::async_trait;
use tracing::Instrument;

use super::{Middleware, Next};
use crate::context::InvocationContext;
use crate::error::SagaError;
use crate::handler::StepOutcome;

/// Runs the rest of the chain inside a `saga.handle` span.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMiddleware;

#[async_trait]
impl Middleware for TracingMiddleware {
    fn name(&self) -> &'static str {
        "tracing"
    }

    async fn handle(
        &self,
        ctx: &mut InvocationContext,
        next: Next<'_>,
    ) -> Result<StepOutcome, SagaError> {
        let span = tracing::info_span!(
            "saga.handle",
            saga_id = %ctx.saga_id(),
            message_id = %ctx.message_id(),
            parent_message_id = ?ctx.parent_message_id(),
            message_type = ctx.message_type(),
            handler_type = ctx.handler_type(),
            outcome = tracing::field::Empty,
        );
        let result = next.run(ctx).instrument(span.clone()).await;
        let outcome = match &result {
            Ok(StepOutcome::Completed) => "completed",
            Ok(StepOutcome::SagaCompleted) => "saga_completed",
            Ok(StepOutcome::Failed { .. }) => "failed",
            Err(e) => e.kind(),
        };
        span.record("outcome", outcome);
        result
    }
}
