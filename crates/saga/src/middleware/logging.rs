use std::time::Instant;

use async_trait::async_trait;

use super::{Middleware, Next};
use crate::context::InvocationContext;
use crate::error::SagaError;
use crate::handler::StepOutcome;

/// Logs every invocation and its outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn handle(
        &self,
        ctx: &mut InvocationContext,
        next: Next<'_>,
    ) -> Result<StepOutcome, SagaError> {
        tracing::debug!(
            saga_id = %ctx.saga_id(),
            message_id = %ctx.message_id(),
            message_type = ctx.message_type(),
            handler_type = ctx.handler_type(),
            "invoking handler"
        );
        let started = Instant::now();
        let result = next.run(ctx).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(StepOutcome::Failed { reason }) => tracing::warn!(
                saga_id = %ctx.saga_id(),
                handler_type = ctx.handler_type(),
                elapsed_ms,
                reason = %reason,
                "handler reported step failure"
            ),
            Ok(outcome) => tracing::info!(
                saga_id = %ctx.saga_id(),
                handler_type = ctx.handler_type(),
                elapsed_ms,
                ?outcome,
                "handler completed"
            ),
            Err(e) if e.is_retryable() => tracing::warn!(
                saga_id = %ctx.saga_id(),
                handler_type = ctx.handler_type(),
                elapsed_ms,
                attempt = ctx.attempt(),
                error = %e,
                "handler failed, retryable"
            ),
            Err(e) => tracing::error!(
                saga_id = %ctx.saga_id(),
                handler_type = ctx.handler_type(),
                elapsed_ms,
                error = %e,
                "handler failed"
            ),
        }
        result
    }
}
