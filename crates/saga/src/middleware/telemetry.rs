use std::time::Instant;

use async_trait::async_trait;

use super::{Middleware, Next};
use crate::context::InvocationContext;
use crate::error::SagaError;
use crate::handler::StepOutcome;

/// Records invocation counts and handler latency.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsMiddleware;

#[async_trait]
impl Middleware for MetricsMiddleware {
    fn name(&self) -> &'static str {
        "metrics"
    }

    async fn handle(
        &self,
        ctx: &mut InvocationContext,
        next: Next<'_>,
    ) -> Result<StepOutcome, SagaError> {
        let handler_type = ctx.handler_type();
        let started = Instant::now();
        let result = next.run(ctx).await;

        metrics::histogram!("saga_step_duration_seconds", "handler" => handler_type)
            .record(started.elapsed().as_secs_f64());
        let outcome = match &result {
            Ok(StepOutcome::Failed { .. }) => "failed",
            Ok(_) => "completed",
            Err(e) => e.kind(),
        };
        metrics::counter!(
            "saga_handler_invocations_total",
            "handler" => handler_type,
            "outcome" => outcome
        )
        .increment(1);
        result
    }
}
