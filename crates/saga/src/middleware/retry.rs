use std::time::Duration;

use async_trait::async_trait;

use super::{Middleware, Next};
use crate::config::RetryPolicy;
use crate::context::InvocationContext;
use crate::error::SagaError;
use crate::handler::StepOutcome;

/// Retries transient handler errors in-process with exponential backoff.
///
/// Only [`crate::HandlerError::Transient`] is retried. Once attempts run out
/// the error propagates and the transport may redeliver. Backoff sleeps end
/// early when the dispatch is cancelled.
#[derive(Debug, Clone, Copy)]
pub struct RetryMiddleware {
    max_attempts: u32,
    base_delay: Duration,
}

impl RetryMiddleware {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub fn from_policy(policy: &RetryPolicy) -> Self {
        Self::new(policy.max_attempts, policy.base_delay)
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

impl Default for RetryMiddleware {
    fn default() -> Self {
        Self::from_policy(&RetryPolicy::default())
    }
}

#[async_trait]
impl Middleware for RetryMiddleware {
    fn name(&self) -> &'static str {
        "retry"
    }

    async fn handle(
        &self,
        ctx: &mut InvocationContext,
        next: Next<'_>,
    ) -> Result<StepOutcome, SagaError> {
        let cancellation = ctx.cancellation().clone();
        let mut attempt = 1;
        loop {
            ctx.set_attempt(attempt);
            match next.run(ctx).await {
                Err(e) if e.is_transient_handler_error() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::debug!(
                        handler_type = ctx.handler_type(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying handler"
                    );
                    metrics::counter!("saga_handler_retries_total", "handler" => ctx.handler_type())
                        .increment(1);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancellation.cancelled() => return Err(SagaError::Cancelled),
                    }
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}
