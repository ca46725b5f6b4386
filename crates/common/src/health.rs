//! Readiness contract shared by every external dependency of the engine.

use std::time::Duration;

use async_trait::async_trait;

/// A dependency that can report whether it is reachable.
///
/// Stores, serializers and transports implement this so the host can gate
/// readiness on all of them before accepting work.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Short name used in readiness reports (e.g. "step_store").
    fn name(&self) -> &'static str;

    /// Returns true if the dependency answered within `timeout`.
    async fn ping(&self, timeout: Duration) -> bool;
}

/// Pings every check and returns each name with its result.
pub async fn ping_all(
    checks: &[std::sync::Arc<dyn HealthCheck>],
    timeout: Duration,
) -> Vec<(&'static str, bool)> {
    let mut results = Vec::with_capacity(checks.len());
    for check in checks {
        results.push((check.name(), check.ping(timeout).await));
    }
    results
}
