//! Engine configuration loaded from environment variables.

use std::time::Duration;

/// In-process retry policy for transient handler errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

/// Saga engine configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `SAGA_APPLICATION_ID`: id of the application running the engine (default: `"saga-engine"`)
/// - `SAGA_MAX_CHAIN_DEPTH`: longest parent chain followed before a step is rejected (default: `64`)
/// - `SAGA_RETRY_MAX_ATTEMPTS`: handler attempts per dispatch (default: `3`)
/// - `SAGA_RETRY_BASE_DELAY_MS`: first backoff delay, doubled per attempt (default: `100`)
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub application_id: String,
    pub max_chain_depth: usize,
    pub retry: RetryPolicy,
}

impl EngineConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            application_id: std::env::var("SAGA_APPLICATION_ID")
                .ok()
                .filter(|id| !id.trim().is_empty())
                .unwrap_or(defaults.application_id),
            max_chain_depth: std::env::var("SAGA_MAX_CHAIN_DEPTH")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&v| v > 0)
                .unwrap_or(defaults.max_chain_depth),
            retry: RetryPolicy {
                max_attempts: std::env::var("SAGA_RETRY_MAX_ATTEMPTS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .filter(|&v| v > 0)
                    .unwrap_or(defaults.retry.max_attempts),
                base_delay: std::env::var("SAGA_RETRY_BASE_DELAY_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.retry.base_delay),
            },
        }
    }

    pub fn with_application_id(mut self, application_id: impl Into<String>) -> Self {
        self.application_id = application_id.into();
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            application_id: "saga-engine".to_string(),
            max_chain_depth: 64,
            retry: RetryPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.application_id, "saga-engine");
        assert_eq!(config.max_chain_depth, 64);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay, Duration::from_millis(100));
    }

    #[test]
    fn test_with_application_id() {
        let config = EngineConfig::default().with_application_id("orders");
        assert_eq!(config.application_id, "orders");
    }
}
