//! Poller that feeds due entries back into the dispatcher.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use tokio::sync::broadcast;

use crate::{Result, ScheduleStore, ScheduledEntry};

/// Receives entries whose due time has passed.
///
/// Implemented by the saga dispatcher; the scheduler depends on nothing else
/// of it.
#[async_trait]
pub trait DueEntryHandler: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Dispatches a due entry.
    async fn handle_due(&self, entry: &ScheduledEntry) -> std::result::Result<(), Self::Error>;

    /// Whether redelivering after `error` can succeed. Entries failing with a
    /// non-retryable error are dead-lettered at once.
    fn is_retryable(&self, _error: &Self::Error) -> bool {
        true
    }
}

/// Poller configuration.
///
/// Reads from environment variables:
/// - `SCHEDULER_POLL_INTERVAL_MS`: delay between polls (default: `1000`)
/// - `SCHEDULER_BATCH_SIZE`: maximum entries per poll (default: `100`)
/// - `SCHEDULER_MAX_CONCURRENCY`: concurrent dispatches per batch (default: `8`)
/// - `SCHEDULER_RETRY_BASE_DELAY_MS`: delay after the first failure (default: `1000`)
/// - `SCHEDULER_RETRY_MAX_DELAY_MS`: upper bound on the retry delay (default: `300000`)
/// - `SCHEDULER_MAX_ATTEMPTS`: failed attempts before an entry is dead-lettered (default: `10`)
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub max_concurrency: usize,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub max_attempts: u32,
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
}

impl PollerConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            poll_interval: env_millis("SCHEDULER_POLL_INTERVAL_MS")
                .unwrap_or(defaults.poll_interval),
            batch_size: std::env::var("SCHEDULER_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&v| v > 0)
                .unwrap_or(defaults.batch_size),
            max_concurrency: std::env::var("SCHEDULER_MAX_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&v| v > 0)
                .unwrap_or(defaults.max_concurrency),
            retry_base_delay: env_millis("SCHEDULER_RETRY_BASE_DELAY_MS")
                .unwrap_or(defaults.retry_base_delay),
            retry_max_delay: env_millis("SCHEDULER_RETRY_MAX_DELAY_MS")
                .unwrap_or(defaults.retry_max_delay),
            max_attempts: std::env::var("SCHEDULER_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&v| v > 0)
                .unwrap_or(defaults.max_attempts),
        }
    }

    /// Delay before the next attempt once `failures` attempts have failed.
    /// Doubles per failure from `retry_base_delay`, capped at `retry_max_delay`.
    pub fn retry_delay(&self, failures: u32) -> Duration {
        let factor = 1u32 << failures.saturating_sub(1).min(20);
        self.retry_base_delay
            .saturating_mul(factor)
            .min(self.retry_max_delay)
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
            max_concurrency: 8,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(300),
            max_attempts: 10,
        }
    }
}

/// Outcome counts of one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub dequeued: usize,
    pub succeeded: usize,
    /// Failed deliveries pushed back for a later attempt.
    pub failed: usize,
    /// Failed deliveries taken out of the queue for good.
    pub dead_lettered: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Succeeded,
    Retrying,
    DeadLettered,
}

/// Repeatedly dequeues due entries and dispatches them.
pub struct SchedulePoller<S: ScheduleStore, H: DueEntryHandler> {
    store: S,
    handler: Arc<H>,
    config: PollerConfig,
}

impl<S: ScheduleStore, H: DueEntryHandler> SchedulePoller<S, H> {
    pub fn new(store: S, handler: Arc<H>, config: PollerConfig) -> Self {
        Self {
            store,
            handler,
            config,
        }
    }

    /// Dispatches one batch of entries due at `now`.
    #[tracing::instrument(skip(self))]
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<PollSummary> {
        let due = self
            .store
            .dequeue_due(now, self.config.batch_size)
            .await?;
        let dequeued = due.len();
        if dequeued == 0 {
            return Ok(PollSummary::default());
        }

        let outcomes: Vec<Delivery> = stream::iter(due)
            .map(|entry| self.deliver(entry, now))
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        let count = |kind: Delivery| outcomes.iter().filter(|&&o| o == kind).count();
        let summary = PollSummary {
            dequeued,
            succeeded: count(Delivery::Succeeded),
            failed: count(Delivery::Retrying),
            dead_lettered: count(Delivery::DeadLettered),
        };
        tracing::debug!(?summary, "poll complete");
        Ok(summary)
    }

    async fn deliver(&self, entry: ScheduledEntry, now: DateTime<Utc>) -> Delivery {
        let schedule_id = entry.schedule_id;
        let error = match self.handler.handle_due(&entry).await {
            Ok(()) => {
                metrics::counter!("saga_schedules_dispatched_total").increment(1);
                // If this write is lost the entry is delivered again; the
                // dispatcher treats the redelivery as a duplicate.
                if let Err(e) = self.store.mark_succeeded(schedule_id).await {
                    tracing::warn!(%schedule_id, error = %e, "failed to mark schedule succeeded");
                    return Delivery::Retrying;
                }
                return Delivery::Succeeded;
            }
            Err(e) => e,
        };

        let attempts = entry.attempts + 1;
        let message = error.to_string();
        if !self.handler.is_retryable(&error) || attempts >= self.config.max_attempts {
            metrics::counter!("saga_schedules_dead_lettered_total").increment(1);
            tracing::error!(
                %schedule_id,
                attempts,
                error = %message,
                "scheduled dispatch failed permanently, dead-lettering entry"
            );
            if let Err(store_err) = self.store.mark_failed(schedule_id, &message).await {
                tracing::warn!(%schedule_id, error = %store_err, "failed to dead-letter schedule");
            }
            return Delivery::DeadLettered;
        }

        metrics::counter!("saga_schedules_failed_total").increment(1);
        let delay = self.config.retry_delay(attempts);
        let retry_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(now);
        tracing::warn!(
            %schedule_id,
            attempts,
            retry_in_ms = delay.as_millis() as u64,
            error = %message,
            "scheduled dispatch failed, backing off"
        );
        if let Err(store_err) = self
            .store
            .record_failure(schedule_id, &message, retry_at)
            .await
        {
            tracing::warn!(%schedule_id, error = %store_err, "failed to record schedule failure");
        }
        Delivery::Retrying
    }

    /// Polls on an interval until a shutdown signal arrives.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "starting schedule poller"
        );
        let mut interval = tokio::time::interval(self.config.poll_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.poll_once(Utc::now()).await {
                        tracing::warn!(error = %e, "schedule poll failed");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("schedule poller shutting down");
                    break;
                }
            }
        }
    }
}
