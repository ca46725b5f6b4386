use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::ScheduleId;

use crate::{Result, ScheduledEntry};

/// Durable queue of scheduled entries keyed by due time.
///
/// Enqueueing is separated from delivery: the poller dequeues due batches and
/// reports each outcome back. Dequeueing does not lease entries; an entry
/// keeps coming back until it is marked succeeded or cancelled.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Persists a new pending entry.
    async fn enqueue(&self, entry: ScheduledEntry) -> Result<()>;

    /// Returns up to `max` pending entries with `due_at <= now`, earliest first.
    async fn dequeue_due(&self, now: DateTime<Utc>, max: usize) -> Result<Vec<ScheduledEntry>>;

    /// Marks an entry delivered. A cancelled entry stays cancelled.
    async fn mark_succeeded(&self, schedule_id: ScheduleId) -> Result<()>;

    /// Marks an entry cancelled.
    ///
    /// Returns false without changing anything if the entry already reached
    /// a terminal state.
    async fn mark_cancelled(&self, schedule_id: ScheduleId) -> Result<bool>;

    /// Records a failed delivery attempt. The entry stays pending and is
    /// next due at `retry_at`.
    async fn record_failure(
        &self,
        schedule_id: ScheduleId,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Records a final failed attempt and takes a pending entry out of the
    /// queue. A terminal entry keeps its status.
    async fn mark_failed(&self, schedule_id: ScheduleId, error: &str) -> Result<()>;

    /// Loads an entry by id.
    async fn get(&self, schedule_id: ScheduleId) -> Result<Option<ScheduledEntry>>;
}
