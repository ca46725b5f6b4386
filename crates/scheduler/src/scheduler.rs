//! Public scheduling facade.

use common::ScheduleId;

use crate::{Result, ScheduleRequest, ScheduleStore, ScheduledEntry};

/// Accepts delayed dispatch requests and cancellations.
#[derive(Clone)]
pub struct Scheduler<S: ScheduleStore> {
    store: S,
}

impl<S: ScheduleStore> Scheduler<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Enqueues a future dispatch and returns its schedule id.
    #[tracing::instrument(skip(self, request), fields(message_type = %request.envelope.message_type, due_at = %request.due_at))]
    pub async fn schedule(&self, request: ScheduleRequest) -> Result<ScheduleId> {
        let entry = ScheduledEntry::from_request(request);
        let schedule_id = entry.schedule_id;
        self.store.enqueue(entry).await?;

        metrics::counter!("saga_schedules_enqueued_total").increment(1);
        tracing::debug!(%schedule_id, "dispatch scheduled");
        Ok(schedule_id)
    }

    /// Cancels a pending dispatch.
    ///
    /// Returns false if the entry was already delivered or cancelled.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, schedule_id: ScheduleId) -> Result<bool> {
        let cancelled = self.store.mark_cancelled(schedule_id).await?;
        if cancelled {
            metrics::counter!("saga_schedules_cancelled_total").increment(1);
        }
        Ok(cancelled)
    }
}
