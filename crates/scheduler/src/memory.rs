use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{HealthCheck, ScheduleId};
use tokio::sync::RwLock;

use crate::{Result, ScheduleError, ScheduleStatus, ScheduleStore, ScheduledEntry};

/// In-memory schedule store implementation for testing.
#[derive(Clone, Default)]
pub struct InMemoryScheduleStore {
    entries: Arc<RwLock<HashMap<ScheduleId, ScheduledEntry>>>,
}

impl InMemoryScheduleStore {
    /// Creates a new empty in-memory schedule store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of entries that are still pending.
    pub async fn pending_count(&self) -> usize {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.status == ScheduleStatus::Pending)
            .count()
    }
}

#[async_trait]
impl ScheduleStore for InMemoryScheduleStore {
    async fn enqueue(&self, entry: ScheduledEntry) -> Result<()> {
        self.entries.write().await.insert(entry.schedule_id, entry);
        Ok(())
    }

    async fn dequeue_due(&self, now: DateTime<Utc>, max: usize) -> Result<Vec<ScheduledEntry>> {
        if max == 0 {
            return Err(ScheduleError::InvalidBatchSize);
        }
        let entries = self.entries.read().await;
        let mut due: Vec<_> = entries.values().filter(|e| e.is_due(now)).cloned().collect();
        due.sort_by(|a, b| {
            a.due_at
                .cmp(&b.due_at)
                .then(a.created_at.cmp(&b.created_at))
        });
        due.truncate(max);
        Ok(due)
    }

    async fn mark_succeeded(&self, schedule_id: ScheduleId) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(&schedule_id)
            .ok_or(ScheduleError::NotFound(schedule_id))?;
        if entry.status == ScheduleStatus::Pending {
            entry.status = ScheduleStatus::Succeeded;
            entry.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_cancelled(&self, schedule_id: ScheduleId) -> Result<bool> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(&schedule_id)
            .ok_or(ScheduleError::NotFound(schedule_id))?;
        if entry.status.is_terminal() {
            return Ok(false);
        }
        entry.status = ScheduleStatus::Cancelled;
        entry.updated_at = Utc::now();
        Ok(true)
    }

    async fn record_failure(
        &self,
        schedule_id: ScheduleId,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(&schedule_id)
            .ok_or(ScheduleError::NotFound(schedule_id))?;
        entry.attempts += 1;
        entry.last_error = Some(error.to_string());
        if entry.status == ScheduleStatus::Pending {
            entry.due_at = retry_at;
        }
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_failed(&self, schedule_id: ScheduleId, error: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(&schedule_id)
            .ok_or(ScheduleError::NotFound(schedule_id))?;
        entry.attempts += 1;
        entry.last_error = Some(error.to_string());
        if entry.status == ScheduleStatus::Pending {
            entry.status = ScheduleStatus::Failed;
        }
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn get(&self, schedule_id: ScheduleId) -> Result<Option<ScheduledEntry>> {
        Ok(self.entries.read().await.get(&schedule_id).cloned())
    }
}

#[async_trait]
impl HealthCheck for InMemoryScheduleStore {
    fn name(&self) -> &'static str {
        "schedule_store"
    }

    async fn ping(&self, _timeout: Duration) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ScheduleRequest;
    use chrono::Duration as ChronoDuration;
    use common::{MessageEnvelope, SagaId};

    fn entry_due_at(due_at: DateTime<Utc>) -> ScheduledEntry {
        let envelope = MessageEnvelope::builder()
            .saga_id(SagaId::new())
            .message_type("ExpireReservation")
            .application_id("inventory")
            .payload(Vec::new())
            .build();
        ScheduledEntry::from_request(ScheduleRequest::at(envelope, due_at))
    }

    #[tokio::test]
    async fn test_dequeue_due_orders_and_bounds_batch() {
        let store = InMemoryScheduleStore::new();
        let t0 = Utc::now();
        let late = entry_due_at(t0 + ChronoDuration::seconds(3));
        let early = entry_due_at(t0 + ChronoDuration::seconds(1));
        let future = entry_due_at(t0 + ChronoDuration::seconds(60));
        for entry in [&late, &early, &future] {
            store.enqueue(entry.clone()).await.unwrap();
        }

        let now = t0 + ChronoDuration::seconds(10);
        let due = store.dequeue_due(now, 10).await.unwrap();
        let ids: Vec<_> = due.iter().map(|e| e.schedule_id).collect();
        assert_eq!(ids, vec![early.schedule_id, late.schedule_id]);

        let bounded = store.dequeue_due(now, 1).await.unwrap();
        assert_eq!(bounded.len(), 1);
        assert_eq!(bounded[0].schedule_id, early.schedule_id);
    }

    #[tokio::test]
    async fn test_zero_batch_is_rejected() {
        let store = InMemoryScheduleStore::new();
        assert!(matches!(
            store.dequeue_due(Utc::now(), 0).await,
            Err(ScheduleError::InvalidBatchSize)
        ));
    }

    #[tokio::test]
    async fn test_cancel_after_success_is_noop() {
        let store = InMemoryScheduleStore::new();
        let entry = entry_due_at(Utc::now());
        let id = entry.schedule_id;
        store.enqueue(entry).await.unwrap();

        store.mark_succeeded(id).await.unwrap();
        assert!(!store.mark_cancelled(id).await.unwrap());

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, ScheduleStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_success_after_cancel_keeps_cancelled() {
        let store = InMemoryScheduleStore::new();
        let entry = entry_due_at(Utc::now());
        let id = entry.schedule_id;
        store.enqueue(entry).await.unwrap();

        assert!(store.mark_cancelled(id).await.unwrap());
        store.mark_succeeded(id).await.unwrap();

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, ScheduleStatus::Cancelled);
        assert_eq!(store.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_record_failure_moves_due_time() {
        let store = InMemoryScheduleStore::new();
        let now = Utc::now();
        let entry = entry_due_at(now);
        let id = entry.schedule_id;
        store.enqueue(entry).await.unwrap();

        let retry_at = now + ChronoDuration::seconds(2);
        store
            .record_failure(id, "store unavailable", retry_at)
            .await
            .unwrap();

        assert!(store.dequeue_due(now, 10).await.unwrap().is_empty());
        let due = store.dequeue_due(retry_at, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].attempts, 1);
        assert_eq!(due[0].last_error.as_deref(), Some("store unavailable"));
    }

    #[tokio::test]
    async fn test_mark_failed_removes_entry_from_queue() {
        let store = InMemoryScheduleStore::new();
        let now = Utc::now();
        let entry = entry_due_at(now);
        let id = entry.schedule_id;
        store.enqueue(entry).await.unwrap();

        store.mark_failed(id, "no route").await.unwrap();

        assert!(store.dequeue_due(now, 10).await.unwrap().is_empty());
        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, ScheduleStatus::Failed);
        assert_eq!(stored.last_error.as_deref(), Some("no route"));
        assert!(!store.mark_cancelled(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_id() {
        let store = InMemoryScheduleStore::new();
        let id = ScheduleId::new();
        assert!(matches!(
            store.mark_succeeded(id).await,
            Err(ScheduleError::NotFound(missing)) if missing == id
        ));
    }
}
