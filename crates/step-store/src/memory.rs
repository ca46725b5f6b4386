use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::HealthCheck;
use tokio::sync::RwLock;

use crate::{
    Result, SagaData, SagaId, SagaStepMetadata, StepKey, StepStoreError,
    store::{SaveOptions, StepStore, record_conflict, validate_for_save},
};

#[derive(Default)]
struct Inner {
    /// Records in insertion order.
    steps: Vec<SagaStepMetadata>,
    /// Position of each key in `steps`.
    index: HashMap<StepKey, usize>,
    saga_data: HashMap<SagaId, SagaData>,
}

/// In-memory step store implementation for testing.
///
/// This implementation keeps all records in memory and provides
/// the same interface as the PostgreSQL implementation. The write lock is
/// held across check and write, which makes every save a single
/// compare-and-write.
#[derive(Clone, Default)]
pub struct InMemoryStepStore {
    inner: Arc<RwLock<Inner>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryStepStore {
    /// Creates a new empty in-memory step store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail with `Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Returns the total number of step records.
    pub async fn step_count(&self) -> usize {
        self.inner.read().await.steps.len()
    }

    /// Clears all records.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.steps.clear();
        inner.index.clear();
        inner.saga_data.clear();
    }

    fn ensure_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StepStoreError::Unavailable(
                "in-memory store switched off".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl StepStore for InMemoryStepStore {
    async fn get(&self, key: &StepKey) -> Result<Option<SagaStepMetadata>> {
        self.ensure_available()?;
        let inner = self.inner.read().await;
        Ok(inner.index.get(key).map(|&pos| inner.steps[pos].clone()))
    }

    async fn save(&self, metadata: SagaStepMetadata, options: SaveOptions) -> Result<()> {
        self.ensure_available()?;
        validate_for_save(&metadata)?;

        let key = metadata.key();
        let mut inner = self.inner.write().await;
        let existing = inner.index.get(&key).copied();
        options
            .check(&key, existing.map(|pos| inner.steps[pos].status))
            .inspect_err(|_| record_conflict("memory"))?;

        match existing {
            Some(pos) => {
                let stored = &mut inner.steps[pos];
                stored.status = metadata.status;
                stored.payload = metadata.payload;
                stored.updated_at = metadata.updated_at;
            }
            None => {
                let pos = inner.steps.len();
                inner.steps.push(metadata);
                inner.index.insert(key, pos);
            }
        }
        Ok(())
    }

    async fn query_by_saga(&self, saga_id: SagaId) -> Result<Vec<SagaStepMetadata>> {
        self.ensure_available()?;
        let inner = self.inner.read().await;
        Ok(inner
            .steps
            .iter()
            .filter(|s| s.saga_id == saga_id)
            .cloned()
            .collect())
    }

    async fn get_saga_data(&self, saga_id: SagaId) -> Result<Option<SagaData>> {
        self.ensure_available()?;
        Ok(self.inner.read().await.saga_data.get(&saga_id).cloned())
    }

    async fn save_saga_data(&self, data: &SagaData) -> Result<u64> {
        self.ensure_available()?;
        let mut inner = self.inner.write().await;
        let actual = inner
            .saga_data
            .get(&data.saga_id)
            .map(|d| d.version)
            .unwrap_or(0);
        if actual != data.version {
            return Err(StepStoreError::SagaDataConflict {
                saga_id: data.saga_id,
                expected: data.version,
                actual,
            });
        }

        let mut stored = data.clone();
        stored.version = actual + 1;
        stored.updated_at = Utc::now();
        let version = stored.version;
        inner.saga_data.insert(data.saga_id, stored);
        Ok(version)
    }
}

#[async_trait]
impl HealthCheck for InMemoryStepStore {
    fn name(&self) -> &'static str {
        "step_store"
    }

    async fn ping(&self, _timeout: Duration) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Expectation, MessageId, StepStatus};

    fn started(saga_id: SagaId, step_type: &str, parent: Option<MessageId>) -> SagaStepMetadata {
        SagaStepMetadata::new(
            StepKey::new(saga_id, step_type, format!("{step_type}Handler"), MessageId::new()),
            parent,
            StepStatus::Started,
            step_type.as_bytes().to_vec(),
        )
    }

    #[tokio::test]
    async fn test_save_and_get() {
        let store = InMemoryStepStore::new();
        let step = started(SagaId::new(), "CreateOrder", None);

        store.save(step.clone(), SaveOptions::expect_new()).await.unwrap();

        let loaded = store.get(&step.key()).await.unwrap().unwrap();
        assert_eq!(loaded, step);
        assert_eq!(store.step_count().await, 1);
    }

    #[tokio::test]
    async fn test_expect_new_conflicts_on_existing_key() {
        let store = InMemoryStepStore::new();
        let step = started(SagaId::new(), "CreateOrder", None);
        store.save(step.clone(), SaveOptions::expect_new()).await.unwrap();

        let result = store.save(step, SaveOptions::expect_new()).await;
        assert!(matches!(
            result,
            Err(StepStoreError::Conflict {
                expected: Expectation::New,
                actual: Some(StepStatus::Started),
                ..
            })
        ));
        assert_eq!(store.step_count().await, 1);
    }

    #[tokio::test]
    async fn test_update_keeps_identity_and_position() {
        let store = InMemoryStepStore::new();
        let saga_id = SagaId::new();
        let first = started(saga_id, "CreateOrder", None);
        let second = started(saga_id, "ReserveStock", Some(first.message_id));
        store.save(first.clone(), SaveOptions::expect_new()).await.unwrap();
        store.save(second.clone(), SaveOptions::expect_new()).await.unwrap();

        let mut completed = first.transitioned(StepStatus::Completed, b"done".to_vec());
        // Attempted identity rewrites must not leak into the stored record.
        completed.parent_message_id = Some(MessageId::new());
        completed.created_at = Utc::now();
        store
            .save(completed, SaveOptions::expect_status(StepStatus::Started))
            .await
            .unwrap();

        let history = store.query_by_saga(saga_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].step_type, "CreateOrder");
        assert_eq!(history[0].status, StepStatus::Completed);
        assert_eq!(history[0].payload, b"done");
        assert_eq!(history[0].parent_message_id, None);
        assert_eq!(history[0].created_at, first.created_at);
        assert_eq!(history[1].step_type, "ReserveStock");
    }

    #[tokio::test]
    async fn test_query_by_saga_isolates_sagas() {
        let store = InMemoryStepStore::new();
        let saga_a = SagaId::new();
        let saga_b = SagaId::new();
        store.save(started(saga_a, "A", None), SaveOptions::new()).await.unwrap();
        store.save(started(saga_b, "B", None), SaveOptions::new()).await.unwrap();

        let history = store.query_by_saga(saga_a).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].saga_id, saga_a);
    }

    #[tokio::test]
    async fn test_concurrent_expect_new_has_single_winner() {
        let store = InMemoryStepStore::new();
        let step = started(SagaId::new(), "CreateOrder", None);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let step = step.clone();
            tasks.push(tokio::spawn(async move {
                store.save(step, SaveOptions::expect_new()).await.is_ok()
            }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.step_count().await, 1);
    }

    #[tokio::test]
    async fn test_saga_data_versioning() {
        let store = InMemoryStepStore::new();
        let saga_id = SagaId::new();
        let mut data = SagaData::new(saga_id);

        data.version = store.save_saga_data(&data).await.unwrap();
        assert_eq!(data.version, 1);

        let stale = data.clone();
        data.mark_completed();
        data.version = store.save_saga_data(&data).await.unwrap();
        assert_eq!(data.version, 2);

        let result = store.save_saga_data(&stale).await;
        assert!(matches!(
            result,
            Err(StepStoreError::SagaDataConflict { expected: 1, actual: 2, .. })
        ));

        let loaded = store.get_saga_data(saga_id).await.unwrap().unwrap();
        assert!(loaded.is_completed);
        assert_eq!(loaded.version, 2);
    }

    struct ConflictTally(Arc<std::sync::atomic::AtomicU64>);

    impl metrics::CounterFn for ConflictTally {
        fn increment(&self, value: u64) {
            self.0.fetch_add(value, Ordering::SeqCst);
        }

        fn absolute(&self, value: u64) {
            self.0.store(value, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct ConflictRecorder {
        conflicts: Arc<std::sync::atomic::AtomicU64>,
    }

    impl metrics::Recorder for ConflictRecorder {
        fn describe_counter(&self, _: metrics::KeyName, _: Option<metrics::Unit>, _: metrics::SharedString) {}
        fn describe_gauge(&self, _: metrics::KeyName, _: Option<metrics::Unit>, _: metrics::SharedString) {}
        fn describe_histogram(&self, _: metrics::KeyName, _: Option<metrics::Unit>, _: metrics::SharedString) {}

        fn register_counter(&self, key: &metrics::Key, _: &metrics::Metadata<'_>) -> metrics::Counter {
            if key.name() == "saga_step_store_conflicts_total" {
                metrics::Counter::from_arc(Arc::new(ConflictTally(self.conflicts.clone())))
            } else {
                metrics::Counter::noop()
            }
        }

        fn register_gauge(&self, _: &metrics::Key, _: &metrics::Metadata<'_>) -> metrics::Gauge {
            metrics::Gauge::noop()
        }

        fn register_histogram(&self, _: &metrics::Key, _: &metrics::Metadata<'_>) -> metrics::Histogram {
            metrics::Histogram::noop()
        }
    }

    #[test]
    fn test_conflicts_are_counted() {
        let recorder = ConflictRecorder::default();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();

        metrics::with_local_recorder(&recorder, || {
            runtime.block_on(async {
                let store = InMemoryStepStore::new();
                let step = started(SagaId::new(), "CreateOrder", None);
                store.save(step.clone(), SaveOptions::expect_new()).await.unwrap();
                assert!(store.save(step.clone(), SaveOptions::expect_new()).await.is_err());
                assert!(
                    store
                        .save(step, SaveOptions::expect_status(StepStatus::Completed))
                        .await
                        .is_err()
                );
            })
        });

        assert_eq!(recorder.conflicts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let store = InMemoryStepStore::new();
        store.set_unavailable(true);
        assert!(!store.ping(Duration::from_millis(10)).await);

        let result = store.query_by_saga(SagaId::new()).await;
        assert!(matches!(result, Err(StepStoreError::Unavailable(_))));

        store.set_unavailable(false);
        assert!(store.ping(Duration::from_millis(10)).await);
        assert!(store.query_by_saga(SagaId::new()).await.unwrap().is_empty());
    }
}
