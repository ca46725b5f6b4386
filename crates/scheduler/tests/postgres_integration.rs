//! PostgreSQL integration tests for the schedule store.
//!
//! Run with:
//!
//! ```bash
//! cargo test -p scheduler --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, TimeZone, Utc};
use common::{HealthCheck, MessageEnvelope, SagaId};
use scheduler::{
    PostgresScheduleStore, ScheduleRequest, ScheduleStatus, ScheduleStore, ScheduledEntry,
};
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/002_create_scheduled_entries_table.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

async fn get_test_store() -> PostgresScheduleStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE scheduled_entries")
        .execute(&pool)
        .await
        .unwrap();

    PostgresScheduleStore::new(pool)
}

fn entry(due_at: chrono::DateTime<Utc>) -> ScheduledEntry {
    let envelope = MessageEnvelope::builder()
        .saga_id(SagaId::new())
        .message_type("PaymentTimeout")
        .application_id("payments")
        .payload(br#"{"order":"ORD-1"}"#.to_vec())
        .header("trace-id", "t-1")
        .build();
    ScheduledEntry::from_request(ScheduleRequest::at(envelope, due_at))
}

#[tokio::test]
async fn due_entry_lifecycle() {
    let store = get_test_store().await;
    let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
    let scheduled = entry(t0 + Duration::seconds(5));
    let id = scheduled.schedule_id;
    store.enqueue(scheduled.clone()).await.unwrap();

    assert!(store
        .dequeue_due(t0 + Duration::seconds(3), 10)
        .await
        .unwrap()
        .is_empty());

    let due = store
        .dequeue_due(t0 + Duration::seconds(6), 10)
        .await
        .unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].envelope, scheduled.envelope);

    store.mark_succeeded(id).await.unwrap();
    assert!(store
        .dequeue_due(t0 + Duration::seconds(10), 10)
        .await
        .unwrap()
        .is_empty());
    assert!(!store.mark_cancelled(id).await.unwrap());
}

#[tokio::test]
async fn failures_are_recorded_and_entry_is_pushed_back() {
    let store = get_test_store().await;
    let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
    let scheduled = entry(t0);
    let id = scheduled.schedule_id;
    store.enqueue(scheduled).await.unwrap();

    let retry_at = t0 + Duration::seconds(4);
    store
        .record_failure(id, "dispatcher offline", t0 + Duration::seconds(2))
        .await
        .unwrap();
    store
        .record_failure(id, "dispatcher offline", retry_at)
        .await
        .unwrap();

    let loaded = store.get(id).await.unwrap().unwrap();
    assert_eq!(loaded.status, ScheduleStatus::Pending);
    assert_eq!(loaded.attempts, 2);
    assert_eq!(loaded.due_at, retry_at);
    assert_eq!(loaded.last_error.as_deref(), Some("dispatcher offline"));
    assert!(store.dequeue_due(t0, 10).await.unwrap().is_empty());
    assert_eq!(store.dequeue_due(retry_at, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn failed_entries_leave_the_queue() {
    let store = get_test_store().await;
    let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
    let scheduled = entry(t0);
    let id = scheduled.schedule_id;
    store.enqueue(scheduled).await.unwrap();

    store.mark_failed(id, "no route").await.unwrap();

    let loaded = store.get(id).await.unwrap().unwrap();
    assert_eq!(loaded.status, ScheduleStatus::Failed);
    assert_eq!(loaded.attempts, 1);
    assert!(store
        .dequeue_due(t0 + Duration::seconds(60), 10)
        .await
        .unwrap()
        .is_empty());
    assert!(!store.mark_cancelled(id).await.unwrap());
}

#[tokio::test]
async fn ping_reports_reachable_database() {
    let store = get_test_store().await;
    assert!(store.ping(StdDuration::from_secs(5)).await);
}
