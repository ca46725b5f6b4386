//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p step-store --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;
use std::time::Duration;

use common::HealthCheck;
use sqlx::PgPool;
use step_store::{
    Expectation, MessageId, PostgresStepStore, SagaData, SagaId, SagaStepMetadata, SaveOptions,
    StepKey, StepStatus, StepStore, StepStoreError,
};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

/// Global shared container
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
                "../../../migrations/001_create_saga_steps_table.sql"
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

/// Get a fresh store with its own pool and cleared tables
async fn get_test_store() -> PostgresStepStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE saga_steps, saga_data")
        .execute(&pool)
        .await
        .unwrap();

    PostgresStepStore::new(pool)
}

fn started(saga_id: SagaId, step_type: &str, parent: Option<MessageId>) -> SagaStepMetadata {
    SagaStepMetadata::new(
        StepKey::new(saga_id, step_type, format!("{step_type}Handler"), MessageId::new()),
        parent,
        StepStatus::Started,
        format!("{{\"step\":\"{step_type}\"}}").into_bytes(),
    )
}

#[tokio::test]
async fn save_and_get_step() {
    let store = get_test_store().await;
    let step = started(SagaId::new(), "CreateOrder", None);

    store
        .save(step.clone(), SaveOptions::expect_new())
        .await
        .unwrap();

    let loaded = store.get(&step.key()).await.unwrap().unwrap();
    assert_eq!(loaded.key(), step.key());
    assert_eq!(loaded.status, StepStatus::Started);
    assert_eq!(loaded.payload, step.payload);
    assert_eq!(loaded.parent_message_id, None);
}

#[tokio::test]
async fn expect_new_conflicts_on_existing_key() {
    let store = get_test_store().await;
    let step = started(SagaId::new(), "CreateOrder", None);
    store
        .save(step.clone(), SaveOptions::expect_new())
        .await
        .unwrap();

    let err = store
        .save(step, SaveOptions::expect_new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        StepStoreError::Conflict {
            expected: Expectation::New,
            actual: Some(StepStatus::Started),
            ..
        }
    ));
}

#[tokio::test]
async fn expect_status_guards_transition() {
    let store = get_test_store().await;
    let step = started(SagaId::new(), "CreateOrder", None);
    store
        .save(step.clone(), SaveOptions::expect_new())
        .await
        .unwrap();

    let completed = step.transitioned(StepStatus::Completed, b"ok".to_vec());
    store
        .save(completed.clone(), SaveOptions::expect_status(StepStatus::Started))
        .await
        .unwrap();

    // A second writer still believing the step is Started loses.
    let failed = step.transitioned(StepStatus::Failed, b"late".to_vec());
    let err = store
        .save(failed, SaveOptions::expect_status(StepStatus::Started))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StepStoreError::Conflict {
            actual: Some(StepStatus::Completed),
            ..
        }
    ));

    let loaded = store.get(&step.key()).await.unwrap().unwrap();
    assert_eq!(loaded.status, StepStatus::Completed);
    assert_eq!(loaded.payload, b"ok");
}

#[tokio::test]
async fn query_by_saga_returns_insertion_order() {
    let store = get_test_store().await;
    let saga_id = SagaId::new();
    let first = started(saga_id, "CreateOrder", None);
    let second = started(saga_id, "ReserveStock", Some(first.message_id));
    let third = started(saga_id, "ProcessPayment", Some(second.message_id));

    for step in [&first, &second, &third] {
        store
            .save(step.clone(), SaveOptions::expect_new())
            .await
            .unwrap();
    }
    store
        .save(started(SagaId::new(), "Other", None), SaveOptions::new())
        .await
        .unwrap();

    let history = store.query_by_saga(saga_id).await.unwrap();
    let types: Vec<_> = history.iter().map(|s| s.step_type.as_str()).collect();
    assert_eq!(types, vec!["CreateOrder", "ReserveStock", "ProcessPayment"]);
    assert_eq!(history[2].parent_message_id, Some(second.message_id));
}

#[tokio::test]
async fn saga_data_optimistic_versioning() {
    let store = get_test_store().await;
    let saga_id = SagaId::new();
    let mut data = SagaData::new(saga_id);
    data.set_extension("order_id", &"ORD-1").unwrap();

    data.version = store.save_saga_data(&data).await.unwrap();
    assert_eq!(data.version, 1);

    let stale = data.clone();
    data.mark_failed("ProcessPayment", "PaymentHandler", "declined");
    data.version = store.save_saga_data(&data).await.unwrap();

    let err = store.save_saga_data(&stale).await.unwrap_err();
    assert!(matches!(
        err,
        StepStoreError::SagaDataConflict {
            expected: 1,
            actual: 2,
            ..
        }
    ));

    let loaded = store.get_saga_data(saga_id).await.unwrap().unwrap();
    assert_eq!(loaded.version, 2);
    assert_eq!(loaded.failed_handler_type.as_deref(), Some("PaymentHandler"));
    let order_id: String = loaded.extension("order_id").unwrap().unwrap();
    assert_eq!(order_id, "ORD-1");
}

#[tokio::test]
async fn ping_reports_reachable_database() {
    let store = get_test_store().await;
    assert!(store.ping(Duration::from_secs(5)).await);
}
