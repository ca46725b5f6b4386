use std::time::{Duration, Instant};

use async_trait::async_trait;
use common::HealthCheck;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    MessageId, Result, SagaData, SagaId, SagaStepMetadata, StepKey, StepStatus, StepStoreError,
    store::{Expectation, SaveOptions, StepStore, record_conflict, validate_for_save},
};

const STEP_COLUMNS: &str = "saga_id, step_type, handler_type, message_id, parent_message_id, status, payload, created_at, updated_at";

/// PostgreSQL-backed step store implementation.
#[derive(Clone)]
pub struct PostgresStepStore {
    pool: PgPool,
}

impl PostgresStepStore {
    /// Creates a new PostgreSQL step store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_step(row: PgRow) -> Result<SagaStepMetadata> {
        let status: String = row.try_get("status")?;
        let status = status
            .parse::<StepStatus>()
            .map_err(|e| StepStoreError::Corrupted(e.to_string()))?;

        Ok(SagaStepMetadata {
            saga_id: SagaId::from_uuid(row.try_get::<Uuid, _>("saga_id")?),
            step_type: row.try_get("step_type")?,
            handler_type: row.try_get("handler_type")?,
            message_id: MessageId::from_uuid(row.try_get::<Uuid, _>("message_id")?),
            parent_message_id: row
                .try_get::<Option<Uuid>, _>("parent_message_id")?
                .map(MessageId::from_uuid),
            status,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn current_status(&self, key: &StepKey) -> Result<Option<StepStatus>> {
        Ok(self.get(key).await?.map(|s| s.status))
    }

    async fn insert(&self, metadata: &SagaStepMetadata, upsert: bool) -> Result<u64> {
        let conflict_clause = if upsert {
            "ON CONFLICT ON CONSTRAINT unique_saga_step DO UPDATE \
             SET status = EXCLUDED.status, payload = EXCLUDED.payload, updated_at = EXCLUDED.updated_at"
        } else {
            "ON CONFLICT ON CONSTRAINT unique_saga_step DO NOTHING"
        };
        let sql = format!(
            "INSERT INTO saga_steps ({STEP_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) {conflict_clause}"
        );

        let result = sqlx::query(&sql)
            .bind(metadata.saga_id.as_uuid())
            .bind(&metadata.step_type)
            .bind(&metadata.handler_type)
            .bind(metadata.message_id.as_uuid())
            .bind(metadata.parent_message_id.map(|id| id.as_uuid()))
            .bind(metadata.status.as_str())
            .bind(&metadata.payload)
            .bind(metadata.created_at)
            .bind(metadata.updated_at)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl StepStore for PostgresStepStore {
    async fn get(&self, key: &StepKey) -> Result<Option<SagaStepMetadata>> {
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM saga_steps \
             WHERE saga_id = $1 AND step_type = $2 AND handler_type = $3 AND message_id = $4"
        );
        let row = sqlx::query(&sql)
            .bind(key.saga_id.as_uuid())
            .bind(&key.step_type)
            .bind(&key.handler_type)
            .bind(key.message_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_step).transpose()
    }

    #[tracing::instrument(skip(self, metadata), fields(key = %metadata.key(), status = %metadata.status))]
    async fn save(&self, metadata: SagaStepMetadata, options: SaveOptions) -> Result<()> {
        validate_for_save(&metadata)?;
        let key = metadata.key();
        let started = Instant::now();

        let rows_affected = match options.expectation {
            Expectation::Any => self.insert(&metadata, true).await?,
            Expectation::New => self.insert(&metadata, false).await?,
            Expectation::Status(expected) => {
                sqlx::query(
                    r#"
                    UPDATE saga_steps
                    SET status = $5, payload = $6, updated_at = $7
                    WHERE saga_id = $1 AND step_type = $2 AND handler_type = $3 AND message_id = $4
                      AND status = $8
                    "#,
                )
                .bind(key.saga_id.as_uuid())
                .bind(&key.step_type)
                .bind(&key.handler_type)
                .bind(key.message_id.as_uuid())
                .bind(metadata.status.as_str())
                .bind(&metadata.payload)
                .bind(metadata.updated_at)
                .bind(expected.as_str())
                .execute(&self.pool)
                .await?
                .rows_affected()
            }
        };
        metrics::histogram!("saga_step_store_save_seconds")
            .record(started.elapsed().as_secs_f64());

        if rows_affected == 0 {
            record_conflict("postgres");
            // The guarded statement matched nothing; report what is there now.
            let actual = self.current_status(&key).await?;
            return Err(StepStoreError::Conflict {
                key,
                expected: options.expectation,
                actual,
            });
        }

        Ok(())
    }

    async fn query_by_saga(&self, saga_id: SagaId) -> Result<Vec<SagaStepMetadata>> {
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM saga_steps WHERE saga_id = $1 ORDER BY sequence ASC"
        );
        let started = Instant::now();
        let rows = sqlx::query(&sql)
            .bind(saga_id.as_uuid())
            .fetch_all(&self.pool)
            .await?;
        metrics::histogram!("saga_step_store_query_seconds")
            .record(started.elapsed().as_secs_f64());

        rows.into_iter().map(Self::row_to_step).collect()
    }

    async fn get_saga_data(&self, saga_id: SagaId) -> Result<Option<SagaData>> {
        let row = sqlx::query("SELECT version, data FROM saga_data WHERE saga_id = $1")
            .bind(saga_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let version: i64 = row.try_get("version")?;
        let mut data: SagaData = serde_json::from_value(row.try_get("data")?)?;
        data.version = version as u64;
        Ok(Some(data))
    }

    async fn save_saga_data(&self, data: &SagaData) -> Result<u64> {
        let new_version = data.version + 1;
        let mut stored = data.clone();
        stored.version = new_version;
        stored.updated_at = chrono::Utc::now();
        let json = serde_json::to_value(&stored)?;

        let rows_affected = if data.version == 0 {
            sqlx::query(
                r#"
                INSERT INTO saga_data (saga_id, version, data, updated_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (saga_id) DO NOTHING
                "#,
            )
            .bind(data.saga_id.as_uuid())
            .bind(new_version as i64)
            .bind(json)
            .bind(stored.updated_at)
            .execute(&self.pool)
            .await?
            .rows_affected()
        } else {
            sqlx::query(
                r#"
                UPDATE saga_data SET version = $2, data = $3, updated_at = $4
                WHERE saga_id = $1 AND version = $5
                "#,
            )
            .bind(data.saga_id.as_uuid())
            .bind(new_version as i64)
            .bind(json)
            .bind(stored.updated_at)
            .bind(data.version as i64)
            .execute(&self.pool)
            .await?
            .rows_affected()
        };

        if rows_affected == 0 {
            let actual: Option<i64> =
                sqlx::query_scalar("SELECT version FROM saga_data WHERE saga_id = $1")
                    .bind(data.saga_id.as_uuid())
                    .fetch_optional(&self.pool)
                    .await?;
            return Err(StepStoreError::SagaDataConflict {
                saga_id: data.saga_id,
                expected: data.version,
                actual: actual.unwrap_or(0) as u64,
            });
        }

        Ok(new_version)
    }
}

#[async_trait]
impl HealthCheck for PostgresStepStore {
    fn name(&self) -> &'static str {
        "step_store"
    }

    async fn ping(&self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, sqlx::query("SELECT 1").execute(&self.pool)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "step store ping failed");
                false
            }
            Err(_) => {
                tracing::warn!(?timeout, "step store ping timed out");
                false
            }
        }
    }
}
