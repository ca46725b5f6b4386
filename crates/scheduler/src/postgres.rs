use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{HealthCheck, MessageEnvelope, ScheduleId};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{Result, ScheduleError, ScheduleStatus, ScheduleStore, ScheduledEntry};

const ENTRY_COLUMNS: &str =
    "schedule_id, due_at, envelope, status, attempts, last_error, created_at, updated_at";

/// PostgreSQL-backed schedule store implementation.
#[derive(Clone)]
pub struct PostgresScheduleStore {
    pool: PgPool,
}

impl PostgresScheduleStore {
    /// Creates a new PostgreSQL schedule store.
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

    fn row_to_entry(row: PgRow) -> Result<ScheduledEntry> {
        let status: String = row.try_get("status")?;
        let status = ScheduleStatus::parse(&status)
            .ok_or_else(|| ScheduleError::Corrupted(format!("unknown status {status}")))?;
        let envelope: MessageEnvelope = serde_json::from_value(row.try_get("envelope")?)?;
        let attempts: i32 = row.try_get("attempts")?;

        Ok(ScheduledEntry {
            schedule_id: ScheduleId::from_uuid(row.try_get::<Uuid, _>("schedule_id")?),
            envelope,
            due_at: row.try_get("due_at")?,
            status,
            attempts: attempts.max(0) as u32,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn exists(&self, schedule_id: ScheduleId) -> Result<bool> {
        let found: Option<i32> =
            sqlx::query_scalar("SELECT 1 FROM scheduled_entries WHERE schedule_id = $1")
                .bind(schedule_id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }
}

#[async_trait]
impl ScheduleStore for PostgresScheduleStore {
    async fn enqueue(&self, entry: ScheduledEntry) -> Result<()> {
        let envelope = serde_json::to_value(&entry.envelope)?;
        sqlx::query(&format!(
            "INSERT INTO scheduled_entries ({ENTRY_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
        ))
        .bind(entry.schedule_id.as_uuid())
        .bind(entry.due_at)
        .bind(envelope)
        .bind(entry.status.as_str())
        .bind(entry.attempts as i32)
        .bind(&entry.last_error)
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn dequeue_due(&self, now: DateTime<Utc>, max: usize) -> Result<Vec<ScheduledEntry>> {
        if max == 0 {
            return Err(ScheduleError::InvalidBatchSize);
        }
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM scheduled_entries \
             WHERE status = 'pending' AND due_at <= $1 \
             ORDER BY due_at ASC, created_at ASC LIMIT $2"
        ))
        .bind(now)
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_entry).collect()
    }

    async fn mark_succeeded(&self, schedule_id: ScheduleId) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE scheduled_entries SET status = 'succeeded', updated_at = $2
            WHERE schedule_id = $1 AND status = 'pending'
            "#,
        )
        .bind(schedule_id.as_uuid())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 && !self.exists(schedule_id).await? {
            return Err(ScheduleError::NotFound(schedule_id));
        }
        Ok(())
    }

    async fn mark_cancelled(&self, schedule_id: ScheduleId) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE scheduled_entries SET status = 'cancelled', updated_at = $2
            WHERE schedule_id = $1 AND status = 'pending'
            "#,
        )
        .bind(schedule_id.as_uuid())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            if !self.exists(schedule_id).await? {
                return Err(ScheduleError::NotFound(schedule_id));
            }
            return Ok(false);
        }
        Ok(true)
    }

    async fn record_failure(
        &self,
        schedule_id: ScheduleId,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE scheduled_entries
            SET attempts = attempts + 1,
                last_error = $2,
                due_at = CASE WHEN status = 'pending' THEN $3 ELSE due_at END,
                updated_at = $4
            WHERE schedule_id = $1
            "#,
        )
        .bind(schedule_id.as_uuid())
        .bind(error)
        .bind(retry_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(ScheduleError::NotFound(schedule_id));
        }
        Ok(())
    }

    async fn mark_failed(&self, schedule_id: ScheduleId, error: &str) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE scheduled_entries
            SET attempts = attempts + 1,
                last_error = $2,
                status = CASE WHEN status = 'pending' THEN 'failed' ELSE status END,
                updated_at = $3
            WHERE schedule_id = $1
            "#,
        )
        .bind(schedule_id.as_uuid())
        .bind(error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(ScheduleError::NotFound(schedule_id));
        }
        Ok(())
    }

    async fn get(&self, schedule_id: ScheduleId) -> Result<Option<ScheduledEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM scheduled_entries WHERE schedule_id = $1"
        ))
        .bind(schedule_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_entry).transpose()
    }
}

#[async_trait]
impl HealthCheck for PostgresScheduleStore {
    fn name(&self) -> &'static str {
        "schedule_store"
    }

    async fn ping(&self, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, sqlx::query("SELECT 1").execute(&self.pool)).await,
            Ok(Ok(_))
        )
    }
}
