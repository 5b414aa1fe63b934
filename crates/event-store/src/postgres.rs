use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::{
    EventId, EventStatus, EventStoreError, NewRetryableEvent, Result, RetryableEvent,
    event::backoff, store::RetryEventStore,
};

const COLUMNS: &str = "id, event_type, status, aggregate_id, aggregate_type, payload, \
     retry_count, max_retry_count, next_retry_at, last_error, created_at, updated_at, processed_at";

/// PostgreSQL-backed retry store over the `retryable_events` table.
#[derive(Clone)]
pub struct PostgresRetryEventStore {
    pool: PgPool,
}

impl PostgresRetryEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_event(row: PgRow) -> Result<RetryableEvent> {
        let event_type: String = row.try_get("event_type")?;
        let status: String = row.try_get("status")?;
        Ok(RetryableEvent {
            id: EventId::new(row.try_get("id")?),
            event_type: event_type.parse()?,
            status: status.parse()?,
            aggregate_id: row.try_get("aggregate_id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            payload: row.try_get("payload")?,
            retry_count: count(row.try_get("retry_count")?),
            max_retry_count: count(row.try_get("max_retry_count")?),
            next_retry_at: row.try_get("next_retry_at")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            processed_at: row.try_get("processed_at")?,
        })
    }

    async fn select(&self, filter: &str, bind: &str) -> Result<Vec<RetryableEvent>> {
        let sql = format!("SELECT {COLUMNS} FROM retryable_events WHERE {filter} ORDER BY id ASC");
        let rows = sqlx::query(&sql).bind(bind).fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_event).collect()
    }
}

fn count(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn column(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[async_trait]
impl RetryEventStore for PostgresRetryEventStore {
    #[tracing::instrument(skip(self, event), fields(event_type = %event.event_type, aggregate_id = %event.aggregate_id))]
    async fn record(&self, event: NewRetryableEvent) -> Result<RetryableEvent> {
        let now = Utc::now();
        let sql = format!(
            r#"
            INSERT INTO retryable_events
                (event_type, status, aggregate_id, aggregate_type, payload,
                 retry_count, max_retry_count, next_retry_at, created_at, updated_at)
            VALUES ($1, 'PENDING', $2, $3, $4, 0, $5, $6, $7, $7)
            ON CONFLICT ON CONSTRAINT retryable_events_type_aggregate_key DO NOTHING
            RETURNING {COLUMNS}
            "#
        );
        let inserted = sqlx::query(&sql)
            .bind(event.event_type.as_str())
            .bind(&event.aggregate_id)
            .bind(&event.aggregate_type)
            .bind(&event.payload)
            .bind(column(event.max_retry_count))
            .bind(now + backoff(0))
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = inserted {
            return Self::row_to_event(row);
        }

        let sql = format!(
            "SELECT {COLUMNS} FROM retryable_events WHERE event_type = $1 AND aggregate_id = $2"
        );
        let row = sqlx::query(&sql)
            .bind(event.event_type.as_str())
            .bind(&event.aggregate_id)
            .fetch_one(&self.pool)
            .await?;
        tracing::debug!("Failure already recorded");
        Self::row_to_event(row)
    }

    async fn find(&self, id: EventId) -> Result<Option<RetryableEvent>> {
        let sql = format!("SELECT {COLUMNS} FROM retryable_events WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.value())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_event).transpose()
    }

    async fn find_retryable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RetryableEvent>> {
        let sql = format!(
            r#"
            SELECT {COLUMNS}
            FROM retryable_events
            WHERE status = 'PENDING'
              AND retry_count < max_retry_count
              AND next_retry_at <= $1
            ORDER BY next_retry_at ASC, id ASC
            LIMIT $2
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn find_by_status(&self, status: EventStatus) -> Result<Vec<RetryableEvent>> {
        self.select("status = $1", status.as_str()).await
    }

    async fn find_by_aggregate(&self, aggregate_id: &str) -> Result<Vec<RetryableEvent>> {
        self.select("aggregate_id = $1", aggregate_id).await
    }

    async fn save(&self, event: &RetryableEvent) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE retryable_events
            SET status = $2, retry_count = $3, max_retry_count = $4, next_retry_at = $5,
                last_error = $6, updated_at = $7, processed_at = $8
            WHERE id = $1
            "#,
        )
        .bind(event.id.value())
        .bind(event.status.as_str())
        .bind(column(event.retry_count))
        .bind(column(event.max_retry_count))
        .bind(event.next_retry_at)
        .bind(&event.last_error)
        .bind(event.updated_at)
        .bind(event.processed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EventStoreError::NotFound(event.id));
        }
        Ok(())
    }
}
