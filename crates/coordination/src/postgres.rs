use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{CoordinationError, Result};
use crate::lock::{Lease, LockManager};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Leases stored as rows of `lock_leases`.
///
/// An acquire inserts the row, or takes it over when the previous lease has
/// expired; otherwise it polls until the wait runs out.
#[derive(Clone)]
pub struct PostgresLockManager {
    pool: PgPool,
    poll_interval: Duration,
}

impl PostgresLockManager {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn try_acquire(&self, key: &str, holder: Uuid, lease: Duration) -> Result<Option<DateTime<Utc>>> {
        let expires_at: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            INSERT INTO lock_leases (key, holder, expires_at, acquired_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3), NOW())
            ON CONFLICT (key) DO UPDATE
                SET holder = EXCLUDED.holder,
                    expires_at = EXCLUDED.expires_at,
                    acquired_at = EXCLUDED.acquired_at
                WHERE lock_leases.expires_at <= NOW()
            RETURNING expires_at
            "#,
        )
        .bind(key)
        .bind(holder)
        .bind(lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;
        Ok(expires_at)
    }
}

#[async_trait]
impl LockManager for PostgresLockManager {
    async fn acquire(&self, key: &str, wait: Duration, lease: Duration) -> Result<Lease> {
        let holder = Uuid::new_v4();
        let deadline = Instant::now() + wait;
        loop {
            if let Some(expires_at) = self.try_acquire(key, holder, lease).await? {
                return Ok(Lease {
                    key: key.to_string(),
                    holder,
                    expires_at,
                });
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(CoordinationError::LockTimeout {
                    key: key.to_string(),
                    waited: wait,
                });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn release(&self, lease: &Lease) -> Result<bool> {
        let result = sqlx::query("DELETE FROM lock_leases WHERE key = $1 AND holder = $2")
            .bind(&lease.key)
            .bind(lease.holder)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}
