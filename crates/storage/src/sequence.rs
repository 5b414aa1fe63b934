//! Per-day order-number sequence.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use domain::OrderNumber;
use sqlx::PgPool;
use tokio::sync::Mutex;

use crate::{Result, StoreError};

/// Hands out order numbers, strictly increasing per calendar day.
///
/// Numbers are drawn outside the caller's transaction, so an order that
/// later rolls back leaves a gap instead of reusing its number.
#[async_trait]
pub trait SequenceGenerator: Send + Sync {
    async fn next_for_date(&self, date: NaiveDate) -> Result<OrderNumber>;

    /// Next number for today's UTC date.
    async fn next_order_number(&self) -> Result<OrderNumber> {
        self.next_for_date(Utc::now().date_naive()).await
    }
}

/// One async mutex per day.
#[derive(Clone, Default)]
pub struct InMemorySequenceGenerator {
    days: Arc<Mutex<HashMap<NaiveDate, Arc<Mutex<u64>>>>>,
}

impl InMemorySequenceGenerator {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SequenceGenerator for InMemorySequenceGenerator {
    async fn next_for_date(&self, date: NaiveDate) -> Result<OrderNumber> {
        let counter = Arc::clone(self.days.lock().await.entry(date).or_default());
        let mut last = counter.lock().await;
        *last += 1;
        Ok(OrderNumber::new(date, *last))
    }
}

/// Counter rows in `order_sequences`, bumped in their own pool transaction.
#[derive(Clone)]
pub struct PostgresSequenceGenerator {
    pool: PgPool,
}

impl PostgresSequenceGenerator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SequenceGenerator for PostgresSequenceGenerator {
    async fn next_for_date(&self, date: NaiveDate) -> Result<OrderNumber> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO order_sequences (order_date, last_value) VALUES ($1, 0) ON CONFLICT (order_date) DO NOTHING",
        )
        .bind(date)
        .execute(&mut *tx)
        .await?;

        let last: i64 = sqlx::query_scalar(
            "SELECT last_value FROM order_sequences WHERE order_date = $1 FOR UPDATE",
        )
        .bind(date)
        .fetch_one(&mut *tx)
        .await?;
        let next = last + 1;

        sqlx::query("UPDATE order_sequences SET last_value = $2 WHERE order_date = $1")
            .bind(date)
            .bind(next)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let sequence =
            u64::try_from(next).map_err(|_| StoreError::Corrupt(format!("sequence = {next}")))?;
        tracing::debug!(%date, sequence, "order number drawn");
        Ok(OrderNumber::new(date, sequence))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[tokio::test]
    async fn first_number_of_a_day_is_one() {
        let generator = InMemorySequenceGenerator::new();
        let day = NaiveDate::from_ymd_opt(2025, 2, 1).unwrap();
        assert_eq!(
            generator.next_for_date(day).await.unwrap().as_str(),
            "ORD-20250201-000001"
        );
        assert_eq!(generator.next_for_date(day).await.unwrap().sequence(), 2);
    }

    #[tokio::test]
    async fn each_day_has_its_own_counter() {
        let generator = InMemorySequenceGenerator::new();
        let monday = NaiveDate::from_ymd_opt(2025, 2, 3).unwrap();
        let tuesday = NaiveDate::from_ymd_opt(2025, 2, 4).unwrap();
        generator.next_for_date(monday).await.unwrap();
        generator.next_for_date(monday).await.unwrap();
        assert_eq!(generator.next_for_date(tuesday).await.unwrap().sequence(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_draws_are_unique_and_dense() {
        let generator = InMemorySequenceGenerator::new();
        let day = NaiveDate::from_ymd_opt(2025, 2, 5).unwrap();
        let handles: Vec<_> = (0..200)
            .map(|_| {
                let generator = generator.clone();
                tokio::spawn(async move { generator.next_for_date(day).await.unwrap().sequence() })
            })
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            assert!(seen.insert(handle.await.unwrap()));
        }
        assert_eq!(seen, (1..=200).collect::<HashSet<u64>>());
    }
}
