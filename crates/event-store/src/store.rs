use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{EventId, EventStatus, NewRetryableEvent, Result, RetryableEvent};

/// Durable record of failed stage work awaiting re-execution.
///
/// Implementations must be thread-safe and support concurrent access.
#[async_trait]
pub trait RetryEventStore: Send + Sync {
    /// Records a failure.
    ///
    /// At most one record exists per `(event_type, aggregate_id)`: recording
    /// the same pair again returns the existing record untouched.
    async fn record(&self, event: NewRetryableEvent) -> Result<RetryableEvent>;

    /// Loads a record by id.
    async fn find(&self, id: EventId) -> Result<Option<RetryableEvent>>;

    /// Records that are `PENDING`, under their ceiling and due at `now`,
    /// earliest `next_retry_at` first.
    async fn find_retryable(&self, now: DateTime<Utc>, limit: usize)
    -> Result<Vec<RetryableEvent>>;

    /// Records in the given status, oldest first.
    async fn find_by_status(&self, status: EventStatus) -> Result<Vec<RetryableEvent>>;

    /// Records for one aggregate, oldest first.
    async fn find_by_aggregate(&self, aggregate_id: &str) -> Result<Vec<RetryableEvent>>;

    /// Persists the mutable fields of an existing record.
    async fn save(&self, event: &RetryableEvent) -> Result<()>;
}

/// Convenience methods for retry stores.
#[async_trait]
pub trait RetryEventStoreExt: RetryEventStore {
    /// Records that exhausted their retries.
    async fn find_failed(&self) -> Result<Vec<RetryableEvent>> {
        self.find_by_status(EventStatus::Failed).await
    }

    /// Loads a record, failing when it does not exist.
    async fn get(&self, id: EventId) -> Result<RetryableEvent> {
        self.find(id)
            .await?
            .ok_or(crate::EventStoreError::NotFound(id))
    }
}

impl<T: RetryEventStore + ?Sized> RetryEventStoreExt for T {}
