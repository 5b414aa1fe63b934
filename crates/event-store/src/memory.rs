use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{
    EventId, EventStatus, EventStoreError, NewRetryableEvent, Result, RetryableEvent,
    store::RetryEventStore,
};

#[derive(Default)]
struct Inner {
    events: BTreeMap<EventId, RetryableEvent>,
    next_id: i64,
}

/// In-memory retry store for tests and single-process runs.
///
/// Provides the same interface as the PostgreSQL implementation.
#[derive(Clone, Default)]
pub struct InMemoryRetryEventStore {
    inner: Arc<RwLock<Inner>>,
    fail_on_record: Arc<AtomicBool>,
}

impl InMemoryRetryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `record` fail.
    pub fn set_fail_on_record(&self, fail: bool) {
        self.fail_on_record.store(fail, Ordering::SeqCst);
    }

    /// Returns the total number of records stored.
    pub async fn event_count(&self) -> usize {
        self.inner.read().await.events.len()
    }

    /// Returns every record, in id order.
    pub async fn all(&self) -> Vec<RetryableEvent> {
        self.inner.read().await.events.values().cloned().collect()
    }
}

#[async_trait]
impl RetryEventStore for InMemoryRetryEventStore {
    async fn record(&self, event: NewRetryableEvent) -> Result<RetryableEvent> {
        if self.fail_on_record.load(Ordering::SeqCst) {
            return Err(EventStoreError::Database(sqlx::Error::Protocol(
                "retry store unavailable".into(),
            )));
        }

        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.events.values().find(|e| {
            e.event_type == event.event_type && e.aggregate_id == event.aggregate_id
        }) {
            return Ok(existing.clone());
        }

        inner.next_id += 1;
        let id = EventId::new(inner.next_id);
        let stored = RetryableEvent::from_new(id, event, Utc::now());
        inner.events.insert(id, stored.clone());
        Ok(stored)
    }

    async fn find(&self, id: EventId) -> Result<Option<RetryableEvent>> {
        Ok(self.inner.read().await.events.get(&id).cloned())
    }

    async fn find_retryable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RetryableEvent>> {
        let inner = self.inner.read().await;
        let mut due: Vec<_> = inner
            .events
            .values()
            .filter(|e| e.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.next_retry_at.cmp(&b.next_retry_at).then(a.id.cmp(&b.id)));
        due.truncate(limit);
        Ok(due)
    }

    async fn find_by_status(&self, status: EventStatus) -> Result<Vec<RetryableEvent>> {
        let inner = self.inner.read().await;
        Ok(inner
            .events
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect())
    }

    async fn find_by_aggregate(&self, aggregate_id: &str) -> Result<Vec<RetryableEvent>> {
        let inner = self.inner.read().await;
        Ok(inner
            .events
            .values()
            .filter(|e| e.aggregate_id == aggregate_id)
            .cloned()
            .collect())
    }

    async fn save(&self, event: &RetryableEvent) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.events.get_mut(&event.id) {
            Some(slot) => {
                *slot = event.clone();
                Ok(())
            }
            None => Err(EventStoreError::NotFound(event.id)),
        }
    }
}
