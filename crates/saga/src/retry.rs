//! Durable re-driving of failed stage work.
//!
//! Stages hand their failures to a [`FailureRecorder`]; the
//! [`RetryScheduler`] sweeps due records under a cluster-wide lease and
//! re-executes them until they complete or exhaust their ceiling.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use coordination::{CoordinationError, LeaseGuard, LockManager, keys};
use event_store::{
    EventId, EventStatus, EventType, NewRetryableEvent, RetryEventStore, RetryEventStoreExt,
    RetryableEvent,
};
use serde::{Deserialize, Serialize};

use crate::compensation::Compensator;
use crate::error::Result;
use crate::messages::StagePayload;
use crate::settings::SagaSettings;
use crate::stages::CompletionHandler;

/// Payload persisted with a retryable event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedStage {
    /// The failure that caused the record.
    pub reason: String,
    #[serde(flatten)]
    pub order: StagePayload,
}

/// Persists stage failures for later re-execution.
///
/// Recording never fails the caller: a store error is logged and the
/// failure stays visible in the logs only.
#[derive(Clone)]
pub struct FailureRecorder {
    store: Arc<dyn RetryEventStore>,
}

impl FailureRecorder {
    pub fn new(store: Arc<dyn RetryEventStore>) -> Self {
        Self { store }
    }

    pub async fn record(
        &self,
        event_type: EventType,
        payload: &StagePayload,
        reason: &str,
    ) -> Option<RetryableEvent> {
        let failed = FailedStage {
            reason: reason.to_string(),
            order: payload.clone(),
        };
        let new = match NewRetryableEvent::for_order(event_type, payload.order_id, &failed) {
            Ok(new) => new,
            Err(e) => {
                tracing::error!(error = %e, order_id = %payload.order_id, "could not encode retryable event");
                return None;
            }
        };
        match self.store.record(new).await {
            Ok(event) => {
                metrics::counter!("retry_events_recorded_total", "event_type" => event_type.as_str())
                    .increment(1);
                tracing::warn!(
                    event_id = %event.id,
                    event_type = %event_type,
                    order_id = %payload.order_id,
                    reason,
                    "stage failure recorded for retry"
                );
                Some(event)
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    event_type = %event_type,
                    order_id = %payload.order_id,
                    "could not record stage failure"
                );
                None
            }
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Another runner held the sweep lease; nothing was attempted.
    pub skipped: bool,
}

/// Re-executes recorded failures with backoff.
pub struct RetryScheduler {
    store: Arc<dyn RetryEventStore>,
    locks: Arc<dyn LockManager>,
    compensator: Compensator,
    completion: Arc<CompletionHandler>,
    settings: SagaSettings,
}

impl RetryScheduler {
    pub fn new(
        store: Arc<dyn RetryEventStore>,
        locks: Arc<dyn LockManager>,
        compensator: Compensator,
        completion: Arc<CompletionHandler>,
        settings: SagaSettings,
    ) -> Self {
        Self {
            store,
            locks,
            compensator,
            completion,
            settings,
        }
    }

    pub async fn retry_all(&self) -> Result<SweepReport> {
        self.retry_all_at(Utc::now()).await
    }

    /// Sweeps records due at `now`, oldest first.
    ///
    /// The sweep lease is tried without waiting; when another runner holds
    /// it this tick is skipped.
    #[tracing::instrument(skip(self))]
    pub async fn retry_all_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let guard = match LeaseGuard::acquire(
            Arc::clone(&self.locks),
            keys::RETRY_SWEEP,
            Duration::ZERO,
            self.settings.retry_sweep_lease,
        )
        .await
        {
            Ok(guard) => guard,
            Err(CoordinationError::LockTimeout { .. }) => {
                metrics::counter!("retry_sweeps_total", "outcome" => "skipped").increment(1);
                tracing::debug!("retry sweep already running elsewhere, skipping");
                return Ok(SweepReport {
                    skipped: true,
                    ..SweepReport::default()
                });
            }
            Err(e) => return Err(e.into()),
        };

        let result = self.sweep(now).await;
        guard.release().await;

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                metrics::counter!("retry_sweeps_total", "outcome" => "error").increment(1);
                return Err(e);
            }
        };
        metrics::counter!("retry_sweeps_total", "outcome" => "completed").increment(1);
        if report.attempted > 0 {
            tracing::info!(
                attempted = report.attempted,
                succeeded = report.succeeded,
                failed = report.failed,
                "retry sweep finished"
            );
        }
        Ok(report)
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let due = self
            .store
            .find_retryable(now, self.settings.retry_batch_size)
            .await?;
        let mut report = SweepReport::default();
        for event in due {
            report.attempted += 1;
            let event_id = event.id;
            match self.process(event, now).await {
                Ok(done) if done.status == EventStatus::Completed => report.succeeded += 1,
                Ok(_) => report.failed += 1,
                Err(e) => {
                    tracing::error!(event_id = %event_id, error = %e, "retry attempt could not run");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Re-executes one record immediately, ignoring its schedule.
    #[tracing::instrument(skip(self), fields(event_id = %id))]
    pub async fn retry_event(&self, id: EventId) -> Result<RetryableEvent> {
        let event = self.store.get(id).await?;
        self.process(event, Utc::now()).await
    }

    /// Returns a `FAILED` record to the pool and re-executes it.
    ///
    /// A `PENDING` record is simply re-executed; a `COMPLETED` one is
    /// rejected.
    #[tracing::instrument(skip(self), fields(event_id = %id))]
    pub async fn manual_retry(&self, id: EventId) -> Result<RetryableEvent> {
        let mut event = self.store.get(id).await?;
        let now = Utc::now();
        if event.status == EventStatus::Failed {
            event.reset_for_manual_retry(now)?;
            self.store.save(&event).await?;
            tracing::info!("failed event reset by operator");
        }
        self.process(event, now).await
    }

    /// Records that exhausted their retries.
    pub async fn failed_events(&self) -> Result<Vec<RetryableEvent>> {
        Ok(self.store.find_failed().await?)
    }

    pub async fn events_for_order(&self, order_id: common::OrderId) -> Result<Vec<RetryableEvent>> {
        Ok(self.store.find_by_aggregate(&order_id.to_string()).await?)
    }

    async fn process(&self, mut event: RetryableEvent, now: DateTime<Utc>) -> Result<RetryableEvent> {
        event.start_processing(now)?;
        self.store.save(&event).await?;

        match self.reexecute(&event).await {
            Ok(()) => {
                event.mark_completed(now);
                self.store.save(&event).await?;
                metrics::counter!("retry_events_completed_total").increment(1);
                tracing::info!(event_id = %event.id, event_type = %event.event_type, "retryable event completed");
            }
            Err(e) => {
                event.mark_failed(&e.to_string(), now);
                self.store.save(&event).await?;
                if event.status == EventStatus::Failed {
                    metrics::counter!("retry_events_failed_total").increment(1);
                    tracing::error!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        aggregate_id = %event.aggregate_id,
                        retry_count = event.retry_count,
                        "retryable event exhausted, manual intervention required"
                    );
                } else {
                    tracing::warn!(
                        event_id = %event.id,
                        attempt = event.retry_count,
                        next_retry_at = %event.next_retry_at,
                        reason = %e,
                        "retry attempt failed, rescheduled"
                    );
                }
            }
        }
        Ok(event)
    }

    async fn reexecute(&self, event: &RetryableEvent) -> Result<()> {
        let failed: FailedStage = event.payload()?;
        let payload = failed.order;
        match event.event_type {
            EventType::StockDeduction | EventType::BalanceDeduction => {
                let reason = format!("retry of {}: {}", event.event_type, failed.reason);
                self.compensator
                    .compensate_order(payload.order_id, &reason)
                    .await?;
                Ok(())
            }
            EventType::CouponUsage => self.completion.redeem_coupon(&payload).await,
            EventType::PopularProductAggregation => {
                self.completion.aggregate_popularity(&payload).await
            }
        }
    }
}
