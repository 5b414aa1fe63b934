use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EventStoreError, Result};

/// Default retry ceiling of a new record.
pub const DEFAULT_MAX_RETRY_COUNT: u32 = 3;

/// Aggregate type recorded for order-scoped failures.
pub const ORDER_AGGREGATE: &str = "Order";

/// Surrogate key of a stored retryable event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(i64);

impl EventId {
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for EventId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Which stage a recorded failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    StockDeduction,
    BalanceDeduction,
    CouponUsage,
    PopularProductAggregation,
}

impl EventType {
    pub const ALL: [EventType; 4] = [
        EventType::StockDeduction,
        EventType::BalanceDeduction,
        EventType::CouponUsage,
        EventType::PopularProductAggregation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::StockDeduction => "STOCK_DEDUCTION",
            EventType::BalanceDeduction => "BALANCE_DEDUCTION",
            EventType::CouponUsage => "COUPON_USAGE",
            EventType::PopularProductAggregation => "POPULAR_PRODUCT_AGGREGATION",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = EventStoreError;

    fn from_str(s: &str) -> Result<Self> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| EventStoreError::UnknownVariant {
                kind: "event type",
                value: s.to_string(),
            })
    }
}

/// Status of a retryable event.
///
/// ```text
/// PENDING ──► PROCESSING ──► COMPLETED
///    ▲            │
///    └─(retries)──┤
///                 └─(ceiling)──► FAILED ──(manual reset)──► PENDING
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "PENDING",
            EventStatus::Processing => "PROCESSING",
            EventStatus::Completed => "COMPLETED",
            EventStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = EventStoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(EventStatus::Pending),
            "PROCESSING" => Ok(EventStatus::Processing),
            "COMPLETED" => Ok(EventStatus::Completed),
            "FAILED" => Ok(EventStatus::Failed),
            other => Err(EventStoreError::UnknownVariant {
                kind: "event status",
                value: other.to_string(),
            }),
        }
    }
}

/// Delay before the next attempt, given the failures so far.
///
/// 1 minute, 5 minutes, 15 minutes, then 30 minutes.
pub fn backoff(retry_count: u32) -> Duration {
    match retry_count {
        0 => Duration::minutes(1),
        1 => Duration::minutes(5),
        2 => Duration::minutes(15),
        _ => Duration::minutes(30),
    }
}

/// A failure to record.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRetryableEvent {
    pub event_type: EventType,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub payload: serde_json::Value,
    pub max_retry_count: u32,
}

impl NewRetryableEvent {
    /// An order-scoped failure with the default retry ceiling.
    pub fn for_order<T: Serialize>(
        event_type: EventType,
        order_id: impl ToString,
        payload: &T,
    ) -> Result<Self> {
        Ok(Self {
            event_type,
            aggregate_id: order_id.to_string(),
            aggregate_type: ORDER_AGGREGATE.to_string(),
            payload: serde_json::to_value(payload)?,
            max_retry_count: DEFAULT_MAX_RETRY_COUNT,
        })
    }

    pub fn with_max_retry_count(mut self, max_retry_count: u32) -> Self {
        self.max_retry_count = max_retry_count;
        self
    }
}

/// A persisted failure awaiting re-execution.
///
/// Never deleted; completed and failed records remain as an audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryableEvent {
    pub id: EventId,
    pub event_type: EventType,
    pub status: EventStatus,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub payload: serde_json::Value,
    pub retry_count: u32,
    pub max_retry_count: u32,
    pub next_retry_at: DateTime<Utc>,
    /// Every failure reason so far, one `[attempt N] reason` per line.
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl RetryableEvent {
    /// A fresh `PENDING` record, first eligible one backoff step from now.
    pub fn from_new(id: EventId, new: NewRetryableEvent, now: DateTime<Utc>) -> Self {
        Self {
            id,
            event_type: new.event_type,
            status: EventStatus::Pending,
            aggregate_id: new.aggregate_id,
            aggregate_type: new.aggregate_type,
            payload: new.payload,
            retry_count: 0,
            max_retry_count: new.max_retry_count,
            next_retry_at: now + backoff(0),
            last_error: None,
            created_at: now,
            updated_at: now,
            processed_at: None,
        }
    }

    /// Deserializes the payload.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn can_retry(&self) -> bool {
        self.status == EventStatus::Pending && self.retry_count < self.max_retry_count
    }

    /// Whether a sweep at `now` should pick this record up.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.can_retry() && self.next_retry_at <= now
    }

    pub fn start_processing(&mut self, now: DateTime<Utc>) -> Result<()> {
        if matches!(self.status, EventStatus::Completed | EventStatus::Failed)
            || self.retry_count >= self.max_retry_count
        {
            return Err(self.invalid("start processing"));
        }
        self.status = EventStatus::Processing;
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = EventStatus::Completed;
        self.processed_at = Some(now);
        self.updated_at = now;
    }

    /// Counts a failed attempt and either reschedules or gives up.
    pub fn mark_failed(&mut self, reason: &str, now: DateTime<Utc>) {
        self.retry_count += 1;
        self.append_note(&format!("[attempt {}] {}", self.retry_count, reason));
        if self.retry_count >= self.max_retry_count {
            self.status = EventStatus::Failed;
        } else {
            self.status = EventStatus::Pending;
            self.next_retry_at = now + backoff(self.retry_count);
        }
        self.updated_at = now;
    }

    /// Puts a `FAILED` record back into the retry pool.
    pub fn reset_for_manual_retry(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != EventStatus::Failed {
            return Err(self.invalid("manually retry"));
        }
        self.status = EventStatus::Pending;
        self.retry_count = 0;
        self.next_retry_at = now;
        self.updated_at = now;
        self.append_note(&format!("[manual retry] reset at {}", now.to_rfc3339()));
        Ok(())
    }

    fn append_note(&mut self, note: &str) {
        self.last_error = Some(match self.last_error.take() {
            Some(previous) => format!("{previous}\n{note}"),
            None => note.to_string(),
        });
    }

    fn invalid(&self, action: &'static str) -> EventStoreError {
        EventStoreError::InvalidTransition {
            id: self.id,
            status: self.status,
            action,
        }
    }
}
