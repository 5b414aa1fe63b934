//! Durable store of failed stage work and its retry schedule.

pub mod error;
pub mod event;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::{EventStoreError, Result};
pub use event::{
    DEFAULT_MAX_RETRY_COUNT, EventId, EventStatus, EventType, NewRetryableEvent, ORDER_AGGREGATE,
    RetryableEvent, backoff,
};
pub use memory::InMemoryRetryEventStore;
pub use postgres::PostgresRetryEventStore;
pub use store::{RetryEventStore, RetryEventStoreExt};
