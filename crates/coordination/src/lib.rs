//! Cross-worker coordination primitives.
//!
//! - [`LockManager`]: named leases with a bounded wait and auto-expiry
//! - [`QuantityAllocator`]: atomic capped issuance for flash-sale coupons
//! - [`RetryPolicy`]: bounded local retries with capped exponential backoff

pub mod allocator;
pub mod error;
pub mod lock;
pub mod postgres;
pub mod retry;

pub use allocator::{AllocationOutcome, InMemoryQuantityAllocator, QuantityAllocator};
pub use error::{CoordinationError, Result};
pub use lock::{InMemoryLockManager, Lease, LeaseGuard, LockManager, keys, with_lock};
pub use postgres::PostgresLockManager;
pub use retry::RetryPolicy;
