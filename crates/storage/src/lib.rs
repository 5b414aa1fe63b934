//! Persistence for the order-fulfillment backend.
//!
//! - [`UnitOfWork`] / [`Transaction`]: one local transaction over every
//!   repository, with in-memory and PostgreSQL backends
//! - [`SequenceGenerator`]: per-day order numbers drawn in an isolated transaction

pub mod error;
pub mod memory;
pub mod postgres;
pub mod sequence;
pub mod uow;

pub use error::{Result, StoreError};
pub use memory::{InMemoryStore, InMemoryTransaction, WriteTarget};
pub use postgres::{PgTransaction, PostgresStore};
pub use sequence::{InMemorySequenceGenerator, PostgresSequenceGenerator, SequenceGenerator};
pub use uow::{Transaction, UnitOfWork, constraints};
