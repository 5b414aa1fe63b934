//! Order saga: checkout, the stock → balance → completion pipeline,
//! compensations, durable retries and flash-sale coupon issuance.
//!
//! ```text
//! create_order ──order-created──► stock ──stock-reserved──► balance ──order-completed──► completion
//!                                   │                          │                            │
//!                                   └── cancel ◄── compensate ─┘        coupon + popularity ┘
//! ```
//!
//! Failures that need re-driving are recorded in the retry store and swept
//! by the [`RetryScheduler`].

pub mod balance;
pub mod bus;
pub mod compensation;
pub mod coupon;
pub mod error;
pub mod messages;
pub mod orchestrator;
pub mod pipeline;
pub mod retry;
pub mod services;
pub mod settings;
pub mod stages;

pub use balance::BalanceService;
pub use bus::{BusSettings, DeadLetter, Envelope, InMemoryBus, MessageHandler};
pub use compensation::{CompensationOutcome, Compensator};
pub use coupon::{CouponIssueService, CouponMaterializer, IssueResult, Materialized};
pub use error::{ErrorClass, Result, SagaError};
pub use messages::{CouponIssued, LineItem, StageEvent, StagePayload, channels};
pub use orchestrator::OrderOrchestrator;
pub use pipeline::{Backends, Saga};
pub use retry::{FailedStage, FailureRecorder, RetryScheduler, SweepReport};
pub use services::{InMemoryPopularityCounter, PopularityCounter};
pub use settings::SagaSettings;
pub use stages::{BalanceDeductionHandler, CompletionHandler, StockReservationHandler};
