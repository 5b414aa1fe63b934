//! Flash-sale coupon issuance.
//!
//! The fast path grants through the [`QuantityAllocator`](coordination::QuantityAllocator)
//! and materializes grants asynchronously; the lease path does everything
//! in one locked transaction.

pub mod issuance;
pub mod materializer;

pub use issuance::{CouponIssueService, IssueResult};
pub use materializer::{CouponMaterializer, Materialized};
