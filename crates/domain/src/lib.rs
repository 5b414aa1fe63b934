//! Entities and local business rules of the order-fulfillment backend.
//!
//! Everything here is synchronous and storage-agnostic: entities validate
//! and apply their own transitions, and callers persist the result.

pub mod account;
pub mod cart;
pub mod coupon;
pub mod error;
pub mod ledger;
pub mod order;
pub mod product;
pub mod value_objects;

pub use account::Account;
pub use cart::CartLine;
pub use coupon::{
    Coupon, CouponStatus, DiscountKind, MarkUsed, NewUserCoupon, OrderCoupon, UserCoupon,
    UserCouponStatus,
};
pub use error::{DomainError, ErrorKind, Result};
pub use ledger::{
    BalanceLedgerEntry, BalanceMovement, StockLedgerEntry, StockMovement, outstanding_reservations,
};
pub use order::{NewOrder, Order, OrderAmounts, OrderItem, OrderStatus, Payment, PaymentStatus};
pub use product::Product;
pub use value_objects::{Money, OrderNumber};
