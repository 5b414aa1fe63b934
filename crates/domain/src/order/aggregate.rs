//! Order root entity.

use chrono::{DateTime, Utc};
use common::{OrderId, UserCouponId, UserId};
use serde::{Deserialize, Serialize};

use super::{OrderAmounts, OrderItem, OrderStatus};
use crate::error::{DomainError, Result};
use crate::value_objects::{Money, OrderNumber};

/// Everything needed to persist a new order; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrder {
    pub order_number: OrderNumber,
    pub user_id: UserId,
    pub items: Vec<OrderItem>,
    pub amounts: OrderAmounts,
    pub user_coupon_id: Option<UserCouponId>,
    pub idempotency_key: String,
    pub ordered_at: DateTime<Utc>,
}

/// An order and its lifecycle.
///
/// Status changes go through [`Order::complete_pay`], [`Order::cancel`] and
/// [`Order::refund`], which enforce the status machine in [`OrderStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub order_number: OrderNumber,
    pub user_id: UserId,
    pub items: Vec<OrderItem>,
    pub total_amount: Money,
    pub discount_amount: Money,
    pub final_amount: Money,
    pub status: OrderStatus,
    pub user_coupon_id: Option<UserCouponId>,
    pub idempotency_key: String,
    pub ordered_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
}

impl Order {
    /// Materializes a freshly inserted order in `Pending`.
    pub fn from_new(id: OrderId, new: NewOrder) -> Self {
        Self {
            id,
            order_number: new.order_number,
            user_id: new.user_id,
            items: new.items,
            total_amount: new.amounts.total(),
            discount_amount: new.amounts.discount(),
            final_amount: new.amounts.final_amount(),
            status: OrderStatus::Pending,
            user_coupon_id: new.user_coupon_id,
            idempotency_key: new.idempotency_key,
            ordered_at: new.ordered_at,
            paid_at: None,
            cancelled_at: None,
            cancellation_reason: None,
        }
    }

    /// Returns the amounts, re-checking the invariant.
    pub fn amounts(&self) -> Result<OrderAmounts> {
        let amounts = OrderAmounts::from_parts(self.total_amount, self.discount_amount)?;
        if amounts.final_amount() != self.final_amount {
            return Err(DomainError::InvalidDiscount {
                discount: self.discount_amount,
                total: self.total_amount,
            });
        }
        Ok(amounts)
    }

    /// Marks the order paid. Only a pending order can be paid.
    pub fn complete_pay(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_complete_pay() {
            return Err(self.invalid("complete payment for"));
        }
        self.status = OrderStatus::Paid;
        self.paid_at = Some(now);
        Ok(())
    }

    /// Cancels the order with a reason.
    pub fn cancel(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_cancel() {
            return Err(self.invalid("cancel"));
        }
        self.status = OrderStatus::Cancelled;
        self.cancelled_at = Some(now);
        self.cancellation_reason = Some(reason.into());
        Ok(())
    }

    pub fn refund(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_refund() {
            return Err(self.invalid("refund"));
        }
        self.status = OrderStatus::Refunded;
        self.cancelled_at = Some(now);
        Ok(())
    }

    fn invalid(&self, action: &'static str) -> DomainError {
        DomainError::InvalidOrderTransition {
            current: self.status,
            action,
        }
    }
}
