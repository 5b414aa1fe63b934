//! Messages exchanged between saga stages.
//!
//! Every message travels as JSON inside an [`Envelope`](crate::bus::Envelope)
//! stamped with [`SCHEMA_VERSION`], so readers outside this crate can rely on
//! a stable shape.

use chrono::{DateTime, Utc};
use common::{CouponId, OrderId, ProductId, UserCouponId, UserId};
use domain::{Money, Order, OrderNumber};
use serde::{Deserialize, Serialize};

/// Version of the message shapes below.
pub const SCHEMA_VERSION: u16 = 1;

/// Channel names.
pub mod channels {
    pub const ORDER_CREATED: &str = "order-created";
    pub const STOCK_RESERVED: &str = "stock-reserved";
    pub const ORDER_COMPLETED: &str = "order-completed";
    pub const COUPON_ISSUED: &str = "coupon-issued";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub product_id: ProductId,
    pub quantity: u32,
    pub unit_price: Money,
}

/// What every stage needs to know about the order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePayload {
    pub order_id: OrderId,
    pub order_number: OrderNumber,
    pub user_id: UserId,
    /// Amount to charge, after discount.
    pub amount: Money,
    pub items: Vec<LineItem>,
    pub user_coupon_id: Option<UserCouponId>,
    pub discount_amount: Money,
}

impl From<&Order> for StagePayload {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.id,
            order_number: order.order_number.clone(),
            user_id: order.user_id,
            amount: order.final_amount,
            items: order
                .items
                .iter()
                .map(|item| LineItem {
                    product_id: item.product_id,
                    quantity: item.quantity,
                    unit_price: item.unit_price,
                })
                .collect(),
            user_coupon_id: order.user_coupon_id,
            discount_amount: order.discount_amount,
        }
    }
}

/// One message per saga stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum StageEvent {
    /// The order exists in `PENDING`; stock is next.
    OrderCreated(StagePayload),
    /// Stock is reserved; the balance is next.
    BalanceDeductionRequested(StagePayload),
    /// The order is `PAID`; coupon and popularity follow.
    OrderCompleted(StagePayload),
}

impl StageEvent {
    pub fn channel(&self) -> &'static str {
        match self {
            StageEvent::OrderCreated(_) => channels::ORDER_CREATED,
            StageEvent::BalanceDeductionRequested(_) => channels::STOCK_RESERVED,
            StageEvent::OrderCompleted(_) => channels::ORDER_COMPLETED,
        }
    }

    pub fn payload(&self) -> &StagePayload {
        match self {
            StageEvent::OrderCreated(p)
            | StageEvent::BalanceDeductionRequested(p)
            | StageEvent::OrderCompleted(p) => p,
        }
    }

    pub fn into_payload(self) -> StagePayload {
        match self {
            StageEvent::OrderCreated(p)
            | StageEvent::BalanceDeductionRequested(p)
            | StageEvent::OrderCompleted(p) => p,
        }
    }

    /// Routing key; keeps every message of one order on one partition.
    pub fn key(&self) -> String {
        self.payload().order_id.to_string()
    }
}

/// A quantity grant from the allocator, awaiting materialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouponIssued {
    pub coupon_id: CouponId,
    pub user_id: UserId,
    /// 1-based position among all grantees.
    pub rank: u32,
    /// 1-based index among this user's grants of the coupon.
    pub grant_ordinal: u32,
    pub granted_at: DateTime<Utc>,
}

impl CouponIssued {
    pub fn key(&self) -> String {
        self.coupon_id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn payload() -> StagePayload {
        StagePayload {
            order_id: OrderId::new(7),
            order_number: OrderNumber::new(NaiveDate::from_ymd_opt(2025, 5, 1).unwrap(), 3),
            user_id: UserId::new(1),
            amount: Money::new(9_000),
            items: vec![LineItem {
                product_id: ProductId::new(2),
                quantity: 2,
                unit_price: Money::new(5_000),
            }],
            user_coupon_id: Some(UserCouponId::new(4)),
            discount_amount: Money::new(1_000),
        }
    }

    #[test]
    fn wire_format_is_tagged() {
        let json = serde_json::to_value(StageEvent::OrderCreated(payload())).unwrap();
        assert_eq!(json["type"], "OrderCreated");
        assert_eq!(json["data"]["order_number"], "ORD-20250501-000003");
        assert_eq!(json["data"]["items"][0]["quantity"], 2);
    }

    #[test]
    fn events_route_by_order() {
        let created = StageEvent::OrderCreated(payload());
        let reserved = StageEvent::BalanceDeductionRequested(payload());
        assert_eq!(created.key(), reserved.key());
        assert_eq!(created.channel(), channels::ORDER_CREATED);
        assert_eq!(reserved.channel(), channels::STOCK_RESERVED);
        assert_eq!(reserved.into_payload().amount, Money::new(9_000));
    }
}
