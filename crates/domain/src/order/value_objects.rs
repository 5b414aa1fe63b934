//! Value objects for the order domain.

use common::ProductId;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, Result};
use crate::value_objects::Money;

/// A line of an order with the unit price captured at checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_id: ProductId,
    pub quantity: u32,
    /// Product price at the time the order was placed.
    pub unit_price: Money,
}

impl OrderItem {
    /// Creates a line, rejecting a zero quantity.
    pub fn new(product_id: ProductId, quantity: u32, unit_price: Money) -> Result<Self> {
        if quantity == 0 {
            return Err(DomainError::InvalidQuantity { quantity });
        }
        Ok(Self {
            product_id,
            quantity,
            unit_price,
        })
    }

    /// Returns `quantity * unit_price`.
    pub fn line_total(&self) -> Money {
        self.unit_price.times(self.quantity)
    }
}

/// The three amounts of an order.
///
/// Always satisfies `final_amount == total - discount` and
/// `0 <= discount <= total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAmounts {
    total: Money,
    discount: Money,
    final_amount: Money,
}

impl OrderAmounts {
    /// Computes amounts for the given lines and discount.
    pub fn compute(items: &[OrderItem], discount: Money) -> Result<Self> {
        let total: Money = items.iter().map(OrderItem::line_total).sum();
        Self::from_parts(total, discount)
    }

    /// Builds amounts from a total and a discount, checking the invariant.
    pub fn from_parts(total: Money, discount: Money) -> Result<Self> {
        if total.is_negative() || discount.is_negative() || discount > total {
            return Err(DomainError::InvalidDiscount { discount, total });
        }
        Ok(Self {
            total,
            discount,
            final_amount: total - discount,
        })
    }

    pub fn total(&self) -> Money {
        self.total
    }

    pub fn discount(&self) -> Money {
        self.discount
    }

    /// Amount actually charged to the balance.
    pub fn final_amount(&self) -> Money {
        self.final_amount
    }
}
