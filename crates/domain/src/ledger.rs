//! Append-only stock and balance ledgers.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::{OrderId, ProductId, UserId};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::value_objects::Money;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StockMovement {
    Increase,
    Decrease,
}

impl StockMovement {
    pub fn as_str(&self) -> &'static str {
        match self {
            StockMovement::Increase => "INCREASE",
            StockMovement::Decrease => "DECREASE",
        }
    }
}

impl FromStr for StockMovement {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INCREASE" => Ok(StockMovement::Increase),
            "DECREASE" => Ok(StockMovement::Decrease),
            other => Err(DomainError::unknown_variant("stock movement", other)),
        }
    }
}

/// One stock change of a product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLedgerEntry {
    pub product_id: ProductId,
    pub order_id: Option<OrderId>,
    pub movement: StockMovement,
    pub quantity: u32,
    pub stock_before: u32,
    pub stock_after: u32,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl StockLedgerEntry {
    pub fn new(
        product_id: ProductId,
        order_id: Option<OrderId>,
        movement: StockMovement,
        quantity: u32,
        stock_before: u32,
        stock_after: u32,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            product_id,
            order_id,
            movement,
            quantity,
            stock_before,
            stock_after,
            reason: reason.into(),
            created_at: Utc::now(),
        }
    }
}

/// Units still held per product: decreases minus increases.
///
/// A compensation restores exactly this much, so running it twice restores
/// nothing the second time.
pub fn outstanding_reservations(entries: &[StockLedgerEntry]) -> HashMap<ProductId, u32> {
    let mut net: HashMap<ProductId, i64> = HashMap::new();
    for entry in entries {
        let delta = i64::from(entry.quantity);
        let slot = net.entry(entry.product_id).or_default();
        match entry.movement {
            StockMovement::Decrease => *slot += delta,
            StockMovement::Increase => *slot -= delta,
        }
    }
    net.into_iter()
        .filter_map(|(product, qty)| u32::try_from(qty).ok().filter(|q| *q > 0).map(|q| (product, q)))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BalanceMovement {
    /// Debit for an order.
    Use,
    /// Top-up.
    Charge,
    /// Credit back for a cancelled order.
    Refund,
}

impl BalanceMovement {
    pub fn as_str(&self) -> &'static str {
        match self {
            BalanceMovement::Use => "USE",
            BalanceMovement::Charge => "CHARGE",
            BalanceMovement::Refund => "REFUND",
        }
    }
}

impl FromStr for BalanceMovement {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "USE" => Ok(BalanceMovement::Use),
            "CHARGE" => Ok(BalanceMovement::Charge),
            "REFUND" => Ok(BalanceMovement::Refund),
            other => Err(DomainError::unknown_variant("balance movement", other)),
        }
    }
}

/// One balance change of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceLedgerEntry {
    pub user_id: UserId,
    pub order_id: Option<OrderId>,
    pub movement: BalanceMovement,
    pub amount: Money,
    pub balance_before: Money,
    pub balance_after: Money,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl BalanceLedgerEntry {
    pub fn new(
        user_id: UserId,
        order_id: Option<OrderId>,
        movement: BalanceMovement,
        amount: Money,
        balance_before: Money,
        balance_after: Money,
        description: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            order_id,
            movement,
            amount,
            balance_before,
            balance_after,
            description: description.into(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(product: i64, movement: StockMovement, qty: u32) -> StockLedgerEntry {
        StockLedgerEntry::new(
            ProductId::new(product),
            Some(OrderId::new(1)),
            movement,
            qty,
            0,
            0,
            "test",
        )
    }

    #[test]
    fn outstanding_nets_out_reversals() {
        let entries = vec![
            entry(1, StockMovement::Decrease, 2),
            entry(2, StockMovement::Decrease, 1),
            entry(1, StockMovement::Increase, 2),
        ];
        let outstanding = outstanding_reservations(&entries);
        assert_eq!(outstanding.get(&ProductId::new(1)), None);
        assert_eq!(outstanding.get(&ProductId::new(2)), Some(&1));
    }

    #[test]
    fn nothing_outstanding_for_empty_ledger() {
        assert!(outstanding_reservations(&[]).is_empty());
    }

    #[test]
    fn movements_parse_their_names() {
        assert_eq!("DECREASE".parse::<StockMovement>().unwrap(), StockMovement::Decrease);
        assert_eq!("REFUND".parse::<BalanceMovement>().unwrap(), BalanceMovement::Refund);
        assert!("NOPE".parse::<BalanceMovement>().is_err());
    }
}
