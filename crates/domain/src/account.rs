//! User balance account.

use common::UserId;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, Result};
use crate::value_objects::Money;

/// A user together with the internal balance used to pay for orders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: UserId,
    pub name: String,
    pub balance: Money,
}

impl Account {
    pub fn new(id: UserId, name: impl Into<String>, balance: Money) -> Self {
        Self {
            id,
            name: name.into(),
            balance,
        }
    }

    /// Debits the balance for a purchase.
    pub fn use_balance(&mut self, amount: Money) -> Result<()> {
        ensure_positive(amount)?;
        if self.balance < amount {
            return Err(DomainError::InsufficientBalance {
                user_id: self.id,
                requested: amount,
                available: self.balance,
            });
        }
        self.balance -= amount;
        Ok(())
    }

    /// Credits a top-up.
    pub fn charge(&mut self, amount: Money) -> Result<()> {
        ensure_positive(amount)?;
        self.balance += amount;
        Ok(())
    }

    /// Credits back a previously debited amount.
    pub fn refund(&mut self, amount: Money) -> Result<()> {
        ensure_positive(amount)?;
        self.balance += amount;
        Ok(())
    }
}

fn ensure_positive(amount: Money) -> Result<()> {
    if amount.is_positive() {
        Ok(())
    } else {
        Err(DomainError::InvalidAmount { amount })
    }
}
