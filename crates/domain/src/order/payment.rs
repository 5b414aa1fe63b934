//! Payment record attached to an order.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::OrderId;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, Result};
use crate::value_objects::Money;

/// Status of a payment record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    #[default]
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Completed => "COMPLETED",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(PaymentStatus::Pending),
            "COMPLETED" => Ok(PaymentStatus::Completed),
            "FAILED" => Ok(PaymentStatus::Failed),
            "CANCELLED" => Ok(PaymentStatus::Cancelled),
            other => Err(DomainError::unknown_variant("payment status", other)),
        }
    }
}

/// Balance payment for one order.
///
/// Created empty (`Pending`) together with the order and completed by the
/// balance stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub order_id: OrderId,
    pub amount: Money,
    pub status: PaymentStatus,
    pub paid_at: Option<DateTime<Utc>>,
}

impl Payment {
    /// Creates a pending payment for the order's final amount.
    pub fn pending(order_id: OrderId, amount: Money) -> Self {
        Self {
            order_id,
            amount,
            status: PaymentStatus::Pending,
            paid_at: None,
        }
    }

    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(PaymentStatus::Pending, PaymentStatus::Completed, "complete")?;
        self.paid_at = Some(now);
        Ok(())
    }

    pub fn fail(&mut self) -> Result<()> {
        self.transition(PaymentStatus::Pending, PaymentStatus::Failed, "fail")
    }

    /// Cancels a completed payment after the order was cancelled.
    pub fn cancel(&mut self) -> Result<()> {
        self.transition(PaymentStatus::Completed, PaymentStatus::Cancelled, "cancel")
    }

    fn transition(
        &mut self,
        from: PaymentStatus,
        to: PaymentStatus,
        action: &'static str,
    ) -> Result<()> {
        if self.status != from {
            return Err(DomainError::InvalidPaymentTransition {
                current: self.status,
                action,
            });
        }
        self.status = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_payment_completes_once() {
        let mut payment = Payment::pending(OrderId::new(1), Money::new(5_000));
        let now = Utc::now();
        payment.complete(now).unwrap();
        assert_eq!(payment.status, PaymentStatus::Completed);
        assert_eq!(payment.paid_at, Some(now));
        assert!(payment.complete(now).is_err());
    }

    #[test]
    fn only_completed_payment_can_be_cancelled() {
        let mut payment = Payment::pending(OrderId::new(1), Money::new(5_000));
        assert!(payment.cancel().is_err());
        payment.complete(Utc::now()).unwrap();
        payment.cancel().unwrap();
        assert_eq!(payment.status, PaymentStatus::Cancelled);
    }

    #[test]
    fn failed_payment_is_final() {
        let mut payment = Payment::pending(OrderId::new(1), Money::new(5_000));
        payment.fail().unwrap();
        assert!(payment.complete(Utc::now()).is_err());
    }
}
