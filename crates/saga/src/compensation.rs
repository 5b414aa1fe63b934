//! Compensating actions shared by the stages, cancellation and retries.
//!
//! Each action reads the current state first, so running it twice has the
//! effect of running it once.

use std::sync::Arc;

use chrono::Utc;
use common::OrderId;
use coordination::RetryPolicy;
use domain::{Order, OrderStatus, PaymentStatus, StockLedgerEntry, StockMovement, outstanding_reservations};
use storage::{Transaction, UnitOfWork};

use crate::error::{Result, SagaError};

/// What a compensation found and did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompensationOutcome {
    /// The order is `PAID`; nothing to undo.
    Settled,
    /// Stock was restored and/or the order cancelled.
    Compensated { restored_lines: usize, cancelled: bool },
}

/// Returns every unit the order still holds to stock.
///
/// Only decrements without a matching reversing entry are restored.
pub(crate) async fn restore_outstanding_stock(
    tx: &mut dyn Transaction,
    order: &Order,
    reason: &str,
) -> Result<usize> {
    let entries = tx.stock_ledger_for_order(order.id).await?;
    let mut outstanding: Vec<_> = outstanding_reservations(&entries).into_iter().collect();
    outstanding.sort_by_key(|(product_id, _)| *product_id);

    for (product_id, quantity) in &outstanding {
        let mut product = tx
            .find_product(*product_id)
            .await?
            .ok_or_else(|| SagaError::not_found("Product", product_id))?;
        let before = product.stock;
        product.increase_stock(*quantity)?;
        tx.update_product(&mut product).await?;
        tx.append_stock_ledger(&StockLedgerEntry::new(
            product.id,
            Some(order.id),
            StockMovement::Increase,
            *quantity,
            before,
            product.stock,
            reason,
        ))
        .await?;
    }
    Ok(outstanding.len())
}

/// Undoes the stock stage of an unpaid order and cancels it.
#[derive(Clone)]
pub struct Compensator {
    uow: Arc<dyn UnitOfWork>,
    retry: RetryPolicy,
}

impl Compensator {
    pub fn new(uow: Arc<dyn UnitOfWork>, retry: RetryPolicy) -> Self {
        Self { uow, retry }
    }

    /// Restores outstanding stock and cancels the order unless it is already
    /// `PAID` or `CANCELLED`. A pending payment is marked failed.
    #[tracing::instrument(skip(self), fields(order_id = %order_id))]
    pub async fn compensate_order(&self, order_id: OrderId, reason: &str) -> Result<CompensationOutcome> {
        let outcome = self
            .retry
            .run(|| self.compensate_once(order_id, reason), SagaError::is_version_conflict)
            .await?;
        if let CompensationOutcome::Compensated { restored_lines, cancelled } = outcome {
            metrics::counter!("saga_compensations_total").increment(1);
            tracing::warn!(restored_lines, cancelled, reason, "order compensated");
        }
        Ok(outcome)
    }

    async fn compensate_once(&self, order_id: OrderId, reason: &str) -> Result<CompensationOutcome> {
        let mut tx = self.uow.begin().await?;
        let mut order = tx
            .find_order(order_id)
            .await?
            .ok_or_else(|| SagaError::not_found("Order", order_id))?;
        if order.status == OrderStatus::Paid {
            return Ok(CompensationOutcome::Settled);
        }

        let restored_lines =
            restore_outstanding_stock(&mut *tx, &order, &format!("compensation: {reason}")).await?;

        let cancelled = order.status == OrderStatus::Pending;
        if cancelled {
            order.cancel(reason, Utc::now())?;
            tx.update_order(&order).await?;
            if let Some(mut payment) = tx.find_payment(order_id).await?
                && payment.status == PaymentStatus::Pending
            {
                payment.fail()?;
                tx.update_payment(&payment).await?;
            }
        }

        if restored_lines == 0 && !cancelled {
            return Ok(CompensationOutcome::Compensated {
                restored_lines,
                cancelled,
            });
        }
        tx.commit().await?;
        Ok(CompensationOutcome::Compensated {
            restored_lines,
            cancelled,
        })
    }
}
