use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use coordination::RetryPolicy;
use domain::{OrderStatus, StockLedgerEntry, StockMovement};
use event_store::EventType;
use storage::UnitOfWork;

use super::observe;
use crate::bus::{Envelope, InMemoryBus, MessageHandler};
use crate::compensation::Compensator;
use crate::error::{ErrorClass, Result, SagaError};
use crate::messages::{StageEvent, StagePayload, channels};
use crate::retry::FailureRecorder;

const STAGE: &str = "stock";

enum Reservation {
    Reserved,
    /// A previous delivery already committed the decrements.
    AlreadyReserved,
    NotPending(OrderStatus),
}

/// Reserves stock for every line with optimistic version checks.
///
/// A shortage cancels the order; nothing else happened yet, so there is
/// nothing further to compensate.
pub struct StockReservationHandler {
    uow: Arc<dyn UnitOfWork>,
    bus: InMemoryBus,
    compensator: Compensator,
    recorder: FailureRecorder,
    retry: RetryPolicy,
}

impl StockReservationHandler {
    pub fn new(
        uow: Arc<dyn UnitOfWork>,
        bus: InMemoryBus,
        compensator: Compensator,
        recorder: FailureRecorder,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            uow,
            bus,
            compensator,
            recorder,
            retry,
        }
    }

    #[tracing::instrument(skip(self, payload), fields(order_id = %payload.order_id, stage = STAGE))]
    pub async fn handle(&self, payload: StagePayload) -> Result<()> {
        let started = Instant::now();
        let result = self
            .retry
            .run(|| self.reserve_once(&payload), SagaError::is_version_conflict)
            .await;

        match result {
            Ok(Reservation::Reserved) | Ok(Reservation::AlreadyReserved) => {
                let next = StageEvent::BalanceDeductionRequested(payload);
                self.bus.publish(channels::STOCK_RESERVED, &next.key(), &next)?;
                observe(STAGE, "success", started);
                tracing::info!("stock reserved");
                Ok(())
            }
            Ok(Reservation::NotPending(status)) => {
                observe(STAGE, "skipped", started);
                tracing::debug!(status = %status, "order no longer pending, skipping");
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                if e.class() == ErrorClass::Infrastructure {
                    tracing::error!(reason = %reason, "stock reservation failed");
                    self.recorder
                        .record(EventType::StockDeduction, &payload, &reason)
                        .await;
                } else {
                    tracing::warn!(reason = %reason, "stock reservation rejected");
                }
                if let Err(ce) = self.compensator.compensate_order(payload.order_id, &reason).await {
                    tracing::error!(error = %ce, "cancelling order failed");
                    self.recorder
                        .record(EventType::StockDeduction, &payload, &ce.to_string())
                        .await;
                }
                observe(STAGE, "rejected", started);
                Ok(())
            }
        }
    }

    async fn reserve_once(&self, payload: &StagePayload) -> Result<Reservation> {
        let mut tx = self.uow.begin().await?;
        let order = tx
            .find_order(payload.order_id)
            .await?
            .ok_or_else(|| SagaError::not_found("Order", payload.order_id))?;
        if order.status != OrderStatus::Pending {
            return Ok(Reservation::NotPending(order.status));
        }
        let ledger = tx.stock_ledger_for_order(order.id).await?;
        if ledger.iter().any(|e| e.movement == StockMovement::Decrease) {
            return Ok(Reservation::AlreadyReserved);
        }

        for item in &order.items {
            let mut product = tx
                .find_product(item.product_id)
                .await?
                .ok_or_else(|| SagaError::not_found("Product", item.product_id))?;
            let before = product.stock;
            product.decrease_stock(item.quantity)?;
            tx.update_product(&mut product).await?;
            tx.append_stock_ledger(&StockLedgerEntry::new(
                product.id,
                Some(order.id),
                StockMovement::Decrease,
                item.quantity,
                before,
                product.stock,
                format!("reserved for {}", order.order_number),
            ))
            .await?;
        }
        tx.commit().await?;
        Ok(Reservation::Reserved)
    }
}

#[async_trait]
impl MessageHandler for StockReservationHandler {
    async fn handle(&self, envelope: &Envelope) -> Result<()> {
        match envelope.decode::<StageEvent>()? {
            StageEvent::OrderCreated(payload) => StockReservationHandler::handle(self, payload).await,
            other => {
                tracing::warn!(channel = %envelope.channel, order_id = %other.payload().order_id, "unexpected stage event");
                Ok(())
            }
        }
    }
}
