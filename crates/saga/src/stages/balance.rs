use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use coordination::{LockManager, keys, with_lock};
use domain::{BalanceLedgerEntry, BalanceMovement, OrderStatus};
use event_store::EventType;
use storage::UnitOfWork;

use super::observe;
use crate::bus::{Envelope, InMemoryBus, MessageHandler};
use crate::compensation::Compensator;
use crate::error::{Result, SagaError};
use crate::messages::{StageEvent, StagePayload, channels};
use crate::retry::FailureRecorder;
use crate::settings::SagaSettings;

const STAGE: &str = "balance";

enum Debit {
    Paid,
    AlreadyPaid,
    NotPending(OrderStatus),
}

/// Debits the owner's balance and marks the order `PAID`.
///
/// Runs under the owner's lease, the same one checkout and top-up take.
/// Any failure restores the reserved stock, cancels the order and records
/// a `BALANCE_DEDUCTION` event.
pub struct BalanceDeductionHandler {
    uow: Arc<dyn UnitOfWork>,
    locks: Arc<dyn LockManager>,
    bus: InMemoryBus,
    compensator: Compensator,
    recorder: FailureRecorder,
    settings: SagaSettings,
}

impl BalanceDeductionHandler {
    pub fn new(
        uow: Arc<dyn UnitOfWork>,
        locks: Arc<dyn LockManager>,
        bus: InMemoryBus,
        compensator: Compensator,
        recorder: FailureRecorder,
        settings: SagaSettings,
    ) -> Self {
        Self {
            uow,
            locks,
            bus,
            compensator,
            recorder,
            settings,
        }
    }

    #[tracing::instrument(
        skip(self, payload),
        fields(order_id = %payload.order_id, user_id = %payload.user_id, stage = STAGE)
    )]
    pub async fn handle(&self, payload: StagePayload) -> Result<()> {
        let started = Instant::now();
        let result = with_lock(
            &self.locks,
            &keys::balance(payload.user_id),
            self.settings.owner_lock_wait,
            self.settings.owner_lock_lease,
            || {
                self.settings
                    .balance_retry
                    .run(|| self.debit_once(&payload), SagaError::is_version_conflict)
            },
        )
        .await;

        match result {
            Ok(Debit::Paid) | Ok(Debit::AlreadyPaid) => {
                let next = StageEvent::OrderCompleted(payload);
                self.bus.publish(channels::ORDER_COMPLETED, &next.key(), &next)?;
                observe(STAGE, "success", started);
                tracing::info!("order paid");
                Ok(())
            }
            Ok(Debit::NotPending(status)) => {
                observe(STAGE, "skipped", started);
                tracing::debug!(status = %status, "order no longer pending, skipping");
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                tracing::warn!(reason = %reason, class = e.class().as_str(), "balance deduction failed, compensating");
                if let Err(ce) = self.compensator.compensate_order(payload.order_id, &reason).await {
                    tracing::error!(error = %ce, "stock compensation failed");
                }
                self.recorder
                    .record(EventType::BalanceDeduction, &payload, &reason)
                    .await;
                observe(STAGE, "compensated", started);
                Ok(())
            }
        }
    }

    async fn debit_once(&self, payload: &StagePayload) -> Result<Debit> {
        let mut tx = self.uow.begin().await?;
        let mut order = tx
            .find_order(payload.order_id)
            .await?
            .ok_or_else(|| SagaError::not_found("Order", payload.order_id))?;
        match order.status {
            OrderStatus::Pending => {}
            OrderStatus::Paid => return Ok(Debit::AlreadyPaid),
            other => return Ok(Debit::NotPending(other)),
        }

        let now = Utc::now();
        let amount = order.final_amount;
        if amount.is_positive() {
            let mut account = tx
                .lock_account(order.user_id)
                .await?
                .ok_or_else(|| SagaError::not_found("User", order.user_id))?;
            let before = account.balance;
            account.use_balance(amount)?;
            tx.update_account(&account).await?;
            tx.append_balance_ledger(&BalanceLedgerEntry::new(
                account.id,
                Some(order.id),
                BalanceMovement::Use,
                amount,
                before,
                account.balance,
                format!("payment for {}", order.order_number),
            ))
            .await?;
        }

        order.complete_pay(now)?;
        tx.update_order(&order).await?;
        let mut payment = tx
            .find_payment(order.id)
            .await?
            .ok_or_else(|| SagaError::not_found("Payment", order.id))?;
        payment.complete(now)?;
        tx.update_payment(&payment).await?;
        tx.commit().await?;
        Ok(Debit::Paid)
    }
}

#[async_trait]
impl MessageHandler for BalanceDeductionHandler {
    async fn handle(&self, envelope: &Envelope) -> Result<()> {
        match envelope.decode::<StageEvent>()? {
            StageEvent::BalanceDeductionRequested(payload) => {
                BalanceDeductionHandler::handle(self, payload).await
            }
            other => {
                tracing::warn!(channel = %envelope.channel, order_id = %other.payload().order_id, "unexpected stage event");
                Ok(())
            }
        }
    }
}
