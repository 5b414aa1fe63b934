//! Checkout entry point and order lifecycle commands.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::{OrderId, UserCouponId, UserId};
use coordination::{LeaseGuard, LockManager, keys, with_lock};
use domain::{
    BalanceLedgerEntry, BalanceMovement, DomainError, Money, NewOrder, Order, OrderAmounts,
    OrderItem, OrderNumber, OrderStatus, Payment, PaymentStatus, UserCouponStatus,
};
use storage::{SequenceGenerator, Transaction, UnitOfWork, constraints};

use crate::bus::InMemoryBus;
use crate::compensation::restore_outstanding_stock;
use crate::error::{Result, SagaError};
use crate::messages::{StageEvent, StagePayload, channels};
use crate::settings::SagaSettings;

enum Checkout {
    Created(Order),
    Replayed(Order),
}

/// Validates checkouts, persists them as `PENDING` orders and starts the
/// stage pipeline.
///
/// Reserves nothing itself: stock and balance are taken by the stages.
pub struct OrderOrchestrator {
    uow: Arc<dyn UnitOfWork>,
    sequences: Arc<dyn SequenceGenerator>,
    locks: Arc<dyn LockManager>,
    bus: InMemoryBus,
    settings: SagaSettings,
}

impl OrderOrchestrator {
    pub fn new(
        uow: Arc<dyn UnitOfWork>,
        sequences: Arc<dyn SequenceGenerator>,
        locks: Arc<dyn LockManager>,
        bus: InMemoryBus,
        settings: SagaSettings,
    ) -> Self {
        Self {
            uow,
            sequences,
            locks,
            bus,
            settings,
        }
    }

    /// Turns the owner's cart into a `PENDING` order.
    ///
    /// A key that already maps to an order returns that order unchanged.
    #[tracing::instrument(skip(self, idempotency_key), fields(user_id = %user_id))]
    pub async fn create_order(
        &self,
        user_id: UserId,
        user_coupon_id: Option<UserCouponId>,
        idempotency_key: &str,
    ) -> Result<Order> {
        let key = idempotency_key.trim();
        if key.is_empty() {
            return Err(SagaError::InvalidRequest("idempotency key is required".into()));
        }
        if let Some(existing) = self.find_by_idempotency_key(key).await? {
            return self.replay(existing, user_id).await;
        }

        let guard = LeaseGuard::acquire(
            Arc::clone(&self.locks),
            &keys::balance(user_id),
            self.settings.owner_lock_wait,
            self.settings.owner_lock_lease,
        )
        .await?;
        let result = self.checkout_and_publish(user_id, user_coupon_id, key).await;
        guard.release().await;

        match result {
            Ok(Checkout::Created(order)) => Ok(order),
            Ok(Checkout::Replayed(order)) => self.replay(order, user_id).await,
            Err(SagaError::Store(e)) if e.is_duplicate(constraints::ORDER_IDEMPOTENCY_KEY) => {
                let order = self
                    .find_by_idempotency_key(key)
                    .await?
                    .ok_or_else(|| SagaError::not_found("Order", key))?;
                self.replay(order, user_id).await
            }
            Err(e) => {
                if e.class() == crate::error::ErrorClass::Infrastructure {
                    tracing::error!(error = %e, "checkout failed");
                } else {
                    tracing::warn!(error = %e, class = e.class().as_str(), "checkout rejected");
                }
                Err(e)
            }
        }
    }

    async fn checkout_and_publish(
        &self,
        user_id: UserId,
        user_coupon_id: Option<UserCouponId>,
        key: &str,
    ) -> Result<Checkout> {
        let checkout = self
            .settings
            .order_creation_retry
            .run(
                || self.checkout_once(user_id, user_coupon_id, key),
                SagaError::is_version_conflict,
            )
            .await?;

        if let Checkout::Created(order) = &checkout {
            metrics::counter!("orders_created_total").increment(1);
            tracing::info!(
                order_id = %order.id,
                order_number = %order.order_number,
                final_amount = %order.final_amount,
                "order created"
            );
            self.publish_created(order)?;
        }
        Ok(checkout)
    }

    fn publish_created(&self, order: &Order) -> Result<()> {
        let event = StageEvent::OrderCreated(StagePayload::from(order));
        self.bus.publish(channels::ORDER_CREATED, &event.key(), &event)?;
        Ok(())
    }

    async fn checkout_once(
        &self,
        user_id: UserId,
        user_coupon_id: Option<UserCouponId>,
        key: &str,
    ) -> Result<Checkout> {
        let mut tx = self.uow.begin().await?;
        if let Some(existing) = tx.find_order_by_idempotency_key(key).await? {
            return Ok(Checkout::Replayed(existing));
        }
        if tx.find_account(user_id).await?.is_none() {
            return Err(SagaError::not_found("User", user_id));
        }

        let lines = tx.cart_lines(user_id).await?;
        if lines.is_empty() {
            return Err(DomainError::EmptyCart { user_id }.into());
        }
        let mut items = Vec::with_capacity(lines.len());
        for line in &lines {
            let product = tx
                .find_product(line.product_id)
                .await?
                .ok_or_else(|| SagaError::not_found("Product", line.product_id))?;
            if !product.has_stock(line.quantity) {
                return Err(DomainError::InsufficientStock {
                    product_id: product.id,
                    requested: line.quantity,
                    available: product.stock,
                }
                .into());
            }
            items.push(OrderItem::new(product.id, line.quantity, product.price)?);
        }

        let now = Utc::now();
        let total: Money = items.iter().map(OrderItem::line_total).sum();
        let discount = match user_coupon_id {
            Some(id) => price_coupon(&mut *tx, user_id, id, total, now).await?,
            None => Money::ZERO,
        };
        let amounts = OrderAmounts::compute(&items, discount)?;

        let order_number = self.sequences.next_order_number().await?;
        let order = tx
            .insert_order(NewOrder {
                order_number,
                user_id,
                items,
                amounts,
                user_coupon_id,
                idempotency_key: key.to_string(),
                ordered_at: now,
            })
            .await?;
        tx.insert_payment(&Payment::pending(order.id, order.final_amount))
            .await?;
        tx.clear_cart(user_id).await?;
        tx.commit().await?;
        Ok(Checkout::Created(order))
    }

    /// Returns the order a key already maps to.
    ///
    /// A `PENDING` order with no stock movement yet may never have reached
    /// the pipeline (the publish after commit failed), so `order-created` is
    /// sent again. The stock stage absorbs a duplicate of an in-flight
    /// delivery.
    async fn replay(&self, order: Order, user_id: UserId) -> Result<Order> {
        if order.user_id != user_id {
            return Err(SagaError::InvalidRequest(
                "idempotency key belongs to another user".into(),
            ));
        }
        metrics::counter!("order_idempotent_replays_total").increment(1);
        if order.status == OrderStatus::Pending && self.awaits_reservation(order.id).await? {
            tracing::warn!(order_id = %order.id, "pending order without reservation, republishing");
            self.publish_created(&order)?;
        } else {
            tracing::info!(order_id = %order.id, "idempotent replay");
        }
        Ok(order)
    }

    async fn awaits_reservation(&self, order_id: OrderId) -> Result<bool> {
        let mut tx = self.uow.begin().await?;
        Ok(tx.stock_ledger_for_order(order_id).await?.is_empty())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Order>> {
        let mut tx = self.uow.begin().await?;
        Ok(tx.find_order_by_idempotency_key(key).await?)
    }

    pub async fn get_order(&self, order_id: OrderId) -> Result<Order> {
        let mut tx = self.uow.begin().await?;
        tx.find_order(order_id)
            .await?
            .ok_or_else(|| SagaError::not_found("Order", order_id))
    }

    pub async fn get_order_by_number(&self, number: &str) -> Result<Order> {
        let parsed: OrderNumber = number.parse()?;
        let mut tx = self.uow.begin().await?;
        tx.find_order_by_number(&parsed)
            .await?
            .ok_or_else(|| SagaError::not_found("Order", number))
    }

    pub async fn orders_for_user(&self, user_id: UserId) -> Result<Vec<Order>> {
        let mut tx = self.uow.begin().await?;
        Ok(tx.orders_for_user(user_id).await?)
    }

    pub async fn payment(&self, order_id: OrderId) -> Result<Payment> {
        let mut tx = self.uow.begin().await?;
        tx.find_payment(order_id)
            .await?
            .ok_or_else(|| SagaError::not_found("Payment", order_id))
    }

    /// Cancels a `PAID` order: stock, balance and coupon are given back in
    /// one transaction under the owner's lease.
    #[tracing::instrument(skip(self, reason), fields(order_id = %order_id))]
    pub async fn cancel_order(&self, order_id: OrderId, reason: &str) -> Result<Order> {
        let owner = self.get_order(order_id).await?.user_id;
        let order = with_lock(
            &self.locks,
            &keys::balance(owner),
            self.settings.owner_lock_wait,
            self.settings.owner_lock_lease,
            || {
                self.settings
                    .balance_retry
                    .run(|| self.cancel_once(order_id, reason), SagaError::is_version_conflict)
            },
        )
        .await?;
        tracing::info!(user_id = %order.user_id, refunded = %order.final_amount, "paid order cancelled");
        Ok(order)
    }

    async fn cancel_once(&self, order_id: OrderId, reason: &str) -> Result<Order> {
        let mut tx = self.uow.begin().await?;
        let mut order = tx
            .find_order(order_id)
            .await?
            .ok_or_else(|| SagaError::not_found("Order", order_id))?;
        if order.status != OrderStatus::Paid {
            return Err(DomainError::InvalidOrderTransition {
                current: order.status,
                action: "cancel",
            }
            .into());
        }

        let now = Utc::now();
        order.cancel(reason, now)?;
        tx.update_order(&order).await?;

        if let Some(mut payment) = tx.find_payment(order.id).await?
            && payment.status == PaymentStatus::Completed
        {
            payment.cancel()?;
            tx.update_payment(&payment).await?;
        }

        restore_outstanding_stock(&mut *tx, &order, &format!("cancel: {reason}")).await?;

        if order.final_amount.is_positive() {
            let mut account = tx
                .lock_account(order.user_id)
                .await?
                .ok_or_else(|| SagaError::not_found("User", order.user_id))?;
            let before = account.balance;
            account.refund(order.final_amount)?;
            tx.update_account(&account).await?;
            tx.append_balance_ledger(&BalanceLedgerEntry::new(
                account.id,
                Some(order.id),
                BalanceMovement::Refund,
                order.final_amount,
                before,
                account.balance,
                format!("refund for {}", order.order_number),
            ))
            .await?;
        }

        if let Some(user_coupon_id) = order.user_coupon_id {
            restore_coupon(&mut *tx, &order, user_coupon_id, now).await?;
        }

        tx.commit().await?;
        Ok(order)
    }
}

/// Checks the coupon can be applied by `user_id` and returns the discount.
async fn price_coupon(
    tx: &mut dyn Transaction,
    user_id: UserId,
    user_coupon_id: UserCouponId,
    total: Money,
    now: DateTime<Utc>,
) -> Result<Money> {
    let user_coupon = tx
        .find_user_coupon(user_coupon_id)
        .await?
        .ok_or_else(|| SagaError::not_found("UserCoupon", user_coupon_id))?;
    let coupon = tx
        .find_coupon(user_coupon.coupon_id)
        .await?
        .ok_or_else(|| SagaError::not_found("Coupon", user_coupon.coupon_id))?;
    user_coupon.ensure_usable_by(user_id, &coupon, now)?;
    // Runs under the owner's lease, so no other checkout of this user can
    // claim the coupon between this scan and the commit.
    if let Some(holder) = tx
        .orders_for_user(user_id)
        .await?
        .into_iter()
        .find(|o| o.user_coupon_id == Some(user_coupon_id) && o.status != OrderStatus::Cancelled)
    {
        return Err(DomainError::CouponInUse {
            user_coupon_id,
            order_id: holder.id,
        }
        .into());
    }
    Ok(coupon.calculate_discount(total)?)
}

async fn restore_coupon(
    tx: &mut dyn Transaction,
    order: &Order,
    user_coupon_id: UserCouponId,
    now: DateTime<Utc>,
) -> Result<()> {
    let Some(mut user_coupon) = tx.find_user_coupon(user_coupon_id).await? else {
        return Ok(());
    };
    if user_coupon.status != UserCouponStatus::Used || user_coupon.used_order_id != Some(order.id) {
        return Ok(());
    }
    let coupon = tx
        .find_coupon(user_coupon.coupon_id)
        .await?
        .ok_or_else(|| SagaError::not_found("Coupon", user_coupon.coupon_id))?;
    user_coupon.restore(&coupon, now)?;
    tx.update_user_coupon(&user_coupon).await?;
    Ok(())
}
