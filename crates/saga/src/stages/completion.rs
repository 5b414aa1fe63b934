use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use coordination::RetryPolicy;
use domain::{DomainError, MarkUsed, OrderCoupon, OrderStatus};
use event_store::EventType;
use storage::UnitOfWork;

use super::observe;
use crate::bus::{Envelope, MessageHandler};
use crate::error::{Result, SagaError};
use crate::messages::{StageEvent, StagePayload};
use crate::retry::FailureRecorder;
use crate::services::PopularityCounter;

const STAGE: &str = "completion";

/// Side effects after payment: coupon redemption and popularity counters.
///
/// The two steps are independent. A failure in one is logged and recorded
/// for retry and never undoes the other or the order.
pub struct CompletionHandler {
    uow: Arc<dyn UnitOfWork>,
    popularity: Arc<dyn PopularityCounter>,
    recorder: FailureRecorder,
    retry: RetryPolicy,
}

impl CompletionHandler {
    pub fn new(
        uow: Arc<dyn UnitOfWork>,
        popularity: Arc<dyn PopularityCounter>,
        recorder: FailureRecorder,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            uow,
            popularity,
            recorder,
            retry,
        }
    }

    #[tracing::instrument(skip(self, payload), fields(order_id = %payload.order_id, stage = STAGE))]
    pub async fn handle(&self, payload: StagePayload) -> Result<()> {
        let started = Instant::now();
        let mut outcome = "success";

        if payload.user_coupon_id.is_some()
            && let Err(e) = self.redeem_coupon(&payload).await
        {
            tracing::warn!(error = %e, "coupon redemption failed");
            self.recorder
                .record(EventType::CouponUsage, &payload, &e.to_string())
                .await;
            outcome = "partial";
        }

        if let Err(e) = self.aggregate_popularity(&payload).await {
            tracing::warn!(error = %e, "popularity aggregation failed");
            self.recorder
                .record(EventType::PopularProductAggregation, &payload, &e.to_string())
                .await;
            outcome = "partial";
        }

        observe(STAGE, outcome, started);
        Ok(())
    }

    /// Marks the order's coupon used and attaches the discount record.
    ///
    /// A coupon already used by this order counts as success. One used by a
    /// different order fails with `CouponInUse` and nothing is attached.
    /// Does nothing unless the order is `PAID`.
    pub async fn redeem_coupon(&self, payload: &StagePayload) -> Result<()> {
        self.retry
            .run(|| self.redeem_once(payload), SagaError::is_version_conflict)
            .await
    }

    async fn redeem_once(&self, payload: &StagePayload) -> Result<()> {
        let Some(user_coupon_id) = payload.user_coupon_id else {
            return Ok(());
        };
        let mut tx = self.uow.begin().await?;
        let order = tx
            .find_order(payload.order_id)
            .await?
            .ok_or_else(|| SagaError::not_found("Order", payload.order_id))?;
        if order.status != OrderStatus::Paid {
            tracing::debug!(status = %order.status, "order not paid, coupon left untouched");
            return Ok(());
        }

        let mut user_coupon = tx
            .find_user_coupon(user_coupon_id)
            .await?
            .ok_or_else(|| SagaError::not_found("UserCoupon", user_coupon_id))?;
        let coupon = tx
            .find_coupon(user_coupon.coupon_id)
            .await?
            .ok_or_else(|| SagaError::not_found("Coupon", user_coupon.coupon_id))?;

        let now = Utc::now();
        let marked = user_coupon.mark_used(order.id, &coupon, now).inspect_err(|e| {
            if let DomainError::CouponInUse { order_id, .. } = e {
                tracing::warn!(taken_by = %order_id, "coupon already redeemed by another order");
            }
        })?;
        if marked == MarkUsed::Marked {
            tx.update_user_coupon(&user_coupon).await?;
        }
        let attached = tx
            .attach_order_coupon(&OrderCoupon {
                order_id: order.id,
                user_coupon_id,
                discount_amount: payload.discount_amount,
                applied_at: now,
            })
            .await?;
        if marked == MarkUsed::AlreadyUsed && !attached {
            tracing::debug!("coupon already redeemed");
            return Ok(());
        }
        tx.commit().await?;
        tracing::info!(user_coupon_id = %user_coupon_id, "coupon redeemed");
        Ok(())
    }

    /// Counts the order's lines; counting the same order twice is a no-op.
    pub async fn aggregate_popularity(&self, payload: &StagePayload) -> Result<()> {
        let sales: Vec<_> = payload
            .items
            .iter()
            .map(|item| (item.product_id, item.quantity))
            .collect();
        self.popularity.record_sale(payload.order_id, &sales).await?;
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for CompletionHandler {
    async fn handle(&self, envelope: &Envelope) -> Result<()> {
        match envelope.decode::<StageEvent>()? {
            StageEvent::OrderCompleted(payload) => CompletionHandler::handle(self, payload).await,
            other => {
                tracing::warn!(channel = %envelope.channel, order_id = %other.payload().order_id, "unexpected stage event");
                Ok(())
            }
        }
    }
}
