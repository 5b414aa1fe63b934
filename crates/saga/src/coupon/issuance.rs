use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::{CouponId, UserId};
use coordination::{AllocationOutcome, LockManager, QuantityAllocator, keys, with_lock};
use domain::{Coupon, DomainError, NewUserCoupon, UserCoupon};
use serde::Serialize;
use storage::UnitOfWork;

use crate::bus::InMemoryBus;
use crate::error::{Result, SagaError};
use crate::messages::{CouponIssued, channels};
use crate::settings::SagaSettings;

/// A successful grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IssueResult {
    pub coupon_id: CouponId,
    pub user_id: UserId,
    /// 1-based position of the requester among all grantees.
    pub rank: u32,
    pub issued_count: u32,
}

/// Issues flash-sale coupons.
pub struct CouponIssueService {
    uow: Arc<dyn UnitOfWork>,
    allocator: Arc<dyn QuantityAllocator>,
    locks: Arc<dyn LockManager>,
    bus: InMemoryBus,
    settings: SagaSettings,
}

fn window_error(err: DomainError) -> SagaError {
    match err {
        DomainError::CouponExhausted { coupon_id } => SagaError::CouponSoldOut { coupon_id },
        other => other.into(),
    }
}

fn count_outcome(outcome: &'static str) {
    metrics::counter!("coupon_issue_total", "outcome" => outcome).increment(1);
}

impl CouponIssueService {
    pub fn new(
        uow: Arc<dyn UnitOfWork>,
        allocator: Arc<dyn QuantityAllocator>,
        locks: Arc<dyn LockManager>,
        bus: InMemoryBus,
        settings: SagaSettings,
    ) -> Self {
        Self {
            uow,
            allocator,
            locks,
            bus,
            settings,
        }
    }

    /// Fast path: one atomic allocator step, then a `coupon-issued` message
    /// the materializer turns into a user coupon.
    #[tracing::instrument(skip(self), fields(coupon_id = %coupon_id, user_id = %user_id))]
    pub async fn request_issue(&self, coupon_id: CouponId, user_id: UserId) -> Result<IssueResult> {
        let coupon = self.load_coupon(coupon_id).await?;
        let now = Utc::now();
        if let Err(e) = coupon.ensure_issue_window(now) {
            count_outcome("REJECTED");
            return Err(window_error(e));
        }

        let outcome = self
            .allocator
            .try_issue(
                coupon_id,
                user_id,
                coupon.total_quantity,
                coupon.max_issue_per_user,
            )
            .await?;
        count_outcome(outcome.as_str());

        match outcome {
            AllocationOutcome::Granted {
                rank,
                issued_count,
                user_ordinal,
            } => {
                self.publish_grant(coupon_id, user_id, rank, user_ordinal, now)?;
                tracing::info!(rank, issued_count, "coupon granted");
                Ok(IssueResult {
                    coupon_id,
                    user_id,
                    rank,
                    issued_count,
                })
            }
            AllocationOutcome::SoldOut { issued_count } => {
                tracing::debug!(issued_count, "coupon sold out");
                Err(SagaError::CouponSoldOut { coupon_id })
            }
            AllocationOutcome::ExceedUserLimit { user_count } => {
                tracing::debug!(user_count, "per-user issue limit reached");
                Err(SagaError::CouponLimitExceeded { coupon_id, user_id })
            }
        }
    }

    fn publish_grant(
        &self,
        coupon_id: CouponId,
        user_id: UserId,
        rank: u32,
        grant_ordinal: u32,
        granted_at: DateTime<Utc>,
    ) -> Result<()> {
        let message = CouponIssued {
            coupon_id,
            user_id,
            rank,
            grant_ordinal,
            granted_at,
        };
        if let Err(e) = self
            .bus
            .publish(channels::COUPON_ISSUED, &message.key(), &message)
        {
            // The allocator already counted this grant.
            tracing::error!(error = %e, rank, "granted coupon could not be queued for materialization");
            return Err(e);
        }
        Ok(())
    }

    /// Lease path: per-coupon lease, locked coupon row, durable count check
    /// and insert in one transaction.
    #[tracing::instrument(skip(self), fields(coupon_id = %coupon_id, user_id = %user_id))]
    pub async fn issue_with_lease(&self, coupon_id: CouponId, user_id: UserId) -> Result<UserCoupon> {
        let result = with_lock(
            &self.locks,
            &keys::coupon_issue(coupon_id),
            self.settings.coupon_lock_wait,
            self.settings.coupon_lock_lease,
            || {
                self.settings.materialization_retry.run(
                    || self.issue_locked(coupon_id, user_id),
                    SagaError::is_version_conflict,
                )
            },
        )
        .await;
        match &result {
            Ok(user_coupon) => {
                count_outcome("GRANTED");
                tracing::info!(user_coupon_id = %user_coupon.id, "coupon issued");
            }
            Err(SagaError::CouponSoldOut { .. }) => count_outcome("SOLD_OUT"),
            Err(SagaError::CouponLimitExceeded { .. }) => count_outcome("EXCEED_USER_LIMIT"),
            Err(_) => count_outcome("REJECTED"),
        }
        result
    }

    async fn issue_locked(&self, coupon_id: CouponId, user_id: UserId) -> Result<UserCoupon> {
        let mut tx = self.uow.begin().await?;
        let mut coupon = tx
            .lock_coupon(coupon_id)
            .await?
            .ok_or_else(|| SagaError::not_found("Coupon", coupon_id))?;
        let now = Utc::now();
        coupon.ensure_issue_window(now).map_err(window_error)?;

        let owned = tx.count_user_coupons(coupon_id, user_id).await?;
        if owned >= coupon.max_issue_per_user {
            return Err(SagaError::CouponLimitExceeded { coupon_id, user_id });
        }
        coupon.record_issue().map_err(window_error)?;
        tx.update_coupon(&mut coupon).await?;
        let user_coupon = tx
            .insert_user_coupon(NewUserCoupon {
                user_id,
                coupon_id,
                grant_ordinal: owned + 1,
                issued_at: now,
            })
            .await?;
        tx.commit().await?;
        Ok(user_coupon)
    }

    pub async fn issued_count(&self, coupon_id: CouponId) -> Result<u32> {
        Ok(self.allocator.issued_count(coupon_id).await?)
    }

    pub async fn user_rank(&self, coupon_id: CouponId, user_id: UserId) -> Result<Option<u32>> {
        Ok(self.allocator.user_rank(coupon_id, user_id).await?)
    }

    async fn load_coupon(&self, coupon_id: CouponId) -> Result<Coupon> {
        let mut tx = self.uow.begin().await?;
        tx.find_coupon(coupon_id)
            .await?
            .ok_or_else(|| SagaError::not_found("Coupon", coupon_id))
    }
}
