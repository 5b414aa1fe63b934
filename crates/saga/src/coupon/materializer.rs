use std::sync::Arc;

use async_trait::async_trait;
use coordination::RetryPolicy;
use domain::{NewUserCoupon, UserCoupon};
use storage::{UnitOfWork, constraints};

use crate::bus::{Envelope, MessageHandler};
use crate::error::{Result, SagaError};
use crate::messages::CouponIssued;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Materialized {
    Created(UserCoupon),
    /// The grant was materialized by an earlier delivery.
    Duplicate,
}

/// Turns allocator grants into durable user coupons.
///
/// Deduplicates on (coupon, user, grant ordinal), so a redelivered grant is
/// a no-op. Inserting the user coupon and counting the durable issue happen
/// in one transaction.
pub struct CouponMaterializer {
    uow: Arc<dyn UnitOfWork>,
    retry: RetryPolicy,
}

impl CouponMaterializer {
    pub fn new(uow: Arc<dyn UnitOfWork>, retry: RetryPolicy) -> Self {
        Self { uow, retry }
    }

    #[tracing::instrument(skip(self, grant), fields(coupon_id = %grant.coupon_id, user_id = %grant.user_id))]
    pub async fn materialize(&self, grant: &CouponIssued) -> Result<Materialized> {
        let result = self
            .retry
            .run(|| self.materialize_once(grant), SagaError::is_version_conflict)
            .await;
        match result {
            Ok(Materialized::Duplicate) => {
                tracing::debug!("grant already materialized");
                Ok(Materialized::Duplicate)
            }
            Err(SagaError::Store(e)) if e.is_duplicate(constraints::USER_COUPON_GRANT) => {
                tracing::debug!("grant materialized concurrently");
                Ok(Materialized::Duplicate)
            }
            other => other,
        }
    }

    async fn materialize_once(&self, grant: &CouponIssued) -> Result<Materialized> {
        let mut tx = self.uow.begin().await?;
        if tx
            .find_user_coupon_by_grant(grant.coupon_id, grant.user_id, grant.grant_ordinal)
            .await?
            .is_some()
        {
            return Ok(Materialized::Duplicate);
        }
        let mut coupon = tx
            .find_coupon(grant.coupon_id)
            .await?
            .ok_or_else(|| SagaError::not_found("Coupon", grant.coupon_id))?;
        coupon.record_issue()?;
        tx.update_coupon(&mut coupon).await?;
        let user_coupon = tx
            .insert_user_coupon(NewUserCoupon {
                user_id: grant.user_id,
                coupon_id: grant.coupon_id,
                grant_ordinal: grant.grant_ordinal,
                issued_at: grant.granted_at,
            })
            .await?;
        tx.commit().await?;
        Ok(Materialized::Created(user_coupon))
    }
}

#[async_trait]
impl MessageHandler for CouponMaterializer {
    async fn handle(&self, envelope: &Envelope) -> Result<()> {
        let grant: CouponIssued = envelope.decode()?;
        self.materialize(&grant).await?;
        Ok(())
    }
}
