//! Atomic check-and-increment of coupon issuance.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::{CouponId, UserId};
use tokio::sync::{Mutex, RwLock};

use crate::error::Result;

/// Result of one issuance attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationOutcome {
    Granted {
        /// 1-based position of the requester's first grant.
        rank: u32,
        /// Issued count including this grant.
        issued_count: u32,
        /// 1-based index of this grant among the requester's grants.
        user_ordinal: u32,
    },
    SoldOut {
        issued_count: u32,
    },
    ExceedUserLimit {
        user_count: u32,
    },
}

impl AllocationOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, AllocationOutcome::Granted { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationOutcome::Granted { .. } => "GRANTED",
            AllocationOutcome::SoldOut { .. } => "SOLD_OUT",
            AllocationOutcome::ExceedUserLimit { .. } => "EXCEED_USER_LIMIT",
        }
    }
}

/// Quantity-limited issuance counter.
///
/// `try_issue` checks the per-requester cap, then the total cap, then
/// records the grant, as one step no other caller can interleave with.
#[async_trait]
pub trait QuantityAllocator: Send + Sync {
    async fn try_issue(
        &self,
        coupon_id: CouponId,
        user_id: UserId,
        total_cap: u32,
        per_user_cap: u32,
    ) -> Result<AllocationOutcome>;

    async fn issued_count(&self, coupon_id: CouponId) -> Result<u32>;

    async fn user_issued_count(&self, coupon_id: CouponId, user_id: UserId) -> Result<u32>;

    /// Rank of the requester's first grant, if any.
    async fn user_rank(&self, coupon_id: CouponId, user_id: UserId) -> Result<Option<u32>>;

    /// Grantees in grant order; a requester appears once per grant.
    async fn grants(&self, coupon_id: CouponId) -> Result<Vec<UserId>>;

    async fn reset(&self, coupon_id: CouponId) -> Result<()>;
}

#[derive(Debug, Default)]
struct CouponLedger {
    grants: Vec<UserId>,
    per_user: HashMap<UserId, u32>,
    first_rank: HashMap<UserId, u32>,
}

/// Allocator with one mutex per coupon.
#[derive(Clone, Default)]
pub struct InMemoryQuantityAllocator {
    coupons: Arc<RwLock<HashMap<CouponId, Arc<Mutex<CouponLedger>>>>>,
}

fn count(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

impl InMemoryQuantityAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    async fn ledger(&self, coupon_id: CouponId) -> Arc<Mutex<CouponLedger>> {
        if let Some(ledger) = self.coupons.read().await.get(&coupon_id) {
            return Arc::clone(ledger);
        }
        Arc::clone(self.coupons.write().await.entry(coupon_id).or_default())
    }
}

#[async_trait]
impl QuantityAllocator for InMemoryQuantityAllocator {
    async fn try_issue(
        &self,
        coupon_id: CouponId,
        user_id: UserId,
        total_cap: u32,
        per_user_cap: u32,
    ) -> Result<AllocationOutcome> {
        let ledger = self.ledger(coupon_id).await;
        let mut ledger = ledger.lock().await;

        let user_count = ledger.per_user.get(&user_id).copied().unwrap_or(0);
        if user_count >= per_user_cap {
            return Ok(AllocationOutcome::ExceedUserLimit { user_count });
        }
        let issued = count(ledger.grants.len());
        if issued >= total_cap {
            return Ok(AllocationOutcome::SoldOut {
                issued_count: issued,
            });
        }

        ledger.grants.push(user_id);
        let issued_count = issued + 1;
        let user_ordinal = user_count + 1;
        ledger.per_user.insert(user_id, user_ordinal);
        let rank = *ledger.first_rank.entry(user_id).or_insert(issued_count);
        Ok(AllocationOutcome::Granted {
            rank,
            issued_count,
            user_ordinal,
        })
    }

    async fn issued_count(&self, coupon_id: CouponId) -> Result<u32> {
        let ledger = self.ledger(coupon_id).await;
        let issued = count(ledger.lock().await.grants.len());
        Ok(issued)
    }

    async fn user_issued_count(&self, coupon_id: CouponId, user_id: UserId) -> Result<u32> {
        let ledger = self.ledger(coupon_id).await;
        let issued = ledger.lock().await.per_user.get(&user_id).copied().unwrap_or(0);
        Ok(issued)
    }

    async fn user_rank(&self, coupon_id: CouponId, user_id: UserId) -> Result<Option<u32>> {
        let ledger = self.ledger(coupon_id).await;
        let rank = ledger.lock().await.first_rank.get(&user_id).copied();
        Ok(rank)
    }

    async fn grants(&self, coupon_id: CouponId) -> Result<Vec<UserId>> {
        let ledger = self.ledger(coupon_id).await;
        let grants = ledger.lock().await.grants.clone();
        Ok(grants)
    }

    async fn reset(&self, coupon_id: CouponId) -> Result<()> {
        self.coupons.write().await.remove(&coupon_id);
        Ok(())
    }
}
