//! Coupon definitions and the coupons granted to users.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::{CouponId, OrderId, UserCouponId, UserId};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, Result};
use crate::value_objects::Money;

/// How a coupon's `discount_value` is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscountKind {
    /// A flat amount off the order.
    FixedAmount,
    /// A percentage of the order total, rounded down.
    Percentage,
}

impl DiscountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscountKind::FixedAmount => "FIXED_AMOUNT",
            DiscountKind::Percentage => "PERCENTAGE",
        }
    }
}

impl FromStr for DiscountKind {
    type Err = DomainError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "FIXED_AMOUNT" => Ok(DiscountKind::FixedAmount),
            "PERCENTAGE" => Ok(DiscountKind::Percentage),
            other => Err(DomainError::unknown_variant("discount kind", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CouponStatus {
    #[default]
    Active,
    Inactive,
    /// Every unit has been issued. Already granted coupons stay usable.
    Exhausted,
}

impl CouponStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CouponStatus::Active => "ACTIVE",
            CouponStatus::Inactive => "INACTIVE",
            CouponStatus::Exhausted => "EXHAUSTED",
        }
    }
}

impl std::fmt::Display for CouponStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CouponStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(CouponStatus::Active),
            "INACTIVE" => Ok(CouponStatus::Inactive),
            "EXHAUSTED" => Ok(CouponStatus::Exhausted),
            other => Err(DomainError::unknown_variant("coupon status", other)),
        }
    }
}

/// A coupon campaign with a limited quantity.
///
/// Two windows apply: coupons can be *issued* between `issue_start_at` and
/// `issue_end_at` and *used* between `valid_from` and `valid_until`. Both
/// bounds are inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coupon {
    pub id: CouponId,
    pub code: String,
    pub name: String,
    pub kind: DiscountKind,
    /// Amount for [`DiscountKind::FixedAmount`], percent for [`DiscountKind::Percentage`].
    pub discount_value: i64,
    pub minimum_order_amount: Option<Money>,
    pub maximum_discount_amount: Option<Money>,
    pub total_quantity: u32,
    pub issued_quantity: u32,
    pub max_issue_per_user: u32,
    pub issue_start_at: DateTime<Utc>,
    pub issue_end_at: DateTime<Utc>,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub status: CouponStatus,
    pub version: i64,
}

impl Coupon {
    /// Checks the definition itself is coherent.
    pub fn validate(&self) -> Result<()> {
        if self.discount_value <= 0 {
            return Err(DomainError::InvalidCoupon(
                "discount value must be positive".into(),
            ));
        }
        if self.kind == DiscountKind::Percentage && self.discount_value > 100 {
            return Err(DomainError::InvalidCoupon(
                "percentage must not exceed 100".into(),
            ));
        }
        if self.total_quantity == 0 || self.max_issue_per_user == 0 {
            return Err(DomainError::InvalidCoupon(
                "quantities must be positive".into(),
            ));
        }
        if self.issue_start_at > self.issue_end_at || self.valid_from > self.valid_until {
            return Err(DomainError::InvalidCoupon("window ends before it starts".into()));
        }
        Ok(())
    }

    pub fn is_issuable_at(&self, now: DateTime<Utc>) -> bool {
        self.status == CouponStatus::Active
            && self.issue_start_at <= now
            && now <= self.issue_end_at
    }

    /// Rejects issuance outside the issue window or on a non-active coupon.
    pub fn ensure_issue_window(&self, now: DateTime<Utc>) -> Result<()> {
        if self.status == CouponStatus::Exhausted {
            return Err(DomainError::CouponExhausted { coupon_id: self.id });
        }
        if !self.is_issuable_at(now) {
            return Err(DomainError::IssueWindowClosed { coupon_id: self.id });
        }
        Ok(())
    }

    /// Whether granted coupons can be used at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.status != CouponStatus::Inactive && self.valid_from <= now && now <= self.valid_until
    }

    pub fn remaining(&self) -> u32 {
        self.total_quantity.saturating_sub(self.issued_quantity)
    }

    /// Counts one more durable issue.
    pub fn record_issue(&mut self) -> Result<()> {
        if self.issued_quantity >= self.total_quantity {
            return Err(DomainError::CouponExhausted { coupon_id: self.id });
        }
        self.issued_quantity += 1;
        if self.issued_quantity >= self.total_quantity {
            self.status = CouponStatus::Exhausted;
        }
        Ok(())
    }

    /// Computes the discount for an order total.
    ///
    /// The result never exceeds `total`.
    pub fn calculate_discount(&self, total: Money) -> Result<Money> {
        if let Some(minimum) = self.minimum_order_amount {
            if total < minimum {
                return Err(DomainError::BelowMinimumOrderAmount {
                    minimum,
                    actual: total,
                });
            }
        }
        let discount = match self.kind {
            DiscountKind::FixedAmount => Money::new(self.discount_value),
            DiscountKind::Percentage => {
                let pct = u32::try_from(self.discount_value).unwrap_or(100).min(100);
                let raw = total.percent(pct);
                match self.maximum_discount_amount {
                    Some(max) if raw > max => max,
                    _ => raw,
                }
            }
        };
        Ok(discount.min(total))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserCouponStatus {
    #[default]
    Issued,
    Used,
    Expired,
    Revoked,
}

impl UserCouponStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserCouponStatus::Issued => "ISSUED",
            UserCouponStatus::Used => "USED",
            UserCouponStatus::Expired => "EXPIRED",
            UserCouponStatus::Revoked => "REVOKED",
        }
    }
}

impl std::fmt::Display for UserCouponStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserCouponStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ISSUED" => Ok(UserCouponStatus::Issued),
            "USED" => Ok(UserCouponStatus::Used),
            "EXPIRED" => Ok(UserCouponStatus::Expired),
            "REVOKED" => Ok(UserCouponStatus::Revoked),
            other => Err(DomainError::unknown_variant("user coupon status", other)),
        }
    }
}

/// Result of [`UserCoupon::mark_used`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkUsed {
    Marked,
    /// The coupon was already used by the same order; redelivered
    /// completions land here.
    AlreadyUsed,
}

/// Insert payload for a granted coupon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUserCoupon {
    pub user_id: UserId,
    pub coupon_id: CouponId,
    /// 1-based index of this grant among the user's grants of the coupon.
    pub grant_ordinal: u32,
    pub issued_at: DateTime<Utc>,
}

/// A coupon granted to one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCoupon {
    pub id: UserCouponId,
    pub user_id: UserId,
    pub coupon_id: CouponId,
    pub grant_ordinal: u32,
    pub status: UserCouponStatus,
    pub issued_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub used_order_id: Option<OrderId>,
}

impl UserCoupon {
    pub fn from_new(id: UserCouponId, new: NewUserCoupon) -> Self {
        Self {
            id,
            user_id: new.user_id,
            coupon_id: new.coupon_id,
            grant_ordinal: new.grant_ordinal,
            status: UserCouponStatus::Issued,
            issued_at: new.issued_at,
            used_at: None,
            used_order_id: None,
        }
    }

    pub fn can_use(&self, coupon: &Coupon, now: DateTime<Utc>) -> bool {
        self.status == UserCouponStatus::Issued && coupon.is_valid_at(now)
    }

    /// Checks `user` may apply this coupon to a checkout at `now`.
    pub fn ensure_usable_by(&self, user: UserId, coupon: &Coupon, now: DateTime<Utc>) -> Result<()> {
        if self.user_id != user {
            return Err(DomainError::CouponNotOwned {
                user_coupon_id: self.id,
                user_id: user,
            });
        }
        if !self.can_use(coupon, now) {
            return Err(DomainError::CouponNotUsable {
                user_coupon_id: self.id,
                status: self.status,
            });
        }
        Ok(())
    }

    /// Marks the coupon used for `order_id`.
    ///
    /// Repeating the call for the same order is a no-op; a coupon used by
    /// another order is rejected with [`DomainError::CouponInUse`].
    pub fn mark_used(
        &mut self,
        order_id: OrderId,
        coupon: &Coupon,
        now: DateTime<Utc>,
    ) -> Result<MarkUsed> {
        if self.status == UserCouponStatus::Used {
            return match self.used_order_id {
                Some(used_by) if used_by == order_id => Ok(MarkUsed::AlreadyUsed),
                Some(used_by) => Err(DomainError::CouponInUse {
                    user_coupon_id: self.id,
                    order_id: used_by,
                }),
                None => Err(DomainError::CouponNotUsable {
                    user_coupon_id: self.id,
                    status: self.status,
                }),
            };
        }
        if !self.can_use(coupon, now) {
            return Err(DomainError::CouponNotUsable {
                user_coupon_id: self.id,
                status: self.status,
            });
        }
        self.status = UserCouponStatus::Used;
        self.used_at = Some(now);
        self.used_order_id = Some(order_id);
        Ok(MarkUsed::Marked)
    }

    /// Gives a used coupon back after its order was cancelled.
    ///
    /// Goes back to `Issued` while the coupon is still valid, otherwise to `Expired`.
    pub fn restore(&mut self, coupon: &Coupon, now: DateTime<Utc>) -> Result<()> {
        if self.status != UserCouponStatus::Used {
            return Err(self.invalid("restore"));
        }
        self.used_at = None;
        self.used_order_id = None;
        self.status = if coupon.is_valid_at(now) {
            UserCouponStatus::Issued
        } else {
            UserCouponStatus::Expired
        };
        Ok(())
    }

    pub fn expire(&mut self) -> Result<()> {
        if self.status != UserCouponStatus::Issued {
            return Err(self.invalid("expire"));
        }
        self.status = UserCouponStatus::Expired;
        Ok(())
    }

    pub fn revoke(&mut self) -> Result<()> {
        if self.status == UserCouponStatus::Used {
            return Err(self.invalid("revoke"));
        }
        self.status = UserCouponStatus::Revoked;
        Ok(())
    }

    fn invalid(&self, action: &'static str) -> DomainError {
        DomainError::InvalidCouponTransition {
            user_coupon_id: self.id,
            status: self.status,
            action,
        }
    }
}

/// Discount actually applied to an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCoupon {
    pub order_id: OrderId,
    pub user_coupon_id: UserCouponId,
    pub discount_amount: Money,
    pub applied_at: DateTime<Utc>,
}
