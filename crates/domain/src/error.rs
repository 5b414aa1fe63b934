//! Domain error types.

use common::{CouponId, OrderId, ProductId, UserCouponId, UserId};
use thiserror::Error;

use crate::coupon::UserCouponStatus;
use crate::order::{OrderStatus, PaymentStatus};
use crate::value_objects::Money;

/// How a domain rejection should be surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or missing input, rejected before any mutation.
    Validation,
    /// A business rule refused the request; retrying will not help.
    BusinessRule,
}

/// Errors raised by entity rules.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Invalid quantity: {quantity} (must be greater than 0)")]
    InvalidQuantity { quantity: u32 },

    #[error("Invalid amount: {amount} (must be greater than 0)")]
    InvalidAmount { amount: Money },

    #[error(
        "Insufficient stock for product {product_id}: requested {requested}, available {available}"
    )]
    InsufficientStock {
        product_id: ProductId,
        requested: u32,
        available: u32,
    },

    #[error("Insufficient balance for user {user_id}: requested {requested}, available {available}")]
    InsufficientBalance {
        user_id: UserId,
        requested: Money,
        available: Money,
    },

    /// The order is not in a status that allows the action.
    #[error("Invalid state transition: cannot {action} an order in {current} state")]
    InvalidOrderTransition {
        current: OrderStatus,
        action: &'static str,
    },

    #[error("Invalid state transition: cannot {action} a payment in {current} state")]
    InvalidPaymentTransition {
        current: PaymentStatus,
        action: &'static str,
    },

    /// Discount must satisfy `0 <= discount <= total`.
    #[error("Invalid discount {discount} for order total {total}")]
    InvalidDiscount { discount: Money, total: Money },

    #[error("Order total {actual} is below the coupon minimum {minimum}")]
    BelowMinimumOrderAmount { minimum: Money, actual: Money },

    #[error("Coupon {coupon_id} is outside its issue window")]
    IssueWindowClosed { coupon_id: CouponId },

    #[error("Coupon {coupon_id} has no remaining quantity")]
    CouponExhausted { coupon_id: CouponId },

    #[error("User coupon {user_coupon_id} cannot be used (status {status})")]
    CouponNotUsable {
        user_coupon_id: UserCouponId,
        status: UserCouponStatus,
    },

    #[error("User coupon {user_coupon_id} is already taken by order {order_id}")]
    CouponInUse {
        user_coupon_id: UserCouponId,
        order_id: OrderId,
    },

    #[error("User coupon {user_coupon_id} does not belong to user {user_id}")]
    CouponNotOwned {
        user_coupon_id: UserCouponId,
        user_id: UserId,
    },

    #[error("Cannot {action} user coupon {user_coupon_id} in {status} status")]
    InvalidCouponTransition {
        user_coupon_id: UserCouponId,
        status: UserCouponStatus,
        action: &'static str,
    },

    #[error("Invalid coupon definition: {0}")]
    InvalidCoupon(String),

    #[error("Cart of user {user_id} is empty")]
    EmptyCart { user_id: UserId },

    #[error("Invalid order number: {0}")]
    InvalidOrderNumber(String),

    #[error("Unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
}

impl DomainError {
    /// Shorthand for a missing entity.
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        DomainError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub(crate) fn unknown_variant(kind: &'static str, value: &str) -> Self {
        DomainError::UnknownVariant {
            kind,
            value: value.to_string(),
        }
    }

    /// Classifies the error for the caller.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DomainError::InvalidQuantity { .. }
            | DomainError::InvalidAmount { .. }
            | DomainError::InvalidDiscount { .. }
            | DomainError::CouponNotOwned { .. }
            | DomainError::InvalidCoupon(_)
            | DomainError::EmptyCart { .. }
            | DomainError::InvalidOrderNumber(_)
            | DomainError::UnknownVariant { .. }
            | DomainError::NotFound { .. } => ErrorKind::Validation,
            DomainError::InsufficientStock { .. }
            | DomainError::InsufficientBalance { .. }
            | DomainError::InvalidOrderTransition { .. }
            | DomainError::InvalidPaymentTransition { .. }
            | DomainError::BelowMinimumOrderAmount { .. }
            | DomainError::IssueWindowClosed { .. }
            | DomainError::CouponExhausted { .. }
            | DomainError::CouponNotUsable { .. }
            | DomainError::CouponInUse { .. }
            | DomainError::InvalidCouponTransition { .. } => ErrorKind::BusinessRule,
        }
    }
}

/// Result type for domain operations.
pub type Result<T> = std::result::Result<T, DomainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_input_is_validation() {
        let err = DomainError::EmptyCart {
            user_id: UserId::new(1),
        };
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(
            DomainError::not_found("Product", ProductId::new(3)).kind(),
            ErrorKind::Validation
        );
    }

    #[test]
    fn shortage_is_business_rule() {
        let err = DomainError::InsufficientBalance {
            user_id: UserId::new(1),
            requested: Money::new(6_000),
            available: Money::new(4_000),
        };
        assert_eq!(err.kind(), ErrorKind::BusinessRule);
        assert!(err.to_string().contains("requested 6000"));
    }
}
