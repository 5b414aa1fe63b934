//! Saga error types.

use common::{CouponId, UserId};
use coordination::CoordinationError;
use domain::{DomainError, ErrorKind};
use event_store::EventStoreError;
use storage::StoreError;
use thiserror::Error;

/// How a failure surfaces to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed or missing input, rejected before any lock or mutation.
    Validation,
    /// A final decision, such as insufficient stock or balance.
    BusinessRule,
    /// Lock-wait timeout or version conflict; the caller may try again.
    Conflict,
    /// A store or collaborator was unavailable.
    Infrastructure,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Validation => "validation",
            ErrorClass::BusinessRule => "business_rule",
            ErrorClass::Conflict => "conflict",
            ErrorClass::Infrastructure => "infrastructure",
        }
    }
}

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The coupon has no quantity left. Retrying will not help.
    #[error("Coupon {coupon_id} is sold out")]
    CouponSoldOut { coupon_id: CouponId },

    #[error("User {user_id} reached the issue limit of coupon {coupon_id}")]
    CouponLimitExceeded { coupon_id: CouponId, user_id: UserId },

    /// A collaborator could not be reached.
    #[error("{0} unavailable")]
    Unavailable(String),

    /// Domain rule violation.
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    /// Retry store error.
    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        SagaError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Places the error in the failure taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            SagaError::NotFound { .. } | SagaError::InvalidRequest(_) => ErrorClass::Validation,
            SagaError::CouponSoldOut { .. } | SagaError::CouponLimitExceeded { .. } => {
                ErrorClass::BusinessRule
            }
            SagaError::Domain(err) => match err.kind() {
                ErrorKind::Validation => ErrorClass::Validation,
                ErrorKind::BusinessRule => ErrorClass::BusinessRule,
            },
            SagaError::Store(StoreError::VersionConflict { .. }) => ErrorClass::Conflict,
            SagaError::Store(StoreError::NotFound { .. }) => ErrorClass::Validation,
            SagaError::Coordination(CoordinationError::LockTimeout { .. }) => ErrorClass::Conflict,
            SagaError::EventStore(EventStoreError::NotFound(_)) => ErrorClass::Validation,
            SagaError::EventStore(EventStoreError::InvalidTransition { .. }) => {
                ErrorClass::BusinessRule
            }
            SagaError::Unavailable(_)
            | SagaError::Store(_)
            | SagaError::Coordination(_)
            | SagaError::EventStore(_)
            | SagaError::Serialization(_) => ErrorClass::Infrastructure,
        }
    }

    /// True only for conflicts; everything else is final for the caller.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Conflict
    }

    /// True when the error names a missing entity.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SagaError::NotFound { .. }
                | SagaError::Domain(DomainError::NotFound { .. })
                | SagaError::Store(StoreError::NotFound { .. })
                | SagaError::EventStore(EventStoreError::NotFound(_))
        )
    }

    /// Optimistic version conflicts, the only errors retried locally.
    pub(crate) fn is_version_conflict(&self) -> bool {
        matches!(self, SagaError::Store(err) if err.is_conflict())
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            SagaError::NotFound { .. } => "NOT_FOUND",
            SagaError::InvalidRequest(_) => "INVALID_REQUEST",
            SagaError::CouponSoldOut { .. } => "SOLD_OUT",
            SagaError::CouponLimitExceeded { .. } => "EXCEED_USER_LIMIT",
            SagaError::Unavailable(_) => "UNAVAILABLE",
            SagaError::Domain(err) => match err {
                DomainError::InsufficientStock { .. } => "INSUFFICIENT_STOCK",
                DomainError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
                DomainError::EmptyCart { .. } => "EMPTY_CART",
                DomainError::NotFound { .. } => "NOT_FOUND",
                DomainError::CouponExhausted { .. } => "SOLD_OUT",
                DomainError::IssueWindowClosed { .. } => "ISSUE_WINDOW_CLOSED",
                DomainError::CouponNotUsable { .. }
                | DomainError::CouponInUse { .. }
                | DomainError::CouponNotOwned { .. } => "COUPON_NOT_USABLE",
                DomainError::BelowMinimumOrderAmount { .. } => "BELOW_MINIMUM_ORDER_AMOUNT",
                DomainError::InvalidOrderTransition { .. }
                | DomainError::InvalidPaymentTransition { .. }
                | DomainError::InvalidCouponTransition { .. } => "INVALID_STATE",
                _ => "INVALID_REQUEST",
            },
            SagaError::Store(StoreError::VersionConflict { .. }) => "CONFLICT",
            SagaError::Store(StoreError::NotFound { .. }) => "NOT_FOUND",
            SagaError::Coordination(CoordinationError::LockTimeout { .. }) => "BUSY",
            SagaError::EventStore(EventStoreError::NotFound(_)) => "NOT_FOUND",
            SagaError::EventStore(EventStoreError::InvalidTransition { .. }) => "INVALID_STATE",
            SagaError::Store(_)
            | SagaError::Coordination(_)
            | SagaError::EventStore(_)
            | SagaError::Serialization(_) => "INFRASTRUCTURE",
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
