use serde::{Deserialize, Serialize};

/// Declares a surrogate identifier backed by an `i64` database key.
///
/// Each identifier is its own type so an order id can never be passed
/// where a product id is expected.
macro_rules! surrogate_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Wraps a raw key.
            pub const fn new(value: i64) -> Self {
                Self(value)
            }

            /// Returns the raw key.
            pub const fn value(&self) -> i64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

surrogate_id!(
    /// Surrogate key of an order. The human-readable order number is separate.
    OrderId
);
surrogate_id!(
    /// Key of a user, who owns a balance, a cart and coupons.
    UserId
);
surrogate_id!(
    /// Key of a catalog product.
    ProductId
);
surrogate_id!(
    /// Key of a coupon definition.
    CouponId
);
surrogate_id!(
    /// Key of a coupon issued to a specific user.
    UserCouponId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_preserve_raw_value() {
        let id = OrderId::new(42);
        assert_eq!(id.value(), 42);
        assert_eq!(i64::from(id), 42);
        assert_eq!(OrderId::from(42), id);
    }

    #[test]
    fn ids_display_as_plain_number() {
        assert_eq!(UserId::new(7).to_string(), "7");
    }

    #[test]
    fn ids_serialize_transparently() {
        let id = CouponId::new(9);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "9");
        let back: CouponId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn ids_order_by_value() {
        let mut ids = vec![ProductId::new(3), ProductId::new(1), ProductId::new(2)];
        ids.sort();
        assert_eq!(ids, vec![ProductId::new(1), ProductId::new(2), ProductId::new(3)]);
    }
}
