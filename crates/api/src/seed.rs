//! Demo rows for a local in-memory run.

use chrono::{TimeDelta, Utc};
use common::{CouponId, ProductId, UserId};
use domain::{Account, CartLine, Coupon, CouponStatus, DiscountKind, Money, Product};
use storage::InMemoryStore;

/// Coupon seeded for flash-sale experiments.
pub const DEMO_COUPON: CouponId = CouponId::new(1);

/// Seeds three funded users, a small catalogue, a 100-unit flash-sale
/// coupon and a cart for user 1.
pub async fn seed_demo_data(store: &InMemoryStore) {
    for (id, name) in [(1, "alice"), (2, "bob"), (3, "carol")] {
        store
            .insert_account(Account::new(UserId::new(id), name, Money::new(100_000)))
            .await;
    }

    let catalogue = [
        (1, "mechanical keyboard", 89_000, 50),
        (2, "wireless mouse", 25_000, 100),
        (3, "usb-c hub", 42_000, 5),
    ];
    for (id, name, price, stock) in catalogue {
        store
            .insert_product(Product::new(ProductId::new(id), name, Money::new(price), stock))
            .await;
    }

    let now = Utc::now();
    store
        .insert_coupon(Coupon {
            id: DEMO_COUPON,
            code: "FLASH10".to_string(),
            name: "flash sale 10%".to_string(),
            kind: DiscountKind::Percentage,
            discount_value: 10,
            minimum_order_amount: Some(Money::new(10_000)),
            maximum_discount_amount: Some(Money::new(20_000)),
            total_quantity: 100,
            issued_quantity: 0,
            max_issue_per_user: 1,
            issue_start_at: now,
            issue_end_at: now + TimeDelta::days(1),
            valid_from: now,
            valid_until: now + TimeDelta::days(30),
            status: CouponStatus::Active,
            version: 0,
        })
        .await;

    store
        .add_to_cart(CartLine::new(UserId::new(1), ProductId::new(2), 1))
        .await;

    tracing::info!(users = 3, products = catalogue.len(), "demo data seeded");
}
