//! Entity-level walk through a checkout, a compensation and a paid-order cancellation.

use chrono::{Duration, NaiveDate, Utc};
use common::{CouponId, OrderId, ProductId, UserCouponId, UserId};
use domain::{
    Account, Coupon, CouponStatus, DiscountKind, DomainError, ErrorKind, MarkUsed, Money,
    NewOrder, NewUserCoupon, Order, OrderAmounts, OrderItem, OrderNumber, OrderStatus, Payment,
    PaymentStatus, Product, StockLedgerEntry, StockMovement, UserCoupon, UserCouponStatus,
    outstanding_reservations,
};

fn coupon() -> Coupon {
    let now = Utc::now();
    Coupon {
        id: CouponId::new(1),
        code: "TENOFF".into(),
        name: "10% off".into(),
        kind: DiscountKind::Percentage,
        discount_value: 10,
        minimum_order_amount: Some(Money::new(5_000)),
        maximum_discount_amount: Some(Money::new(2_000)),
        total_quantity: 100,
        issued_quantity: 0,
        max_issue_per_user: 1,
        issue_start_at: now - Duration::hours(1),
        issue_end_at: now + Duration::hours(1),
        valid_from: now - Duration::hours(1),
        valid_until: now + Duration::days(30),
        status: CouponStatus::Active,
        version: 0,
    }
}

fn place(products: &[&Product], user: UserId, discount: Money) -> Order {
    let items: Vec<OrderItem> = products
        .iter()
        .map(|p| OrderItem::new(p.id, 1, p.price).unwrap())
        .collect();
    let amounts = OrderAmounts::compute(&items, discount).unwrap();
    Order::from_new(
        OrderId::new(1),
        NewOrder {
            order_number: OrderNumber::new(NaiveDate::from_ymd_opt(2025, 5, 1).unwrap(), 1),
            user_id: user,
            items,
            amounts,
            user_coupon_id: None,
            idempotency_key: "checkout-1".into(),
            ordered_at: Utc::now(),
        },
    )
}

mod happy_path {
    use super::*;

    #[test]
    fn checkout_with_coupon_pays_and_marks_coupon() {
        let user = UserId::new(1);
        let mut account = Account::new(user, "lee", Money::new(20_000));
        let mut keyboard = Product::new(ProductId::new(1), "keyboard", Money::new(8_000), 3);
        let mut mouse = Product::new(ProductId::new(2), "mouse", Money::new(4_000), 3);

        let mut coupon = coupon();
        coupon.ensure_issue_window(Utc::now()).unwrap();
        coupon.record_issue().unwrap();
        let mut granted = UserCoupon::from_new(
            UserCouponId::new(1),
            NewUserCoupon {
                user_id: user,
                coupon_id: coupon.id,
                grant_ordinal: 1,
                issued_at: Utc::now(),
            },
        );
        granted.ensure_usable_by(user, &coupon, Utc::now()).unwrap();

        let discount = coupon.calculate_discount(Money::new(12_000)).unwrap();
        assert_eq!(discount, Money::new(1_200));

        let mut order = place(&[&keyboard, &mouse], user, discount);
        assert_eq!(order.final_amount, Money::new(10_800));

        keyboard.decrease_stock(1).unwrap();
        mouse.decrease_stock(1).unwrap();
        account.use_balance(order.final_amount).unwrap();
        order.complete_pay(Utc::now()).unwrap();

        let mut payment = Payment::pending(order.id, order.final_amount);
        payment.complete(Utc::now()).unwrap();

        assert_eq!(
            granted.mark_used(order.id, &coupon, Utc::now()).unwrap(),
            MarkUsed::Marked
        );
        assert_eq!(order.status, OrderStatus::Paid);
        assert_eq!(payment.status, PaymentStatus::Completed);
        assert_eq!(account.balance, Money::new(9_200));
        assert_eq!(granted.status, UserCouponStatus::Used);
    }
}

mod compensation {
    use super::*;

    #[test]
    fn failed_balance_restores_stock_exactly_once() {
        let user = UserId::new(2);
        let mut account = Account::new(user, "park", Money::new(1_000));
        let mut product = Product::new(ProductId::new(1), "monitor", Money::new(6_000), 1);
        let mut order = place(&[&product], user, Money::ZERO);

        let before = product.stock;
        product.decrease_stock(1).unwrap();
        let mut ledger = vec![StockLedgerEntry::new(
            product.id,
            Some(order.id),
            StockMovement::Decrease,
            1,
            before,
            product.stock,
            "order",
        )];

        let err = account.use_balance(order.final_amount).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BusinessRule);

        for _ in 0..2 {
            for (product_id, qty) in outstanding_reservations(&ledger) {
                assert_eq!(product_id, product.id);
                let before = product.stock;
                product.increase_stock(qty).unwrap();
                ledger.push(StockLedgerEntry::new(
                    product_id,
                    Some(order.id),
                    StockMovement::Increase,
                    qty,
                    before,
                    product.stock,
                    "compensation",
                ));
            }
        }
        if order.status != OrderStatus::Cancelled {
            order.cancel("insufficient balance", Utc::now()).unwrap();
        }

        assert_eq!(product.stock, 1);
        assert_eq!(ledger.len(), 2);
        assert_eq!(order.status, OrderStatus::Cancelled);
    }
}

mod cancellation {
    use super::*;

    #[test]
    fn paid_order_cancel_refunds_and_restores_coupon() {
        let user = UserId::new(3);
        let coupon = coupon();
        let mut account = Account::new(user, "choi", Money::new(10_000));
        let product = Product::new(ProductId::new(1), "desk", Money::new(5_000), 1);
        let mut order = place(&[&product], user, Money::new(500));
        let mut granted = UserCoupon::from_new(
            UserCouponId::new(4),
            NewUserCoupon {
                user_id: user,
                coupon_id: coupon.id,
                grant_ordinal: 1,
                issued_at: Utc::now(),
            },
        );

        account.use_balance(order.final_amount).unwrap();
        order.complete_pay(Utc::now()).unwrap();
        granted.mark_used(order.id, &coupon, Utc::now()).unwrap();

        order.cancel("changed my mind", Utc::now()).unwrap();
        account.refund(order.final_amount).unwrap();
        granted.restore(&coupon, Utc::now()).unwrap();

        assert_eq!(account.balance, Money::new(10_000));
        assert_eq!(granted.status, UserCouponStatus::Issued);
        assert!(matches!(
            order.cancel("again", Utc::now()),
            Err(DomainError::InvalidOrderTransition { .. })
        ));
    }

    #[test]
    fn below_minimum_rejects_coupon() {
        let err = coupon().calculate_discount(Money::new(4_999)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BusinessRule);
    }
}
