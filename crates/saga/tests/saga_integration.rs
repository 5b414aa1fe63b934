//! End-to-end tests of the checkout saga on in-memory backends.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as TimeDelta, Utc};
use common::{CouponId, OrderId, ProductId, UserCouponId, UserId};
use coordination::{InMemoryLockManager, LockManager, RetryPolicy, keys};
use domain::{
    Account, BalanceMovement, CartLine, Coupon, CouponStatus, DiscountKind, Money, NewOrder,
    NewUserCoupon, Order, OrderAmounts, OrderItem, OrderNumber, OrderStatus, Payment,
    PaymentStatus, Product, StockMovement, UserCouponStatus,
};
use event_store::{EventStatus, EventType, InMemoryRetryEventStore, RetryEventStore};
use saga::{
    BalanceDeductionHandler, Backends, BusSettings, Compensator, ErrorClass, FailureRecorder,
    InMemoryPopularityCounter, PopularityCounter, Saga, SagaError, SagaSettings, StagePayload,
};
use storage::{InMemoryStore, UnitOfWork, WriteTarget};

const PRODUCT: ProductId = ProductId::new(1);

struct Harness {
    store: InMemoryStore,
    retry_store: InMemoryRetryEventStore,
    popularity: InMemoryPopularityCounter,
    locks: InMemoryLockManager,
    saga: Saga,
}

impl Harness {
    fn new() -> Self {
        let store = InMemoryStore::new();
        let retry_store = InMemoryRetryEventStore::new();
        let popularity = InMemoryPopularityCounter::new();
        let locks = InMemoryLockManager::new();

        let mut backends = Backends::in_memory(&store);
        backends.retry_store = Arc::new(retry_store.clone());
        backends.popularity = Arc::new(popularity.clone());
        backends.locks = Arc::new(locks.clone());

        let saga = Saga::start(backends, SagaSettings::default(), BusSettings::default()).unwrap();
        Self {
            store,
            retry_store,
            popularity,
            locks,
            saga,
        }
    }

    async fn user(&self, id: i64, balance: i64) -> UserId {
        let user_id = UserId::new(id);
        self.store
            .insert_account(Account::new(user_id, format!("user-{id}"), Money::new(balance)))
            .await;
        user_id
    }

    async fn product(&self, id: ProductId, price: i64, stock: u32) {
        self.store
            .insert_product(Product::new(id, format!("product-{id}"), Money::new(price), stock))
            .await;
    }

    async fn cart(&self, user_id: UserId, product_id: ProductId, quantity: u32) {
        self.store
            .add_to_cart(CartLine::new(user_id, product_id, quantity))
            .await;
    }

    async fn grant(&self, user_id: UserId, coupon_id: CouponId) -> UserCouponId {
        self.store
            .grant_user_coupon(NewUserCoupon {
                user_id,
                coupon_id,
                grant_ordinal: 1,
                issued_at: Utc::now(),
            })
            .await
            .id
    }

    /// Commits a `PENDING` order and its payment the way checkout does,
    /// without publishing `order-created`.
    async fn unpublished_order(&self, user_id: UserId, key: &str, seq: u64, quantity: u32) -> Order {
        let price = self.store.product(PRODUCT).await.unwrap().price;
        let items = vec![OrderItem::new(PRODUCT, quantity, price).unwrap()];
        let mut tx = self.store.begin().await.unwrap();
        let order = tx
            .insert_order(NewOrder {
                order_number: OrderNumber::new(Utc::now().date_naive(), seq),
                user_id,
                amounts: OrderAmounts::compute(&items, Money::ZERO).unwrap(),
                items,
                user_coupon_id: None,
                idempotency_key: key.to_string(),
                ordered_at: Utc::now(),
            })
            .await
            .unwrap();
        tx.insert_payment(&Payment::pending(order.id, order.final_amount))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        order
    }

    async fn settle(&self) {
        assert!(
            self.saga.bus.wait_until_idle_for(Duration::from_secs(10)).await,
            "pipeline did not drain"
        );
    }

    async fn stock(&self, id: ProductId) -> u32 {
        self.store.product(id).await.unwrap().stock
    }

    async fn balance(&self, id: UserId) -> Money {
        self.store.account(id).await.unwrap().balance
    }

    async fn status(&self, id: OrderId) -> OrderStatus {
        self.store.order(id).await.unwrap().status
    }
}

fn coupon(id: i64, kind: DiscountKind, value: i64, total: u32, per_user: u32) -> Coupon {
    let now = Utc::now();
    Coupon {
        id: CouponId::new(id),
        code: format!("COUPON-{id}"),
        name: format!("coupon {id}"),
        kind,
        discount_value: value,
        minimum_order_amount: None,
        maximum_discount_amount: None,
        total_quantity: total,
        issued_quantity: 0,
        max_issue_per_user: per_user,
        issue_start_at: now - TimeDelta::hours(1),
        issue_end_at: now + TimeDelta::hours(1),
        valid_from: now - TimeDelta::hours(1),
        valid_until: now + TimeDelta::days(7),
        status: CouponStatus::Active,
        version: 0,
    }
}

#[tokio::test]
async fn test_checkout_pays_order_end_to_end() {
    let h = Harness::new();
    let user = h.user(1, 10_000).await;
    h.product(PRODUCT, 3_000, 5).await;
    h.cart(user, PRODUCT, 2).await;

    let order = h.saga.orders.create_order(user, None, "key-1").await.unwrap();
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.total_amount, Money::new(6_000));
    assert_eq!(order.final_amount, Money::new(6_000));
    assert!(order.order_number.as_str().starts_with("ORD-"));
    assert!(h.store.cart(user).await.is_empty());

    h.settle().await;

    assert_eq!(h.status(order.id).await, OrderStatus::Paid);
    assert_eq!(h.balance(user).await, Money::new(4_000));
    assert_eq!(h.stock(PRODUCT).await, 3);
    assert_eq!(
        h.store.payment(order.id).await.unwrap().status,
        PaymentStatus::Completed
    );
    assert_eq!(h.popularity.sold(PRODUCT).await.unwrap(), 2);

    let stock_ledger = h.store.stock_ledger().await;
    assert_eq!(stock_ledger.len(), 1);
    assert_eq!(stock_ledger[0].movement, StockMovement::Decrease);
    assert_eq!(stock_ledger[0].order_id, Some(order.id));
    let balance_ledger = h.store.balance_ledger().await;
    assert_eq!(balance_ledger.len(), 1);
    assert_eq!(balance_ledger[0].movement, BalanceMovement::Use);

    assert_eq!(h.retry_store.event_count().await, 0);
    assert!(h.saga.bus.dead_letters().is_empty());
}

#[tokio::test]
async fn test_same_idempotency_key_returns_same_order() {
    let h = Harness::new();
    let user = h.user(1, 10_000).await;
    h.product(PRODUCT, 1_000, 10).await;
    h.cart(user, PRODUCT, 1).await;

    let first = h.saga.orders.create_order(user, None, "same").await.unwrap();
    h.settle().await;
    let second = h.saga.orders.create_order(user, None, "same").await.unwrap();
    h.settle().await;

    assert_eq!(first.id, second.id);
    assert_eq!(h.store.orders().await.len(), 1);
    assert_eq!(h.stock(PRODUCT).await, 9);
    assert_eq!(h.balance(user).await, Money::new(9_000));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_replays_create_one_order() {
    let h = Harness::new();
    let user = h.user(1, 10_000).await;
    h.product(PRODUCT, 1_000, 10).await;
    h.cart(user, PRODUCT, 1).await;

    let attempts = (0..5).map(|_| h.saga.orders.create_order(user, None, "burst"));
    let results = futures_util::future::join_all(attempts).await;

    let ids: Vec<OrderId> = results.into_iter().map(|r| r.unwrap().id).collect();
    assert!(ids.iter().all(|id| *id == ids[0]));
    h.settle().await;
    assert_eq!(h.store.orders().await.len(), 1);
    assert_eq!(h.stock(PRODUCT).await, 9);
}

#[tokio::test]
async fn test_checkout_rejects_missing_input_before_mutation() {
    let h = Harness::new();
    let user = h.user(1, 10_000).await;

    let err = h.saga.orders.create_order(user, None, "k").await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Validation);
    assert_eq!(err.code(), "EMPTY_CART");

    let err = h
        .saga
        .orders
        .create_order(UserId::new(99), None, "k")
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let err = h.saga.orders.create_order(user, None, "  ").await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Validation);
    assert!(h.store.orders().await.is_empty());
}

#[tokio::test]
async fn test_balance_failure_restores_stock_and_cancels() {
    let h = Harness::new();
    let user = h.user(1, 1_000).await;
    h.product(PRODUCT, 3_000, 5).await;
    h.cart(user, PRODUCT, 1).await;

    let order = h.saga.orders.create_order(user, None, "poor").await.unwrap();
    h.settle().await;

    assert_eq!(h.status(order.id).await, OrderStatus::Cancelled);
    assert_eq!(h.stock(PRODUCT).await, 5);
    assert_eq!(h.balance(user).await, Money::new(1_000));
    assert_eq!(
        h.store.payment(order.id).await.unwrap().status,
        PaymentStatus::Failed
    );

    let movements: Vec<_> = h.store.stock_ledger().await.iter().map(|e| e.movement).collect();
    assert_eq!(movements, vec![StockMovement::Decrease, StockMovement::Increase]);

    let events = h.retry_store.all().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::BalanceDeduction);
    assert_eq!(events[0].aggregate_id, order.id.to_string());
}

#[tokio::test]
async fn test_recorded_balance_failure_retries_as_no_op() {
    let h = Harness::new();
    let user = h.user(1, 1_000).await;
    h.product(PRODUCT, 3_000, 5).await;
    h.cart(user, PRODUCT, 1).await;

    h.saga.orders.create_order(user, None, "poor").await.unwrap();
    h.settle().await;

    let report = h
        .saga
        .retries
        .retry_all_at(Utc::now() + TimeDelta::minutes(2))
        .await
        .unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(report.succeeded, 1);

    assert_eq!(h.stock(PRODUCT).await, 5);
    assert_eq!(h.store.stock_ledger().await.len(), 2);
    assert_eq!(h.retry_store.all().await[0].status, EventStatus::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_back_to_back_checkouts_leave_one_paid_order() {
    let h = Harness::new();
    let user = h.user(1, 10_000).await;
    h.product(PRODUCT, 6_000, 10).await;

    // Checkout itself is sequential here; the two balance stages contend.
    h.cart(user, PRODUCT, 1).await;
    let a = h.saga.orders.create_order(user, None, "race-a").await.unwrap();
    h.cart(user, PRODUCT, 1).await;
    let b = h.saga.orders.create_order(user, None, "race-b").await.unwrap();
    h.settle().await;

    let mut statuses = vec![h.status(a.id).await, h.status(b.id).await];
    statuses.sort_by_key(|s| s.as_str());
    assert_eq!(statuses, vec![OrderStatus::Cancelled, OrderStatus::Paid]);
    assert_eq!(h.balance(user).await, Money::new(4_000));
    assert_eq!(h.stock(PRODUCT).await, 9);

    let events = h.retry_store.all().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::BalanceDeduction);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_simultaneous_balance_deductions_charge_once() {
    let h = Harness::new();
    let user = h.user(1, 10_000).await;
    h.product(PRODUCT, 6_000, 10).await;
    let a = h.unpublished_order(user, "both-a", 901, 1).await;
    let b = h.unpublished_order(user, "both-b", 902, 1).await;

    let uow = Arc::new(h.store.clone());
    let recorder = FailureRecorder::new(Arc::new(h.retry_store.clone()));
    let balance = BalanceDeductionHandler::new(
        uow.clone(),
        Arc::new(h.locks.clone()),
        h.saga.bus.clone(),
        Compensator::new(uow, RetryPolicy::stock_reservation()),
        recorder,
        SagaSettings::default(),
    );
    let (ra, rb) = tokio::join!(
        balance.handle(StagePayload::from(&a)),
        balance.handle(StagePayload::from(&b)),
    );
    ra.unwrap();
    rb.unwrap();
    h.settle().await;

    let mut statuses = vec![h.status(a.id).await, h.status(b.id).await];
    statuses.sort_by_key(|s| s.as_str());
    assert_eq!(statuses, vec![OrderStatus::Cancelled, OrderStatus::Paid]);
    assert_eq!(h.balance(user).await, Money::new(4_000));
    let uses = h
        .store
        .balance_ledger()
        .await
        .into_iter()
        .filter(|e| e.movement == BalanceMovement::Use)
        .count();
    assert_eq!(uses, 1);

    let events = h.retry_store.all().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::BalanceDeduction);
}

#[tokio::test]
async fn test_stock_write_failure_is_recorded_and_cancels() {
    let h = Harness::new();
    let user = h.user(1, 10_000).await;
    h.product(PRODUCT, 1_000, 5).await;
    h.cart(user, PRODUCT, 2).await;
    h.store.set_fail_on_write(WriteTarget::Product, true).await;

    let order = h.saga.orders.create_order(user, None, "broken-stock").await.unwrap();
    h.settle().await;

    assert_eq!(h.status(order.id).await, OrderStatus::Cancelled);
    assert_eq!(h.stock(PRODUCT).await, 5);
    assert_eq!(h.balance(user).await, Money::new(10_000));
    assert_eq!(
        h.store.payment(order.id).await.unwrap().status,
        PaymentStatus::Failed
    );
    assert!(h.store.stock_ledger().await.is_empty());

    let recorded = h.saga.retries.events_for_order(order.id).await.unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].event_type, EventType::StockDeduction);

    h.store.set_fail_on_write(WriteTarget::Product, false).await;
    let report = h
        .saga
        .retries
        .retry_all_at(Utc::now() + TimeDelta::minutes(2))
        .await
        .unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(report.succeeded, 1);
    assert_eq!(
        h.retry_store.find(recorded[0].id).await.unwrap().unwrap().status,
        EventStatus::Completed
    );
    assert_eq!(h.stock(PRODUCT).await, 5);
}

#[tokio::test]
async fn test_retry_restores_stock_after_failed_compensation() {
    let h = Harness::new();
    let user = h.user(1, 1_000).await;
    h.product(PRODUCT, 3_000, 5).await;
    h.cart(user, PRODUCT, 1).await;
    // The reservation goes through, the restore after the balance failure does not.
    h.store.fail_writes_after(WriteTarget::Product, 1).await;

    let order = h.saga.orders.create_order(user, None, "stuck").await.unwrap();
    h.settle().await;

    assert_eq!(h.status(order.id).await, OrderStatus::Pending);
    assert_eq!(h.stock(PRODUCT).await, 4);
    let recorded = h.saga.retries.events_for_order(order.id).await.unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].event_type, EventType::BalanceDeduction);

    h.store.set_fail_on_write(WriteTarget::Product, false).await;
    let report = h
        .saga
        .retries
        .retry_all_at(Utc::now() + TimeDelta::minutes(2))
        .await
        .unwrap();
    assert_eq!(report.succeeded, 1);

    assert_eq!(h.status(order.id).await, OrderStatus::Cancelled);
    assert_eq!(h.stock(PRODUCT).await, 5);
    assert_eq!(h.balance(user).await, Money::new(1_000));
    assert_eq!(
        h.store.payment(order.id).await.unwrap().status,
        PaymentStatus::Failed
    );
    let movements: Vec<_> = h.store.stock_ledger().await.iter().map(|e| e.movement).collect();
    assert_eq!(movements, vec![StockMovement::Decrease, StockMovement::Increase]);
    assert_eq!(
        h.retry_store.find(recorded[0].id).await.unwrap().unwrap().status,
        EventStatus::Completed
    );
}

#[tokio::test]
async fn test_replay_restarts_an_order_that_never_reached_the_pipeline() {
    let h = Harness::new();
    let user = h.user(1, 10_000).await;
    h.product(PRODUCT, 1_000, 5).await;
    let stranded = h.unpublished_order(user, "stranded", 900, 2).await;

    let replayed = h.saga.orders.create_order(user, None, "stranded").await.unwrap();
    assert_eq!(replayed.id, stranded.id);
    h.settle().await;

    assert_eq!(h.status(stranded.id).await, OrderStatus::Paid);
    assert_eq!(h.stock(PRODUCT).await, 3);
    assert_eq!(h.balance(user).await, Money::new(8_000));

    // Once reserved, a replay starts nothing new.
    h.saga.orders.create_order(user, None, "stranded").await.unwrap();
    h.settle().await;
    assert_eq!(h.stock(PRODUCT).await, 3);
    assert_eq!(h.store.stock_ledger().await.len(), 1);
    assert_eq!(h.store.balance_ledger().await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_last_unit_goes_to_one_order() {
    let h = Harness::new();
    let alice = h.user(1, 10_000).await;
    let bob = h.user(2, 10_000).await;
    h.product(PRODUCT, 1_000, 1).await;
    h.cart(alice, PRODUCT, 1).await;
    h.cart(bob, PRODUCT, 1).await;

    let (a, b) = tokio::join!(
        h.saga.orders.create_order(alice, None, "alice"),
        h.saga.orders.create_order(bob, None, "bob"),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    h.settle().await;

    let mut statuses = vec![h.status(a.id).await, h.status(b.id).await];
    statuses.sort_by_key(|s| s.as_str());
    assert_eq!(statuses, vec![OrderStatus::Cancelled, OrderStatus::Paid]);
    assert_eq!(h.stock(PRODUCT).await, 0);

    let total = h.balance(alice).await + h.balance(bob).await;
    assert_eq!(total, Money::new(19_000));
    // A shortage is final, so nothing is recorded for retry.
    assert_eq!(h.retry_store.event_count().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_flash_sale_grants_exactly_capacity() {
    let h = Harness::new();
    let coupon_id = CouponId::new(7);
    h.store
        .insert_coupon(coupon(7, DiscountKind::FixedAmount, 1_000, 100, 1))
        .await;

    let mut tasks = Vec::with_capacity(1_000);
    for requester in 1..=1_000 {
        let coupons = Arc::clone(&h.saga.coupons);
        tasks.push(tokio::spawn(async move {
            coupons.request_issue(coupon_id, UserId::new(requester)).await
        }));
    }

    let mut granted = Vec::new();
    let mut sold_out = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(result) => granted.push(result.rank),
            Err(SagaError::CouponSoldOut { .. }) => sold_out += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    granted.sort_unstable();

    assert_eq!(granted, (1..=100).collect::<Vec<u32>>());
    assert_eq!(sold_out, 900);
    assert_eq!(h.saga.coupons.issued_count(coupon_id).await.unwrap(), 100);

    h.settle().await;
    assert_eq!(h.store.user_coupons_of(coupon_id).await.len(), 100);
    let stored = h.store.coupon(coupon_id).await.unwrap();
    assert_eq!(stored.issued_quantity, 100);
    assert_eq!(stored.status, CouponStatus::Exhausted);

    let err = h
        .saga
        .coupons
        .request_issue(coupon_id, UserId::new(5_000))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "SOLD_OUT");
}

#[tokio::test]
async fn test_second_issue_to_same_user_exceeds_limit() {
    let h = Harness::new();
    let coupon_id = CouponId::new(3);
    h.store
        .insert_coupon(coupon(3, DiscountKind::FixedAmount, 500, 10, 1))
        .await;
    let user = UserId::new(1);

    let first = h.saga.coupons.request_issue(coupon_id, user).await.unwrap();
    assert_eq!(first.rank, 1);
    let err = h.saga.coupons.request_issue(coupon_id, user).await.unwrap_err();
    assert!(matches!(err, SagaError::CouponLimitExceeded { .. }));

    h.settle().await;
    assert_eq!(h.store.user_coupons_of(coupon_id).await.len(), 1);
}

#[tokio::test]
async fn test_lease_path_issues_durably() {
    let h = Harness::new();
    let coupon_id = CouponId::new(4);
    h.store
        .insert_coupon(coupon(4, DiscountKind::FixedAmount, 500, 2, 1))
        .await;

    let issued = h
        .saga
        .coupons
        .issue_with_lease(coupon_id, UserId::new(1))
        .await
        .unwrap();
    assert_eq!(issued.status, UserCouponStatus::Issued);
    h.saga
        .coupons
        .issue_with_lease(coupon_id, UserId::new(2))
        .await
        .unwrap();

    let err = h
        .saga
        .coupons
        .issue_with_lease(coupon_id, UserId::new(3))
        .await
        .unwrap_err();
    assert!(matches!(err, SagaError::CouponSoldOut { .. }));
    assert_eq!(h.store.coupon(coupon_id).await.unwrap().issued_quantity, 2);
}

#[tokio::test]
async fn test_coupon_is_redeemed_after_payment() {
    let h = Harness::new();
    let user = h.user(1, 10_000).await;
    h.product(PRODUCT, 5_000, 3).await;
    h.store
        .insert_coupon(coupon(9, DiscountKind::FixedAmount, 1_000, 10, 1))
        .await;
    let granted = h
        .store
        .grant_user_coupon(NewUserCoupon {
            user_id: user,
            coupon_id: CouponId::new(9),
            grant_ordinal: 1,
            issued_at: Utc::now(),
        })
        .await;
    h.cart(user, PRODUCT, 1).await;

    let order = h
        .saga
        .orders
        .create_order(user, Some(granted.id), "with-coupon")
        .await
        .unwrap();
    assert_eq!(order.discount_amount, Money::new(1_000));
    assert_eq!(order.final_amount, Money::new(4_000));
    h.settle().await;

    assert_eq!(h.status(order.id).await, OrderStatus::Paid);
    assert_eq!(h.balance(user).await, Money::new(6_000));
    let used = h.store.user_coupon(granted.id).await.unwrap();
    assert_eq!(used.status, UserCouponStatus::Used);
    assert_eq!(used.used_order_id, Some(order.id));
    let record = h.store.order_coupon(order.id).await.unwrap();
    assert_eq!(record.discount_amount, Money::new(1_000));
}

#[tokio::test]
async fn test_one_coupon_discounts_one_order() {
    let h = Harness::new();
    let user = h.user(1, 20_000).await;
    h.product(PRODUCT, 5_000, 5).await;
    h.store
        .insert_coupon(coupon(9, DiscountKind::FixedAmount, 1_000, 10, 1))
        .await;
    let granted = h.grant(user, CouponId::new(9)).await;

    h.cart(user, PRODUCT, 1).await;
    let first = h
        .saga
        .orders
        .create_order(user, Some(granted), "coupon-a")
        .await
        .unwrap();
    h.cart(user, PRODUCT, 1).await;
    let err = h
        .saga
        .orders
        .create_order(user, Some(granted), "coupon-b")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "COUPON_NOT_USABLE");
    assert_eq!(err.class(), ErrorClass::BusinessRule);

    h.settle().await;
    let err = h
        .saga
        .orders
        .create_order(user, Some(granted), "coupon-c")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "COUPON_NOT_USABLE");

    let second = h.saga.orders.create_order(user, None, "no-coupon").await.unwrap();
    h.settle().await;

    assert_eq!(h.status(first.id).await, OrderStatus::Paid);
    assert_eq!(h.status(second.id).await, OrderStatus::Paid);
    assert_eq!(second.discount_amount, Money::ZERO);
    assert!(h.store.order_coupon(first.id).await.is_some());
    assert!(h.store.order_coupon(second.id).await.is_none());
    assert_eq!(
        h.store.user_coupon(granted).await.unwrap().used_order_id,
        Some(first.id)
    );
    assert_eq!(h.balance(user).await, Money::new(11_000));
}

#[tokio::test]
async fn test_failed_coupon_redemption_is_retried() {
    let h = Harness::new();
    let user = h.user(1, 10_000).await;
    h.product(PRODUCT, 5_000, 3).await;
    h.store
        .insert_coupon(coupon(9, DiscountKind::FixedAmount, 1_000, 10, 1))
        .await;
    let granted = h.grant(user, CouponId::new(9)).await;
    h.cart(user, PRODUCT, 1).await;
    h.store.set_fail_on_write(WriteTarget::UserCoupon, true).await;

    let order = h
        .saga
        .orders
        .create_order(user, Some(granted), "coupon-retry")
        .await
        .unwrap();
    h.settle().await;

    // Payment stands; only the redemption is pending.
    assert_eq!(h.status(order.id).await, OrderStatus::Paid);
    assert_eq!(h.balance(user).await, Money::new(6_000));
    assert_eq!(
        h.store.user_coupon(granted).await.unwrap().status,
        UserCouponStatus::Issued
    );
    assert!(h.store.order_coupon(order.id).await.is_none());
    let recorded = h.saga.retries.events_for_order(order.id).await.unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].event_type, EventType::CouponUsage);

    h.store.set_fail_on_write(WriteTarget::UserCoupon, false).await;
    let report = h
        .saga
        .retries
        .retry_all_at(Utc::now() + TimeDelta::minutes(2))
        .await
        .unwrap();
    assert_eq!(report.succeeded, 1);

    let used = h.store.user_coupon(granted).await.unwrap();
    assert_eq!(used.status, UserCouponStatus::Used);
    assert_eq!(used.used_order_id, Some(order.id));
    assert_eq!(
        h.store.order_coupon(order.id).await.unwrap().discount_amount,
        Money::new(1_000)
    );
    assert_eq!(
        h.retry_store.find(recorded[0].id).await.unwrap().unwrap().status,
        EventStatus::Completed
    );
}

#[tokio::test]
async fn test_cancel_paid_order_gives_everything_back() {
    let h = Harness::new();
    let user = h.user(1, 10_000).await;
    h.product(PRODUCT, 2_000, 4).await;
    h.store
        .insert_coupon(coupon(2, DiscountKind::Percentage, 10, 10, 1))
        .await;
    let granted = h
        .store
        .grant_user_coupon(NewUserCoupon {
            user_id: user,
            coupon_id: CouponId::new(2),
            grant_ordinal: 1,
            issued_at: Utc::now(),
        })
        .await;
    h.cart(user, PRODUCT, 2).await;

    let order = h
        .saga
        .orders
        .create_order(user, Some(granted.id), "to-cancel")
        .await
        .unwrap();
    assert_eq!(order.final_amount, Money::new(3_600));
    h.settle().await;
    assert_eq!(h.balance(user).await, Money::new(6_400));

    let cancelled = h
        .saga
        .orders
        .cancel_order(order.id, "changed my mind")
        .await
        .unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(h.balance(user).await, Money::new(10_000));
    assert_eq!(h.stock(PRODUCT).await, 4);
    assert_eq!(
        h.store.payment(order.id).await.unwrap().status,
        PaymentStatus::Cancelled
    );
    assert_eq!(
        h.store.user_coupon(granted.id).await.unwrap().status,
        UserCouponStatus::Issued
    );
    let refund = h
        .store
        .balance_ledger()
        .await
        .into_iter()
        .find(|e| e.movement == BalanceMovement::Refund)
        .unwrap();
    assert_eq!(refund.amount, Money::new(3_600));

    let err = h.saga.orders.cancel_order(order.id, "again").await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::BusinessRule);
}

#[tokio::test]
async fn test_order_queries() {
    let h = Harness::new();
    let user = h.user(1, 10_000).await;
    h.product(PRODUCT, 1_000, 5).await;
    h.cart(user, PRODUCT, 1).await;
    let order = h.saga.orders.create_order(user, None, "q").await.unwrap();
    h.settle().await;

    let by_number = h
        .saga
        .orders
        .get_order_by_number(order.order_number.as_str())
        .await
        .unwrap();
    assert_eq!(by_number.id, order.id);
    assert_eq!(h.saga.orders.orders_for_user(user).await.unwrap().len(), 1);
    assert!(h.saga.orders.get_order(OrderId::new(404)).await.unwrap_err().is_not_found());
    assert_eq!(
        h.saga
            .orders
            .get_order_by_number("not-a-number")
            .await
            .unwrap_err()
            .class(),
        ErrorClass::Validation
    );
}

#[tokio::test]
async fn test_charge_credits_balance_under_owner_lease() {
    let h = Harness::new();
    let user = h.user(1, 1_000).await;

    let account = h.saga.balances.charge(user, Money::new(5_000)).await.unwrap();
    assert_eq!(account.balance, Money::new(6_000));
    let ledger = h.store.balance_ledger().await;
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].movement, BalanceMovement::Charge);
    assert_eq!(ledger[0].order_id, None);

    let err = h.saga.balances.charge(user, Money::ZERO).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Validation);

    let held = h
        .locks
        .acquire(&keys::balance(user), Duration::ZERO, Duration::from_secs(30))
        .await
        .unwrap();
    let settings = SagaSettings {
        owner_lock_wait: Duration::from_millis(50),
        ..SagaSettings::default()
    };
    let impatient = saga::BalanceService::new(
        Arc::new(h.store.clone()),
        Arc::new(h.locks.clone()),
        settings,
    );
    let err = impatient.charge(user, Money::new(1)).await.unwrap_err();
    assert!(err.is_retryable());
    h.locks.release(&held).await.unwrap();
}

#[tokio::test]
async fn test_failing_aggregation_backs_off_then_fails() {
    let h = Harness::new();
    let user = h.user(1, 10_000).await;
    h.product(PRODUCT, 1_000, 5).await;
    h.cart(user, PRODUCT, 1).await;
    h.popularity.set_fail_on_record(true);

    let order = h.saga.orders.create_order(user, None, "popular").await.unwrap();
    h.settle().await;
    // The side-effect failure never touches the order.
    assert_eq!(h.status(order.id).await, OrderStatus::Paid);

    let recorded = h.saga.retries.events_for_order(order.id).await.unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].event_type, EventType::PopularProductAggregation);
    let id = recorded[0].id;

    let mut sweep_at = recorded[0].next_retry_at;
    let mut gaps = Vec::new();
    for attempt in 1..=3 {
        let report = h.saga.retries.retry_all_at(sweep_at).await.unwrap();
        assert_eq!(report.attempted, 1);
        assert_eq!(report.failed, 1);
        let event = h.retry_store.find(id).await.unwrap().unwrap();
        assert_eq!(event.retry_count, attempt);
        if attempt < 3 {
            assert_eq!(event.status, EventStatus::Pending);
            gaps.push(event.next_retry_at - sweep_at);
            sweep_at = event.next_retry_at;
        } else {
            assert_eq!(event.status, EventStatus::Failed);
        }
    }
    assert_eq!(gaps, vec![TimeDelta::minutes(5), TimeDelta::minutes(15)]);

    let later = h
        .saga
        .retries
        .retry_all_at(sweep_at + TimeDelta::hours(1))
        .await
        .unwrap();
    assert_eq!(later.attempted, 0);
    assert_eq!(h.saga.retries.failed_events().await.unwrap().len(), 1);

    h.popularity.set_fail_on_record(false);
    let retried = h.saga.retries.manual_retry(id).await.unwrap();
    assert_eq!(retried.status, EventStatus::Completed);
    assert!(retried.last_error.unwrap().contains("[manual retry]"));
    assert_eq!(h.popularity.sold(PRODUCT).await.unwrap(), 1);
    assert!(h.saga.retries.failed_events().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_sweep_is_skipped_while_another_runner_holds_it() {
    let h = Harness::new();
    let held = h
        .locks
        .acquire(keys::RETRY_SWEEP, Duration::ZERO, Duration::from_secs(60))
        .await
        .unwrap();

    let report = h.saga.retries.retry_all().await.unwrap();
    assert!(report.skipped);
    assert_eq!(report.attempted, 0);

    h.locks.release(&held).await.unwrap();
    let report = h.saga.retries.retry_all().await.unwrap();
    assert!(!report.skipped);
}

#[tokio::test]
async fn test_shutdown_drains_pipeline() {
    let h = Harness::new();
    let user = h.user(1, 10_000).await;
    h.product(PRODUCT, 1_000, 5).await;
    h.cart(user, PRODUCT, 1).await;

    let order = h.saga.orders.create_order(user, None, "drain").await.unwrap();
    h.saga.shutdown().await;

    assert_eq!(h.status(order.id).await, OrderStatus::Paid);
}
