//! Integration tests for the API server.

use std::sync::{Arc, OnceLock};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{TimeDelta, Utc};
use common::{CouponId, ProductId, UserId};
use domain::{Account, CartLine, Coupon, CouponStatus, DiscountKind, Money, Product};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{Backends, BusSettings, InMemoryPopularityCounter, Saga, SagaSettings};
use serde_json::{Value, json};
use storage::InMemoryStore;
use tower::ServiceExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

struct TestApp {
    app: axum::Router,
    store: InMemoryStore,
    popularity: Arc<InMemoryPopularityCounter>,
    saga: Saga,
}

impl TestApp {
    fn new() -> Self {
        let store = InMemoryStore::new();
        let popularity = Arc::new(InMemoryPopularityCounter::new());
        let backends = Backends {
            popularity: popularity.clone(),
            ..Backends::in_memory(&store)
        };
        let saga = Saga::start(backends, SagaSettings::default(), BusSettings::default()).unwrap();
        let state = Arc::new(api::AppState { saga: saga.clone() });
        let app = api::create_app(state, get_metrics_handle());
        Self {
            app,
            store,
            popularity,
            saga,
        }
    }

    async fn seed_checkout(&self, user: i64, balance: i64, stock: u32, quantity: u32) {
        self.store
            .insert_account(Account::new(UserId::new(user), "buyer", Money::new(balance)))
            .await;
        self.store
            .insert_product(Product::new(ProductId::new(1), "keyboard", Money::new(3_000), stock))
            .await;
        self.store
            .add_to_cart(CartLine::new(UserId::new(user), ProductId::new(1), quantity))
            .await;
    }

    async fn seed_coupon(&self, id: i64, total: u32) {
        let now = Utc::now();
        self.store
            .insert_coupon(Coupon {
                id: CouponId::new(id),
                code: format!("FLASH-{id}"),
                name: "flash sale".to_string(),
                kind: DiscountKind::FixedAmount,
                discount_value: 1_000,
                minimum_order_amount: None,
                maximum_discount_amount: None,
                total_quantity: total,
                issued_quantity: 0,
                max_issue_per_user: 1,
                issue_start_at: now - TimeDelta::hours(1),
                issue_end_at: now + TimeDelta::hours(1),
                valid_from: now - TimeDelta::hours(1),
                valid_until: now + TimeDelta::days(7),
                status: CouponStatus::Active,
                version: 0,
            })
            .await;
    }

    async fn send(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    async fn checkout(&self, user: i64, key: &str) -> (StatusCode, Value) {
        self.send(
            "POST",
            "/orders",
            Some(json!({ "user_id": user, "idempotency_key": key })),
        )
        .await
    }
}

#[tokio::test]
async fn test_health_check() {
    let t = TestApp::new();
    let (status, body) = t.send("GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let t = TestApp::new();
    let response = t
        .app
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()["content-type"].to_str().unwrap();
    assert!(content_type.starts_with("text/plain"));
}

#[tokio::test]
async fn test_checkout_pays_order() {
    let t = TestApp::new();
    t.seed_checkout(1, 10_000, 5, 2).await;

    let (status, created) = t.checkout(1, "req-1").await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["status"], "PENDING");
    assert_eq!(created["final_amount"], 6_000);
    let id = created["id"].as_i64().unwrap();

    t.saga.wait_until_idle().await;

    let (status, order) = t.send("GET", &format!("/orders/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(order["status"], "PAID");
    assert_eq!(order["payment"]["status"], "COMPLETED");

    let (_, account) = t.send("GET", "/users/1/balance", None).await;
    assert_eq!(account["balance"], 4_000);
}

#[tokio::test]
async fn test_checkout_replays_same_key() {
    let t = TestApp::new();
    t.seed_checkout(1, 10_000, 5, 1).await;

    let (_, first) = t.checkout(1, "req-replay").await;
    t.saga.wait_until_idle().await;
    let (status, second) = t.checkout(1, "req-replay").await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["id"], second["id"]);
    assert_eq!(first["order_number"], second["order_number"]);

    let (_, orders) = t.send("GET", "/users/1/orders", None).await;
    assert_eq!(orders.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_checkout_validation_errors() {
    let t = TestApp::new();
    t.seed_checkout(1, 10_000, 5, 1).await;

    let (status, body) = t.checkout(1, "   ").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_REQUEST");
    assert_eq!(body["retryable"], false);

    let (status, body) = t.checkout(99, "req-unknown-user").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");

    let (status, body) = t
        .send("POST", "/orders", Some(json!({ "user_id": "one" })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_REQUEST");
}

#[tokio::test]
async fn test_checkout_beyond_stock_is_422() {
    let t = TestApp::new();
    t.seed_checkout(1, 100_000, 2, 3).await;

    let (status, body) = t.checkout(1, "req-too-many").await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "INSUFFICIENT_STOCK");
    assert_eq!(body["retryable"], false);
}

#[tokio::test]
async fn test_get_order_errors() {
    let t = TestApp::new();

    let (status, _) = t.send("GET", "/orders/4242", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = t.send("GET", "/orders/not-a-number", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_REQUEST");
}

#[tokio::test]
async fn test_cancel_paid_order_refunds() {
    let t = TestApp::new();
    t.seed_checkout(1, 10_000, 5, 2).await;
    let (_, created) = t.checkout(1, "req-cancel").await;
    let id = created["id"].as_i64().unwrap();
    t.saga.wait_until_idle().await;

    let (status, order) = t
        .send(
            "POST",
            &format!("/orders/{id}/cancel"),
            Some(json!({ "reason": "changed my mind" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(order["status"], "CANCELLED");
    assert_eq!(order["cancellation_reason"], "changed my mind");

    let (_, account) = t.send("GET", "/users/1/balance", None).await;
    assert_eq!(account["balance"], 10_000);
    assert_eq!(t.store.product(ProductId::new(1)).await.unwrap().stock, 5);

    let (status, body) = t
        .send("POST", &format!("/orders/{id}/cancel"), Some(json!({})))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "INVALID_STATE");
}

#[tokio::test]
async fn test_charge_balance() {
    let t = TestApp::new();
    t.store
        .insert_account(Account::new(UserId::new(7), "saver", Money::new(500)))
        .await;

    let (status, account) = t
        .send("POST", "/users/7/balance/charge", Some(json!({ "amount": 1_500 })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(account["balance"], 2_000);

    let (status, body) = t
        .send("POST", "/users/7/balance/charge", Some(json!({ "amount": 0 })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["retryable"], false);

    let (status, _) = t
        .send("POST", "/users/8/balance/charge", Some(json!({ "amount": 100 })))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_coupon_issue_sold_out_and_limit() {
    let t = TestApp::new();
    t.seed_coupon(5, 1).await;

    let (status, granted) = t
        .send("POST", "/coupons/5/issue", Some(json!({ "user_id": 1 })))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(granted["rank"], 1);
    assert_eq!(granted["issued_count"], 1);

    let (status, body) = t
        .send("POST", "/coupons/5/issue", Some(json!({ "user_id": 1 })))
        .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], "EXCEED_USER_LIMIT");

    let (status, body) = t
        .send("POST", "/coupons/5/issue", Some(json!({ "user_id": 2 })))
        .await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["code"], "SOLD_OUT");
    assert_eq!(body["retryable"], false);

    t.saga.wait_until_idle().await;
    let (_, issued) = t.send("GET", "/coupons/5/issued", None).await;
    assert_eq!(issued["issued_count"], 1);
    assert_eq!(t.store.user_coupons_of(CouponId::new(5)).await.len(), 1);

    let (status, _) = t
        .send("POST", "/coupons/404/issue", Some(json!({ "user_id": 1 })))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_retry_endpoints() {
    let t = TestApp::new();
    t.seed_checkout(1, 10_000, 5, 1).await;
    t.popularity.set_fail_on_record(true);

    let (_, created) = t.checkout(1, "req-popularity").await;
    let id = created["id"].as_i64().unwrap();
    t.saga.wait_until_idle().await;

    let (status, events) = t.send("GET", &format!("/orders/{id}/events"), None).await;
    assert_eq!(status, StatusCode::OK);
    let events = events.as_array().unwrap().clone();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["event_type"], "POPULAR_PRODUCT_AGGREGATION");
    assert_eq!(events[0]["status"], "PENDING");
    let event_id = events[0]["id"].as_i64().unwrap();

    let (status, report) = t.send("POST", "/events/retry-sweep", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["skipped"], false);
    assert_eq!(report["attempted"], 0);

    let (_, failed) = t.send("GET", "/events/failed", None).await;
    assert!(failed.as_array().unwrap().is_empty());

    t.popularity.set_fail_on_record(false);
    let (status, retried) = t
        .send("POST", &format!("/events/{event_id}/retry"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(retried["status"], "COMPLETED");

    let (status, _) = t.send("POST", "/events/999/retry", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
