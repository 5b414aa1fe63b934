//! Checkout and order lifecycle endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::{OrderId, UserCouponId, UserId};
use domain::{Order, Payment};
use event_store::RetryableEvent;
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;
use crate::routes::{json_body, path_id};

// -- Request types --

#[derive(Deserialize)]
pub struct CreateOrderRequest {
    pub user_id: i64,
    pub user_coupon_id: Option<i64>,
    pub idempotency_key: String,
}

#[derive(Deserialize)]
pub struct CancelOrderRequest {
    pub reason: Option<String>,
}

// -- Response types --

#[derive(Serialize)]
pub struct OrderResponse {
    #[serde(flatten)]
    pub order: Order,
    pub payment: Option<Payment>,
}

// -- Handlers --

/// POST /orders: turns the user's cart into a `PENDING` order.
///
/// The stages run after the response is sent; poll `GET /orders/{id}` for
/// the outcome. Repeating a request with the same key returns the same order.
#[tracing::instrument(skip(state, body))]
pub async fn create(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CreateOrderRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Order>), ApiError> {
    let req = json_body(body)?;
    let order = state
        .saga
        .orders
        .create_order(
            UserId::new(req.user_id),
            req.user_coupon_id.map(UserCouponId::new),
            &req.idempotency_key,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(order)))
}

/// GET /orders/{id}: the order with its payment.
pub async fn get(
    State(state): State<Arc<AppState>>,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Json<OrderResponse>, ApiError> {
    let order_id = OrderId::new(path_id(id)?);
    let order = state.saga.orders.get_order(order_id).await?;
    let payment = match state.saga.orders.payment(order_id).await {
        Ok(payment) => Some(payment),
        Err(e) if e.is_not_found() => None,
        Err(e) => return Err(e.into()),
    };
    Ok(Json(OrderResponse { order, payment }))
}

/// POST /orders/{id}/cancel: cancels a paid order and gives everything back.
#[tracing::instrument(skip(state, id, body))]
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    id: Result<Path<i64>, PathRejection>,
    body: Result<Json<CancelOrderRequest>, JsonRejection>,
) -> Result<Json<Order>, ApiError> {
    let order_id = OrderId::new(path_id(id)?);
    let reason = json_body(body)?
        .reason
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| "cancelled by user".to_string());
    let order = state.saga.orders.cancel_order(order_id, &reason).await?;
    Ok(Json(order))
}

/// GET /orders/{id}/events: retryable events recorded for the order.
pub async fn events(
    State(state): State<Arc<AppState>>,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Json<Vec<RetryableEvent>>, ApiError> {
    let order_id = OrderId::new(path_id(id)?);
    let events = state.saga.retries.events_for_order(order_id).await?;
    Ok(Json(events))
}
