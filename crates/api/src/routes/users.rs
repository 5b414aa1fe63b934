//! Balance endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, State};
use common::UserId;
use domain::{Account, Money, Order};
use serde::Deserialize;

use crate::AppState;
use crate::error::ApiError;
use crate::routes::{json_body, path_id};

#[derive(Deserialize)]
pub struct ChargeRequest {
    pub amount: i64,
}

/// POST /users/{id}/balance/charge: tops up the balance under the owner's lease.
#[tracing::instrument(skip(state, id, body))]
pub async fn charge(
    State(state): State<Arc<AppState>>,
    id: Result<Path<i64>, PathRejection>,
    body: Result<Json<ChargeRequest>, JsonRejection>,
) -> Result<Json<Account>, ApiError> {
    let user_id = UserId::new(path_id(id)?);
    let req = json_body(body)?;
    let account = state
        .saga
        .balances
        .charge(user_id, Money::new(req.amount))
        .await?;
    Ok(Json(account))
}

/// GET /users/{id}/balance
pub async fn balance(
    State(state): State<Arc<AppState>>,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Json<Account>, ApiError> {
    let user_id = UserId::new(path_id(id)?);
    Ok(Json(state.saga.balances.account(user_id).await?))
}

/// GET /users/{id}/orders
pub async fn orders(
    State(state): State<Arc<AppState>>,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Json<Vec<Order>>, ApiError> {
    let user_id = UserId::new(path_id(id)?);
    Ok(Json(state.saga.orders.orders_for_user(user_id).await?))
}
