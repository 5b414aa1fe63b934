//! Flash-sale coupon issuance.

use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::{CouponId, UserId};
use saga::IssueResult;
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;
use crate::routes::{json_body, path_id};

#[derive(Deserialize)]
pub struct IssueRequest {
    pub user_id: i64,
}

#[derive(Serialize)]
pub struct IssuedCountResponse {
    pub coupon_id: CouponId,
    pub issued_count: u32,
}

/// POST /coupons/{id}/issue: grants one unit or rejects with 410 / 429.
///
/// The user coupon row is written asynchronously after the grant.
#[tracing::instrument(skip(state, id, body))]
pub async fn issue(
    State(state): State<Arc<AppState>>,
    id: Result<Path<i64>, PathRejection>,
    body: Result<Json<IssueRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<IssueResult>), ApiError> {
    let coupon_id = CouponId::new(path_id(id)?);
    let req = json_body(body)?;
    let result = state
        .saga
        .coupons
        .request_issue(coupon_id, UserId::new(req.user_id))
        .await?;
    Ok((StatusCode::CREATED, Json(result)))
}

/// GET /coupons/{id}/issued
pub async fn issued(
    State(state): State<Arc<AppState>>,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Json<IssuedCountResponse>, ApiError> {
    let coupon_id = CouponId::new(path_id(id)?);
    let issued_count = state.saga.coupons.issued_count(coupon_id).await?;
    Ok(Json(IssuedCountResponse {
        coupon_id,
        issued_count,
    }))
}
