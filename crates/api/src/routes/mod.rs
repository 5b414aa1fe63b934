//! HTTP route handlers.

pub mod coupons;
pub mod events;
pub mod health;
pub mod metrics;
pub mod orders;
pub mod users;

use axum::Json;
use axum::extract::Path;
use axum::extract::rejection::{JsonRejection, PathRejection};

use crate::error::ApiError;

/// Unwraps a JSON body, reporting a malformed one as a `400`.
pub(crate) fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(value)| value)
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}

/// Unwraps a numeric path id, reporting a malformed one as a `400`.
pub(crate) fn path_id(path: Result<Path<i64>, PathRejection>) -> Result<i64, ApiError> {
    path.map(|Path(id)| id)
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}
