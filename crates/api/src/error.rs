//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use saga::{ErrorClass, SagaError};
use serde::Serialize;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Bad request from the client, rejected before reaching the saga.
    BadRequest(String),
    /// Error raised by a saga service.
    Saga(SagaError),
}

/// JSON body of every error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: &'static str,
    pub retryable: bool,
}

impl ApiError {
    /// HTTP status for the error.
    ///
    /// Sold-out and per-user-limit rejections get their own statuses so a
    /// client can tell them apart from a retryable conflict.
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Saga(err) => saga_status(err),
        }
    }

    fn body(&self) -> ErrorBody {
        match self {
            ApiError::BadRequest(msg) => ErrorBody {
                error: msg.clone(),
                code: "INVALID_REQUEST",
                retryable: false,
            },
            ApiError::Saga(err) => ErrorBody {
                error: err.to_string(),
                code: err.code(),
                retryable: err.is_retryable(),
            },
        }
    }
}

fn saga_status(err: &SagaError) -> StatusCode {
    if err.is_not_found() {
        return StatusCode::NOT_FOUND;
    }
    match err {
        SagaError::CouponSoldOut { .. } => StatusCode::GONE,
        SagaError::CouponLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        _ => match err.class() {
            ErrorClass::Validation => StatusCode::BAD_REQUEST,
            ErrorClass::BusinessRule if err.code() == "SOLD_OUT" => StatusCode::GONE,
            ErrorClass::BusinessRule => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorClass::Conflict => StatusCode::CONFLICT,
            ErrorClass::Infrastructure => StatusCode::SERVICE_UNAVAILABLE,
        },
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = self.body();
        metrics::counter!(
            "http_errors_total",
            "status" => status.as_u16().to_string(),
            "code" => body.code
        )
        .increment(1);
        if status.is_server_error() {
            tracing::error!(error = %body.error, code = body.code, "request failed");
        } else {
            tracing::debug!(error = %body.error, code = body.code, %status, "request rejected");
        }
        (status, axum::Json(body)).into_response()
    }
}

impl From<SagaError> for ApiError {
    fn from(err: SagaError) -> Self {
        ApiError::Saga(err)
    }
}
