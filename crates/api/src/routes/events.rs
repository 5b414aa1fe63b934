//! Operator endpoints for retryable events.

use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::PathRejection;
use axum::extract::{Path, State};
use event_store::{EventId, RetryableEvent};
use saga::SweepReport;

use crate::AppState;
use crate::error::ApiError;
use crate::routes::path_id;

/// GET /events/failed: events that exhausted their retries.
pub async fn failed(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<RetryableEvent>>, ApiError> {
    Ok(Json(state.saga.retries.failed_events().await?))
}

/// POST /events/{id}/retry: resets a failed event and re-executes it now.
#[tracing::instrument(skip(state, id))]
pub async fn retry(
    State(state): State<Arc<AppState>>,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Json<RetryableEvent>, ApiError> {
    let event_id = EventId::new(path_id(id)?);
    Ok(Json(state.saga.retries.manual_retry(event_id).await?))
}

/// POST /events/retry-sweep: runs one sweep outside the periodic tick.
pub async fn sweep(State(state): State<Arc<AppState>>) -> Result<Json<SweepReport>, ApiError> {
    Ok(Json(state.saga.retries.retry_all().await?))
}
