//! HTTP surface of the checkout saga.
//!
//! Handlers are thin: checkout, cancellation, balance, coupon issuance and
//! retry operations all live in the `saga` crate. This crate adds the
//! backend wiring, the periodic retry tick, structured logging (tracing)
//! and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;
pub mod seed;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use coordination::{InMemoryQuantityAllocator, PostgresLockManager};
use event_store::PostgresRetryEventStore;
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{Backends, InMemoryPopularityCounter, Saga, SagaError};
use sqlx::postgres::PgPoolOptions;
use storage::{InMemoryStore, PostgresSequenceGenerator, PostgresStore, StoreError};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub saga: Saga,
}

/// Failures while starting the server.
#[derive(Debug, Error)]
pub enum BootError {
    #[error("database connection failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store setup failed: {0}")]
    Store(#[from] StoreError),

    #[error("saga startup failed: {0}")]
    Saga(#[from] SagaError),

    #[error("metrics recorder setup failed: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/orders", post(routes::orders::create))
        .route("/orders/{id}", get(routes::orders::get))
        .route("/orders/{id}/cancel", post(routes::orders::cancel))
        .route("/orders/{id}/events", get(routes::orders::events))
        .route("/users/{id}/balance", get(routes::users::balance))
        .route("/users/{id}/balance/charge", post(routes::users::charge))
        .route("/users/{id}/orders", get(routes::users::orders))
        .route("/coupons/{id}/issue", post(routes::coupons::issue))
        .route("/coupons/{id}/issued", get(routes::coupons::issued))
        .route("/events/failed", get(routes::events::failed))
        .route("/events/retry-sweep", post(routes::events::sweep))
        .route("/events/{id}/retry", post(routes::events::retry))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Picks the backends named by the configuration.
///
/// With `DATABASE_URL` set, orders, locks, sequences and retry events live
/// in PostgreSQL and migrations are applied first. Otherwise everything is
/// in memory and the returned store can be seeded.
pub async fn build_backends(config: &Config) -> Result<(Backends, Option<InMemoryStore>), BootError> {
    let Some(url) = config.database_url.as_deref() else {
        tracing::info!("using in-memory backends");
        let store = InMemoryStore::new();
        return Ok((Backends::in_memory(&store), Some(store)));
    };

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(5))
        .connect(url)
        .await?;
    let store = PostgresStore::new(pool.clone());
    store.run_migrations().await?;
    tracing::info!("using PostgreSQL backends, migrations applied");

    let backends = Backends {
        uow: Arc::new(store),
        sequences: Arc::new(PostgresSequenceGenerator::new(pool.clone())),
        locks: Arc::new(PostgresLockManager::new(pool.clone())),
        allocator: Arc::new(InMemoryQuantityAllocator::new()),
        retry_store: Arc::new(PostgresRetryEventStore::new(pool)),
        popularity: Arc::new(InMemoryPopularityCounter::new()),
    };
    Ok((backends, None))
}

/// Runs a retry sweep every `interval` until `shutdown` flips to `true`.
///
/// The first tick fires one full interval after start.
pub fn spawn_retry_tick(
    saga: Saga,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = saga.retries.retry_all().await {
                        tracing::error!(error = %e, "retry sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("retry tick stopped");
    })
}
