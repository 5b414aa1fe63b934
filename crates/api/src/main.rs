//! API server entry point.

use std::process::ExitCode;
use std::sync::Arc;

use api::config::{Config, LogFormat};
use api::{AppState, BootError};
use saga::Saga;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn run(config: Config) -> Result<(), BootError> {
    // 1. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;

    // 2. Backends, optional demo data, saga pipeline
    let (backends, memory_store) = api::build_backends(&config).await?;
    if config.seed_demo_data {
        match &memory_store {
            Some(store) => api::seed::seed_demo_data(store).await,
            None => tracing::warn!("SEED_DEMO_DATA ignored with a database backend"),
        }
    }
    let saga = Saga::start(backends, config.saga_settings(), config.bus_settings())?;

    // 3. Periodic retry sweep
    let (stop_tx, stop_rx) = watch::channel(false);
    let tick = api::spawn_retry_tick(saga.clone(), config.retry_sweep_interval, stop_rx);

    // 4. Serve until a signal arrives
    let app = api::create_app(Arc::new(AppState { saga: saga.clone() }), metrics_handle);
    let addr = config.addr();
    tracing::info!(%addr, "starting API server");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // 5. Stop the tick, drain in-flight stage messages
    let _ = stop_tx.send(true);
    if let Err(e) = tick.await {
        tracing::error!(error = %e, "retry tick task panicked");
    }
    saga.shutdown().await;

    served?;
    tracing::info!("server shut down gracefully");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::from_env();
    init_tracing(&config);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "server failed");
            ExitCode::FAILURE
        }
    }
}
