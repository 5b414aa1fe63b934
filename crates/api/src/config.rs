//! Application configuration loaded from environment variables.

use std::time::Duration;

use saga::{BusSettings, SagaSettings};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST` / `PORT`: bind address (default `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default `info`)
/// - `LOG_FORMAT`: `pretty` or `json`
/// - `DATABASE_URL`: selects the PostgreSQL backends when set
/// - `RETRY_SWEEP_INTERVAL_SECS`: period of the retry tick (default 60)
/// - `LOCK_WAIT_MS` / `LOCK_LEASE_MS`: owner lease wait and lifetime
/// - `BUS_PARTITIONS`: partitions per bus channel (default 8)
/// - `SEED_DEMO_DATA`: seed demo rows into the in-memory store
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub retry_sweep_interval: Duration,
    pub lock_wait: Duration,
    pub lock_lease: Duration,
    pub bus_partitions: usize,
    pub seed_demo_data: bool,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup. Unparseable values
    /// fall back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: lookup("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: match lookup("LOG_FORMAT").as_deref().map(str::trim) {
                Some(f) if f.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            retry_sweep_interval: parsed("RETRY_SWEEP_INTERVAL_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.retry_sweep_interval),
            lock_wait: parsed("LOCK_WAIT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_wait),
            lock_lease: parsed("LOCK_LEASE_MS")
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_lease),
            bus_partitions: parsed("BUS_PARTITIONS")
                .and_then(|n| usize::try_from(n).ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.bus_partitions),
            seed_demo_data: lookup("SEED_DEMO_DATA")
                .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(defaults.seed_demo_data),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn saga_settings(&self) -> SagaSettings {
        SagaSettings {
            owner_lock_wait: self.lock_wait,
            owner_lock_lease: self.lock_lease,
            ..SagaSettings::default()
        }
    }

    pub fn bus_settings(&self) -> BusSettings {
        BusSettings {
            partitions: self.bus_partitions,
            ..BusSettings::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            database_url: None,
            retry_sweep_interval: Duration::from_secs(60),
            lock_wait: Duration::from_millis(10_000),
            lock_lease: Duration::from_millis(30_000),
            bus_partitions: 8,
            seed_demo_data: false,
        }
    }
}
