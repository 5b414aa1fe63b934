//! PostgreSQL integration tests for the lease table.
//!
//! Run with:
//!
//! ```bash
//! cargo test -p coordination --test postgres_lock -- --test-threads=1
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use coordination::{CoordinationError, LockManager, PostgresLockManager, with_lock};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();
            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();
            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!("../../../migrations/004_create_lock_leases.sql"))
                .execute(&temp_pool)
                .await
                .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

async fn get_lock_manager() -> PostgresLockManager {
    let info = get_container_info().await;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&info.connection_string)
        .await
        .unwrap();
    sqlx::query("TRUNCATE TABLE lock_leases")
        .execute(&pool)
        .await
        .unwrap();
    PostgresLockManager::new(pool).with_poll_interval(Duration::from_millis(10))
}

const LEASE: Duration = Duration::from_secs(30);

#[tokio::test]
#[serial]
async fn held_key_times_out_then_frees_on_release() {
    let locks = get_lock_manager().await;
    let lease = locks.acquire("k", Duration::ZERO, LEASE).await.unwrap();

    let err = locks
        .acquire("k", Duration::from_millis(100), LEASE)
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinationError::LockTimeout { .. }));

    assert!(locks.release(&lease).await.unwrap());
    assert!(!locks.release(&lease).await.unwrap());
    locks.acquire("k", Duration::ZERO, LEASE).await.unwrap();
}

#[tokio::test]
#[serial]
async fn expired_lease_is_taken_over() {
    let locks = get_lock_manager().await;
    let stale = locks
        .acquire("k", Duration::ZERO, Duration::from_millis(50))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let fresh = locks.acquire("k", Duration::ZERO, LEASE).await.unwrap();
    assert_ne!(fresh.holder, stale.holder);
    assert!(!locks.release(&stale).await.unwrap());
    assert!(locks.release(&fresh).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn with_lock_serializes_workers() {
    let manager: Arc<dyn LockManager> = Arc::new(get_lock_manager().await);
    let inside = Arc::new(AtomicU32::new(0));
    let max_inside = Arc::new(AtomicU32::new(0));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let manager = Arc::clone(&manager);
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            tokio::spawn(async move {
                with_lock(&manager, "shared", Duration::from_secs(10), LEASE, move || async move {
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, CoordinationError>(())
                })
                .await
            })
        })
        .collect();

    for task in futures_util::future::join_all(tasks).await {
        task.unwrap().unwrap();
    }
    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
}
