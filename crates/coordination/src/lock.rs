//! Named mutual-exclusion leases.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{CoordinationError, Result};

/// Lock keys shared by every process.
pub mod keys {
    use common::{CouponId, UserId};

    /// Serializes sweeps of the retry store.
    pub const RETRY_SWEEP: &str = "lock:retry-sweep";

    /// Serializes every balance-affecting operation of one user.
    pub fn balance(user_id: UserId) -> String {
        format!("lock:balance:user:{user_id}")
    }

    /// Serializes the slow issuance path of one coupon.
    pub fn coupon_issue(coupon_id: CouponId) -> String {
        format!("lock:coupon:issue:{coupon_id}")
    }
}

/// A granted lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    /// Identifies this grant; only the holder can release it.
    pub holder: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// Acquires and releases named leases.
///
/// A lease expires on its own after its lifetime, so a crashed holder blocks
/// others for at most one lease lifetime.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Waits up to `wait` for `key`. A zero wait tries exactly once.
    async fn acquire(&self, key: &str, wait: Duration, lease: Duration) -> Result<Lease>;

    /// Returns false if the lease had already been taken over by someone else.
    async fn release(&self, lease: &Lease) -> Result<bool>;
}

/// Holds a lease and gives it back.
///
/// Call [`LeaseGuard::release`] once the protected work has committed. If the
/// guard is dropped instead (early return, panic, cancelled future), the
/// release is spawned onto the current runtime.
pub struct LeaseGuard {
    manager: Arc<dyn LockManager>,
    lease: Option<Lease>,
}

impl LeaseGuard {
    pub async fn acquire(
        manager: Arc<dyn LockManager>,
        key: &str,
        wait: Duration,
        lease: Duration,
    ) -> Result<Self> {
        let started = Instant::now();
        let result = manager.acquire(key, wait, lease).await;
        metrics::histogram!("lock_wait_seconds").record(started.elapsed().as_secs_f64());
        match result {
            Ok(lease) => Ok(Self {
                manager,
                lease: Some(lease),
            }),
            Err(err) => {
                if matches!(err, CoordinationError::LockTimeout { .. }) {
                    metrics::counter!("lock_acquire_timeouts_total").increment(1);
                }
                Err(err)
            }
        }
    }

    pub fn key(&self) -> &str {
        self.lease.as_ref().map(|l| l.key.as_str()).unwrap_or_default()
    }

    pub async fn release(mut self) {
        if let Some(lease) = self.lease.take() {
            release_logged(self.manager.as_ref(), &lease).await;
        }
    }
}

async fn release_logged(manager: &dyn LockManager, lease: &Lease) {
    match manager.release(lease).await {
        Ok(true) => tracing::debug!(key = %lease.key, "lease released"),
        Ok(false) => tracing::warn!(key = %lease.key, "lease expired before release"),
        Err(err) => tracing::warn!(key = %lease.key, error = %err, "lease release failed"),
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let manager = Arc::clone(&self.manager);
                handle.spawn(async move { release_logged(manager.as_ref(), &lease).await });
            }
            Err(_) => {
                tracing::warn!(key = %lease.key, "no runtime to release lease; it will expire");
            }
        }
    }
}

/// Runs `work` while holding `key`, releasing the lease afterwards whatever
/// the outcome.
pub async fn with_lock<T, E, F, Fut>(
    manager: &Arc<dyn LockManager>,
    key: &str,
    wait: Duration,
    lease: Duration,
    work: F,
) -> std::result::Result<T, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: From<CoordinationError>,
{
    let guard = LeaseGuard::acquire(Arc::clone(manager), key, wait, lease).await?;
    let result = work().await;
    guard.release().await;
    result
}

struct Held {
    holder: Uuid,
    expires: Instant,
}

#[derive(Default)]
struct LockTable {
    held: Mutex<HashMap<String, Held>>,
    released: Notify,
}

/// Single-process lease table with expiry.
#[derive(Clone, Default)]
pub struct InMemoryLockManager {
    table: Arc<LockTable>,
}

impl InMemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    async fn held(&self) -> MutexGuard<'_, HashMap<String, Held>> {
        self.table.held.lock().await
    }

    /// Whether `key` is held by an unexpired lease.
    pub async fn is_held(&self, key: &str) -> bool {
        self.held()
            .await
            .get(key)
            .is_some_and(|h| h.expires > Instant::now())
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn acquire(&self, key: &str, wait: Duration, lease: Duration) -> Result<Lease> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.table.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let holder_expires = {
                let mut held = self.held().await;
                let now = Instant::now();
                match held.get(key) {
                    Some(current) if current.expires > now => current.expires,
                    _ => {
                        let holder = Uuid::new_v4();
                        held.insert(
                            key.to_string(),
                            Held {
                                holder,
                                expires: now + lease,
                            },
                        );
                        let lifetime = chrono::Duration::from_std(lease)
                            .unwrap_or(chrono::Duration::zero());
                        return Ok(Lease {
                            key: key.to_string(),
                            holder,
                            expires_at: Utc::now() + lifetime,
                        });
                    }
                }
            };

            if Instant::now() >= deadline {
                return Err(CoordinationError::LockTimeout {
                    key: key.to_string(),
                    waited: wait,
                });
            }
            let wake_at = deadline.min(holder_expires);
            let _ = tokio::time::timeout_at(wake_at, notified).await;
        }
    }

    async fn release(&self, lease: &Lease) -> Result<bool> {
        let released = {
            let mut held = self.held().await;
            match held.get(&lease.key) {
                Some(current) if current.holder == lease.holder => {
                    held.remove(&lease.key);
                    true
                }
                _ => false,
            }
        };
        if released {
            self.table.released.notify_waiters();
        }
        Ok(released)
    }
}
