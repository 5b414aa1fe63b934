use std::time::Duration;

use coordination::RetryPolicy;

/// Timeouts, retry budgets and batch sizes of the saga.
#[derive(Debug, Clone)]
pub struct SagaSettings {
    /// Wait for the owner's balance lease.
    pub owner_lock_wait: Duration,
    /// Lifetime of the owner's balance lease.
    pub owner_lock_lease: Duration,
    pub order_creation_retry: RetryPolicy,
    pub stock_retry: RetryPolicy,
    pub balance_retry: RetryPolicy,
    pub materialization_retry: RetryPolicy,
    /// Lifetime of the sweep lease; the sweep never waits for it.
    pub retry_sweep_lease: Duration,
    pub retry_batch_size: usize,
    pub coupon_lock_wait: Duration,
    pub coupon_lock_lease: Duration,
}

impl Default for SagaSettings {
    fn default() -> Self {
        Self {
            owner_lock_wait: Duration::from_secs(10),
            owner_lock_lease: Duration::from_secs(30),
            order_creation_retry: RetryPolicy::order_creation(),
            stock_retry: RetryPolicy::stock_reservation(),
            balance_retry: RetryPolicy::balance_deduction(),
            materialization_retry: RetryPolicy::materialization(),
            retry_sweep_lease: Duration::from_secs(60),
            retry_batch_size: 100,
            coupon_lock_wait: Duration::from_secs(3),
            coupon_lock_lease: Duration::from_secs(10),
        }
    }
}
