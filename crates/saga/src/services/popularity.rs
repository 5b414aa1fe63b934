//! Sales counters used to rank popular products.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use common::{OrderId, ProductId};
use tokio::sync::RwLock;

use crate::error::{Result, SagaError};

/// Per-product sales counter.
///
/// Counting is keyed by order, so a redelivered completion event or a
/// retried aggregation never counts an order twice.
#[async_trait]
pub trait PopularityCounter: Send + Sync {
    /// Adds the order's quantities. Returns `false` when the order was
    /// already counted.
    async fn record_sale(&self, order_id: OrderId, items: &[(ProductId, u32)]) -> Result<bool>;

    async fn sold(&self, product_id: ProductId) -> Result<u64>;

    /// Best sellers, highest count first; ties go to the lower product id.
    async fn top(&self, limit: usize) -> Result<Vec<(ProductId, u64)>>;
}

#[derive(Debug, Default)]
struct PopularityState {
    counted: HashSet<OrderId>,
    sold: HashMap<ProductId, u64>,
}

/// In-memory counter with a failure switch for tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPopularityCounter {
    state: Arc<RwLock<PopularityState>>,
    fail_on_record: Arc<AtomicBool>,
}

impl InMemoryPopularityCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every `record_sale` fail until switched off.
    pub fn set_fail_on_record(&self, fail: bool) {
        self.fail_on_record.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PopularityCounter for InMemoryPopularityCounter {
    async fn record_sale(&self, order_id: OrderId, items: &[(ProductId, u32)]) -> Result<bool> {
        if self.fail_on_record.load(Ordering::SeqCst) {
            return Err(SagaError::Unavailable("popularity counter".into()));
        }
        let mut state = self.state.write().await;
        if !state.counted.insert(order_id) {
            return Ok(false);
        }
        for (product_id, quantity) in items {
            *state.sold.entry(*product_id).or_default() += u64::from(*quantity);
        }
        Ok(true)
    }

    async fn sold(&self, product_id: ProductId) -> Result<u64> {
        let sold = self.state.read().await.sold.get(&product_id).copied();
        Ok(sold.unwrap_or_default())
    }

    async fn top(&self, limit: usize) -> Result<Vec<(ProductId, u64)>> {
        let mut ranked: Vec<_> = self
            .state
            .read()
            .await
            .sold
            .iter()
            .map(|(p, n)| (*p, *n))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.truncate(limit);
        Ok(ranked)
    }
}
