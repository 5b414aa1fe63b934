//! Wiring of the saga: backends in, running services out.

use std::sync::Arc;

use coordination::{InMemoryLockManager, InMemoryQuantityAllocator, LockManager, QuantityAllocator};
use event_store::{InMemoryRetryEventStore, RetryEventStore};
use storage::{InMemorySequenceGenerator, InMemoryStore, SequenceGenerator, UnitOfWork};

use crate::balance::BalanceService;
use crate::bus::{BusSettings, InMemoryBus};
use crate::compensation::Compensator;
use crate::coupon::{CouponIssueService, CouponMaterializer};
use crate::error::Result;
use crate::messages::channels;
use crate::orchestrator::OrderOrchestrator;
use crate::retry::{FailureRecorder, RetryScheduler};
use crate::services::{InMemoryPopularityCounter, PopularityCounter};
use crate::settings::SagaSettings;
use crate::stages::{BalanceDeductionHandler, CompletionHandler, StockReservationHandler};

/// Storage and coordination the saga runs on.
#[derive(Clone)]
pub struct Backends {
    pub uow: Arc<dyn UnitOfWork>,
    pub sequences: Arc<dyn SequenceGenerator>,
    pub locks: Arc<dyn LockManager>,
    pub allocator: Arc<dyn QuantityAllocator>,
    pub retry_store: Arc<dyn RetryEventStore>,
    pub popularity: Arc<dyn PopularityCounter>,
}

impl Backends {
    /// Single-process backends around `store`.
    pub fn in_memory(store: &InMemoryStore) -> Self {
        Self {
            uow: Arc::new(store.clone()),
            sequences: Arc::new(InMemorySequenceGenerator::new()),
            locks: Arc::new(InMemoryLockManager::new()),
            allocator: Arc::new(InMemoryQuantityAllocator::new()),
            retry_store: Arc::new(InMemoryRetryEventStore::new()),
            popularity: Arc::new(InMemoryPopularityCounter::new()),
        }
    }
}

/// The running saga: entry-point services plus the bus the stages listen on.
#[derive(Clone)]
pub struct Saga {
    pub bus: InMemoryBus,
    pub orders: Arc<OrderOrchestrator>,
    pub balances: Arc<BalanceService>,
    pub coupons: Arc<CouponIssueService>,
    pub retries: Arc<RetryScheduler>,
    pub popularity: Arc<dyn PopularityCounter>,
}

impl Saga {
    /// Builds the services and subscribes the stage handlers.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(backends: Backends, settings: SagaSettings, bus_settings: BusSettings) -> Result<Self> {
        let Backends {
            uow,
            sequences,
            locks,
            allocator,
            retry_store,
            popularity,
        } = backends;
        let bus = InMemoryBus::new(bus_settings);
        let recorder = FailureRecorder::new(Arc::clone(&retry_store));
        let compensator = Compensator::new(Arc::clone(&uow), settings.stock_retry);

        let stock = Arc::new(StockReservationHandler::new(
            Arc::clone(&uow),
            bus.clone(),
            compensator.clone(),
            recorder.clone(),
            settings.stock_retry,
        ));
        let balance = Arc::new(BalanceDeductionHandler::new(
            Arc::clone(&uow),
            Arc::clone(&locks),
            bus.clone(),
            compensator.clone(),
            recorder.clone(),
            settings.clone(),
        ));
        let completion = Arc::new(CompletionHandler::new(
            Arc::clone(&uow),
            Arc::clone(&popularity),
            recorder,
            settings.materialization_retry,
        ));
        let materializer = Arc::new(CouponMaterializer::new(
            Arc::clone(&uow),
            settings.materialization_retry,
        ));

        bus.subscribe(channels::ORDER_CREATED, "stock-reservation", stock)?;
        bus.subscribe(channels::STOCK_RESERVED, "balance-deduction", balance)?;
        bus.subscribe(channels::ORDER_COMPLETED, "order-completion", completion.clone())?;
        bus.subscribe(channels::COUPON_ISSUED, "coupon-materializer", materializer)?;

        let orders = Arc::new(OrderOrchestrator::new(
            Arc::clone(&uow),
            sequences,
            Arc::clone(&locks),
            bus.clone(),
            settings.clone(),
        ));
        let balances = Arc::new(BalanceService::new(
            Arc::clone(&uow),
            Arc::clone(&locks),
            settings.clone(),
        ));
        let coupons = Arc::new(CouponIssueService::new(
            Arc::clone(&uow),
            allocator,
            Arc::clone(&locks),
            bus.clone(),
            settings.clone(),
        ));
        let retries = Arc::new(RetryScheduler::new(
            retry_store,
            locks,
            compensator,
            completion,
            settings,
        ));

        tracing::info!("saga pipeline started");
        Ok(Self {
            bus,
            orders,
            balances,
            coupons,
            retries,
            popularity,
        })
    }

    /// Waits until every published message was handled.
    pub async fn wait_until_idle(&self) {
        self.bus.wait_until_idle().await;
    }

    pub async fn shutdown(&self) {
        self.bus.wait_until_idle().await;
        self.bus.shutdown().await;
        tracing::info!("saga pipeline stopped");
    }
}
