//! Mirror sync orchestration
//!
//! Owns the periodic tasks of the mirroring subsystem:
//!   1. sync cycle — diff every mapped product's local book against the
//!      external book and hand the reconcile work to the executor,
//!      keyed by product so cycles for one product never interleave;
//!   2. catalogue refresh — rebuild the product→symbol mapping and let
//!      the client reconnect when it changed;
//!   3. health check — revive the external stream when it is down.
//!
//! Shutdown stops the tasks, disconnects the stream and cancels every
//! synthetic order the mirror owns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use types::book::OrderBookSnapshot;
use types::ids::ProductId;

use executor::AdaptiveBatchExecutor;

use crate::client::ExternalMarketDataClient;
use crate::compare::{mirror_diff, BookLevels};
use crate::config::MirrorConfig;
use crate::mapper::{build_mapping, ProductCatalog};
use crate::reconciler::LiquidityMirrorReconciler;

/// Read access to the local synthetic book, provided by the trading
/// core. Only mirror-owned resting orders should be visible here.
pub trait LocalBookSource: Send + Sync {
    fn book(&self, product_id: &ProductId) -> Option<OrderBookSnapshot>;
}

pub struct MirrorSyncService {
    config: MirrorConfig,
    client: ExternalMarketDataClient,
    reconciler: Arc<LiquidityMirrorReconciler>,
    catalog: Arc<dyn ProductCatalog>,
    local_books: Arc<dyn LocalBookSource>,
    executor: AdaptiveBatchExecutor,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MirrorSyncService {
    pub fn new(
        config: MirrorConfig,
        client: ExternalMarketDataClient,
        reconciler: Arc<LiquidityMirrorReconciler>,
        catalog: Arc<dyn ProductCatalog>,
        local_books: Arc<dyn LocalBookSource>,
        executor: AdaptiveBatchExecutor,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            client,
            reconciler,
            catalog,
            local_books,
            executor,
            running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Connect the stream and start the periodic tasks. A no-op when
    /// mirroring is disabled or already running.
    pub fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            info!("liquidity mirroring disabled");
            return;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        self.client.set_mapping(build_mapping(self.catalog.as_ref()));
        self.client.connect();

        let mut tasks = lock_tasks(&self.tasks);
        tasks.push(tokio::spawn(sync_loop(self.clone())));
        tasks.push(tokio::spawn(refresh_loop(self.clone())));
        tasks.push(tokio::spawn(health_loop(self.clone())));
        info!(
            sync = ?self.config.sync_interval,
            refresh = ?self.config.product_refresh_interval,
            "liquidity mirroring started"
        );
    }

    /// Stop the tasks, drop the stream and pull every mirror order.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for task in lock_tasks(&self.tasks).drain(..) {
            task.abort();
        }
        self.client.disconnect();
        self.reconciler.cleanup_all(&self.client.mapped_products());
        info!("liquidity mirroring stopped");
    }

    /// One pass over every mapped product. Exposed for tests; the sync
    /// task calls this on the configured interval.
    pub async fn sync_cycle(&self) {
        for product_id in self.client.mapped_products() {
            let Some(external) = self.client.book_for(&product_id) else {
                debug!(product = %product_id, "no external depth yet, skipping");
                continue;
            };

            let local = self
                .local_books
                .book(&product_id)
                .as_ref()
                .map(BookLevels::from_snapshot)
                .unwrap_or_default();

            let diff = mirror_diff(&local, &external);
            if !diff.has_changes() && local.is_empty() {
                continue;
            }
            let keep_bids = diff.keep_bids(&local);
            let keep_asks = diff.keep_asks(&local);

            let reconciler = self.reconciler.clone();
            let product = product_id.clone();
            let submitted = self.executor.submit(product_id.as_str(), move || {
                reconciler.reconcile(&product, &diff);
                reconciler.sweep(&product, &keep_bids, &keep_asks);
                Ok(())
            });
            if let Err(error) = submitted {
                warn!(%error, product = %product_id, "sync work rejected");
            }
        }
    }
}

fn lock_tasks(tasks: &Mutex<Vec<JoinHandle<()>>>) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
    match tasks.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn sync_loop(service: Arc<MirrorSyncService>) {
    let mut ticker = tokio::time::interval(service.config.sync_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        service.sync_cycle().await;
    }
}

async fn refresh_loop(service: Arc<MirrorSyncService>) {
    let mut ticker = tokio::time::interval(service.config.product_refresh_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        // set_mapping reconnects by itself when the set changed.
        service
            .client
            .set_mapping(build_mapping(service.catalog.as_ref()));
    }
}

async fn health_loop(service: Arc<MirrorSyncService>) {
    let mut ticker = tokio::time::interval(service.config.health_check_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if !service.client.is_connected() {
            warn!("external stream down, reviving");
            service.client.connect();
        }
    }
}
