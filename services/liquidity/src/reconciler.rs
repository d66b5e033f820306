//! Mirror order reconciliation
//!
//! Turns a [`MirrorDiff`](crate::compare::MirrorDiff) into order
//! placements and cancellations through an [`OrderGateway`]. One order
//! per (side, price) level; a size change is a cancel followed by a
//! fresh placement. A per-product cache remembers which order backs
//! each level, with the gateway's open-order index as the fallback when
//! the cache is cold or stale. Gateway failures are logged and the
//! level is retried on the next cycle, never propagated.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use types::ids::{OrderId, ProductId, UserId};
use types::order::Side;

use crate::compare::MirrorDiff;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("order not found")]
    NotFound,

    #[error("gateway unavailable: {0}")]
    Unavailable(String),
}

/// A new synthetic limit order for one mirrored level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorOrderRequest {
    pub product_id: ProductId,
    pub user_id: UserId,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    /// Marks the order as mirror-owned so downstream accounting can
    /// tell it apart from customer flow.
    pub synthetic: bool,
}

/// An open order as the gateway reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorOrder {
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
}

/// The trading core's order entry surface, as the mirror needs it.
///
/// `find_open_order` and `open_orders_excluding` must only report
/// orders owned by the mirror's bot identity.
pub trait OrderGateway: Send + Sync {
    fn place_order(&self, request: MirrorOrderRequest) -> Result<MirrorOrder, GatewayError>;

    fn cancel_order(&self, order_id: OrderId) -> Result<(), GatewayError>;

    fn get_order(&self, order_id: OrderId) -> Result<Option<MirrorOrder>, GatewayError>;

    fn find_open_order(
        &self,
        product_id: &ProductId,
        side: Side,
        price: Decimal,
    ) -> Result<Option<MirrorOrder>, GatewayError>;

    fn open_orders_excluding(
        &self,
        product_id: &ProductId,
        side: Side,
        keep_prices: &BTreeSet<Decimal>,
    ) -> Result<Vec<MirrorOrder>, GatewayError>;
}

#[derive(Default)]
struct MirrorState {
    /// (side, price) → order backing that level
    orders: HashMap<(Side, Decimal), OrderId>,
}

/// Drives the local synthetic book toward the external target.
pub struct LiquidityMirrorReconciler {
    gateway: Arc<dyn OrderGateway>,
    bot_user_id: UserId,
    states: DashMap<ProductId, Arc<Mutex<MirrorState>>>,
    orders_placed: AtomicU64,
    orders_cancelled: AtomicU64,
    gateway_failures: AtomicU64,
}

impl LiquidityMirrorReconciler {
    pub fn new(gateway: Arc<dyn OrderGateway>, bot_user_id: UserId) -> Self {
        Self {
            gateway,
            bot_user_id,
            states: DashMap::new(),
            orders_placed: AtomicU64::new(0),
            orders_cancelled: AtomicU64::new(0),
            gateway_failures: AtomicU64::new(0),
        }
    }

    pub fn orders_placed(&self) -> u64 {
        self.orders_placed.load(Ordering::Relaxed)
    }

    pub fn orders_cancelled(&self) -> u64 {
        self.orders_cancelled.load(Ordering::Relaxed)
    }

    pub fn gateway_failures(&self) -> u64 {
        self.gateway_failures.load(Ordering::Relaxed)
    }

    /// Apply one cycle's diff for a product: upsert every add target,
    /// then cancel every removed level.
    pub fn reconcile(&self, product_id: &ProductId, diff: &MirrorDiff) {
        let state = self.state_for(product_id);
        let mut state = lock(&state);

        self.upsert_side(&mut state, product_id, Side::BUY, &diff.bids_to_add);
        self.upsert_side(&mut state, product_id, Side::SELL, &diff.asks_to_add);
        self.remove_side(&mut state, product_id, Side::BUY, &diff.bids_to_remove);
        self.remove_side(&mut state, product_id, Side::SELL, &diff.asks_to_remove);
    }

    /// Cancel every mirror order outside the keep sets. Catches drift
    /// the level cache never saw, such as orders left over from a
    /// previous process.
    pub fn sweep(
        &self,
        product_id: &ProductId,
        keep_bids: &BTreeSet<Decimal>,
        keep_asks: &BTreeSet<Decimal>,
    ) {
        let state = self.state_for(product_id);
        let mut state = lock(&state);
        self.sweep_side(&mut state, product_id, Side::BUY, keep_bids);
        self.sweep_side(&mut state, product_id, Side::SELL, keep_asks);
    }

    /// Cancel everything the mirror owns on one product.
    pub fn cleanup(&self, product_id: &ProductId) {
        info!(product = %product_id, "cancelling all mirror orders");
        self.sweep(product_id, &BTreeSet::new(), &BTreeSet::new());
        self.states.remove(product_id);
    }

    /// Cancel everything the mirror owns, used on shutdown.
    pub fn cleanup_all(&self, products: &[ProductId]) {
        for product_id in products {
            self.cleanup(product_id);
        }
    }

    fn state_for(&self, product_id: &ProductId) -> Arc<Mutex<MirrorState>> {
        self.states
            .entry(product_id.clone())
            .or_default()
            .clone()
    }

    fn upsert_side(
        &self,
        state: &mut MirrorState,
        product_id: &ProductId,
        side: Side,
        targets: &BTreeMap<Decimal, Decimal>,
    ) {
        for (&price, &size) in targets {
            self.upsert_level(state, product_id, side, price, size);
        }
    }

    /// Bring one (side, price) level to the target size. The cached
    /// order is verified against the gateway before it is trusted; a
    /// cold cache falls back to the gateway's open-order lookup so a
    /// restart does not double-place.
    fn upsert_level(
        &self,
        state: &mut MirrorState,
        product_id: &ProductId,
        side: Side,
        price: Decimal,
        size: Decimal,
    ) {
        let key = (side, price);

        if let Some(&order_id) = state.orders.get(&key) {
            match self.gateway.get_order(order_id) {
                Ok(Some(existing)) if existing.size == size => return,
                Ok(Some(_)) => {
                    if !self.cancel(order_id, product_id, side, price) {
                        return;
                    }
                    state.orders.remove(&key);
                }
                Ok(None) => {
                    debug!(product = %product_id, %side, %price, "cached order gone, re-resolving");
                    state.orders.remove(&key);
                }
                Err(error) => {
                    self.gateway_failures.fetch_add(1, Ordering::Relaxed);
                    error!(%error, product = %product_id, %side, %price, "order lookup failed");
                    return;
                }
            }
        }

        if state.orders.get(&key).is_none() {
            match self.gateway.find_open_order(product_id, side, price) {
                Ok(Some(existing)) => {
                    if existing.size == size {
                        state.orders.insert(key, existing.order_id);
                        return;
                    }
                    if !self.cancel(existing.order_id, product_id, side, price) {
                        return;
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    self.gateway_failures.fetch_add(1, Ordering::Relaxed);
                    error!(%error, product = %product_id, %side, %price, "open order lookup failed");
                    return;
                }
            }
        }

        let request = MirrorOrderRequest {
            product_id: product_id.clone(),
            user_id: self.bot_user_id,
            side,
            price,
            size,
            synthetic: true,
        };
        match self.gateway.place_order(request) {
            Ok(order) => {
                self.orders_placed.fetch_add(1, Ordering::Relaxed);
                debug!(product = %product_id, %side, %price, %size, order = %order.order_id, "mirror order placed");
                state.orders.insert(key, order.order_id);
            }
            Err(error) => {
                self.gateway_failures.fetch_add(1, Ordering::Relaxed);
                error!(%error, product = %product_id, %side, %price, "mirror placement failed");
            }
        }
    }

    fn remove_side(
        &self,
        state: &mut MirrorState,
        product_id: &ProductId,
        side: Side,
        prices: &BTreeSet<Decimal>,
    ) {
        for &price in prices {
            let key = (side, price);
            let order_id = match state.orders.get(&key) {
                Some(&order_id) => Some(order_id),
                None => match self.gateway.find_open_order(product_id, side, price) {
                    Ok(found) => found.map(|o| o.order_id),
                    Err(error) => {
                        self.gateway_failures.fetch_add(1, Ordering::Relaxed);
                        error!(%error, product = %product_id, %side, %price, "open order lookup failed");
                        continue;
                    }
                },
            };
            let Some(order_id) = order_id else { continue };
            if self.cancel(order_id, product_id, side, price) {
                state.orders.remove(&key);
            }
        }
    }

    fn sweep_side(
        &self,
        state: &mut MirrorState,
        product_id: &ProductId,
        side: Side,
        keep_prices: &BTreeSet<Decimal>,
    ) {
        let stray = match self
            .gateway
            .open_orders_excluding(product_id, side, keep_prices)
        {
            Ok(orders) => orders,
            Err(error) => {
                self.gateway_failures.fetch_add(1, Ordering::Relaxed);
                error!(%error, product = %product_id, %side, "stray order sweep failed");
                return;
            }
        };
        for order in stray {
            if self.cancel(order.order_id, product_id, side, order.price) {
                state.orders.remove(&(side, order.price));
            }
        }
    }

    fn cancel(&self, order_id: OrderId, product_id: &ProductId, side: Side, price: Decimal) -> bool {
        match self.gateway.cancel_order(order_id) {
            Ok(()) => {
                self.orders_cancelled.fetch_add(1, Ordering::Relaxed);
                debug!(product = %product_id, %side, %price, order = %order_id, "mirror order cancelled");
                true
            }
            // Already gone counts as cancelled.
            Err(GatewayError::NotFound) => true,
            Err(error) => {
                self.gateway_failures.fetch_add(1, Ordering::Relaxed);
                warn!(%error, product = %product_id, %side, %price, "mirror cancel failed");
                false
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::{mirror_diff, BookLevels};
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Place(Side, Decimal, Decimal),
        Cancel(OrderId),
    }

    #[derive(Default)]
    struct FakeGateway {
        open: Mutex<HashMap<OrderId, MirrorOrder>>,
        calls: Mutex<Vec<Call>>,
        fail_placements: Mutex<bool>,
    }

    impl FakeGateway {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn open_count(&self) -> usize {
            self.open.lock().unwrap().len()
        }

        fn seed(&self, side: Side, price: &str, size: &str) -> OrderId {
            let order_id = OrderId::new();
            self.open.lock().unwrap().insert(
                order_id,
                MirrorOrder {
                    order_id,
                    product_id: ProductId::new("BTC-USDT"),
                    side,
                    price: d(price),
                    size: d(size),
                },
            );
            order_id
        }
    }

    impl OrderGateway for FakeGateway {
        fn place_order(&self, request: MirrorOrderRequest) -> Result<MirrorOrder, GatewayError> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Place(request.side, request.price, request.size));
            if *self.fail_placements.lock().unwrap() {
                return Err(GatewayError::Rejected("insufficient funds".into()));
            }
            assert!(request.synthetic, "mirror orders must carry the bot marker");
            let order = MirrorOrder {
                order_id: OrderId::new(),
                product_id: request.product_id,
                side: request.side,
                price: request.price,
                size: request.size,
            };
            self.open.lock().unwrap().insert(order.order_id, order.clone());
            Ok(order)
        }

        fn cancel_order(&self, order_id: OrderId) -> Result<(), GatewayError> {
            self.calls.lock().unwrap().push(Call::Cancel(order_id));
            match self.open.lock().unwrap().remove(&order_id) {
                Some(_) => Ok(()),
                None => Err(GatewayError::NotFound),
            }
        }

        fn get_order(&self, order_id: OrderId) -> Result<Option<MirrorOrder>, GatewayError> {
            Ok(self.open.lock().unwrap().get(&order_id).cloned())
        }

        fn find_open_order(
            &self,
            _product_id: &ProductId,
            side: Side,
            price: Decimal,
        ) -> Result<Option<MirrorOrder>, GatewayError> {
            Ok(self
                .open
                .lock()
                .unwrap()
                .values()
                .find(|o| o.side == side && o.price == price)
                .cloned())
        }

        fn open_orders_excluding(
            &self,
            _product_id: &ProductId,
            side: Side,
            keep_prices: &BTreeSet<Decimal>,
        ) -> Result<Vec<MirrorOrder>, GatewayError> {
            Ok(self
                .open
                .lock()
                .unwrap()
                .values()
                .filter(|o| o.side == side && !keep_prices.contains(&o.price))
                .cloned()
                .collect())
        }
    }

    fn setup() -> (Arc<FakeGateway>, LiquidityMirrorReconciler, ProductId) {
        let gateway = Arc::new(FakeGateway::default());
        let reconciler = LiquidityMirrorReconciler::new(gateway.clone(), UserId::new());
        (gateway, reconciler, ProductId::new("BTC-USDT"))
    }

    fn levels(pairs: &[(&str, &str)]) -> BTreeMap<Decimal, Decimal> {
        pairs.iter().map(|(p, s)| (d(p), d(s))).collect()
    }

    #[test]
    fn test_empty_local_places_every_level() {
        let (gateway, reconciler, product) = setup();
        let external = BookLevels {
            bids: levels(&[("100", "2"), ("99", "1")]),
            asks: levels(&[("101", "3")]),
        };
        let diff = mirror_diff(&BookLevels::default(), &external);

        reconciler.reconcile(&product, &diff);

        assert_eq!(reconciler.orders_placed(), 3);
        assert_eq!(gateway.open_count(), 3);
        assert!(gateway
            .calls()
            .contains(&Call::Place(Side::SELL, d("101"), d("3"))));
    }

    #[test]
    fn test_matching_size_is_a_noop() {
        let (gateway, reconciler, product) = setup();
        let external = BookLevels {
            bids: levels(&[("100", "2")]),
            asks: BTreeMap::new(),
        };
        let diff = mirror_diff(&BookLevels::default(), &external);
        reconciler.reconcile(&product, &diff);
        let placed_calls = gateway.calls().len();

        // Same diff again: cached order matches, nothing happens.
        reconciler.reconcile(&product, &diff);
        assert_eq!(gateway.calls().len(), placed_calls);
        assert_eq!(reconciler.orders_placed(), 1);
    }

    #[test]
    fn test_size_change_cancels_then_replaces() {
        let (gateway, reconciler, product) = setup();
        let before = BookLevels {
            bids: levels(&[("100", "2"), ("101", "1")]),
            asks: BTreeMap::new(),
        };
        reconciler.reconcile(&product, &mirror_diff(&BookLevels::default(), &before));

        // 100 disappears, 99 resizes in from nothing, 101 unchanged.
        let after = BookLevels {
            bids: levels(&[("99", "5"), ("101", "1")]),
            asks: BTreeMap::new(),
        };
        let diff = mirror_diff(&before, &after);
        reconciler.reconcile(&product, &diff);

        assert_eq!(gateway.open_count(), 2);
        assert_eq!(reconciler.orders_placed(), 3);
        assert_eq!(reconciler.orders_cancelled(), 1);
        // The untouched 101 level saw no new gateway traffic.
        let replacements: Vec<_> = gateway
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Place(_, p, _) if *p == d("101")))
            .collect();
        assert_eq!(replacements.len(), 1);
    }

    #[test]
    fn test_cold_cache_adopts_existing_order() {
        let (gateway, reconciler, product) = setup();
        gateway.seed(Side::BUY, "100", "2");

        let external = BookLevels {
            bids: levels(&[("100", "2")]),
            asks: BTreeMap::new(),
        };
        let diff = mirror_diff(&BookLevels::default(), &external);
        reconciler.reconcile(&product, &diff);

        assert_eq!(reconciler.orders_placed(), 0, "existing order is adopted");
        assert_eq!(gateway.open_count(), 1);
    }

    #[test]
    fn test_placement_failure_is_swallowed_and_counted() {
        let (gateway, reconciler, product) = setup();
        *gateway.fail_placements.lock().unwrap() = true;

        let external = BookLevels {
            bids: levels(&[("100", "2")]),
            asks: BTreeMap::new(),
        };
        reconciler.reconcile(&product, &mirror_diff(&BookLevels::default(), &external));

        assert_eq!(reconciler.orders_placed(), 0);
        assert_eq!(reconciler.gateway_failures(), 1);
    }

    #[test]
    fn test_sweep_cancels_strays_only() {
        let (gateway, reconciler, product) = setup();
        gateway.seed(Side::BUY, "100", "2");
        let stray = gateway.seed(Side::BUY, "50", "9");

        reconciler.sweep(&product, &[d("100")].into(), &BTreeSet::new());

        assert_eq!(gateway.calls(), vec![Call::Cancel(stray)]);
        assert_eq!(gateway.open_count(), 1);
    }

    #[test]
    fn test_cleanup_cancels_everything() {
        let (gateway, reconciler, product) = setup();
        gateway.seed(Side::BUY, "100", "2");
        gateway.seed(Side::SELL, "101", "1");

        reconciler.cleanup(&product);

        assert_eq!(gateway.open_count(), 0);
        assert_eq!(reconciler.orders_cancelled(), 2);
    }
}
