//! Feed dispatcher
//!
//! Consumes upstream events and fans each one out to its client
//! channels: the legacy per-product/per-user channel and the normalized
//! frontend channel, published in parallel. Matching-engine book log
//! entries feed `{product}.full`, and trades additionally reach the
//! private `trade` channel. Delivery work runs on the keyed executor so
//! all messages for one user or product stay ordered while unrelated
//! keys proceed concurrently.
//!
//! Book snapshots additionally refresh the last-value stores consulted
//! on subscribe; books reach sessions through the lanes' diff path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use executor::{AdaptiveBatchExecutor, SubmitError};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::events::{UpstreamEvent, UpstreamPayload};
use crate::registry::ChannelRegistry;
use crate::snapshot::{SnapshotStore, TickerStore};

/// One channel-addressed publication derived from an upstream event.
enum Publication {
    Json {
        channel: String,
        payload: Arc<Value>,
    },
    Book {
        channel: String,
        book: Arc<types::book::OrderBookSnapshot>,
    },
}

pub struct FeedDispatcher {
    registry: Arc<ChannelRegistry>,
    executor: AdaptiveBatchExecutor,
    books: Arc<SnapshotStore>,
    tickers: Arc<TickerStore>,
    /// Events accepted for fan-out.
    events_dispatched: AtomicU64,
    /// Events dropped because the executor rejected them.
    events_dropped: AtomicU64,
}

impl FeedDispatcher {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        executor: AdaptiveBatchExecutor,
        books: Arc<SnapshotStore>,
        tickers: Arc<TickerStore>,
    ) -> Self {
        Self {
            registry,
            executor,
            books,
            tickers,
            events_dispatched: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
        }
    }

    /// Consume events until the upstream channel closes.
    pub async fn run(&self, mut events: mpsc::Receiver<UpstreamEvent>) {
        info!("feed dispatcher running");
        while let Some(event) = events.recv().await {
            self.dispatch(event);
        }
        info!(
            dispatched = self.events_dispatched.load(Ordering::Relaxed),
            dropped = self.events_dropped.load(Ordering::Relaxed),
            "feed dispatcher stopped"
        );
    }

    /// Map one event to its publications and hand them to the executor
    /// under the event's partition key. All publications of one event
    /// run in a single operation so legacy and frontend frames for the
    /// same event cannot reorder against each other.
    pub fn dispatch(&self, event: UpstreamEvent) {
        let key = event.partition_key();
        let label = event.event_type_label();
        let publications = self.publications_for(&event);
        if publications.is_empty() {
            return;
        }

        let registry = self.registry.clone();
        let submitted = self.executor.submit(&key, move || {
            for publication in publications {
                match publication {
                    Publication::Json { channel, payload } => {
                        registry.broadcast_json(&channel, payload);
                    }
                    Publication::Book { channel, book } => {
                        registry.broadcast_book(&channel, book);
                    }
                }
            }
            Ok(())
        });

        match submitted {
            Ok(_handle) => {
                self.events_dispatched.fetch_add(1, Ordering::Relaxed);
            }
            Err(SubmitError::QueueFull { .. }) => {
                self.events_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(key, event = label, "executor queue full, event dropped");
            }
            Err(SubmitError::ShutDown) => {
                self.events_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(key, event = label, "executor down, event dropped");
            }
        }
    }

    pub fn events_dispatched(&self) -> u64 {
        self.events_dispatched.load(Ordering::Relaxed)
    }

    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }

    fn publications_for(&self, event: &UpstreamEvent) -> Vec<Publication> {
        match &event.payload {
            UpstreamPayload::Order {
                order_id,
                user_id,
                product_id,
                side,
                price,
                size,
                filled_size,
                state,
            } => {
                let legacy = Arc::new(json!({
                    "type": "order",
                    "orderId": order_id.to_string(),
                    "productId": product_id.as_str(),
                    "side": side.wire_label(),
                    "price": price.map(|p| p.to_string()),
                    "size": size.to_string(),
                    "filledSize": filled_size.to_string(),
                    "status": state.label(),
                }));
                let frontend = Arc::new(json!({
                    "order_id": order_id.to_string(),
                    "market": product_id.as_str(),
                    "side": side.wire_label(),
                    "price": price.map(|p| p.to_string()),
                    "volume": size.to_string(),
                    "executed_volume": filled_size.to_string(),
                    "state": state.label(),
                }));
                vec![
                    Publication::Json {
                        channel: format!("{user_id}.{product_id}.order"),
                        payload: legacy,
                    },
                    Publication::Json {
                        channel: "order".to_string(),
                        payload: frontend,
                    },
                ]
            }

            UpstreamPayload::OrderLog {
                product_id,
                sequence,
                order_id,
                side,
                state,
                price,
                size,
                remaining_size,
            } => {
                let mut entry = json!({
                    "type": state.label(),
                    "productId": product_id.as_str(),
                    "sequence": sequence,
                    "orderId": order_id.to_string(),
                    "side": side.wire_label(),
                    "time": event.timestamp,
                });
                if let Some(price) = price {
                    entry["price"] = json!(price.to_string());
                }
                if let Some(size) = size {
                    entry["size"] = json!(size.to_string());
                }
                if let Some(remaining) = remaining_size {
                    entry["remainingSize"] = json!(remaining.to_string());
                }
                vec![Publication::Json {
                    channel: format!("{product_id}.full"),
                    payload: Arc::new(entry),
                }]
            }

            UpstreamPayload::Account {
                user_id,
                currency_id,
                available,
                hold,
            } => {
                let legacy = Arc::new(json!({
                    "type": "funds",
                    "currencyId": currency_id.as_str(),
                    "available": available.to_string(),
                    "hold": hold.to_string(),
                }));
                let frontend = Arc::new(json!({
                    "currency": currency_id.as_str(),
                    "balance": available.to_string(),
                    "locked": hold.to_string(),
                }));
                vec![
                    Publication::Json {
                        channel: format!("{user_id}.{currency_id}.funds"),
                        payload: legacy,
                    },
                    Publication::Json {
                        channel: "balances".to_string(),
                        payload: frontend,
                    },
                ]
            }

            UpstreamPayload::Trade {
                product_id,
                sequence,
                price,
                size,
                side,
            } => {
                let legacy = Arc::new(json!({
                    "type": "match",
                    "productId": product_id.as_str(),
                    "sequence": sequence,
                    "price": price.to_string(),
                    "size": size.to_string(),
                    "side": side.wire_label(),
                }));
                let frontend = Arc::new(json!({
                    "price": price.to_string(),
                    "amount": size.to_string(),
                    "taker_type": side.wire_label(),
                    "created_at": event.timestamp,
                }));
                let private = Arc::new(json!({
                    "id": sequence,
                    "market": product_id.as_str(),
                    "price": price.to_string(),
                    "amount": size.to_string(),
                    "total": (*price * *size).to_string(),
                    "taker_type": side.wire_label(),
                    "side": side.wire_label(),
                    "created_at": event.timestamp,
                }));
                vec![
                    Publication::Json {
                        channel: format!("{product_id}.match"),
                        payload: legacy,
                    },
                    Publication::Json {
                        channel: format!("{product_id}.trades"),
                        payload: frontend,
                    },
                    Publication::Json {
                        channel: "trade".to_string(),
                        payload: private,
                    },
                ]
            }

            UpstreamPayload::Ticker {
                product_id,
                sequence,
                last_price,
                open_24h,
                high_24h,
                low_24h,
                volume_24h,
            } => {
                let legacy = Arc::new(json!({
                    "type": "ticker",
                    "productId": product_id.as_str(),
                    "sequence": sequence,
                    "price": last_price.to_string(),
                    "open24h": open_24h.to_string(),
                    "high24h": high_24h.to_string(),
                    "low24h": low_24h.to_string(),
                    "volume24h": volume_24h.to_string(),
                }));
                let frontend = Arc::new(json!({
                    product_id.as_str(): {
                        "last": last_price.to_string(),
                        "open": open_24h.to_string(),
                        "high": high_24h.to_string(),
                        "low": low_24h.to_string(),
                        "volume": volume_24h.to_string(),
                    }
                }));
                self.tickers.update(product_id.clone(), legacy.clone());
                vec![
                    Publication::Json {
                        channel: format!("{product_id}.ticker"),
                        payload: legacy,
                    },
                    Publication::Json {
                        channel: "global.tickers".to_string(),
                        payload: frontend,
                    },
                ]
            }

            UpstreamPayload::Candle {
                product_id,
                granularity,
                start_time,
                open,
                high,
                low,
                close,
                volume,
            } => {
                let bucket = json!([
                    start_time,
                    open.to_string(),
                    high.to_string(),
                    low.to_string(),
                    close.to_string(),
                    volume.to_string(),
                ]);
                let legacy = Arc::new(json!({
                    "type": "candles",
                    "productId": product_id.as_str(),
                    "granularity": granularity,
                    "candle": bucket,
                }));
                let frontend = Arc::new(bucket);
                vec![
                    Publication::Json {
                        // Legacy clients address candle channels by
                        // bucket width in seconds.
                        channel: format!("{product_id}.candle_{}", granularity * 60),
                        payload: legacy,
                    },
                    Publication::Json {
                        channel: format!("{product_id}.kline-{granularity}m"),
                        payload: frontend,
                    },
                ]
            }

            UpstreamPayload::BookSnapshot { book } => {
                let book = Arc::new(book.clone());
                self.books.update(book.clone());
                vec![
                    Publication::Book {
                        channel: format!("{}.level2", book.product_id),
                        book: book.clone(),
                    },
                    Publication::Book {
                        channel: format!("{}.update", book.product_id),
                        book,
                    },
                ]
            }

            UpstreamPayload::BookIncrement {
                product_id,
                sequence,
                side,
                price,
                size,
            } => {
                let payload = Arc::new(json!({
                    "type": "l2update",
                    "productId": product_id.as_str(),
                    "sequence": sequence,
                    "changes": [[side.wire_label(), price.to_string(), size.to_string()]],
                }));
                vec![Publication::Json {
                    channel: format!("{product_id}.ob-inc"),
                    payload,
                }]
            }
        }
    }
}
