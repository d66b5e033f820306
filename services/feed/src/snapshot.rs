//! Last-value caches for initial pushes
//!
//! A new level2 or ticker subscriber gets the current state immediately
//! instead of waiting for the next upstream publish. The dispatcher
//! refreshes these on every BookSnapshot/Ticker event; the server reads
//! them on subscribe.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use types::book::OrderBookSnapshot;
use types::ids::ProductId;

/// Most recent full book per product.
#[derive(Default)]
pub struct SnapshotStore {
    books: DashMap<ProductId, Arc<OrderBookSnapshot>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `book` unless an equal-or-newer sequence is already held.
    pub fn update(&self, book: Arc<OrderBookSnapshot>) {
        match self.books.entry(book.product_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if book.sequence > entry.get().sequence {
                    entry.insert(book);
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(book);
            }
        }
    }

    pub fn get(&self, product_id: &ProductId) -> Option<Arc<OrderBookSnapshot>> {
        self.books.get(product_id).map(|entry| entry.value().clone())
    }
}

/// Most recent ticker payload per product, stored in wire shape.
#[derive(Default)]
pub struct TickerStore {
    tickers: DashMap<ProductId, Arc<Value>>,
}

impl TickerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, product_id: ProductId, payload: Arc<Value>) {
        self.tickers.insert(product_id, payload);
    }

    pub fn get(&self, product_id: &ProductId) -> Option<Arc<Value>> {
        self.tickers
            .get(product_id)
            .map(|entry| entry.value().clone())
    }
}
