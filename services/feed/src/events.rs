//! Upstream event definitions for the feed service
//!
//! Defines the `UpstreamEvent` envelope for everything this service
//! consumes from the matching engine and the account/trade buses. The
//! dispatcher pattern-matches the payload exhaustively; there is no
//! runtime type inspection anywhere downstream.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use types::book::OrderBookSnapshot;
use types::ids::{CurrencyId, OrderId, ProductId, UserId};
use types::order::Side;
use uuid::Uuid;

/// Lifecycle state of an order as reported on the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderState {
    /// Accepted, not yet on the book.
    Received,
    /// Resting on the book (possibly partially filled).
    Open,
    /// Terminal: filled or cancelled.
    Done,
}

impl OrderState {
    pub fn label(&self) -> &'static str {
        match self {
            OrderState::Received => "received",
            OrderState::Open => "open",
            OrderState::Done => "done",
        }
    }
}

/// Envelope for one upstream event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamEvent {
    /// Unique event identifier (UUID v7)
    pub event_id: Uuid,
    /// Unix nanoseconds timestamp from the producing service
    pub timestamp: i64,
    /// Event-specific payload
    pub payload: UpstreamPayload,
}

/// Event payloads, one variant per upstream topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum UpstreamPayload {
    /// Order lifecycle change for one user's order.
    Order {
        order_id: OrderId,
        user_id: UserId,
        product_id: ProductId,
        side: Side,
        /// Absent for market orders.
        price: Option<Decimal>,
        size: Decimal,
        filled_size: Decimal,
        state: OrderState,
    },

    /// Matching-engine book log entry: an order was received, opened on
    /// the book, or finished. Product-scoped, feeds the full channel.
    OrderLog {
        product_id: ProductId,
        sequence: u64,
        order_id: OrderId,
        side: Side,
        state: OrderState,
        /// Absent for market orders.
        price: Option<Decimal>,
        /// Original size, reported on received entries.
        size: Option<Decimal>,
        /// Reported on open and done entries.
        remaining_size: Option<Decimal>,
    },

    /// Balance change for one user/currency pair.
    Account {
        user_id: UserId,
        currency_id: CurrencyId,
        available: Decimal,
        hold: Decimal,
    },

    /// An executed trade, side from the taker's perspective.
    Trade {
        product_id: ProductId,
        sequence: u64,
        price: Decimal,
        size: Decimal,
        side: Side,
    },

    /// Rolling 24h product statistics.
    Ticker {
        product_id: ProductId,
        sequence: u64,
        last_price: Decimal,
        open_24h: Decimal,
        high_24h: Decimal,
        low_24h: Decimal,
        volume_24h: Decimal,
    },

    /// One OHLCV bucket.
    Candle {
        product_id: ProductId,
        /// Bucket width in minutes.
        granularity: u32,
        start_time: i64,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
    },

    /// Full level-2 book published by the trading core.
    BookSnapshot { book: OrderBookSnapshot },

    /// Single-level incremental book change.
    BookIncrement {
        product_id: ProductId,
        sequence: u64,
        side: Side,
        price: Decimal,
        size: Decimal,
    },
}

impl UpstreamEvent {
    /// Ordering partition for executor routing: user-scoped events key
    /// by user, product-scoped events key by product.
    pub fn partition_key(&self) -> String {
        match &self.payload {
            UpstreamPayload::Order { user_id, .. } => user_id.to_string(),
            UpstreamPayload::OrderLog { product_id, .. } => product_id.to_string(),
            UpstreamPayload::Account { user_id, .. } => user_id.to_string(),
            UpstreamPayload::Trade { product_id, .. } => product_id.to_string(),
            UpstreamPayload::Ticker { product_id, .. } => product_id.to_string(),
            UpstreamPayload::Candle { product_id, .. } => product_id.to_string(),
            UpstreamPayload::BookSnapshot { book } => book.product_id.to_string(),
            UpstreamPayload::BookIncrement { product_id, .. } => product_id.to_string(),
        }
    }

    /// Get the event type as a string label for logging.
    pub fn event_type_label(&self) -> &'static str {
        match &self.payload {
            UpstreamPayload::Order { .. } => "Order",
            UpstreamPayload::OrderLog { .. } => "OrderLog",
            UpstreamPayload::Account { .. } => "Account",
            UpstreamPayload::Trade { .. } => "Trade",
            UpstreamPayload::Ticker { .. } => "Ticker",
            UpstreamPayload::Candle { .. } => "Candle",
            UpstreamPayload::BookSnapshot { .. } => "BookSnapshot",
            UpstreamPayload::BookIncrement { .. } => "BookIncrement",
        }
    }

    pub fn new(timestamp: i64, payload: UpstreamPayload) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            timestamp,
            payload,
        }
    }
}
