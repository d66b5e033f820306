//! Client-facing wire protocol
//!
//! Inbound: subscribe/unsubscribe/ping requests as JSON. Outbound: book
//! snapshots and deltas, pong, and the channel envelope used for
//! broadcast frames. Every subscribable kind maps to one or two concrete
//! channel names: the legacy per-product/per-user name and the
//! normalized frontend name, published in parallel so both client
//! generations see the same data.

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use types::book::OrderBookSnapshot;
use types::ids::{CurrencyId, ProductId, UserId};
use types::order::Side;

use crate::diff::BookDelta;

/// Inbound client request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientRequest {
    Subscribe {
        #[serde(default)]
        channels: Vec<String>,
        #[serde(default, rename = "productIds")]
        product_ids: Vec<String>,
        #[serde(default, rename = "currencyIds")]
        currency_ids: Vec<String>,
    },
    Unsubscribe {
        #[serde(default)]
        channels: Vec<String>,
        #[serde(default, rename = "productIds")]
        product_ids: Vec<String>,
        #[serde(default, rename = "currencyIds")]
        currency_ids: Vec<String>,
    },
    Ping,
}

/// Subscribable channel kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Level2,
    Ticker,
    Match,
    Order,
    Funds,
    Full,
    Trade,
}

impl ChannelKind {
    /// Parse a channel name from a subscribe request. Unknown names are
    /// ignored by the caller.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "level2" => Some(ChannelKind::Level2),
            "ticker" => Some(ChannelKind::Ticker),
            "match" => Some(ChannelKind::Match),
            "order" => Some(ChannelKind::Order),
            "funds" => Some(ChannelKind::Funds),
            "full" => Some(ChannelKind::Full),
            "trade" => Some(ChannelKind::Trade),
            _ => None,
        }
    }

    /// Whether this kind only makes sense for an identified session.
    pub fn requires_identity(&self) -> bool {
        matches!(
            self,
            ChannelKind::Order | ChannelKind::Funds | ChannelKind::Trade
        )
    }
}

/// Resolve a channel kind to the concrete channel names a session
/// should join. Identity-requiring kinds resolve to nothing for
/// anonymous sessions (the request is silently ignored).
pub fn resolve_channels(
    kind: ChannelKind,
    product_ids: &[ProductId],
    currency_ids: &[CurrencyId],
    user: Option<&UserId>,
) -> Vec<String> {
    let mut names = Vec::new();
    match kind {
        ChannelKind::Level2 => {
            for product in product_ids {
                names.push(format!("{product}.level2"));
                names.push(format!("{product}.update"));
            }
        }
        ChannelKind::Ticker => {
            for product in product_ids {
                names.push(format!("{product}.ticker"));
            }
            names.push("global.tickers".to_string());
        }
        ChannelKind::Match => {
            for product in product_ids {
                names.push(format!("{product}.match"));
                names.push(format!("{product}.trades"));
            }
        }
        ChannelKind::Order => {
            if let Some(user) = user {
                for product in product_ids {
                    names.push(format!("{user}.{product}.order"));
                }
                names.push("order".to_string());
            }
        }
        ChannelKind::Funds => {
            if let Some(user) = user {
                for currency in currency_ids {
                    names.push(format!("{user}.{currency}.funds"));
                }
                names.push("balances".to_string());
            }
        }
        ChannelKind::Full => {
            for product in product_ids {
                names.push(format!("{product}.full"));
            }
        }
        ChannelKind::Trade => {
            if user.is_some() {
                names.push("trade".to_string());
            }
        }
    }
    names
}

/// If `channel` is a level2 alias (`{product}.level2` or
/// `{product}.update`), return the product whose per-session book state
/// it owns.
pub fn level2_product(channel: &str) -> Option<ProductId> {
    let product = channel
        .strip_suffix(".level2")
        .or_else(|| channel.strip_suffix(".update"))?;
    ProductId::try_new(product)
}

fn level_pairs(levels: &[types::book::PriceLevel]) -> Vec<Value> {
    levels
        .iter()
        .map(|l| json!([l.price.to_string(), l.size.to_string()]))
        .collect()
}

/// Full-book payload: `{"type":"snapshot",...}`.
pub fn snapshot_message(book: &OrderBookSnapshot) -> Value {
    json!({
        "type": "snapshot",
        "productId": book.product_id.as_str(),
        "sequence": book.sequence,
        "bids": level_pairs(&book.bids),
        "asks": level_pairs(&book.asks),
    })
}

/// Delta payload: `{"type":"update","changes":[[side,price,size]...]}`.
/// Removed levels are encoded with size `"0"`.
pub fn update_message(product_id: &ProductId, delta: &BookDelta) -> Value {
    let mut changes: Vec<Value> = Vec::with_capacity(delta.changed.len() + delta.removed.len());
    for (side, level) in &delta.changed {
        changes.push(json!([
            side.wire_label(),
            level.price.to_string(),
            level.size.to_string(),
        ]));
    }
    for (side, price) in &delta.removed {
        changes.push(json!([
            side.wire_label(),
            price.to_string(),
            Decimal::ZERO.to_string(),
        ]));
    }
    json!({
        "type": "update",
        "productId": product_id.as_str(),
        "sequence": delta.sequence,
        "changes": changes,
    })
}

pub fn pong_message() -> Value {
    json!({ "type": "pong" })
}

/// Wrap a broadcast payload in the routing-key envelope. Legacy direct
/// pushes skip this and send the bare payload.
pub fn envelope(channel: &str, payload: &Value) -> Value {
    json!({ channel: payload })
}
