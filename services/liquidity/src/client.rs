//! External venue market data client
//!
//! Holds one streaming connection for the current symbol set using the
//! venue's combined-stream endpoint (`{symbol}@depth20` per symbol).
//! Every depth frame fully replaces the symbol's cached book; nothing
//! is merged, so a reconnect needs no resync protocol. Connection loss
//! is retried on a background task with a fixed delay, without bound.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use futures::StreamExt;
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use types::ids::ProductId;

use crate::compare::BookLevels;
use crate::config::MirrorConfig;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("malformed depth frame: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unusable depth frame: {0}")]
    BadFrame(String),
}

#[derive(Debug, Deserialize)]
struct StreamEnvelope {
    stream: String,
    data: DepthData,
}

#[derive(Debug, Deserialize)]
struct DepthData {
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

/// Parse one combined-stream depth frame into the symbol it belongs to
/// and its full replacement book.
pub fn parse_depth_frame(text: &str) -> Result<(String, BookLevels), ClientError> {
    let envelope: StreamEnvelope = serde_json::from_str(text)?;
    let symbol = envelope
        .stream
        .split('@')
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ClientError::BadFrame(format!("stream '{}'", envelope.stream)))?
        .to_string();

    Ok((
        symbol,
        BookLevels {
            bids: parse_levels(&envelope.data.bids)?,
            asks: parse_levels(&envelope.data.asks)?,
        },
    ))
}

fn parse_levels(raw: &[[String; 2]]) -> Result<BTreeMap<Decimal, Decimal>, ClientError> {
    let mut levels = BTreeMap::new();
    for [price, size] in raw {
        let price = Decimal::from_str(price)
            .map_err(|e| ClientError::BadFrame(format!("price '{price}': {e}")))?;
        let size = Decimal::from_str(size)
            .map_err(|e| ClientError::BadFrame(format!("size '{size}': {e}")))?;
        if size > Decimal::ZERO {
            levels.insert(price, size);
        }
    }
    Ok(levels)
}

struct ClientInner {
    config: MirrorConfig,
    /// external symbol → latest full book
    books: DashMap<String, BookLevels>,
    mapping: Mutex<BTreeMap<ProductId, String>>,
    connected: AtomicBool,
    /// Bumped on every disconnect; stale connection loops observe the
    /// change and exit.
    generation: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Live mirror of the external venue's books for the mapped symbol set.
/// Cheap to clone.
#[derive(Clone)]
pub struct ExternalMarketDataClient {
    inner: Arc<ClientInner>,
}

impl ExternalMarketDataClient {
    pub fn new(config: MirrorConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                books: DashMap::new(),
                mapping: Mutex::new(BTreeMap::new()),
                connected: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                task: Mutex::new(None),
            }),
        }
    }

    /// Replace the product→symbol mapping. A changed mapping while
    /// connected tears the stream down and reconnects with the new
    /// symbol set.
    pub fn set_mapping(&self, mapping: BTreeMap<ProductId, String>) {
        let changed = {
            let mut current = lock(&self.inner.mapping);
            if *current == mapping {
                false
            } else {
                *current = mapping;
                true
            }
        };
        if changed && self.is_connected() {
            info!("product mapping changed, reconnecting stream");
            self.disconnect();
            self.connect();
        }
    }

    pub fn mapped_products(&self) -> Vec<ProductId> {
        lock(&self.inner.mapping).keys().cloned().collect()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Start the connection task for the current mapping. No-op when a
    /// task is already live.
    pub fn connect(&self) {
        let mut task = lock(&self.inner.task);
        if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return;
        }
        let generation = self.inner.generation.load(Ordering::SeqCst);
        *task = Some(tokio::spawn(connection_loop(
            self.inner.clone(),
            generation,
        )));
    }

    /// Stop the stream. Cached books are kept; the next sync decides
    /// what to do with them.
    pub fn disconnect(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.connected.store(false, Ordering::SeqCst);
        if let Some(task) = lock(&self.inner.task).take() {
            task.abort();
        }
    }

    /// Latest external book for a product, if a depth frame has been
    /// seen since connect.
    pub fn book_for(&self, product_id: &ProductId) -> Option<BookLevels> {
        let symbol = lock(&self.inner.mapping).get(product_id).cloned()?;
        self.inner.books.get(&symbol).map(|b| b.clone())
    }

    /// Apply one raw depth frame. Exposed for the connection loop and
    /// for tests; frames always replace the whole symbol book.
    pub fn apply_frame(&self, text: &str) -> Result<(), ClientError> {
        apply_frame(&self.inner, text)
    }
}

fn apply_frame(inner: &ClientInner, text: &str) -> Result<(), ClientError> {
    let (symbol, levels) = parse_depth_frame(text)?;
    debug!(
        symbol,
        bids = levels.bids.len(),
        asks = levels.asks.len(),
        "external book replaced"
    );
    inner.books.insert(symbol, levels);
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn stream_url(inner: &ClientInner) -> Option<String> {
    let mapping = lock(&inner.mapping);
    if mapping.is_empty() {
        return None;
    }
    let streams: Vec<String> = mapping
        .values()
        .map(|symbol| format!("{symbol}{}", inner.config.depth_suffix))
        .collect();
    Some(format!(
        "{}{}",
        inner.config.websocket_url,
        streams.join("/")
    ))
}

/// Connect, consume frames, and retry forever with a fixed delay.
/// Exits when the client's generation moves past `generation`.
async fn connection_loop(inner: Arc<ClientInner>, generation: u64) {
    loop {
        if inner.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        let Some(url) = stream_url(&inner) else {
            warn!("no mapped products, stream not started");
            return;
        };

        match connect_async(&url).await {
            Ok((stream, _)) => {
                info!(url, "external stream connected");
                inner.connected.store(true, Ordering::SeqCst);

                let (_, mut read) = stream.split();
                while let Some(message) = read.next().await {
                    if inner.generation.load(Ordering::SeqCst) != generation {
                        return;
                    }
                    match message {
                        Ok(Message::Text(text)) => {
                            if let Err(error) = apply_frame(&inner, &text) {
                                debug!(%error, "ignoring unusable depth frame");
                            }
                        }
                        Ok(_) => {}
                        Err(error) => {
                            warn!(%error, "external stream error");
                            break;
                        }
                    }
                }
                inner.connected.store(false, Ordering::SeqCst);
                warn!("external stream closed, will reconnect");
            }
            Err(error) => {
                inner.connected.store(false, Ordering::SeqCst);
                error!(%error, "external stream connect failed");
            }
        }

        tokio::time::sleep(inner.config.reconnect_delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_with_mapping() -> ExternalMarketDataClient {
        let client = ExternalMarketDataClient::new(MirrorConfig::default());
        client.set_mapping(
            [(ProductId::new("BTC-USDT"), "btcusdt".to_string())]
                .into_iter()
                .collect(),
        );
        client
    }

    #[test]
    fn test_parse_depth_frame() {
        let (symbol, levels) = parse_depth_frame(
            r#"{"stream":"btcusdt@depth20","data":{"bids":[["100.5","2"],["99","0"]],"asks":[["101","3"]]}}"#,
        )
        .unwrap();
        assert_eq!(symbol, "btcusdt");
        assert_eq!(levels.bids.len(), 1, "zero-size levels are dropped");
        assert_eq!(
            levels.bids[&Decimal::from_str("100.5").unwrap()],
            Decimal::from(2)
        );
        assert_eq!(levels.asks.len(), 1);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_depth_frame("not json").is_err());
        assert!(parse_depth_frame(
            r#"{"stream":"btcusdt@depth20","data":{"bids":[["oops","2"]],"asks":[]}}"#
        )
        .is_err());
    }

    #[tokio::test]
    async fn test_frames_replace_not_merge() {
        let client = client_with_mapping();
        client
            .apply_frame(
                r#"{"stream":"btcusdt@depth20","data":{"bids":[["100","1"],["99","1"]],"asks":[]}}"#,
            )
            .unwrap();
        client
            .apply_frame(
                r#"{"stream":"btcusdt@depth20","data":{"bids":[["98","5"]],"asks":[["101","1"]]}}"#,
            )
            .unwrap();

        let book = client.book_for(&ProductId::new("BTC-USDT")).unwrap();
        assert_eq!(book.bids.len(), 1, "old bid levels must be gone");
        assert_eq!(book.bids[&Decimal::from(98)], Decimal::from(5));
        assert_eq!(book.asks.len(), 1);
    }

    #[test]
    fn test_stream_url_joins_symbols() {
        let client = ExternalMarketDataClient::new(MirrorConfig::default());
        client.set_mapping(
            [
                (ProductId::new("BTC-USDT"), "btcusdt".to_string()),
                (ProductId::new("ETH-USDT"), "ethusdt".to_string()),
            ]
            .into_iter()
            .collect(),
        );
        let url = stream_url(&client.inner).unwrap();
        assert_eq!(
            url,
            "wss://stream.binance.com/stream?streams=btcusdt@depth20/ethusdt@depth20"
        );
    }

    #[test]
    fn test_no_book_before_any_frame() {
        let client = client_with_mapping();
        assert!(client.book_for(&ProductId::new("BTC-USDT")).is_none());
    }
}
