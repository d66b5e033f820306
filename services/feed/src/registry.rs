//! Channel registry and per-session delivery lanes
//!
//! Keeps the bidirectional channel↔session index and one serial lane
//! task per session. All frames for a session flow through its lane, so
//! delivery to one connection is FIFO while sessions proceed in
//! parallel. The lane also owns the session's last-sent book per
//! subscription (channel name), which drives the snapshot-then-delta
//! protocol independently for each level2 alias.
//!
//! Both halves of the index are concurrent maps mutated in a fixed
//! order (channel set first, then session set); sessions and channels
//! only ever reference each other by id.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use types::book::OrderBookSnapshot;
use types::ids::{SessionId, UserId};

use crate::diff::{diff, DiffOutcome};
use crate::protocol::{envelope, level2_product, snapshot_message, update_message};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
}

/// Work routed through a session's serial lane.
#[derive(Debug, Clone)]
pub enum LaneCommand {
    /// Order-book message; the lane diffs it against the last book it
    /// sent on that channel. `channel: None` sends the bare payload
    /// (legacy direct push) and primes both level2 aliases.
    Book {
        channel: Option<String>,
        book: Arc<OrderBookSnapshot>,
    },
    /// Pre-built payload, enveloped when channel-addressed.
    Json {
        channel: Option<String>,
        payload: Arc<Value>,
    },
    /// Drop per-session book state for one channel.
    ClearBook(String),
}

struct SessionHandle {
    user: Option<UserId>,
    lane_tx: mpsc::UnboundedSender<LaneCommand>,
}

/// Bidirectional subscription index plus per-session lanes.
#[derive(Default)]
pub struct ChannelRegistry {
    /// channel name → subscribed sessions
    channels: DashMap<String, BTreeSet<SessionId>>,
    /// session → subscribed channel names
    sessions: DashMap<SessionId, BTreeSet<String>>,
    /// session → identity and lane input
    handles: DashMap<SessionId, SessionHandle>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session and spawn its delivery lane. Frames the lane
    /// produces are pushed into `transport`, which the socket writer
    /// drains.
    pub fn register_session(
        &self,
        session_id: SessionId,
        user: Option<UserId>,
        transport: mpsc::UnboundedSender<String>,
    ) {
        let (lane_tx, lane_rx) = mpsc::unbounded_channel();
        tokio::spawn(session_lane(session_id, lane_rx, transport));
        self.sessions.entry(session_id).or_default();
        self.handles.insert(session_id, SessionHandle { user, lane_tx });
        debug!(%session_id, "session registered");
    }

    /// Identity bound to the session at connect time.
    pub fn user_of(&self, session_id: &SessionId) -> Option<UserId> {
        self.handles.get(session_id).and_then(|h| h.user)
    }

    /// Idempotent join. Channel set first, session set second; the
    /// handle is re-checked afterwards so a concurrent disconnect
    /// cannot leave an orphan membership.
    pub fn subscribe(&self, session_id: SessionId, channel: &str) -> Result<(), RegistryError> {
        if !self.handles.contains_key(&session_id) {
            return Err(RegistryError::UnknownSession(session_id));
        }

        self.channels
            .entry(channel.to_string())
            .or_default()
            .insert(session_id);
        self.sessions
            .entry(session_id)
            .or_default()
            .insert(channel.to_string());

        if !self.handles.contains_key(&session_id) {
            self.forget(session_id, channel);
            return Err(RegistryError::UnknownSession(session_id));
        }
        Ok(())
    }

    /// Idempotent leave. Unsubscribing a level2 alias also clears the
    /// session's book state for that alias, so a resubscribe starts
    /// with a fresh snapshot. The other alias keeps its delta chain.
    pub fn unsubscribe(&self, session_id: SessionId, channel: &str) {
        self.forget(session_id, channel);
        if level2_product(channel).is_some() {
            if let Some(handle) = self.handles.get(&session_id) {
                let _ = handle
                    .lane_tx
                    .send(LaneCommand::ClearBook(channel.to_string()));
            }
        }
    }

    /// Remove the session from every channel, then drop its lane.
    /// Safe to call concurrently with broadcasts and idempotent.
    pub fn remove_session(&self, session_id: SessionId) {
        self.handles.remove(&session_id);
        let channels = self
            .sessions
            .remove(&session_id)
            .map(|(_, set)| set)
            .unwrap_or_default();
        for channel in channels {
            if let Some(mut members) = self.channels.get_mut(&channel) {
                members.remove(&session_id);
            }
        }
        self.channels.retain(|_, members| !members.is_empty());
        debug!(%session_id, "session removed");
    }

    /// Schedule a payload for every current subscriber of `channel`.
    /// Returns the number of lanes it reached; closed lanes are skipped
    /// (their removal is driven by the transport close path).
    pub fn broadcast_json(&self, channel: &str, payload: Arc<Value>) -> usize {
        self.broadcast(channel, |name| LaneCommand::Json {
            channel: Some(name.to_string()),
            payload: payload.clone(),
        })
    }

    /// Broadcast a book through the diff path of each subscriber lane.
    pub fn broadcast_book(&self, channel: &str, book: Arc<OrderBookSnapshot>) -> usize {
        self.broadcast(channel, |name| LaneCommand::Book {
            channel: Some(name.to_string()),
            book: book.clone(),
        })
    }

    fn broadcast(&self, channel: &str, make: impl Fn(&str) -> LaneCommand) -> usize {
        // Membership snapshot at call time; sessions removed after this
        // point may still receive already-scheduled frames.
        let members: Vec<SessionId> = match self.channels.get(channel) {
            Some(set) => set.iter().copied().collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for session_id in members {
            if let Some(handle) = self.handles.get(&session_id) {
                match handle.lane_tx.send(make(channel)) {
                    Ok(()) => delivered += 1,
                    Err(_) => debug!(%session_id, channel, "lane closed, skipping"),
                }
            }
        }
        delivered
    }

    /// Direct push to one session (initial snapshots, pong).
    pub fn send_to(&self, session_id: SessionId, command: LaneCommand) -> Result<(), RegistryError> {
        let handle = self
            .handles
            .get(&session_id)
            .ok_or(RegistryError::UnknownSession(session_id))?;
        handle
            .lane_tx
            .send(command)
            .map_err(|_| RegistryError::UnknownSession(session_id))
    }

    pub fn session_count(&self) -> usize {
        self.handles.len()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map(|set| set.len()).unwrap_or(0)
    }

    fn forget(&self, session_id: SessionId, channel: &str) {
        if let Some(mut members) = self.channels.get_mut(channel) {
            members.remove(&session_id);
        }
        self.channels
            .remove_if(channel, |_, members| members.is_empty());
        if let Some(mut set) = self.sessions.get_mut(&session_id) {
            set.remove(channel);
        }
    }
}

/// Serial delivery lane for one session.
///
/// Owns the last-sent book per subscribed channel, so the two level2
/// aliases each carry their own snapshot-then-delta chain. Stale books
/// are logged and dropped; frames for a closed transport end the lane.
async fn session_lane(
    session_id: SessionId,
    mut lane_rx: mpsc::UnboundedReceiver<LaneCommand>,
    transport: mpsc::UnboundedSender<String>,
) {
    let mut last_books: HashMap<String, Arc<OrderBookSnapshot>> = HashMap::new();

    while let Some(command) = lane_rx.recv().await {
        let frame = match command {
            LaneCommand::Book { channel, book } => {
                // A direct push has no channel of its own; it seeds both
                // aliases so broadcasts on either continue with deltas.
                let keys: Vec<String> = match &channel {
                    Some(name) => vec![name.clone()],
                    None => vec![
                        format!("{}.level2", book.product_id),
                        format!("{}.update", book.product_id),
                    ],
                };
                let previous = last_books.get(&keys[0]).map(|b| b.as_ref());
                match diff(previous, &book) {
                    DiffOutcome::Snapshot => {
                        let payload = snapshot_message(&book);
                        store_book(&mut last_books, &keys, &book);
                        Some(wrap(channel.as_deref(), &payload))
                    }
                    DiffOutcome::Delta(delta) => {
                        let payload = update_message(&book.product_id, &delta);
                        store_book(&mut last_books, &keys, &book);
                        Some(wrap(channel.as_deref(), &payload))
                    }
                    DiffOutcome::Unchanged => {
                        // Levels identical but sequence advanced; keep
                        // the newer book for stale detection.
                        store_book(&mut last_books, &keys, &book);
                        None
                    }
                    DiffOutcome::Discard => {
                        warn!(
                            %session_id,
                            product_id = %book.product_id,
                            sequence = book.sequence,
                            "stale book discarded"
                        );
                        None
                    }
                }
            }
            LaneCommand::Json { channel, payload } => Some(wrap(channel.as_deref(), &payload)),
            LaneCommand::ClearBook(channel) => {
                last_books.remove(&channel);
                None
            }
        };

        if let Some(frame) = frame {
            if transport.send(frame).is_err() {
                debug!(%session_id, "transport closed, ending lane");
                return;
            }
        }
    }
}

fn store_book(
    last_books: &mut HashMap<String, Arc<OrderBookSnapshot>>,
    keys: &[String],
    book: &Arc<OrderBookSnapshot>,
) {
    for key in keys {
        last_books.insert(key.clone(), book.clone());
    }
}

fn wrap(channel: Option<&str>, payload: &Value) -> String {
    match channel {
        Some(channel) => envelope(channel, payload).to_string(),
        None => payload.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use std::time::Duration;
    use rust_decimal::Decimal;
    use tokio::time::timeout;
    use types::book::PriceLevel;
    use types::ids::ProductId;

    fn book(sequence: u64, bid: (&str, &str)) -> Arc<OrderBookSnapshot> {
        Arc::new(OrderBookSnapshot {
            product_id: ProductId::new("BTC-USDT"),
            sequence,
            bids: vec![PriceLevel::new(
                Decimal::from_str(bid.0).unwrap(),
                Decimal::from_str(bid.1).unwrap(),
            )],
            asks: vec![],
        })
    }

    async fn next_frame(rx: &mut mpsc::UnboundedReceiver<String>) -> Value {
        let frame = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("frame expected")
            .expect("transport open");
        serde_json::from_str(&frame).unwrap()
    }

    async fn expect_silence(rx: &mut mpsc::UnboundedReceiver<String>) {
        assert!(
            timeout(Duration::from_millis(50), rx.recv()).await.is_err(),
            "no frame expected"
        );
    }

    #[tokio::test]
    async fn test_first_book_is_snapshot_then_delta() {
        let registry = ChannelRegistry::new();
        let session = SessionId::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register_session(session, None, tx);
        registry.subscribe(session, "BTC-USDT.level2").unwrap();

        registry.broadcast_book("BTC-USDT.level2", book(1, ("100", "1")));
        let frame = next_frame(&mut rx).await;
        assert_eq!(frame["BTC-USDT.level2"]["type"], "snapshot");

        registry.broadcast_book("BTC-USDT.level2", book(2, ("100", "2")));
        let frame = next_frame(&mut rx).await;
        assert_eq!(frame["BTC-USDT.level2"]["type"], "update");
    }

    #[tokio::test]
    async fn test_stale_book_produces_no_frame() {
        let registry = ChannelRegistry::new();
        let session = SessionId::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register_session(session, None, tx);
        registry.subscribe(session, "BTC-USDT.level2").unwrap();

        registry.broadcast_book("BTC-USDT.level2", book(5, ("100", "1")));
        next_frame(&mut rx).await;

        registry.broadcast_book("BTC-USDT.level2", book(5, ("100", "9")));
        expect_silence(&mut rx).await;
    }

    #[tokio::test]
    async fn test_both_level2_aliases_receive_every_book() {
        let registry = ChannelRegistry::new();
        let session = SessionId::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register_session(session, None, tx);
        registry.subscribe(session, "BTC-USDT.level2").unwrap();
        registry.subscribe(session, "BTC-USDT.update").unwrap();

        // The dispatcher publishes each book to both aliases.
        for sequence in 1..=3u64 {
            let b = book(sequence, ("100", &sequence.to_string()));
            registry.broadcast_book("BTC-USDT.level2", b.clone());
            registry.broadcast_book("BTC-USDT.update", b);
        }

        let mut legacy = Vec::new();
        let mut frontend = Vec::new();
        for _ in 0..6 {
            let frame = next_frame(&mut rx).await;
            if !frame["BTC-USDT.level2"].is_null() {
                legacy.push(frame["BTC-USDT.level2"]["type"].clone());
            } else {
                frontend.push(frame["BTC-USDT.update"]["type"].clone());
            }
        }

        // Each alias carries its own snapshot-then-delta chain.
        for frames in [&legacy, &frontend] {
            assert_eq!(frames.len(), 3);
            assert_eq!(frames[0], "snapshot");
            assert_eq!(frames[1], "update");
            assert_eq!(frames[2], "update");
        }
        expect_silence(&mut rx).await;
    }

    #[tokio::test]
    async fn test_unsubscribe_alias_resets_only_that_alias() {
        let registry = ChannelRegistry::new();
        let session = SessionId::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register_session(session, None, tx);
        registry.subscribe(session, "BTC-USDT.level2").unwrap();
        registry.subscribe(session, "BTC-USDT.update").unwrap();

        registry.broadcast_book("BTC-USDT.level2", book(1, ("100", "1")));
        registry.broadcast_book("BTC-USDT.update", book(1, ("100", "1")));
        next_frame(&mut rx).await;
        next_frame(&mut rx).await;

        registry.unsubscribe(session, "BTC-USDT.update");
        registry.subscribe(session, "BTC-USDT.update").unwrap();

        registry.broadcast_book("BTC-USDT.level2", book(2, ("100", "2")));
        registry.broadcast_book("BTC-USDT.update", book(2, ("100", "2")));

        // The surviving alias continues its delta chain; the rejoined
        // alias starts over with a fresh snapshot.
        let first = next_frame(&mut rx).await;
        assert_eq!(first["BTC-USDT.level2"]["type"], "update");
        let second = next_frame(&mut rx).await;
        assert_eq!(second["BTC-USDT.update"]["type"], "snapshot");
    }

    #[tokio::test]
    async fn test_broadcast_reaches_only_subscribers() {
        let registry = ChannelRegistry::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let s1 = SessionId::new();
        let s2 = SessionId::new();
        registry.register_session(s1, None, tx1);
        registry.register_session(s2, None, tx2);
        registry.subscribe(s1, "BTC-USDT.trades").unwrap();

        let delivered =
            registry.broadcast_json("BTC-USDT.trades", Arc::new(serde_json::json!({"n": 1})));
        assert_eq!(delivered, 1);
        next_frame(&mut rx1).await;
        expect_silence(&mut rx2).await;
    }

    #[tokio::test]
    async fn test_remove_session_severs_both_maps() {
        let registry = ChannelRegistry::new();
        let session = SessionId::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register_session(session, None, tx);
        registry.subscribe(session, "BTC-USDT.ticker").unwrap();
        registry.subscribe(session, "global.tickers").unwrap();

        registry.remove_session(session);

        assert_eq!(registry.session_count(), 0);
        assert_eq!(registry.subscriber_count("BTC-USDT.ticker"), 0);
        assert_eq!(
            registry.broadcast_json("global.tickers", Arc::new(Value::Null)),
            0
        );
        assert!(matches!(
            registry.subscribe(session, "BTC-USDT.ticker"),
            Err(RegistryError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribe_idempotent() {
        let registry = ChannelRegistry::new();
        let session = SessionId::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register_session(session, None, tx);
        registry.subscribe(session, "BTC-USDT.match").unwrap();
        registry.subscribe(session, "BTC-USDT.match").unwrap();
        assert_eq!(registry.subscriber_count("BTC-USDT.match"), 1);
    }
}
