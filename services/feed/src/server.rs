//! WebSocket endpoint
//!
//! One route, `/ws`. Each connection becomes a registry session: a
//! writer task drains the session's frame queue into the socket while
//! the read loop parses client requests. Malformed input is logged and
//! ignored; the connection stays open. Authentication is the edge
//! proxy's concern — an already-verified identity arrives as the
//! `user_id` query parameter, and repeated `stream` parameters name
//! channels to join at connect time.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, RawQuery, State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info};
use types::ids::{CurrencyId, ProductId, SessionId, UserId};
use uuid::Uuid;

use crate::protocol::{pong_message, resolve_channels, ChannelKind, ClientRequest};
use crate::registry::{ChannelRegistry, LaneCommand};
use crate::snapshot::{SnapshotStore, TickerStore};

#[derive(Clone)]
pub struct FeedServerState {
    pub registry: Arc<ChannelRegistry>,
    pub books: Arc<SnapshotStore>,
    pub tickers: Arc<TickerStore>,
}

pub fn router(state: FeedServerState) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(state)
}

/// Bind and serve until the task is cancelled.
pub async fn serve(addr: SocketAddr, state: FeedServerState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "feed server listening");
    axum::serve(listener, router(state)).await
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    /// Identity established upstream; absent for anonymous sessions.
    user_id: Option<Uuid>,
}

/// Channels named by repeated `stream` parameters
/// (`/ws?stream=BTC-USDT.ticker&stream=global.tickers`).
fn stream_params(query: &str) -> Vec<String> {
    serde_urlencoded::from_str::<Vec<(String, String)>>(query)
        .unwrap_or_default()
        .into_iter()
        .filter(|(name, _)| name == "stream")
        .map(|(_, value)| value)
        .collect()
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    RawQuery(raw): RawQuery,
    State(state): State<FeedServerState>,
) -> Response {
    let streams = stream_params(raw.as_deref().unwrap_or(""));
    ws.on_upgrade(move |socket| handle_socket(socket, state, query, streams))
}

async fn handle_socket(
    socket: WebSocket,
    state: FeedServerState,
    query: WsQuery,
    streams: Vec<String>,
) {
    let session_id = SessionId::new();
    let user = query.user_id.map(UserId::from_uuid);

    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<String>();
    state.registry.register_session(session_id, user, frame_tx);
    info!(%session_id, identified = user.is_some(), "session connected");

    let (mut sink, mut stream) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    for channel in &streams {
        if let Err(error) = state.registry.subscribe(session_id, channel) {
            debug!(%session_id, channel, %error, "connect-time subscribe failed");
        }
    }

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => handle_request(&state, session_id, &text),
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.registry.remove_session(session_id);
    writer.abort();
    info!(%session_id, "session disconnected");
}

fn handle_request(state: &FeedServerState, session_id: SessionId, text: &str) {
    let request: ClientRequest = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(error) => {
            debug!(%session_id, %error, "ignoring malformed client message");
            return;
        }
    };

    match request {
        ClientRequest::Ping => {
            let _ = state.registry.send_to(
                session_id,
                LaneCommand::Json {
                    channel: None,
                    payload: Arc::new(pong_message()),
                },
            );
        }
        ClientRequest::Subscribe {
            channels,
            product_ids,
            currency_ids,
        } => {
            let user = state.registry.user_of(&session_id);
            let products = parse_products(&product_ids, session_id);
            let currencies: Vec<CurrencyId> =
                currency_ids.iter().map(CurrencyId::new).collect();

            for name in &channels {
                let Some(kind) = ChannelKind::parse(name) else {
                    debug!(%session_id, channel = %name, "unknown channel kind ignored");
                    continue;
                };
                for channel in resolve_channels(kind, &products, &currencies, user.as_ref()) {
                    if let Err(error) = state.registry.subscribe(session_id, &channel) {
                        debug!(%session_id, channel, %error, "subscribe failed");
                    }
                }
                initial_push(state, session_id, kind, &products);
            }
        }
        ClientRequest::Unsubscribe {
            channels,
            product_ids,
            currency_ids,
        } => {
            let user = state.registry.user_of(&session_id);
            let products = parse_products(&product_ids, session_id);
            let currencies: Vec<CurrencyId> =
                currency_ids.iter().map(CurrencyId::new).collect();

            for name in &channels {
                let Some(kind) = ChannelKind::parse(name) else {
                    continue;
                };
                for channel in resolve_channels(kind, &products, &currencies, user.as_ref()) {
                    state.registry.unsubscribe(session_id, &channel);
                }
            }
        }
    }
}

/// A fresh level2/ticker subscriber gets the current state immediately
/// as a bare direct push, in the legacy subscribe style.
fn initial_push(
    state: &FeedServerState,
    session_id: SessionId,
    kind: ChannelKind,
    products: &[ProductId],
) {
    match kind {
        ChannelKind::Level2 => {
            for product in products {
                if let Some(book) = state.books.get(product) {
                    let _ = state.registry.send_to(
                        session_id,
                        LaneCommand::Book {
                            channel: None,
                            book,
                        },
                    );
                }
            }
        }
        ChannelKind::Ticker => {
            for product in products {
                if let Some(payload) = state.tickers.get(product) {
                    let _ = state.registry.send_to(
                        session_id,
                        LaneCommand::Json {
                            channel: None,
                            payload,
                        },
                    );
                }
            }
        }
        _ => {}
    }
}

fn parse_products(raw: &[String], session_id: SessionId) -> Vec<ProductId> {
    raw.iter()
        .filter_map(|s| {
            let product = ProductId::try_new(s.clone());
            if product.is_none() {
                debug!(%session_id, product = %s, "invalid product id ignored");
            }
            product
        })
        .collect()
}
