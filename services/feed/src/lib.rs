//! Real-time market data distribution service
//!
//! Fans upstream exchange events out to WebSocket subscribers. Order
//! book topics go through a per-session diff engine so every subscriber
//! sees one full snapshot followed by deltas; all other topics are
//! published to a legacy and a frontend channel name in parallel.
//!
//! Flow: upstream events → `dispatcher` (channel mapping, keyed
//! executor fan-out) → `registry` (subscription index, per-session
//! lanes, book diffing) → `server` (socket transport).
//!
//! # Modules
//! - `events`: upstream event taxonomy
//! - `diff`: order book diff engine
//! - `protocol`: client request and wire payload shapes
//! - `snapshot`: last-value caches for initial pushes
//! - `registry`: channel↔session index and delivery lanes
//! - `dispatcher`: event → channel fan-out
//! - `server`: axum WebSocket endpoint

pub mod diff;
pub mod dispatcher;
pub mod events;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod snapshot;

pub use dispatcher::FeedDispatcher;
pub use registry::ChannelRegistry;
pub use server::{router, serve, FeedServerState};
