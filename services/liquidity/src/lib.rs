//! External liquidity mirroring
//!
//! Replicates an external venue's depth into the local book with
//! synthetic orders owned by a bot identity:
//!
//! 1. [`client`] keeps a streaming connection to the venue and caches a
//!    full-replacement book per symbol;
//! 2. [`compare`] diffs the local synthetic book against the cached
//!    external book;
//! 3. [`reconciler`] turns the diff into order placements and cancels
//!    through the trading core's [`reconciler::OrderGateway`];
//! 4. [`sync`] schedules the cycles and owns startup and shutdown.

pub mod client;
pub mod compare;
pub mod config;
pub mod mapper;
pub mod reconciler;
pub mod sync;

pub use client::ExternalMarketDataClient;
pub use compare::{mirror_diff, BookLevels, MirrorDiff};
pub use config::MirrorConfig;
pub use reconciler::{LiquidityMirrorReconciler, OrderGateway};
pub use sync::{LocalBookSource, MirrorSyncService};
