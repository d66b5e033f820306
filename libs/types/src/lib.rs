//! Types library for the exchange feed subsystem
//!
//! This library provides the core type definitions shared by the market-data
//! distribution and liquidity-mirroring services, ensuring type safety and
//! deterministic behavior at the crate boundaries.
//!
//! # Modules
//! - `ids`: Unique identifiers (ProductId, CurrencyId, SessionId, UserId, OrderId)
//! - `order`: Order side
//! - `book`: Price levels and order book snapshots

// Public modules
pub mod book;
pub mod ids;
pub mod order;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::book::*;
    pub use crate::ids::*;
    pub use crate::order::*;
}
