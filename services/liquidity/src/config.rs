//! Mirroring configuration

use std::time::Duration;

use types::ids::UserId;

/// Configuration for the liquidity mirroring service.
///
/// Disabled by default; the service is only wired into deployments
/// that want external depth mirrored into the local book.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Master switch. When false, `start` is a no-op.
    pub enabled: bool,
    /// How often local books are reconciled against the external feed.
    pub sync_interval: Duration,
    /// How often the product catalogue is re-read for new mappings.
    pub product_refresh_interval: Duration,
    /// How often the connection is probed and revived if down.
    pub health_check_interval: Duration,
    /// Wait between reconnect attempts after a failed connect.
    pub reconnect_delay: Duration,
    /// Combined-stream endpoint; stream names are appended.
    pub websocket_url: String,
    /// Depth stream suffix appended to each symbol.
    pub depth_suffix: String,
    /// Identity the synthetic orders are placed under.
    pub bot_user_id: UserId,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sync_interval: Duration::from_secs(5),
            product_refresh_interval: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
            websocket_url: "wss://stream.binance.com/stream?streams=".to_string(),
            depth_suffix: "@depth20".to_string(),
            bot_user_id: UserId::new(),
        }
    }
}
