//! Product-to-symbol mapping
//!
//! Local products are "BASE-QUOTE"; the external venue uses lowercase
//! concatenated symbols ("BTC-USDT" → "btcusdt"). The mapping is
//! rebuilt from the product catalogue on a refresh schedule; a changed
//! mapping forces the stream client to reconnect with the new set.

use std::collections::BTreeMap;

use tracing::warn;
use types::ids::ProductId;

/// The catalogue of mirrorable products, provided by the trading core.
pub trait ProductCatalog: Send + Sync {
    fn product_ids(&self) -> Vec<ProductId>;
}

/// External symbol for one product.
pub fn symbol_for(product_id: &ProductId) -> String {
    product_id.as_str().replace('-', "").to_lowercase()
}

/// Build the product→symbol mapping for every catalogued product.
/// Deterministically ordered so mapping comparisons are stable.
pub fn build_mapping(catalog: &dyn ProductCatalog) -> BTreeMap<ProductId, String> {
    let products = catalog.product_ids();
    if products.is_empty() {
        warn!("product catalogue is empty, nothing to mirror");
        return BTreeMap::new();
    }
    products
        .into_iter()
        .map(|product| {
            let symbol = symbol_for(&product);
            (product, symbol)
        })
        .collect()
}
