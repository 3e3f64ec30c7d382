pub mod coingecko;
pub mod rate_limit;

use async_trait::async_trait;

use crate::error::FetchError;
use crate::types::PricePoint;

pub use coingecko::CoinGeckoClient;

/// Upstream source of price quotes for one tracked asset.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Latest quote for `asset`.
    async fn current_price(&self, asset: &str) -> Result<PricePoint, FetchError>;

    /// Price history covering the last `days` days, in source order.
    async fn history(&self, asset: &str, days: u32) -> Result<Vec<PricePoint>, FetchError>;
}
