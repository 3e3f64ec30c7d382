// =============================================================================
// CoinGecko REST client — current quote + multi-day history
// =============================================================================
//
// Endpoints used:
//   GET /simple/price?ids=<asset>&vs_currencies=<vs>&include_last_updated_at=true
//       => { "<asset>": { "<vs>": 64000.12, "last_updated_at": 1714550400 } }
//   GET /coins/<asset>/market_chart?vs_currency=<vs>&days=<n>
//       => { "prices": [[1714550400000, 64000.12], ...], ... }
//
// The API is public, rate-limited and occasionally unavailable; every failure
// maps onto `FetchError` and the caller decides what to do with the cycle.
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::error::FetchError;
use crate::market_data::rate_limit::{RateLimitSnapshot, RateLimitTracker};
use crate::market_data::PriceSource;
use crate::types::PricePoint;

/// CoinGecko-compatible quote client.
pub struct CoinGeckoClient {
    base_url: String,
    vs_currency: String,
    client: reqwest::Client,
    rate_limit: RateLimitTracker,
}

#[derive(Debug, Deserialize)]
struct MarketChart {
    prices: Vec<(f64, f64)>,
}

impl CoinGeckoClient {
    /// Create a client for `base_url` (e.g. `https://api.coingecko.com/api/v3`)
    /// quoting in `vs_currency`.
    pub fn new(
        base_url: impl Into<String>,
        vs_currency: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("coin-pulse/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            vs_currency: vs_currency.into().to_lowercase(),
            client,
            rate_limit: RateLimitTracker::new(),
        })
    }

    pub fn rate_limit(&self) -> RateLimitSnapshot {
        self.rate_limit.snapshot(Utc::now().timestamp_millis())
    }

    /// `base_url` with `segments` appended as percent-encoded path segments.
    fn endpoint(&self, segments: &[&str]) -> Result<reqwest::Url, FetchError> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| FetchError::Transport(format!("invalid base URL {}: {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|_| FetchError::Transport(format!("base URL {} cannot take a path", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn simple_price_request(&self, asset: &str) -> Result<reqwest::RequestBuilder, FetchError> {
        let url = self.endpoint(&["simple", "price"])?;
        Ok(self.client.get(url).query(&[
            ("ids", asset),
            ("vs_currencies", self.vs_currency.as_str()),
            ("include_last_updated_at", "true"),
        ]))
    }

    fn market_chart_request(&self, asset: &str, days: u32) -> Result<reqwest::RequestBuilder, FetchError> {
        let url = self.endpoint(&["coins", asset, "market_chart"])?;
        let days = days.to_string();
        Ok(self.client.get(url).query(&[
            ("vs_currency", self.vs_currency.as_str()),
            ("days", days.as_str()),
        ]))
    }

    /// Send `request` and decode the JSON body, honouring the rate-limit
    /// cooldown.
    async fn get_json(&self, request: reqwest::RequestBuilder) -> Result<serde_json::Value, FetchError> {
        let now_ms = Utc::now().timestamp_millis();
        if let Err(remaining) = self.rate_limit.check(now_ms) {
            return Err(FetchError::RateLimited {
                retry_after_secs: remaining,
            });
        }

        let resp = request.send().await.map_err(transport_error)?;

        let status = resp.status();
        self.rate_limit
            .observe(status, resp.headers(), Utc::now().timestamp_millis());

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let remaining = self
                .rate_limit
                .check(Utc::now().timestamp_millis())
                .err()
                .unwrap_or(0);
            return Err(FetchError::RateLimited {
                retry_after_secs: remaining,
            });
        }

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                status: status.as_u16(),
                body,
            });
        }

        resp.json()
            .await
            .map_err(|e| FetchError::Malformed(format!("body is not JSON: {e}")))
    }
}

#[async_trait]
impl PriceSource for CoinGeckoClient {
    #[instrument(skip(self), name = "coingecko::current_price")]
    async fn current_price(&self, asset: &str) -> Result<PricePoint, FetchError> {
        let body = self.get_json(self.simple_price_request(asset)?).await?;
        let point = parse_simple_price(&body, asset, &self.vs_currency, Utc::now())?;
        debug!(price = point.price, "current price fetched");
        Ok(point)
    }

    #[instrument(skip(self), name = "coingecko::history")]
    async fn history(&self, asset: &str, days: u32) -> Result<Vec<PricePoint>, FetchError> {
        let body = self.get_json(self.market_chart_request(asset, days)?).await?;
        let series = parse_market_chart(body)?;
        debug!(points = series.len(), "history fetched");
        Ok(series)
    }
}

fn transport_error(e: reqwest::Error) -> FetchError {
    FetchError::Transport(e.to_string())
}

/// Extract the quote from a `/simple/price` body.  Falls back to `fetched_at`
/// when the API omits `last_updated_at`.
fn parse_simple_price(
    body: &serde_json::Value,
    asset: &str,
    vs_currency: &str,
    fetched_at: DateTime<Utc>,
) -> Result<PricePoint, FetchError> {
    let entry = body
        .get(asset)
        .ok_or_else(|| FetchError::Malformed(format!("no quote for '{asset}'")))?;

    let price = entry
        .get(vs_currency)
        .and_then(|v| v.as_f64())
        .filter(|p| p.is_finite())
        .ok_or_else(|| FetchError::Malformed(format!("'{asset}.{vs_currency}' is not a number")))?;

    let timestamp = entry
        .get("last_updated_at")
        .and_then(|v| v.as_i64())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or(fetched_at);

    Ok(PricePoint::new(timestamp, price))
}

/// Convert a `/market_chart` body into price points in response order.
fn parse_market_chart(body: serde_json::Value) -> Result<Vec<PricePoint>, FetchError> {
    let chart: MarketChart = serde_json::from_value(body)
        .map_err(|e| FetchError::Malformed(format!("market_chart: {e}")))?;

    chart
        .prices
        .into_iter()
        .map(|(ms, price)| {
            let timestamp = Utc
                .timestamp_millis_opt(ms as i64)
                .single()
                .ok_or_else(|| FetchError::Malformed(format!("bad timestamp {ms}")))?;
            if !price.is_finite() {
                return Err(FetchError::Malformed(format!("non-finite price at {ms}")));
            }
            Ok(PricePoint::new(timestamp, price))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_simple_price_with_update_time() {
        let body = json!({ "bitcoin": { "usd": 64000.5, "last_updated_at": 1714550400 } });
        let p = parse_simple_price(&body, "bitcoin", "usd", Utc::now()).unwrap();
        assert_eq!(p.price, 64000.5);
        assert_eq!(p.timestamp.timestamp(), 1714550400);
    }

    #[test]
    fn simple_price_without_update_time_uses_fetch_time() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let body = json!({ "bitcoin": { "usd": 1.0 } });
        let p = parse_simple_price(&body, "bitcoin", "usd", now).unwrap();
        assert_eq!(p.timestamp, now);
    }

    #[test]
    fn simple_price_missing_asset_is_malformed() {
        let body = json!({ "ethereum": { "usd": 1.0 } });
        assert!(matches!(
            parse_simple_price(&body, "bitcoin", "usd", Utc::now()),
            Err(FetchError::Malformed(_))
        ));
        let body = json!({ "bitcoin": { "usd": "1.0" } });
        assert!(parse_simple_price(&body, "bitcoin", "usd", Utc::now()).is_err());
    }

    #[test]
    fn parses_market_chart() {
        let body = json!({
            "prices": [[1714550400000.0, 100.0], [1714554000000.0, 101.5]],
            "market_caps": [],
            "total_volumes": []
        });
        let series = parse_market_chart(body).unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series[1].price, 101.5);
        assert_eq!(series[1].timestamp.timestamp(), 1714554000);
    }

    #[test]
    fn market_chart_without_prices_is_malformed() {
        assert!(matches!(
            parse_market_chart(json!({ "error": "coin not found" })),
            Err(FetchError::Malformed(_))
        ));
    }

    #[test]
    fn request_urls_encode_asset_and_currency() {
        let c = CoinGeckoClient::new("http://localhost:1/api/v3", "usd&x=1", Duration::from_secs(1))
            .unwrap();

        let req = c.simple_price_request("bit coin/../x").unwrap().build().unwrap();
        assert_eq!(req.url().path(), "/api/v3/simple/price");
        let query: Vec<(String, String)> = req.url().query_pairs().into_owned().collect();
        assert_eq!(
            query,
            vec![
                ("ids".to_string(), "bit coin/../x".to_string()),
                ("vs_currencies".to_string(), "usd&x=1".to_string()),
                ("include_last_updated_at".to_string(), "true".to_string()),
            ]
        );

        let req = c.market_chart_request("bit coin/x", 7).unwrap().build().unwrap();
        assert_eq!(req.url().path(), "/api/v3/coins/bit%20coin%2Fx/market_chart");
        assert_eq!(req.url().query(), Some("vs_currency=usd%26x%3D1&days=7"));
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let c = CoinGeckoClient::new("http://localhost:1/api/v3/", "USD", Duration::from_secs(1))
            .unwrap();
        assert_eq!(c.base_url, "http://localhost:1/api/v3");
        assert_eq!(c.vs_currency, "usd");
    }
}
