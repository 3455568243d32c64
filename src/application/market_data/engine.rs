use crate::application::market_data::freshness::FreshnessPolicy;
use crate::application::market_data::rate_limiter::ProviderRateLimiter;
use crate::application::market_data::single_flight::SingleFlight;
use crate::domain::clock::Clock;
use crate::domain::errors::{MarketDataError, ProviderError};
use crate::domain::ports::{DailyBar, HotCache, MarketDataProvider, PriceRepository, ProviderQuote};
use crate::domain::price::{PriceInterval, PricePoint, PriceRow, PriceSource};
use crate::domain::ticker::Ticker;
use anyhow::anyhow;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Tolerated clock skew on provider timestamps.
const CLOCK_SKEW_TOLERANCE: ChronoDuration = ChronoDuration::minutes(1);

/// How far back a point-in-time lookup may reach for the nearest price.
const POINT_LOOKBACK_TRADING_DAYS: usize = 5;

/// Cap on rows returned by a single range query.
const MAX_RANGE_ROWS: usize = 10_000;

#[derive(Debug, Clone, Copy)]
pub struct MarketDataEngineConfig {
    /// Timeout for one outbound provider call, distinct from any caller
    /// deadline.
    pub provider_timeout: Duration,
}

impl Default for MarketDataEngineConfig {
    fn default() -> Self {
        Self {
            provider_timeout: Duration::from_secs(10),
        }
    }
}

/// Tiered read-through cache over the external price provider.
///
/// Resolution walks hot cache, warm store, then the provider, degrading to
/// stale warm data when the provider is rate-limited or failing. All
/// freshness decisions delegate to the [`FreshnessPolicy`]; all provider
/// traffic passes the [`ProviderRateLimiter`].
pub struct MarketDataEngine {
    provider: Arc<dyn MarketDataProvider>,
    prices: Arc<dyn PriceRepository>,
    hot: Arc<dyn HotCache>,
    limiter: Arc<ProviderRateLimiter>,
    clock: Arc<dyn Clock>,
    policy: FreshnessPolicy,
    flights: SingleFlight,
    config: MarketDataEngineConfig,
}

impl MarketDataEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<dyn MarketDataProvider>,
        prices: Arc<dyn PriceRepository>,
        hot: Arc<dyn HotCache>,
        limiter: Arc<ProviderRateLimiter>,
        clock: Arc<dyn Clock>,
        policy: FreshnessPolicy,
        config: MarketDataEngineConfig,
    ) -> Self {
        Self {
            provider,
            prices,
            hot,
            limiter,
            clock,
            policy,
            flights: SingleFlight::new(),
            config,
        }
    }

    /// Current price for a ticker: hot cache, then fresh warm data, then
    /// the provider, then stale warm data as a last resort.
    pub async fn get_current_price(&self, ticker: &Ticker) -> Result<PricePoint, MarketDataError> {
        let key = current_key(ticker);
        if let Some(point) = self.read_hot_point(&key).await {
            return Ok(point.with_source(PriceSource::HotCache));
        }

        // Coalesce concurrent misses for the same ticker
        let _flight = self.flights.lock(&key).await;
        if let Some(point) = self.read_hot_point(&key).await {
            return Ok(point.with_source(PriceSource::HotCache));
        }

        let now = self.clock.now();
        let warm = self
            .prices
            .get_latest(ticker)
            .await
            .map_err(MarketDataError::Transient)?;

        if let Some(row) = &warm
            && self.policy.is_current_fresh(row.timestamp, now)
        {
            let point = row.to_point(PriceSource::WarmStore);
            self.write_hot_point(&key, &point, self.policy.current_cache_ttl(now))
                .await;
            return Ok(point);
        }

        if self.limiter.try_acquire().await {
            match self.call_provider_current(ticker).await {
                Ok(quote) => {
                    let point = self.store_quote(ticker, quote, &key).await;
                    return Ok(point);
                }
                Err(ProviderError::NotFound(symbol)) => {
                    return Err(MarketDataError::TickerNotFound(symbol));
                }
                Err(e) => {
                    warn!("Provider current fetch failed for {}: {}", ticker, e);
                }
            }
        } else {
            debug!("Provider budget depleted, degrading {} to cache", ticker);
        }

        match warm {
            Some(row) => {
                warn!("Serving stale price for {} from {}", ticker, row.timestamp);
                Ok(row.to_point(PriceSource::Stale))
            }
            None => Err(MarketDataError::Unavailable {
                ticker: ticker.to_string(),
                reason: "provider unreachable and no cached price exists".to_string(),
            }),
        }
    }

    /// Price in effect at a historical instant: the nearest stored row at
    /// or before `as_of`, reaching back at most five trading days. A miss
    /// triggers an on-demand daily-series backfill.
    pub async fn get_price_at(
        &self,
        ticker: &Ticker,
        as_of: DateTime<Utc>,
    ) -> Result<PricePoint, MarketDataError> {
        let now = self.clock.now();
        if as_of > now + CLOCK_SKEW_TOLERANCE {
            return Err(MarketDataError::InvalidArgument(format!(
                "as_of {as_of} lies in the future"
            )));
        }

        let not_before = self
            .policy
            .calendar()
            .trading_days_back(as_of.date_naive(), POINT_LOOKBACK_TRADING_DAYS)
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc())
            .unwrap_or(as_of - ChronoDuration::days(POINT_LOOKBACK_TRADING_DAYS as i64 * 2));

        if let Some(row) = self
            .prices
            .get_at(ticker, as_of, not_before)
            .await
            .map_err(MarketDataError::Transient)?
        {
            return Ok(row.to_point(PriceSource::WarmStore));
        }

        // Warm miss: backfill the provider's daily series on demand
        let flight_key = format!("price:at:{ticker}");
        let _flight = self.flights.lock(&flight_key).await;

        if !self.limiter.try_acquire().await {
            return Err(MarketDataError::Unavailable {
                ticker: ticker.to_string(),
                reason: format!("no stored price near {as_of} and provider budget depleted"),
            });
        }
        match self.call_provider_series(ticker).await {
            Ok(bars) => {
                self.store_series(ticker, &bars).await;
            }
            Err(ProviderError::NotFound(symbol)) => {
                return Err(MarketDataError::TickerNotFound(symbol));
            }
            Err(e) => {
                warn!("Provider series fetch failed for {}: {}", ticker, e);
                return Err(MarketDataError::Unavailable {
                    ticker: ticker.to_string(),
                    reason: format!("no stored price near {as_of}: {e}"),
                });
            }
        }

        match self
            .prices
            .get_at(ticker, as_of, not_before)
            .await
            .map_err(MarketDataError::Transient)?
        {
            Some(row) => Ok(row.to_point(PriceSource::Provider)),
            None => Err(MarketDataError::Unavailable {
                ticker: ticker.to_string(),
                reason: format!("provider has no data within 5 trading days of {as_of}"),
            }),
        }
    }

    /// Historical series over `[start, end]`. Daily requests read through
    /// to the provider when warm coverage is incomplete; other intervals
    /// are served from whatever the warm store holds.
    pub async fn get_price_history(
        &self,
        ticker: &Ticker,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: PriceInterval,
    ) -> Result<Vec<PricePoint>, MarketDataError> {
        if start > end {
            return Err(MarketDataError::InvalidArgument(format!(
                "range start {start} is after end {end}"
            )));
        }
        let now = self.clock.now();

        let key = range_key(ticker, start, end, interval);
        if let Some(points) = self.read_hot_series(&key).await
            && self.is_series_usable(&points, start, end, interval, now)
        {
            return Ok(points
                .into_iter()
                .map(|p| p.with_source(PriceSource::HotCache))
                .collect());
        }

        let _flight = self.flights.lock(&key).await;
        if let Some(points) = self.read_hot_series(&key).await
            && self.is_series_usable(&points, start, end, interval, now)
        {
            return Ok(points
                .into_iter()
                .map(|p| p.with_source(PriceSource::HotCache))
                .collect());
        }

        let warm_rows = self
            .prices
            .get_range(ticker, start, end, interval, MAX_RANGE_ROWS)
            .await
            .map_err(MarketDataError::Transient)?;
        let warm_points: Vec<PricePoint> = warm_rows
            .iter()
            .map(|r| r.to_point(PriceSource::WarmStore))
            .collect();

        if self.is_series_usable(&warm_points, start, end, interval, now) {
            self.write_hot_series(&key, &warm_points, now).await;
            return Ok(warm_points);
        }

        if interval == PriceInterval::Daily && self.limiter.try_acquire().await {
            match self.call_provider_series(ticker).await {
                Ok(bars) => {
                    self.store_series(ticker, &bars).await;
                    let rows = self
                        .prices
                        .get_range(ticker, start, end, interval, MAX_RANGE_ROWS)
                        .await
                        .map_err(MarketDataError::Transient)?;
                    let points: Vec<PricePoint> = rows
                        .iter()
                        .map(|r| r.to_point(PriceSource::Provider))
                        .collect();
                    self.write_hot_series(&key, &points, now).await;
                    return Ok(points);
                }
                Err(ProviderError::NotFound(symbol)) => {
                    return Err(MarketDataError::TickerNotFound(symbol));
                }
                Err(e) => {
                    warn!("Provider series fetch failed for {}: {}", ticker, e);
                }
            }
        }

        if !warm_points.is_empty() {
            warn!(
                "Serving partial stale series for {} ({} rows)",
                ticker,
                warm_points.len()
            );
            return Ok(warm_points
                .into_iter()
                .map(|p| p.with_source(PriceSource::Stale))
                .collect());
        }

        Err(MarketDataError::Unavailable {
            ticker: ticker.to_string(),
            reason: "provider unreachable and no cached series exists".to_string(),
        })
    }

    // ===== provider calls =====

    async fn call_provider_current(
        &self,
        ticker: &Ticker,
    ) -> Result<ProviderQuote, ProviderError> {
        let now = self.clock.now();
        let quote = match timeout(
            self.config.provider_timeout,
            self.provider.fetch_current(ticker),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(ProviderError::Transient(anyhow!(
                    "provider call timed out after {:?}",
                    self.config.provider_timeout
                )));
            }
        };

        if !quote.price.is_positive() {
            return Err(ProviderError::Transient(anyhow!(
                "provider returned non-positive price {} for {}",
                quote.price,
                ticker
            )));
        }
        if quote.timestamp > now + CLOCK_SKEW_TOLERANCE {
            return Err(ProviderError::Transient(anyhow!(
                "provider returned future timestamp {} for {}",
                quote.timestamp,
                ticker
            )));
        }
        Ok(quote)
    }

    async fn call_provider_series(&self, ticker: &Ticker) -> Result<Vec<DailyBar>, ProviderError> {
        let now = self.clock.now();
        let bars = match timeout(
            self.config.provider_timeout,
            self.provider.fetch_daily_series(ticker),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(ProviderError::Transient(anyhow!(
                    "provider call timed out after {:?}",
                    self.config.provider_timeout
                )));
            }
        };
        // Keep only sane bars; a bad row must not poison the warm store
        Ok(bars
            .into_iter()
            .filter(|b| b.close.is_positive() && b.timestamp <= now + CLOCK_SKEW_TOLERANCE)
            .collect())
    }

    // ===== persistence of provider results =====

    async fn store_quote(&self, ticker: &Ticker, quote: ProviderQuote, key: &str) -> PricePoint {
        let now = self.clock.now();
        let point = PricePoint {
            ticker: ticker.clone(),
            price: quote.price,
            timestamp: quote.timestamp,
            source: PriceSource::Provider,
            interval: PriceInterval::Realtime,
        };
        let row = PriceRow {
            ticker: ticker.clone(),
            timestamp: quote.timestamp,
            interval: PriceInterval::Realtime,
            price: quote.price,
            ohlcv: None,
            source: PriceSource::Provider,
            created_at: now,
        };
        // Read-your-writes depends on the warm upsert; a failure here is
        // logged loudly but the caller still gets the fetched price
        if let Err(e) = self.prices.upsert(std::slice::from_ref(&row)).await {
            warn!("Failed to persist quote for {}: {:#}", ticker, e);
        }
        self.write_hot_point(key, &point, self.policy.current_cache_ttl(now))
            .await;
        info!("Fetched {} @ {} from provider", ticker, point.price);
        point
    }

    async fn store_series(&self, ticker: &Ticker, bars: &[DailyBar]) {
        let now = self.clock.now();
        let rows: Vec<PriceRow> = bars
            .iter()
            .map(|bar| PriceRow {
                ticker: ticker.clone(),
                timestamp: bar.timestamp,
                interval: PriceInterval::Daily,
                price: bar.close,
                ohlcv: bar.ohlcv.clone(),
                source: PriceSource::Provider,
                created_at: now,
            })
            .collect();
        if let Err(e) = self.prices.upsert(&rows).await {
            warn!("Failed to persist {} daily rows for {}: {:#}", rows.len(), ticker, e);
        } else {
            info!("Backfilled {} daily rows for {}", rows.len(), ticker);
        }
    }

    // ===== hot-cache helpers =====

    async fn read_hot_point(&self, key: &str) -> Option<PricePoint> {
        match self.hot.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str::<PricePoint>(&raw) {
                Ok(point) => Some(point),
                Err(e) => {
                    warn!("Dropping undecodable hot-cache entry {}: {}", key, e);
                    let _ = self.hot.delete(key).await;
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Hot-cache read failed for {}: {:#}", key, e);
                None
            }
        }
    }

    async fn write_hot_point(&self, key: &str, point: &PricePoint, ttl: Duration) {
        match serde_json::to_string(point) {
            Ok(raw) => {
                if let Err(e) = self.hot.set(key, &raw, ttl).await {
                    warn!("Hot-cache write failed for {}: {:#}", key, e);
                }
            }
            Err(e) => warn!("Failed to encode price point for {}: {}", key, e),
        }
    }

    async fn read_hot_series(&self, key: &str) -> Option<Vec<PricePoint>> {
        match self.hot.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<PricePoint>>(&raw) {
                Ok(points) => Some(points),
                Err(e) => {
                    warn!("Dropping undecodable hot-cache entry {}: {}", key, e);
                    let _ = self.hot.delete(key).await;
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Hot-cache read failed for {}: {:#}", key, e);
                None
            }
        }
    }

    async fn write_hot_series(&self, key: &str, points: &[PricePoint], now: DateTime<Utc>) {
        let Some(freshest) = points.iter().map(|p| p.timestamp).max() else {
            return;
        };
        let ttl = self.policy.history_cache_ttl(freshest, now);
        match serde_json::to_string(points) {
            Ok(raw) => {
                if let Err(e) = self.hot.set(key, &raw, ttl).await {
                    warn!("Hot-cache write failed for {}: {:#}", key, e);
                }
            }
            Err(e) => warn!("Failed to encode series for {}: {}", key, e),
        }
    }

    /// Whether a cached/stored series can satisfy the request without the
    /// provider. Daily series must pass the completeness policy; other
    /// intervals are usable whenever non-empty.
    fn is_series_usable(
        &self,
        points: &[PricePoint],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: PriceInterval,
        now: DateTime<Utc>,
    ) -> bool {
        match interval {
            PriceInterval::Daily => {
                let expected = self.policy.expected_trading_days(start, end, now);
                if expected.is_empty() {
                    // No trading days can exist in the window; an empty
                    // series is the correct answer
                    return true;
                }
                if points.is_empty() {
                    return false;
                }
                let covered: BTreeSet<_> =
                    points.iter().map(|p| p.timestamp.date_naive()).collect();
                self.policy
                    .is_daily_series_complete(&covered, start, end, now)
            }
            _ => !points.is_empty(),
        }
    }
}

fn current_key(ticker: &Ticker) -> String {
    format!("price:current:{ticker}")
}

fn range_key(
    ticker: &Ticker,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    interval: PriceInterval,
) -> String {
    format!(
        "price:range:{ticker}:{}:{}:{interval}",
        start.timestamp(),
        end.timestamp()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_keys_are_stable() {
        let t = Ticker::new("AAPL").unwrap();
        assert_eq!(current_key(&t), "price:current:AAPL");
        let start: DateTime<Utc> = "2024-01-08T00:00:00Z".parse().unwrap();
        let end: DateTime<Utc> = "2024-01-14T00:00:00Z".parse().unwrap();
        assert_eq!(
            range_key(&t, start, end, PriceInterval::Daily),
            "price:range:AAPL:1704672000:1705190400:DAILY"
        );
    }
}
