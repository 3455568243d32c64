use crate::domain::money::Money;
use crate::domain::ticker::Ticker;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which tier of the market-data stack produced a price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceSource {
    Provider,
    WarmStore,
    HotCache,
    /// Warm/hot data served while the authoritative provider is unreachable
    /// or rate-limited.
    Stale,
}

impl fmt::Display for PriceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriceSource::Provider => write!(f, "PROVIDER"),
            PriceSource::WarmStore => write!(f, "WARM_STORE"),
            PriceSource::HotCache => write!(f, "HOT_CACHE"),
            PriceSource::Stale => write!(f, "STALE"),
        }
    }
}

impl FromStr for PriceSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PROVIDER" => Ok(PriceSource::Provider),
            "WARM_STORE" => Ok(PriceSource::WarmStore),
            "HOT_CACHE" => Ok(PriceSource::HotCache),
            "STALE" => Ok(PriceSource::Stale),
            other => Err(format!("unknown price source: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PriceInterval {
    Realtime,
    Hourly,
    Daily,
}

impl fmt::Display for PriceInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriceInterval::Realtime => write!(f, "REALTIME"),
            PriceInterval::Hourly => write!(f, "HOURLY"),
            PriceInterval::Daily => write!(f, "DAILY"),
        }
    }
}

impl FromStr for PriceInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REALTIME" => Ok(PriceInterval::Realtime),
            "HOURLY" => Ok(PriceInterval::Hourly),
            "DAILY" => Ok(PriceInterval::Daily),
            other => Err(format!("unknown price interval: '{other}'")),
        }
    }
}

/// A single resolved price as returned by the market-data engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub ticker: Ticker,
    pub price: Money,
    pub timestamp: DateTime<Utc>,
    pub source: PriceSource,
    pub interval: PriceInterval,
}

impl PricePoint {
    pub fn with_source(mut self, source: PriceSource) -> Self {
        self.source = source;
        self
    }
}

/// Optional open/high/low/close/volume detail carried on warm-store rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ohlcv {
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// One durable row of the historical price store, unique on
/// `(ticker, timestamp, interval)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRow {
    pub ticker: Ticker,
    pub timestamp: DateTime<Utc>,
    pub interval: PriceInterval,
    pub price: Money,
    pub ohlcv: Option<Ohlcv>,
    pub source: PriceSource,
    pub created_at: DateTime<Utc>,
}

impl PriceRow {
    pub fn to_point(&self, source: PriceSource) -> PricePoint {
        PricePoint {
            ticker: self.ticker.clone(),
            price: self.price,
            timestamp: self.timestamp,
            source,
            interval: self.interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_source_round_trip() {
        for s in [
            PriceSource::Provider,
            PriceSource::WarmStore,
            PriceSource::HotCache,
            PriceSource::Stale,
        ] {
            assert_eq!(s.to_string().parse::<PriceSource>().unwrap(), s);
        }
    }

    #[test]
    fn test_interval_round_trip() {
        for iv in [
            PriceInterval::Realtime,
            PriceInterval::Hourly,
            PriceInterval::Daily,
        ] {
            assert_eq!(iv.to_string().parse::<PriceInterval>().unwrap(), iv);
        }
    }

    #[test]
    fn test_row_to_point_overrides_source() {
        let row = PriceRow {
            ticker: Ticker::new("AAPL").unwrap(),
            timestamp: "2024-01-15T21:00:00Z".parse().unwrap(),
            interval: PriceInterval::Daily,
            price: Money::usd(dec!(150)),
            ohlcv: None,
            source: PriceSource::Provider,
            created_at: "2024-01-15T21:00:05Z".parse().unwrap(),
        };
        assert_eq!(row.to_point(PriceSource::Stale).source, PriceSource::Stale);
    }
}
