use crate::domain::clock::Clock;
use crate::domain::errors::ProviderError;
use crate::domain::money::Money;
use crate::domain::ports::{DailyBar, MarketDataProvider, ProviderQuote};
use crate::domain::price::Ohlcv;
use crate::domain::ticker::Ticker;
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

/// Deterministic clock for tests and backtests.
pub struct MockClock {
    now: RwLock<DateTime<Utc>>,
}

impl MockClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.write() {
            *guard = now;
        }
    }

    pub fn advance(&self, by: ChronoDuration) {
        if let Ok(mut guard) = self.now.write() {
            *guard += by;
        }
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.read().map(|guard| *guard).unwrap_or_else(|_| Utc::now())
    }
}

/// Failure modes the mock provider can be scripted to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    NotFound,
    RateLimited,
    Auth,
    Transient,
}

/// Scripted market-data provider: fixed quotes and series, optional forced
/// failures, and call counters so tests can assert exactly how many
/// provider calls the engine issued.
pub struct MockMarketDataProvider {
    quotes: RwLock<HashMap<Ticker, ProviderQuote>>,
    series: RwLock<HashMap<Ticker, Vec<DailyBar>>>,
    failure: RwLock<Option<MockFailure>>,
    current_calls: AtomicUsize,
    series_calls: AtomicUsize,
}

impl MockMarketDataProvider {
    pub fn new() -> Self {
        Self {
            quotes: RwLock::new(HashMap::new()),
            series: RwLock::new(HashMap::new()),
            failure: RwLock::new(None),
            current_calls: AtomicUsize::new(0),
            series_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_quote(&self, ticker: &Ticker, price: Money, timestamp: DateTime<Utc>) {
        if let Ok(mut quotes) = self.quotes.write() {
            quotes.insert(
                ticker.clone(),
                ProviderQuote {
                    ticker: ticker.clone(),
                    price,
                    timestamp,
                },
            );
        }
    }

    pub fn remove_quote(&self, ticker: &Ticker) {
        if let Ok(mut quotes) = self.quotes.write() {
            quotes.remove(ticker);
        }
    }

    pub fn set_series(&self, ticker: &Ticker, bars: Vec<DailyBar>) {
        if let Ok(mut series) = self.series.write() {
            series.insert(ticker.clone(), bars);
        }
    }

    /// Force every subsequent call to fail until cleared with `None`.
    pub fn fail_with(&self, failure: Option<MockFailure>) {
        if let Ok(mut guard) = self.failure.write() {
            *guard = failure;
        }
    }

    pub fn current_calls(&self) -> usize {
        self.current_calls.load(Ordering::SeqCst)
    }

    pub fn series_calls(&self) -> usize {
        self.series_calls.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.current_calls() + self.series_calls()
    }

    fn scripted_failure(&self, ticker: &Ticker) -> Option<ProviderError> {
        let failure = self.failure.read().ok().and_then(|guard| *guard)?;
        Some(match failure {
            MockFailure::NotFound => ProviderError::NotFound(ticker.to_string()),
            MockFailure::RateLimited => ProviderError::RateLimited,
            MockFailure::Auth => ProviderError::Auth("scripted auth failure".to_string()),
            MockFailure::Transient => {
                ProviderError::Transient(anyhow!("scripted transient failure"))
            }
        })
    }
}

impl Default for MockMarketDataProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketDataProvider for MockMarketDataProvider {
    async fn fetch_current(&self, ticker: &Ticker) -> Result<ProviderQuote, ProviderError> {
        self.current_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.scripted_failure(ticker) {
            return Err(err);
        }
        self.quotes
            .read()
            .ok()
            .and_then(|quotes| quotes.get(ticker).cloned())
            .ok_or_else(|| ProviderError::NotFound(ticker.to_string()))
    }

    async fn fetch_daily_series(&self, ticker: &Ticker) -> Result<Vec<DailyBar>, ProviderError> {
        self.series_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.scripted_failure(ticker) {
            return Err(err);
        }
        self.series
            .read()
            .ok()
            .and_then(|series| series.get(ticker).cloned())
            .ok_or_else(|| ProviderError::NotFound(ticker.to_string()))
    }
}

/// A USD daily close bar, stamped at the start of its trading day the way
/// provider adapters stamp daily series.
pub fn daily_bar(date: NaiveDate, close: Decimal) -> DailyBar {
    DailyBar {
        timestamp: date.and_time(NaiveTime::MIN).and_utc(),
        close: Money::usd(close),
        ohlcv: Some(Ohlcv {
            open: close,
            high: close,
            low: close,
            close,
            volume: Decimal::ZERO,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn test_mock_clock_advances() {
        let clock = MockClock::at(ts("2024-01-16T14:00:00Z"));
        clock.advance(ChronoDuration::minutes(5));
        assert_eq!(clock.now(), ts("2024-01-16T14:05:00Z"));
        clock.set(ts("2024-02-01T00:00:00Z"));
        assert_eq!(clock.now(), ts("2024-02-01T00:00:00Z"));
    }

    #[tokio::test]
    async fn test_mock_provider_counts_calls() {
        let provider = MockMarketDataProvider::new();
        let aapl = Ticker::new("AAPL").unwrap();
        provider.set_quote(&aapl, Money::usd(dec!(150)), ts("2024-01-16T14:00:00Z"));

        assert!(provider.fetch_current(&aapl).await.is_ok());
        assert!(provider.fetch_current(&aapl).await.is_ok());
        assert_eq!(provider.current_calls(), 2);

        let unknown = Ticker::new("NOPE").unwrap();
        assert!(matches!(
            provider.fetch_current(&unknown).await,
            Err(ProviderError::NotFound(_))
        ));
        assert_eq!(provider.current_calls(), 3);
    }

    #[tokio::test]
    async fn test_scripted_failure() {
        let provider = MockMarketDataProvider::new();
        let aapl = Ticker::new("AAPL").unwrap();
        provider.set_quote(&aapl, Money::usd(dec!(150)), ts("2024-01-16T14:00:00Z"));
        provider.fail_with(Some(MockFailure::RateLimited));
        assert!(matches!(
            provider.fetch_current(&aapl).await,
            Err(ProviderError::RateLimited)
        ));
        provider.fail_with(None);
        assert!(provider.fetch_current(&aapl).await.is_ok());
    }
}
