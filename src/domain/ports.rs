//! Port Abstractions
//!
//! Trait seams between the core and its adapters: the durable stores, the
//! hot cache and the external market-data provider. The application layer
//! depends only on these traits; SQLite, in-memory and HTTP implementations
//! live under `infrastructure`.

use crate::domain::errors::{LedgerError, ProviderError};
use crate::domain::money::Money;
use crate::domain::portfolio::{Portfolio, PortfolioId};
use crate::domain::price::{Ohlcv, PriceInterval, PriceRow};
use crate::domain::ticker::Ticker;
use crate::domain::transaction::{Transaction, TransactionKind};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Optional constraints for `list_transactions`.
#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub kinds: Option<Vec<TransactionKind>>,
}

/// Durable, append-only ledger store (portfolios + transactions).
///
/// Writes are serializable at the portfolio grain; the `expected_version`
/// check on append is the optimistic lock that serializes concurrent trades
/// on one portfolio without blocking others.
#[async_trait]
pub trait PortfolioRepository: Send + Sync {
    /// Create the portfolio row and its opening DEPOSIT transaction in one
    /// unit of work. Fails with `InvalidArgument` when
    /// `initial_deposit <= 0`.
    async fn create_portfolio(
        &self,
        owner_id: &str,
        name: &str,
        initial_deposit: Money,
    ) -> Result<Portfolio, LedgerError>;

    async fn get_portfolio(&self, id: PortfolioId) -> Result<Portfolio, LedgerError>;

    /// All portfolios of one owner, ordered by `created_at` ascending.
    async fn list_portfolios(&self, owner_id: &str) -> Result<Vec<Portfolio>, LedgerError>;

    /// Atomically append a transaction group and bump the version.
    ///
    /// Returns the new stored version. Transactions whose ids already exist
    /// are skipped (retry safety); a group consisting only of already-seen
    /// ids leaves the portfolio untouched and returns the stored version.
    async fn append_transactions(
        &self,
        portfolio_id: PortfolioId,
        expected_version: u64,
        transactions: &[Transaction],
    ) -> Result<u64, LedgerError>;

    /// Transactions ordered `(timestamp ASC, id ASC)` - the stable
    /// tie-break guarantees deterministic replay.
    async fn list_transactions(
        &self,
        portfolio_id: PortfolioId,
        filter: &TransactionFilter,
    ) -> Result<Vec<Transaction>, LedgerError>;

    /// Ledger prefix for point-in-time projection.
    async fn transactions_at_or_before(
        &self,
        portfolio_id: PortfolioId,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, LedgerError>;

    /// Portfolios are never deleted; archiving hides them instead.
    async fn set_archived(&self, id: PortfolioId, archived: bool) -> Result<(), LedgerError>;
}

/// Durable historical price store (the warm tier).
#[async_trait]
pub trait PriceRepository: Send + Sync {
    /// Most recent row for the ticker at REALTIME or DAILY interval.
    async fn get_latest(&self, ticker: &Ticker) -> Result<Option<PriceRow>>;

    /// Nearest row with `timestamp <= as_of`, not older than `not_before`.
    async fn get_at(
        &self,
        ticker: &Ticker,
        as_of: DateTime<Utc>,
        not_before: DateTime<Utc>,
    ) -> Result<Option<PriceRow>>;

    /// Rows in `[start, end]` at the given interval, ascending by
    /// timestamp, capped at `limit` rows.
    async fn get_range(
        &self,
        ticker: &Ticker,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: PriceInterval,
        limit: usize,
    ) -> Result<Vec<PriceRow>>;

    /// Bulk insert-or-replace on the `(ticker, timestamp, interval)` key.
    async fn upsert(&self, rows: &[PriceRow]) -> Result<()>;

    /// Tickers held (non-zero projected quantity) or traded since `since`;
    /// drives the background refresher.
    async fn list_active_tickers(&self, since: DateTime<Utc>) -> Result<Vec<Ticker>>;
}

/// Ephemeral key-value cache in front of the warm store. Values are opaque
/// strings (the engine stores JSON); expiry is handled by the cache.
#[async_trait]
pub trait HotCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// A raw current quote from the external provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderQuote {
    pub ticker: Ticker,
    pub price: Money,
    pub timestamp: DateTime<Utc>,
}

/// One day of the provider's daily series.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyBar {
    pub timestamp: DateTime<Utc>,
    pub close: Money,
    pub ohlcv: Option<Ohlcv>,
}

/// External market-data source (the cold tier). Calls are expensive and
/// quota-bound; the engine owns all rate limiting and caching around them.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn fetch_current(&self, ticker: &Ticker) -> Result<ProviderQuote, ProviderError>;

    /// The provider's full daily close series for the ticker, ascending.
    async fn fetch_daily_series(&self, ticker: &Ticker) -> Result<Vec<DailyBar>, ProviderError>;
}
