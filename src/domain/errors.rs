use crate::domain::money::{Money, MoneyError};
use thiserror::Error;

/// Errors raised while constructing or validating ledger transactions
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("amount must be positive, got {0}")]
    NonPositiveAmount(Money),

    #[error("quantity must be at least 1")]
    ZeroQuantity,

    #[error("{kind} transaction requires field '{field}'")]
    MissingField { kind: String, field: String },

    #[error("{kind} transaction must not carry field '{field}'")]
    UnexpectedField { kind: String, field: String },

    #[error("cash delta {actual} does not match {expected} required by transaction kind")]
    CashDeltaMismatch { expected: Money, actual: Money },

    #[error("transaction timestamp {timestamp} lies in the future (now: {now})")]
    FutureTimestamp {
        timestamp: chrono::DateTime<chrono::Utc>,
        now: chrono::DateTime<chrono::Utc>,
    },

    #[error(transparent)]
    Money(#[from] MoneyError),
}

/// Errors raised by the ledger store
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("portfolio not found: {0}")]
    PortfolioNotFound(String),

    #[error("version conflict on portfolio {portfolio_id}: expected v{expected}, stored v{actual}")]
    ConcurrentModification {
        portfolio_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("storage failure: {0}")]
    Transient(#[from] anyhow::Error),
}

/// Error kinds surfaced by an external market-data provider adapter
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider does not know symbol '{0}'")]
    NotFound(String),

    #[error("provider rate limit hit")]
    RateLimited,

    #[error("provider rejected credentials: {0}")]
    Auth(String),

    #[error("provider transport failure: {0}")]
    Transient(#[source] anyhow::Error),
}

/// Errors raised by the market-data engine
#[derive(Debug, Error)]
pub enum MarketDataError {
    #[error("ticker not found: {0}")]
    TickerNotFound(String),

    #[error("market data unavailable for {ticker}: {reason}")]
    Unavailable { ticker: String, reason: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("market data backend failure: {0}")]
    Transient(#[from] anyhow::Error),
}

/// Errors raised by the pure ledger projections
#[derive(Debug, Error)]
pub enum ProjectionError {
    /// The ledger reached a state the write path must never permit.
    #[error("inconsistent ledger: {0}")]
    InconsistentLedger(String),

    #[error("insufficient shares of {ticker}: selling {requested} with {held} held")]
    InsufficientShares {
        ticker: String,
        requested: u64,
        held: u64,
    },

    #[error("no price available for held ticker {0}")]
    MissingPrice(String),

    #[error(transparent)]
    Money(#[from] MoneyError),
}

/// Failure taxonomy surfaced by the trade execution service. Each variant
/// maps to a distinct external error kind at the HTTP boundary.
#[derive(Debug, Error)]
pub enum TradeError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("portfolio not found: {0}")]
    NotFound(String),

    #[error("insufficient funds: need {need}, available {available}")]
    InsufficientFunds { need: Money, available: Money },

    #[error("insufficient shares of {ticker}: selling {requested} with {held} held")]
    InsufficientShares {
        ticker: String,
        requested: u64,
        held: u64,
    },

    #[error("ticker not found: {0}")]
    TickerNotFound(String),

    #[error("market data unavailable: {0}")]
    MarketDataUnavailable(String),

    #[error("conflicting concurrent update on portfolio {0}")]
    Conflict(String),

    #[error("inconsistent ledger: {0}")]
    InconsistentLedger(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<LedgerError> for TradeError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::PortfolioNotFound(id) => TradeError::NotFound(id),
            LedgerError::ConcurrentModification { portfolio_id, .. } => {
                TradeError::Conflict(portfolio_id)
            }
            LedgerError::InvalidArgument(reason) => TradeError::InvalidArgument(reason),
            LedgerError::Transient(e) => TradeError::Internal(e),
        }
    }
}

impl From<MarketDataError> for TradeError {
    fn from(e: MarketDataError) -> Self {
        match e {
            MarketDataError::TickerNotFound(t) => TradeError::TickerNotFound(t),
            MarketDataError::Unavailable { ticker, reason } => {
                TradeError::MarketDataUnavailable(format!("{ticker}: {reason}"))
            }
            MarketDataError::InvalidArgument(reason) => TradeError::InvalidArgument(reason),
            MarketDataError::Transient(e) => TradeError::MarketDataUnavailable(e.to_string()),
        }
    }
}

impl From<ProjectionError> for TradeError {
    fn from(e: ProjectionError) -> Self {
        match e {
            ProjectionError::InsufficientShares {
                ticker,
                requested,
                held,
            } => TradeError::InsufficientShares {
                ticker,
                requested,
                held,
            },
            ProjectionError::InconsistentLedger(reason) => TradeError::InconsistentLedger(reason),
            ProjectionError::MissingPrice(t) => {
                TradeError::MarketDataUnavailable(format!("no price for {t}"))
            }
            ProjectionError::Money(e) => TradeError::InvalidArgument(e.to_string()),
        }
    }
}

impl From<TransactionError> for TradeError {
    fn from(e: TransactionError) -> Self {
        TradeError::InvalidArgument(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_trade_error_formatting() {
        let err = TradeError::InsufficientFunds {
            need: Money::usd(dec!(1500)),
            available: Money::usd(dec!(100)),
        };
        let msg = err.to_string();
        assert!(msg.contains("1500"));
        assert!(msg.contains("100"));
    }

    #[test]
    fn test_ledger_conflict_maps_to_conflict() {
        let err: TradeError = LedgerError::ConcurrentModification {
            portfolio_id: "p-1".to_string(),
            expected: 3,
            actual: 4,
        }
        .into();
        assert!(matches!(err, TradeError::Conflict(id) if id == "p-1"));
    }
}
