use crate::application::market_data::MarketDataEngine;
use crate::domain::clock::Clock;
use crate::domain::errors::{LedgerError, TradeError};
use crate::domain::money::Money;
use crate::domain::portfolio::{Portfolio, PortfolioId};
use crate::domain::price::{PriceInterval, PricePoint, PriceSource};
use crate::domain::projections::{
    project_cash, project_holdings, project_valuation, realized_pnl, PortfolioValuation,
};
use crate::domain::ports::{PortfolioRepository, TransactionFilter};
use crate::domain::ticker::Ticker;
use crate::domain::transaction::Transaction;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Optimistic-lock retries before surfacing `Conflict`.
const MAX_COMMIT_ATTEMPTS: u32 = 3;

/// Extra attempts allowed when the store reports a transient I/O failure.
const MAX_TRANSIENT_RETRIES: u32 = 1;

const BACKOFF_MIN_MS: u64 = 20;
const BACKOFF_MAX_MS: u64 = 200;

/// Point-in-time view of a portfolio: everything derived from the ledger.
#[derive(Debug, Clone)]
pub struct PortfolioState {
    pub portfolio: Portfolio,
    pub as_of: DateTime<Utc>,
    pub valuation: PortfolioValuation,
    pub realized_pnl: Money,
}

/// Validates trades, resolves execution prices through the market-data
/// engine and appends ledger entries under optimistic concurrency.
pub struct TradeExecutionService {
    ledger: Arc<dyn PortfolioRepository>,
    engine: Arc<MarketDataEngine>,
    clock: Arc<dyn Clock>,
}

impl TradeExecutionService {
    pub fn new(
        ledger: Arc<dyn PortfolioRepository>,
        engine: Arc<MarketDataEngine>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger,
            engine,
            clock,
        }
    }

    pub async fn create_portfolio(
        &self,
        owner_id: &str,
        name: &str,
        initial_deposit: Money,
    ) -> Result<Portfolio, TradeError> {
        if owner_id.trim().is_empty() || name.trim().is_empty() {
            return Err(TradeError::InvalidArgument(
                "owner_id and name must be non-empty".to_string(),
            ));
        }
        if !initial_deposit.is_positive() {
            return Err(TradeError::InvalidArgument(format!(
                "initial deposit must be positive, got {initial_deposit}"
            )));
        }
        let portfolio = self
            .ledger
            .create_portfolio(owner_id, name, initial_deposit)
            .await?;
        info!(
            "Created portfolio {} ('{}') for {} with {}",
            portfolio.id, portfolio.name, owner_id, initial_deposit
        );
        Ok(portfolio)
    }

    pub async fn list_portfolios(&self, owner_id: &str) -> Result<Vec<Portfolio>, TradeError> {
        Ok(self.ledger.list_portfolios(owner_id).await?)
    }

    pub async fn list_transactions(
        &self,
        portfolio_id: PortfolioId,
        filter: &TransactionFilter,
    ) -> Result<Vec<Transaction>, TradeError> {
        // Surface NotFound for unknown portfolios rather than an empty list
        self.ledger.get_portfolio(portfolio_id).await?;
        Ok(self.ledger.list_transactions(portfolio_id, filter).await?)
    }

    /// Cash, holdings and valuation at `as_of` (now when absent). Prices
    /// come from the engine; a holding whose price cannot be resolved at
    /// all is valued at its average cost and flagged stale, so one dead
    /// ticker cannot take down the whole view.
    pub async fn portfolio_state(
        &self,
        portfolio_id: PortfolioId,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<PortfolioState, TradeError> {
        let portfolio = self.ledger.get_portfolio(portfolio_id).await?;
        let now = self.clock.now();
        let effective = as_of.unwrap_or(now);
        if effective > now {
            return Err(TradeError::InvalidArgument(format!(
                "as_of {effective} lies in the future"
            )));
        }

        let transactions = self
            .ledger
            .transactions_at_or_before(portfolio_id, effective)
            .await?;
        let cash = project_cash(&transactions, portfolio.currency, None)?;
        let holdings = project_holdings(&transactions, None)?;

        let mut prices: HashMap<Ticker, PricePoint> = HashMap::new();
        for holding in &holdings {
            let resolved = match as_of {
                None => self.engine.get_current_price(&holding.ticker).await,
                Some(ts) => self.engine.get_price_at(&holding.ticker, ts).await,
            };
            let point = match resolved {
                Ok(point) => point,
                Err(e) => {
                    // Conservative fallback: value at cost, marked stale
                    warn!(
                        "No price for held ticker {}: {}; valuing at average cost",
                        holding.ticker, e
                    );
                    PricePoint {
                        ticker: holding.ticker.clone(),
                        price: holding.average_cost,
                        timestamp: effective,
                        source: PriceSource::Stale,
                        interval: PriceInterval::Realtime,
                    }
                }
            };
            prices.insert(holding.ticker.clone(), point);
        }

        let valuation = project_valuation(cash, &holdings, &prices)?;
        let realized = realized_pnl(&transactions, portfolio.currency, None)?;

        Ok(PortfolioState {
            portfolio,
            as_of: effective,
            valuation,
            realized_pnl: realized,
        })
    }

    pub async fn deposit(
        &self,
        portfolio_id: PortfolioId,
        amount: Money,
    ) -> Result<Transaction, TradeError> {
        if !amount.is_positive() {
            return Err(TradeError::InvalidArgument(format!(
                "deposit must be positive, got {amount}"
            )));
        }
        self.commit_with_retries(portfolio_id, |portfolio, _txns, now| {
            ensure_currency(portfolio, amount)?;
            Ok(Transaction::deposit(portfolio.id, amount, now, now)?)
        })
        .await
    }

    pub async fn withdraw(
        &self,
        portfolio_id: PortfolioId,
        amount: Money,
    ) -> Result<Transaction, TradeError> {
        if !amount.is_positive() {
            return Err(TradeError::InvalidArgument(format!(
                "withdrawal must be positive, got {amount}"
            )));
        }
        self.commit_with_retries(portfolio_id, |portfolio, txns, now| {
            ensure_currency(portfolio, amount)?;
            let cash = project_cash(txns, portfolio.currency, None)?;
            if cash.checked_cmp(&amount).map_err(|e| {
                TradeError::InvalidArgument(e.to_string())
            })? == std::cmp::Ordering::Less
            {
                return Err(TradeError::InsufficientFunds {
                    need: amount,
                    available: cash,
                });
            }
            Ok(Transaction::withdraw(portfolio.id, amount, now, now)?)
        })
        .await
    }

    pub async fn execute_buy(
        &self,
        portfolio_id: PortfolioId,
        ticker: &Ticker,
        quantity: u64,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Transaction, TradeError> {
        let price = self.resolve_trade_price(ticker, quantity, as_of).await?;
        self.commit_with_retries(portfolio_id, |portfolio, txns, now| {
            ensure_currency(portfolio, price.price)?;
            let effective = as_of.unwrap_or(now);
            let cash = project_cash(txns, portfolio.currency, Some(effective))?;
            let cost = price.price.mul_quantity(quantity);
            if cash
                .checked_cmp(&cost)
                .map_err(|e| TradeError::InvalidArgument(e.to_string()))?
                == std::cmp::Ordering::Less
            {
                return Err(TradeError::InsufficientFunds {
                    need: cost,
                    available: cash,
                });
            }
            Ok(Transaction::buy(
                portfolio.id,
                ticker.clone(),
                quantity,
                price.price,
                effective,
                now,
            )?)
        })
        .await
    }

    pub async fn execute_sell(
        &self,
        portfolio_id: PortfolioId,
        ticker: &Ticker,
        quantity: u64,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Transaction, TradeError> {
        let price = self.resolve_trade_price(ticker, quantity, as_of).await?;
        self.commit_with_retries(portfolio_id, |portfolio, txns, now| {
            ensure_currency(portfolio, price.price)?;
            let effective = as_of.unwrap_or(now);
            let holdings = project_holdings(txns, Some(effective))?;
            let held = holdings
                .iter()
                .find(|h| h.ticker == *ticker)
                .map(|h| h.quantity)
                .unwrap_or(0);
            if held < quantity {
                return Err(TradeError::InsufficientShares {
                    ticker: ticker.to_string(),
                    requested: quantity,
                    held,
                });
            }
            Ok(Transaction::sell(
                portfolio.id,
                ticker.clone(),
                quantity,
                price.price,
                effective,
                now,
            )?)
        })
        .await
    }

    pub async fn set_archived(
        &self,
        portfolio_id: PortfolioId,
        archived: bool,
    ) -> Result<(), TradeError> {
        Ok(self.ledger.set_archived(portfolio_id, archived).await?)
    }

    /// Shared trade preamble: argument validation and price resolution.
    /// Resolving the price before touching the ledger keeps failed trades
    /// at a single provider call.
    async fn resolve_trade_price(
        &self,
        ticker: &Ticker,
        quantity: u64,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<PricePoint, TradeError> {
        if quantity == 0 {
            return Err(TradeError::InvalidArgument(
                "quantity must be at least 1".to_string(),
            ));
        }
        if let Some(ts) = as_of
            && ts > self.clock.now()
        {
            return Err(TradeError::InvalidArgument(format!(
                "as_of {ts} lies in the future"
            )));
        }
        let price = match as_of {
            None => self.engine.get_current_price(ticker).await?,
            Some(ts) => self.engine.get_price_at(ticker, ts).await?,
        };
        Ok(price)
    }

    /// Load-validate-append loop under optimistic locking.
    ///
    /// `build` sees the freshly loaded portfolio and its ledger prefix at
    /// the trade's effective time and returns the transaction to append.
    /// Version conflicts re-run the whole loop (the state that justified
    /// the trade may be gone); transient storage failures get one retry.
    async fn commit_with_retries<F>(
        &self,
        portfolio_id: PortfolioId,
        build: F,
    ) -> Result<Transaction, TradeError>
    where
        F: Fn(&Portfolio, &[Transaction], DateTime<Utc>) -> Result<Transaction, TradeError>,
    {
        let mut conflicts = 0u32;
        let mut transient_retries = 0u32;

        loop {
            let now = self.clock.now();
            let portfolio = self.ledger.get_portfolio(portfolio_id).await?;
            let transactions = self
                .ledger
                .transactions_at_or_before(portfolio_id, now)
                .await?;

            let transaction = build(&portfolio, &transactions, now)?;
            self.check_candidate_ledger(&portfolio, &transactions, &transaction)?;

            match self
                .ledger
                .append_transactions(portfolio_id, portfolio.version, &[transaction.clone()])
                .await
            {
                Ok(version) => {
                    info!(
                        "Committed {} on portfolio {} (v{})",
                        transaction.kind, portfolio_id, version
                    );
                    return Ok(transaction);
                }
                Err(LedgerError::ConcurrentModification { expected, actual, .. }) => {
                    conflicts += 1;
                    if conflicts >= MAX_COMMIT_ATTEMPTS {
                        warn!(
                            "Giving up on portfolio {} after {} version conflicts",
                            portfolio_id, conflicts
                        );
                        return Err(TradeError::Conflict(portfolio_id.to_string()));
                    }
                    debug!(
                        "Version conflict on portfolio {} (expected v{}, stored v{}), retrying",
                        portfolio_id, expected, actual
                    );
                    let backoff = jittered_backoff();
                    tokio::time::sleep(backoff).await;
                }
                Err(LedgerError::Transient(e)) => {
                    transient_retries += 1;
                    if transient_retries > MAX_TRANSIENT_RETRIES {
                        return Err(TradeError::Internal(e));
                    }
                    warn!(
                        "Transient storage failure on portfolio {}, retrying once: {:#}",
                        portfolio_id, e
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Replay the ledger with the candidate inserted at its effective
    /// position. A backdated trade can pass the at-effective checks yet
    /// still overdraw or oversell a later prefix; it must be rejected
    /// before it is written, never after.
    fn check_candidate_ledger(
        &self,
        portfolio: &Portfolio,
        transactions: &[Transaction],
        candidate: &Transaction,
    ) -> Result<(), TradeError> {
        let mut ledger = transactions.to_vec();
        ledger.push(candidate.clone());
        if let Err(e) = project_cash(&ledger, portfolio.currency, None) {
            return Err(match e {
                crate::domain::errors::ProjectionError::InconsistentLedger(_) => {
                    TradeError::InvalidArgument(
                        "trade would overdraw the portfolio at a later ledger point".to_string(),
                    )
                }
                other => other.into(),
            });
        }
        if candidate.kind.is_trade() {
            project_holdings(&ledger, None)?;
        }
        Ok(())
    }
}

fn ensure_currency(portfolio: &Portfolio, money: Money) -> Result<(), TradeError> {
    if money.currency() != portfolio.currency {
        return Err(TradeError::InvalidArgument(format!(
            "currency {} does not match portfolio currency {}",
            money.currency(),
            portfolio.currency
        )));
    }
    Ok(())
}

fn jittered_backoff() -> Duration {
    // ThreadRng is not Send; keep it out of any await
    let millis = {
        use rand::Rng;
        rand::rng().random_range(BACKOFF_MIN_MS..=BACKOFF_MAX_MS)
    };
    Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_stays_in_bounds() {
        for _ in 0..100 {
            let d = jittered_backoff();
            assert!(d >= Duration::from_millis(BACKOFF_MIN_MS));
            assert!(d <= Duration::from_millis(BACKOFF_MAX_MS));
        }
    }
}
