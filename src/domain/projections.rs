//! Pure folds over ledger streams.
//!
//! Every function here is deterministic and side-effect free: no clock, no
//! I/O. Callers pick the ledger prefix with `as_of` and supply prices as a
//! pre-resolved map, which makes the same code serve both live valuation and
//! historical backtests.

use crate::domain::errors::ProjectionError;
use crate::domain::money::{Currency, Money};
use crate::domain::portfolio::Holding;
use crate::domain::price::{PricePoint, PriceSource};
use crate::domain::ticker::Ticker;
use crate::domain::transaction::{Transaction, TransactionKind};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};

/// Decimal places kept on an average cost after each buy.
const AVG_COST_SCALE: u32 = 4;

/// Valuation of one derived holding against a resolved price.
#[derive(Debug, Clone, PartialEq)]
pub struct HoldingValuation {
    pub holding: Holding,
    pub price: PricePoint,
    pub market_value: Money,
    pub unrealized_pnl: Money,
}

/// Full point-in-time valuation of a portfolio.
#[derive(Debug, Clone, PartialEq)]
pub struct PortfolioValuation {
    pub cash: Money,
    pub holdings: Vec<HoldingValuation>,
    pub total_value: Money,
    /// True when any price in the valuation was served stale.
    pub stale: bool,
}

/// Order transactions the way every projection replays them:
/// `(timestamp ASC, id ASC)`. The id tie-break keeps replay deterministic
/// for equal timestamps.
fn replay_order(transactions: &[Transaction], as_of: Option<DateTime<Utc>>) -> Vec<&Transaction> {
    let mut txns: Vec<&Transaction> = transactions
        .iter()
        .filter(|t| as_of.is_none_or(|cutoff| t.timestamp <= cutoff))
        .collect();
    txns.sort_by(|a, b| (a.timestamp, a.id).cmp(&(b.timestamp, b.id)));
    txns
}

/// Sum of signed cash deltas up to `as_of` inclusive.
///
/// The running sum is checked at every prefix: a negative intermediate
/// balance means the write path admitted an overdraw, which is an
/// `InconsistentLedger` condition, never a business error.
pub fn project_cash(
    transactions: &[Transaction],
    currency: Currency,
    as_of: Option<DateTime<Utc>>,
) -> Result<Money, ProjectionError> {
    let mut cash = Money::zero(currency);
    for txn in replay_order(transactions, as_of) {
        cash = cash.checked_add(txn.cash_delta)?;
        if cash.is_negative() {
            return Err(ProjectionError::InconsistentLedger(format!(
                "cash went negative ({cash}) after transaction {} at {}",
                txn.id, txn.timestamp
            )));
        }
    }
    Ok(cash)
}

/// Fold trades into per-ticker holdings with average-cost basis.
///
/// BUY blends the trade into the average cost (banker's rounding to four
/// decimal places); SELL reduces quantity and leaves the average cost
/// untouched, removing the holding when it reaches zero.
pub fn project_holdings(
    transactions: &[Transaction],
    as_of: Option<DateTime<Utc>>,
) -> Result<Vec<Holding>, ProjectionError> {
    let mut positions: BTreeMap<Ticker, (u64, Money)> = BTreeMap::new();

    for txn in replay_order(transactions, as_of) {
        if !txn.kind.is_trade() {
            continue;
        }
        let (ticker, quantity, unit_price) =
            match (&txn.ticker, txn.quantity, txn.unit_price) {
                (Some(t), Some(q), Some(p)) => (t, q, p),
                _ => {
                    return Err(ProjectionError::InconsistentLedger(format!(
                        "trade transaction {} is missing trade fields",
                        txn.id
                    )));
                }
            };

        match txn.kind {
            TransactionKind::Buy => {
                let entry = positions
                    .entry(ticker.clone())
                    .or_insert((0, Money::zero(unit_price.currency())));
                let (held, avg) = *entry;
                let new_qty = held + quantity;
                let blended = (avg.mul_quantity(held).checked_add(unit_price.mul_quantity(quantity)))?;
                let new_avg = Money::new(
                    blended.amount() / Decimal::from(new_qty),
                    blended.currency(),
                )
                .round_dp(AVG_COST_SCALE);
                *entry = (new_qty, new_avg);
            }
            TransactionKind::Sell => {
                let held = positions.get(ticker).map(|(q, _)| *q).unwrap_or(0);
                if quantity > held {
                    return Err(ProjectionError::InsufficientShares {
                        ticker: ticker.to_string(),
                        requested: quantity,
                        held,
                    });
                }
                if quantity == held {
                    positions.remove(ticker);
                } else if let Some(entry) = positions.get_mut(ticker) {
                    entry.0 = held - quantity;
                }
            }
            _ => {}
        }
    }

    Ok(positions
        .into_iter()
        .map(|(ticker, (quantity, average_cost))| Holding {
            ticker,
            quantity,
            average_cost,
        })
        .collect())
}

/// Value holdings against pre-resolved prices.
///
/// `total_value = cash + sum(quantity * price)`; per-holding market value and
/// unrealized P/L come along. Missing or mixed-currency prices are errors.
pub fn project_valuation(
    cash: Money,
    holdings: &[Holding],
    prices: &HashMap<Ticker, PricePoint>,
) -> Result<PortfolioValuation, ProjectionError> {
    let mut total = cash;
    let mut valued = Vec::with_capacity(holdings.len());
    let mut stale = false;

    for holding in holdings {
        let point = prices
            .get(&holding.ticker)
            .ok_or_else(|| ProjectionError::MissingPrice(holding.ticker.to_string()))?;
        let market_value = point.price.mul_quantity(holding.quantity);
        let unrealized = market_value.checked_sub(holding.cost_basis())?;
        total = total.checked_add(market_value)?;
        stale |= point.source == PriceSource::Stale;
        valued.push(HoldingValuation {
            holding: holding.clone(),
            price: point.clone(),
            market_value,
            unrealized_pnl: unrealized,
        });
    }

    Ok(PortfolioValuation {
        cash,
        holdings: valued,
        total_value: total,
        stale,
    })
}

/// Realized profit over the ledger: for each SELL,
/// `quantity * (unit_price - average_cost_at_time_of_sale)` on the
/// average-cost basis maintained by the holdings fold.
pub fn realized_pnl(
    transactions: &[Transaction],
    currency: Currency,
    as_of: Option<DateTime<Utc>>,
) -> Result<Money, ProjectionError> {
    let mut positions: BTreeMap<Ticker, (u64, Money)> = BTreeMap::new();
    let mut pnl = Money::zero(currency);

    for txn in replay_order(transactions, as_of) {
        let (ticker, quantity, unit_price) =
            match (&txn.ticker, txn.quantity, txn.unit_price) {
                (Some(t), Some(q), Some(p)) if txn.kind.is_trade() => (t, q, p),
                _ => continue,
            };
        match txn.kind {
            TransactionKind::Buy => {
                let entry = positions
                    .entry(ticker.clone())
                    .or_insert((0, Money::zero(unit_price.currency())));
                let (held, avg) = *entry;
                let new_qty = held + quantity;
                let blended = (avg.mul_quantity(held).checked_add(unit_price.mul_quantity(quantity)))?;
                let new_avg = Money::new(
                    blended.amount() / Decimal::from(new_qty),
                    blended.currency(),
                )
                .round_dp(AVG_COST_SCALE);
                *entry = (new_qty, new_avg);
            }
            TransactionKind::Sell => {
                let (held, avg) = positions
                    .get(ticker)
                    .copied()
                    .unwrap_or((0, Money::zero(unit_price.currency())));
                if quantity > held {
                    return Err(ProjectionError::InsufficientShares {
                        ticker: ticker.to_string(),
                        requested: quantity,
                        held,
                    });
                }
                let gain = unit_price.checked_sub(avg)?.mul_quantity(quantity);
                pnl = pnl.checked_add(gain)?;
                if quantity == held {
                    positions.remove(ticker);
                } else if let Some(entry) = positions.get_mut(ticker) {
                    entry.0 = held - quantity;
                }
            }
            _ => {}
        }
    }

    Ok(pnl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::portfolio::PortfolioId;
    use crate::domain::price::PriceInterval;
    use rust_decimal_macros::dec;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn ticker(s: &str) -> Ticker {
        Ticker::new(s).unwrap()
    }

    struct LedgerBuilder {
        portfolio_id: PortfolioId,
        txns: Vec<Transaction>,
    }

    impl LedgerBuilder {
        fn new() -> Self {
            Self {
                portfolio_id: PortfolioId::new(),
                txns: Vec::new(),
            }
        }

        fn deposit(mut self, amount: Decimal, at: &str) -> Self {
            self.txns.push(
                Transaction::deposit(self.portfolio_id, Money::usd(amount), ts(at), ts(at))
                    .unwrap(),
            );
            self
        }

        fn withdraw(mut self, amount: Decimal, at: &str) -> Self {
            self.txns.push(
                Transaction::withdraw(self.portfolio_id, Money::usd(amount), ts(at), ts(at))
                    .unwrap(),
            );
            self
        }

        fn buy(mut self, sym: &str, qty: u64, price: Decimal, at: &str) -> Self {
            self.txns.push(
                Transaction::buy(
                    self.portfolio_id,
                    ticker(sym),
                    qty,
                    Money::usd(price),
                    ts(at),
                    ts(at),
                )
                .unwrap(),
            );
            self
        }

        fn sell(mut self, sym: &str, qty: u64, price: Decimal, at: &str) -> Self {
            self.txns.push(
                Transaction::sell(
                    self.portfolio_id,
                    ticker(sym),
                    qty,
                    Money::usd(price),
                    ts(at),
                    ts(at),
                )
                .unwrap(),
            );
            self
        }

        fn build(self) -> Vec<Transaction> {
            self.txns
        }
    }

    #[test]
    fn test_project_cash_simple() {
        let txns = LedgerBuilder::new()
            .deposit(dec!(10000), "2024-01-10T10:00:00Z")
            .buy("AAPL", 10, dec!(150), "2024-01-11T10:00:00Z")
            .build();
        let cash = project_cash(&txns, Currency::USD, None).unwrap();
        assert_eq!(cash, Money::usd(dec!(8500)));
    }

    #[test]
    fn test_project_cash_as_of_prefix() {
        let txns = LedgerBuilder::new()
            .deposit(dec!(10000), "2024-01-10T10:00:00Z")
            .buy("IBM", 10, dec!(160), "2024-01-15T15:00:00Z")
            .build();
        let before = project_cash(&txns, Currency::USD, Some(ts("2024-01-14T00:00:00Z"))).unwrap();
        let after = project_cash(&txns, Currency::USD, Some(ts("2024-01-16T00:00:00Z"))).unwrap();
        assert_eq!(before, Money::usd(dec!(10000)));
        assert_eq!(after, Money::usd(dec!(8400)));
    }

    #[test]
    fn test_project_cash_detects_negative_prefix() {
        // A backdated withdraw slipped before the deposit: the fold must
        // flag it even though the final sum is positive.
        let txns = LedgerBuilder::new()
            .withdraw(dec!(50), "2024-01-09T10:00:00Z")
            .deposit(dec!(10000), "2024-01-10T10:00:00Z")
            .build();
        assert!(matches!(
            project_cash(&txns, Currency::USD, None),
            Err(ProjectionError::InconsistentLedger(_))
        ));
    }

    #[test]
    fn test_project_holdings_average_cost() {
        let txns = LedgerBuilder::new()
            .deposit(dec!(10000), "2024-01-10T10:00:00Z")
            .buy("AAPL", 10, dec!(100), "2024-01-11T10:00:00Z")
            .buy("AAPL", 10, dec!(120), "2024-01-12T10:00:00Z")
            .build();
        let holdings = project_holdings(&txns, None).unwrap();
        assert_eq!(holdings.len(), 1);
        assert_eq!(holdings[0].quantity, 20);
        assert_eq!(holdings[0].average_cost, Money::usd(dec!(110.0000)));
    }

    #[test]
    fn test_sell_keeps_average_cost() {
        let txns = LedgerBuilder::new()
            .deposit(dec!(10000), "2024-01-10T10:00:00Z")
            .buy("AAPL", 10, dec!(100), "2024-01-11T10:00:00Z")
            .sell("AAPL", 4, dec!(130), "2024-01-12T10:00:00Z")
            .build();
        let holdings = project_holdings(&txns, None).unwrap();
        assert_eq!(holdings[0].quantity, 6);
        assert_eq!(holdings[0].average_cost, Money::usd(dec!(100.0000)));
    }

    #[test]
    fn test_sell_to_zero_removes_holding() {
        let txns = LedgerBuilder::new()
            .deposit(dec!(10000), "2024-01-10T10:00:00Z")
            .buy("AAPL", 10, dec!(100), "2024-01-11T10:00:00Z")
            .sell("AAPL", 10, dec!(100), "2024-01-12T10:00:00Z")
            .build();
        assert!(project_holdings(&txns, None).unwrap().is_empty());
    }

    #[test]
    fn test_oversell_detected_at_prefix() {
        let txns = LedgerBuilder::new()
            .deposit(dec!(10000), "2024-01-10T10:00:00Z")
            .buy("GOOG", 5, dec!(100), "2024-01-11T10:00:00Z")
            .sell("GOOG", 6, dec!(100), "2024-01-12T10:00:00Z")
            .build();
        assert!(matches!(
            project_holdings(&txns, None),
            Err(ProjectionError::InsufficientShares {
                requested: 6,
                held: 5,
                ..
            })
        ));
    }

    #[test]
    fn test_replay_is_permutation_independent() {
        let txns = LedgerBuilder::new()
            .deposit(dec!(10000), "2024-01-10T10:00:00Z")
            .buy("AAPL", 10, dec!(100), "2024-01-11T10:00:00Z")
            .sell("AAPL", 5, dec!(120), "2024-01-12T10:00:00Z")
            .buy("AAPL", 3, dec!(90), "2024-01-13T10:00:00Z")
            .build();
        let mut shuffled = txns.clone();
        shuffled.reverse();
        assert_eq!(
            project_holdings(&txns, None).unwrap(),
            project_holdings(&shuffled, None).unwrap()
        );
        assert_eq!(
            project_cash(&txns, Currency::USD, None).unwrap(),
            project_cash(&shuffled, Currency::USD, None).unwrap()
        );
    }

    #[test]
    fn test_valuation_matches_cash_and_prices() {
        let txns = LedgerBuilder::new()
            .deposit(dec!(10000), "2024-01-10T10:00:00Z")
            .buy("AAPL", 10, dec!(150), "2024-01-11T10:00:00Z")
            .build();
        let cash = project_cash(&txns, Currency::USD, None).unwrap();
        let holdings = project_holdings(&txns, None).unwrap();

        let mut prices = HashMap::new();
        prices.insert(
            ticker("AAPL"),
            PricePoint {
                ticker: ticker("AAPL"),
                price: Money::usd(dec!(160)),
                timestamp: ts("2024-01-12T15:00:00Z"),
                source: PriceSource::Provider,
                interval: PriceInterval::Realtime,
            },
        );

        let valuation = project_valuation(cash, &holdings, &prices).unwrap();
        assert_eq!(valuation.cash, Money::usd(dec!(8500)));
        assert_eq!(valuation.total_value, Money::usd(dec!(10100)));
        assert_eq!(valuation.holdings[0].market_value, Money::usd(dec!(1600)));
        assert_eq!(valuation.holdings[0].unrealized_pnl, Money::usd(dec!(100)));
        assert!(!valuation.stale);
    }

    #[test]
    fn test_valuation_flags_stale_prices() {
        let txns = LedgerBuilder::new()
            .deposit(dec!(1000), "2024-01-10T10:00:00Z")
            .buy("AAPL", 1, dec!(150), "2024-01-11T10:00:00Z")
            .build();
        let cash = project_cash(&txns, Currency::USD, None).unwrap();
        let holdings = project_holdings(&txns, None).unwrap();
        let mut prices = HashMap::new();
        prices.insert(
            ticker("AAPL"),
            PricePoint {
                ticker: ticker("AAPL"),
                price: Money::usd(dec!(148)),
                timestamp: ts("2024-01-11T21:00:00Z"),
                source: PriceSource::Stale,
                interval: PriceInterval::Realtime,
            },
        );
        assert!(project_valuation(cash, &holdings, &prices).unwrap().stale);
    }

    #[test]
    fn test_valuation_missing_price_is_error() {
        let txns = LedgerBuilder::new()
            .deposit(dec!(1000), "2024-01-10T10:00:00Z")
            .buy("AAPL", 1, dec!(150), "2024-01-11T10:00:00Z")
            .build();
        let cash = project_cash(&txns, Currency::USD, None).unwrap();
        let holdings = project_holdings(&txns, None).unwrap();
        assert!(matches!(
            project_valuation(cash, &holdings, &HashMap::new()),
            Err(ProjectionError::MissingPrice(_))
        ));
    }

    #[test]
    fn test_realized_pnl_round_trip_is_zero() {
        // Buy then sell the same quantity at the same price: zero realized
        // P/L and holdings back to the pre-buy state.
        let txns = LedgerBuilder::new()
            .deposit(dec!(10000), "2024-01-10T10:00:00Z")
            .buy("AAPL", 10, dec!(150), "2024-01-11T10:00:00Z")
            .sell("AAPL", 10, dec!(150), "2024-01-12T10:00:00Z")
            .build();
        assert_eq!(
            realized_pnl(&txns, Currency::USD, None).unwrap(),
            Money::usd(dec!(0))
        );
        assert!(project_holdings(&txns, None).unwrap().is_empty());
    }

    #[test]
    fn test_realized_pnl_uses_average_cost() {
        let txns = LedgerBuilder::new()
            .deposit(dec!(10000), "2024-01-10T10:00:00Z")
            .buy("AAPL", 10, dec!(100), "2024-01-11T10:00:00Z")
            .buy("AAPL", 10, dec!(120), "2024-01-12T10:00:00Z")
            // Average cost is 110; selling 5 at 130 realizes 5 * 20 = 100
            .sell("AAPL", 5, dec!(130), "2024-01-13T10:00:00Z")
            .build();
        assert_eq!(
            realized_pnl(&txns, Currency::USD, None).unwrap(),
            Money::usd(dec!(100.0000))
        );
    }
}
