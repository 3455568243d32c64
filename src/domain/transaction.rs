use crate::domain::errors::TransactionError;
use crate::domain::money::Money;
use crate::domain::portfolio::PortfolioId;
use crate::domain::ticker::Ticker;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransactionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionKind {
    Deposit,
    Withdraw,
    Buy,
    Sell,
}

impl TransactionKind {
    pub fn is_trade(&self) -> bool {
        matches!(self, TransactionKind::Buy | TransactionKind::Sell)
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionKind::Deposit => write!(f, "DEPOSIT"),
            TransactionKind::Withdraw => write!(f, "WITHDRAW"),
            TransactionKind::Buy => write!(f, "BUY"),
            TransactionKind::Sell => write!(f, "SELL"),
        }
    }
}

impl FromStr for TransactionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEPOSIT" => Ok(TransactionKind::Deposit),
            "WITHDRAW" => Ok(TransactionKind::Withdraw),
            "BUY" => Ok(TransactionKind::Buy),
            "SELL" => Ok(TransactionKind::Sell),
            other => Err(format!("unknown transaction kind: '{other}'")),
        }
    }
}

/// One immutable row of the ledger: the system of record.
///
/// `timestamp` is the effective trading time and may be historical for
/// backtests; `created_at` records when the row was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub portfolio_id: PortfolioId,
    pub kind: TransactionKind,
    pub timestamp: DateTime<Utc>,
    /// Signed: negative means cash leaves the portfolio.
    pub cash_delta: Money,
    pub ticker: Option<Ticker>,
    pub quantity: Option<u64>,
    pub unit_price: Option<Money>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    pub fn deposit(
        portfolio_id: PortfolioId,
        amount: Money,
        timestamp: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Result<Self, TransactionError> {
        if !amount.is_positive() {
            return Err(TransactionError::NonPositiveAmount(amount));
        }
        Ok(Self {
            id: TransactionId::new(),
            portfolio_id,
            kind: TransactionKind::Deposit,
            timestamp,
            cash_delta: amount,
            ticker: None,
            quantity: None,
            unit_price: None,
            notes: None,
            created_at,
        })
    }

    pub fn withdraw(
        portfolio_id: PortfolioId,
        amount: Money,
        timestamp: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Result<Self, TransactionError> {
        if !amount.is_positive() {
            return Err(TransactionError::NonPositiveAmount(amount));
        }
        Ok(Self {
            id: TransactionId::new(),
            portfolio_id,
            kind: TransactionKind::Withdraw,
            timestamp,
            cash_delta: -amount,
            ticker: None,
            quantity: None,
            unit_price: None,
            notes: None,
            created_at,
        })
    }

    pub fn buy(
        portfolio_id: PortfolioId,
        ticker: Ticker,
        quantity: u64,
        unit_price: Money,
        timestamp: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Result<Self, TransactionError> {
        if quantity == 0 {
            return Err(TransactionError::ZeroQuantity);
        }
        if !unit_price.is_positive() {
            return Err(TransactionError::NonPositiveAmount(unit_price));
        }
        Ok(Self {
            id: TransactionId::new(),
            portfolio_id,
            kind: TransactionKind::Buy,
            timestamp,
            cash_delta: -unit_price.mul_quantity(quantity),
            ticker: Some(ticker),
            quantity: Some(quantity),
            unit_price: Some(unit_price),
            notes: None,
            created_at,
        })
    }

    pub fn sell(
        portfolio_id: PortfolioId,
        ticker: Ticker,
        quantity: u64,
        unit_price: Money,
        timestamp: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Result<Self, TransactionError> {
        if quantity == 0 {
            return Err(TransactionError::ZeroQuantity);
        }
        if !unit_price.is_positive() {
            return Err(TransactionError::NonPositiveAmount(unit_price));
        }
        Ok(Self {
            id: TransactionId::new(),
            portfolio_id,
            kind: TransactionKind::Sell,
            timestamp,
            cash_delta: unit_price.mul_quantity(quantity),
            ticker: Some(ticker),
            quantity: Some(quantity),
            unit_price: Some(unit_price),
            notes: None,
            created_at,
        })
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Check the shape invariants for this transaction's kind:
    /// trade fields present/absent as required and `cash_delta` carrying the
    /// exact sign and magnitude the kind demands.
    pub fn validate(&self) -> Result<(), TransactionError> {
        match self.kind {
            TransactionKind::Deposit | TransactionKind::Withdraw => {
                self.ensure_no_trade_fields()?;
                let positive = self.kind == TransactionKind::Deposit;
                if positive != self.cash_delta.is_positive() || self.cash_delta.is_zero() {
                    return Err(TransactionError::CashDeltaMismatch {
                        expected: if positive {
                            self.cash_delta
                        } else {
                            -self.cash_delta
                        },
                        actual: self.cash_delta,
                    });
                }
                Ok(())
            }
            TransactionKind::Buy | TransactionKind::Sell => {
                let quantity = self.require(self.quantity, "quantity")?;
                let unit_price = self.require(self.unit_price, "unit_price")?;
                self.require(self.ticker.clone(), "ticker")?;
                if quantity == 0 {
                    return Err(TransactionError::ZeroQuantity);
                }
                let gross = unit_price.mul_quantity(quantity);
                let expected = if self.kind == TransactionKind::Buy {
                    -gross
                } else {
                    gross
                };
                if self.cash_delta != expected {
                    return Err(TransactionError::CashDeltaMismatch {
                        expected,
                        actual: self.cash_delta,
                    });
                }
                if !self.cash_delta.same_currency(&unit_price) {
                    return Err(TransactionError::Money(
                        crate::domain::money::MoneyError::CurrencyMismatch {
                            left: self.cash_delta.currency(),
                            right: unit_price.currency(),
                        },
                    ));
                }
                Ok(())
            }
        }
    }

    fn ensure_no_trade_fields(&self) -> Result<(), TransactionError> {
        for (present, field) in [
            (self.ticker.is_some(), "ticker"),
            (self.quantity.is_some(), "quantity"),
            (self.unit_price.is_some(), "unit_price"),
        ] {
            if present {
                return Err(TransactionError::UnexpectedField {
                    kind: self.kind.to_string(),
                    field: field.to_string(),
                });
            }
        }
        Ok(())
    }

    fn require<T>(&self, field: Option<T>, name: &str) -> Result<T, TransactionError> {
        field.ok_or_else(|| TransactionError::MissingField {
            kind: self.kind.to_string(),
            field: name.to_string(),
        })
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
    fn test_buy_cash_delta() {
        let t = Transaction::buy(
            PortfolioId::new(),
            Ticker::new("AAPL").unwrap(),
            10,
            Money::usd(dec!(150)),
            ts("2024-01-15T15:00:00Z"),
            ts("2024-01-15T15:00:00Z"),
        )
        .unwrap();
        assert_eq!(t.cash_delta, Money::usd(dec!(-1500)));
        t.validate().unwrap();
    }

    #[test]
    fn test_sell_cash_delta() {
        let t = Transaction::sell(
            PortfolioId::new(),
            Ticker::new("GOOG").unwrap(),
            5,
            Money::usd(dec!(99.50)),
            ts("2024-01-15T15:00:00Z"),
            ts("2024-01-15T15:00:00Z"),
        )
        .unwrap();
        assert_eq!(t.cash_delta, Money::usd(dec!(497.50)));
        t.validate().unwrap();
    }

    #[test]
    fn test_withdraw_is_negative() {
        let t = Transaction::withdraw(
            PortfolioId::new(),
            Money::usd(dec!(250)),
            ts("2024-01-15T15:00:00Z"),
            ts("2024-01-15T15:00:00Z"),
        )
        .unwrap();
        assert_eq!(t.cash_delta, Money::usd(dec!(-250)));
        t.validate().unwrap();
    }

    #[test]
    fn test_deposit_rejects_non_positive() {
        let now = ts("2024-01-15T15:00:00Z");
        assert!(Transaction::deposit(PortfolioId::new(), Money::usd(dec!(0)), now, now).is_err());
        assert!(
            Transaction::deposit(PortfolioId::new(), Money::usd(dec!(-10)), now, now).is_err()
        );
    }

    #[test]
    fn test_validate_catches_tampered_cash_delta() {
        let now = ts("2024-01-15T15:00:00Z");
        let mut t = Transaction::buy(
            PortfolioId::new(),
            Ticker::new("IBM").unwrap(),
            10,
            Money::usd(dec!(160)),
            now,
            now,
        )
        .unwrap();
        t.cash_delta = Money::usd(dec!(-1));
        assert!(matches!(
            t.validate(),
            Err(TransactionError::CashDeltaMismatch { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_trade_fields_on_deposit() {
        let now = ts("2024-01-15T15:00:00Z");
        let mut t = Transaction::deposit(PortfolioId::new(), Money::usd(dec!(100)), now, now).unwrap();
        t.ticker = Some(Ticker::new("AAPL").unwrap());
        assert!(matches!(
            t.validate(),
            Err(TransactionError::UnexpectedField { .. })
        ));
    }
}
