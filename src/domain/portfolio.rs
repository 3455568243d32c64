use crate::domain::money::{Currency, Money};
use crate::domain::ticker::Ticker;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque stable portfolio identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortfolioId(Uuid);

impl PortfolioId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PortfolioId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PortfolioId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PortfolioId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A user's paper-trading account. Holds no balance fields: cash, holdings
/// and valuations are always derived from the transaction ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
    pub id: PortfolioId,
    pub owner_id: String,
    pub name: String,
    /// Base currency, fixed by the opening deposit.
    pub currency: Currency,
    pub created_at: DateTime<Utc>,
    /// Monotonic counter for optimistic concurrency on ledger appends.
    pub version: u64,
    pub archived: bool,
}

/// Derived position in one ticker, produced by folding the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub ticker: Ticker,
    pub quantity: u64,
    pub average_cost: Money,
}

impl Holding {
    pub fn cost_basis(&self) -> Money {
        self.average_cost.mul_quantity(self.quantity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_portfolio_id_round_trip() {
        let id = PortfolioId::new();
        let parsed: PortfolioId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_cost_basis() {
        let h = Holding {
            ticker: Ticker::new("AAPL").unwrap(),
            quantity: 10,
            average_cost: Money::usd(dec!(150.25)),
        };
        assert_eq!(h.cost_basis(), Money::usd(dec!(1502.50)));
    }
}
