use crate::domain::clock::Clock;
use crate::domain::errors::LedgerError;
use crate::domain::money::{Currency, Money};
use crate::domain::portfolio::{Portfolio, PortfolioId};
use crate::domain::ports::{PortfolioRepository, TransactionFilter};
use crate::domain::transaction::{Transaction, TransactionId, TransactionKind};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// Tolerated clock skew on effective timestamps at write time.
const WRITE_SKEW_TOLERANCE: ChronoDuration = ChronoDuration::minutes(1);

pub struct SqlitePortfolioRepository {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SqlitePortfolioRepository {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }
}

#[async_trait]
impl PortfolioRepository for SqlitePortfolioRepository {
    async fn create_portfolio(
        &self,
        owner_id: &str,
        name: &str,
        initial_deposit: Money,
    ) -> Result<Portfolio, LedgerError> {
        if !initial_deposit.is_positive() {
            return Err(LedgerError::InvalidArgument(format!(
                "initial deposit must be positive, got {initial_deposit}"
            )));
        }

        let now = self.clock.now();
        let portfolio = Portfolio {
            id: PortfolioId::new(),
            owner_id: owner_id.to_string(),
            name: name.to_string(),
            currency: initial_deposit.currency(),
            created_at: now,
            version: 1,
            archived: false,
        };
        let opening = Transaction::deposit(portfolio.id, initial_deposit, now, now)
            .map_err(|e| LedgerError::InvalidArgument(e.to_string()))?
            .with_notes("opening deposit");

        let mut tx = self
            .pool
            .begin()
            .await
            .context("beginning create_portfolio transaction")?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO portfolios (id, owner_id, name, currency, created_at, version, archived)
            VALUES (?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(portfolio.id.to_string())
        .bind(&portfolio.owner_id)
        .bind(&portfolio.name)
        .bind(portfolio.currency.as_str())
        .bind(portfolio.created_at.timestamp_millis())
        .bind(portfolio.version as i64)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            if is_unique_violation(&e) {
                return Err(LedgerError::InvalidArgument(format!(
                    "owner {owner_id} already has a portfolio named '{name}'"
                )));
            }
            return Err(LedgerError::Transient(
                anyhow!(e).context("inserting portfolio row"),
            ));
        }

        insert_transaction(&mut tx, &opening).await?;

        tx.commit()
            .await
            .context("committing create_portfolio transaction")?;

        debug!("Created portfolio {} for owner {}", portfolio.id, owner_id);
        Ok(portfolio)
    }

    async fn get_portfolio(&self, id: PortfolioId) -> Result<Portfolio, LedgerError> {
        let row = sqlx::query("SELECT * FROM portfolios WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("loading portfolio")?;

        match row {
            Some(row) => Ok(portfolio_from_row(&row)?),
            None => Err(LedgerError::PortfolioNotFound(id.to_string())),
        }
    }

    async fn list_portfolios(&self, owner_id: &str) -> Result<Vec<Portfolio>, LedgerError> {
        let rows = sqlx::query(
            "SELECT * FROM portfolios WHERE owner_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .context("listing portfolios")?;

        rows.iter().map(portfolio_from_row).collect()
    }

    async fn append_transactions(
        &self,
        portfolio_id: PortfolioId,
        expected_version: u64,
        transactions: &[Transaction],
    ) -> Result<u64, LedgerError> {
        if transactions.is_empty() {
            return Err(LedgerError::InvalidArgument(
                "transaction group must not be empty".to_string(),
            ));
        }
        let now = self.clock.now();
        for txn in transactions {
            if txn.portfolio_id != portfolio_id {
                return Err(LedgerError::InvalidArgument(format!(
                    "transaction {} targets portfolio {}, not {}",
                    txn.id, txn.portfolio_id, portfolio_id
                )));
            }
            if txn.timestamp > now + WRITE_SKEW_TOLERANCE {
                return Err(LedgerError::InvalidArgument(format!(
                    "transaction timestamp {} lies in the future",
                    txn.timestamp
                )));
            }
            txn.validate()
                .map_err(|e| LedgerError::InvalidArgument(e.to_string()))?;
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .context("beginning append transaction")?;

        let stored: Option<i64> =
            sqlx::query_scalar("SELECT version FROM portfolios WHERE id = ?")
                .bind(portfolio_id.to_string())
                .fetch_optional(&mut *tx)
                .await
                .context("reading portfolio version")?;
        let Some(stored) = stored else {
            return Err(LedgerError::PortfolioNotFound(portfolio_id.to_string()));
        };
        let stored = stored as u64;

        // Idempotent retry safety: already-written ids are skipped, and a
        // group of nothing but replays leaves the version untouched
        let mut fresh = Vec::with_capacity(transactions.len());
        for txn in transactions {
            let seen: Option<String> =
                sqlx::query_scalar("SELECT id FROM transactions WHERE id = ?")
                    .bind(txn.id.to_string())
                    .fetch_optional(&mut *tx)
                    .await
                    .context("checking transaction id")?;
            if seen.is_none() {
                fresh.push(txn);
            }
        }
        if fresh.is_empty() {
            debug!(
                "Append of {} transaction(s) on {} was a pure replay",
                transactions.len(),
                portfolio_id
            );
            return Ok(stored);
        }

        // Commit-time optimistic lock: the guarded update is the authority
        let bumped = sqlx::query(
            "UPDATE portfolios SET version = version + 1 WHERE id = ? AND version = ?",
        )
        .bind(portfolio_id.to_string())
        .bind(expected_version as i64)
        .execute(&mut *tx)
        .await
        .context("bumping portfolio version")?;

        if bumped.rows_affected() == 0 {
            return Err(LedgerError::ConcurrentModification {
                portfolio_id: portfolio_id.to_string(),
                expected: expected_version,
                actual: stored,
            });
        }

        for txn in fresh {
            insert_transaction(&mut tx, txn).await?;
        }

        tx.commit().await.context("committing append")?;
        Ok(expected_version + 1)
    }

    async fn list_transactions(
        &self,
        portfolio_id: PortfolioId,
        filter: &TransactionFilter,
    ) -> Result<Vec<Transaction>, LedgerError> {
        let mut sql = String::from("SELECT * FROM transactions WHERE portfolio_id = ?");
        if filter.from.is_some() {
            sql.push_str(" AND timestamp >= ?");
        }
        if filter.to.is_some() {
            sql.push_str(" AND timestamp <= ?");
        }
        if let Some(kinds) = &filter.kinds {
            if kinds.is_empty() {
                return Ok(Vec::new());
            }
            let placeholders = vec!["?"; kinds.len()].join(", ");
            sql.push_str(&format!(" AND kind IN ({placeholders})"));
        }
        sql.push_str(" ORDER BY timestamp ASC, id ASC");

        let mut query = sqlx::query(&sql).bind(portfolio_id.to_string());
        if let Some(from) = filter.from {
            query = query.bind(from.timestamp_millis());
        }
        if let Some(to) = filter.to {
            query = query.bind(to.timestamp_millis());
        }
        if let Some(kinds) = &filter.kinds {
            for kind in kinds {
                query = query.bind(kind.to_string());
            }
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .context("listing transactions")?;
        rows.iter().map(transaction_from_row).collect()
    }

    async fn transactions_at_or_before(
        &self,
        portfolio_id: PortfolioId,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM transactions
            WHERE portfolio_id = ? AND timestamp <= ?
            ORDER BY timestamp ASC, id ASC
            "#,
        )
        .bind(portfolio_id.to_string())
        .bind(as_of.timestamp_millis())
        .fetch_all(&self.pool)
        .await
        .context("loading ledger prefix")?;

        rows.iter().map(transaction_from_row).collect()
    }

    async fn set_archived(&self, id: PortfolioId, archived: bool) -> Result<(), LedgerError> {
        let updated = sqlx::query("UPDATE portfolios SET archived = ? WHERE id = ?")
            .bind(archived)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .context("setting archived flag")?;
        if updated.rows_affected() == 0 {
            return Err(LedgerError::PortfolioNotFound(id.to_string()));
        }
        Ok(())
    }
}

async fn insert_transaction(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    txn: &Transaction,
) -> Result<(), LedgerError> {
    sqlx::query(
        r#"
        INSERT INTO transactions
        (id, portfolio_id, kind, timestamp, cash_amount, cash_currency,
         ticker, quantity, unit_amount, unit_currency, notes, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(txn.id.to_string())
    .bind(txn.portfolio_id.to_string())
    .bind(txn.kind.to_string())
    .bind(txn.timestamp.timestamp_millis())
    .bind(txn.cash_delta.amount().to_string())
    .bind(txn.cash_delta.currency().as_str())
    .bind(txn.ticker.as_ref().map(|t| t.to_string()))
    .bind(txn.quantity.map(|q| q as i64))
    .bind(txn.unit_price.map(|p| p.amount().to_string()))
    .bind(txn.unit_price.map(|p| p.currency().as_str().to_string()))
    .bind(txn.notes.as_deref())
    .bind(txn.created_at.timestamp_millis())
    .execute(&mut **tx)
    .await
    .context("inserting transaction row")?;
    Ok(())
}

fn portfolio_from_row(row: &SqliteRow) -> Result<Portfolio, LedgerError> {
    let parse = || -> anyhow::Result<Portfolio> {
        let id: String = row.try_get("id")?;
        let currency: String = row.try_get("currency")?;
        let created_at: i64 = row.try_get("created_at")?;
        let version: i64 = row.try_get("version")?;
        Ok(Portfolio {
            id: id.parse().context("parsing portfolio id")?,
            owner_id: row.try_get("owner_id")?,
            name: row.try_get("name")?,
            currency: Currency::new(&currency).map_err(|e| anyhow!(e))?,
            created_at: millis_to_utc(created_at)?,
            version: version as u64,
            archived: row.try_get("archived")?,
        })
    };
    parse().map_err(LedgerError::Transient)
}

fn transaction_from_row(row: &SqliteRow) -> Result<Transaction, LedgerError> {
    let parse = || -> anyhow::Result<Transaction> {
        let id: String = row.try_get("id")?;
        let portfolio_id: String = row.try_get("portfolio_id")?;
        let kind: String = row.try_get("kind")?;
        let timestamp: i64 = row.try_get("timestamp")?;
        let cash_amount: String = row.try_get("cash_amount")?;
        let cash_currency: String = row.try_get("cash_currency")?;
        let ticker: Option<String> = row.try_get("ticker")?;
        let quantity: Option<i64> = row.try_get("quantity")?;
        let unit_amount: Option<String> = row.try_get("unit_amount")?;
        let unit_currency: Option<String> = row.try_get("unit_currency")?;
        let created_at: i64 = row.try_get("created_at")?;

        let currency = Currency::new(&cash_currency).map_err(|e| anyhow!(e))?;
        let unit_price = match (unit_amount, unit_currency) {
            (Some(amount), Some(code)) => Some(Money::new(
                Decimal::from_str(&amount).context("parsing unit price")?,
                Currency::new(&code).map_err(|e| anyhow!(e))?,
            )),
            _ => None,
        };

        Ok(Transaction {
            id: TransactionId::from_str(&id).context("parsing transaction id")?,
            portfolio_id: portfolio_id.parse().context("parsing portfolio id")?,
            kind: TransactionKind::from_str(&kind).map_err(|e| anyhow!(e))?,
            timestamp: millis_to_utc(timestamp)?,
            cash_delta: Money::new(
                Decimal::from_str(&cash_amount).context("parsing cash amount")?,
                currency,
            ),
            ticker: ticker
                .map(|t| t.parse().map_err(|e| anyhow!("{e}")))
                .transpose()?,
            quantity: quantity.map(|q| q as u64),
            unit_price,
            notes: row.try_get("notes")?,
            created_at: millis_to_utc(created_at)?,
        })
    };
    parse().map_err(LedgerError::Transient)
}

fn millis_to_utc(millis: i64) -> anyhow::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| anyhow!("timestamp {millis} out of range"))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Database(db) if db.kind() == sqlx::error::ErrorKind::UniqueViolation
    )
}
