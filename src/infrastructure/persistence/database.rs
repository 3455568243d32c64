use anyhow::{Context, Result};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tokio::fs;
use tracing::info;

/// Singleton database wrapper
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(db_url: &str) -> Result<Self> {
        // Ensure the directory exists if it's a file path
        if let Some(path_part) = db_url.strip_prefix("sqlite://") {
            let path = Path::new(path_part);
            if let Some(parent) = path.parent()
                && !parent.exists()
            {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create database directory")?;
            }
        }

        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal); // Better for concurrency

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        info!("Connected to database: {}", db_url);

        let db = Self { pool };
        db.init().await?;

        Ok(db)
    }

    /// Shared in-memory database for tests. A single pooled connection
    /// keeps every handle on the same memory store.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite database")?;

        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        // 1. Portfolios Table
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS portfolios (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                currency TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                version INTEGER NOT NULL DEFAULT 0,
                archived BOOLEAN NOT NULL DEFAULT 0,
                UNIQUE (owner_id, name)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create portfolios table")?;

        // 2. Transactions Table (append-only ledger)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transactions (
                id TEXT PRIMARY KEY,
                portfolio_id TEXT NOT NULL REFERENCES portfolios(id),
                kind TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                cash_amount TEXT NOT NULL,
                cash_currency TEXT NOT NULL,
                ticker TEXT,
                quantity INTEGER,
                unit_amount TEXT,
                unit_currency TEXT,
                notes TEXT,
                created_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create transactions table")?;

        // Replay order index
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_transactions_portfolio_time
            ON transactions (portfolio_id, timestamp, id);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create transaction index")?;

        // 3. Price History Table (warm store)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS price_history (
                ticker TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                interval TEXT NOT NULL,
                price TEXT NOT NULL,
                currency TEXT NOT NULL,
                open TEXT,
                high TEXT,
                low TEXT,
                close TEXT,
                volume TEXT,
                source TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (ticker, timestamp, interval)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create price_history table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_price_history_ticker_time
            ON price_history (ticker, timestamp DESC);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create price_history index")?;

        info!("Database schema initialized.");
        Ok(())
    }
}
