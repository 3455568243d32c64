use crate::domain::money::{Currency, Money};
use crate::domain::ports::PriceRepository;
use crate::domain::price::{Ohlcv, PriceInterval, PriceRow, PriceSource};
use crate::domain::ticker::Ticker;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::debug;

pub struct SqlitePriceRepository {
    pool: SqlitePool,
}

impl SqlitePriceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PriceRepository for SqlitePriceRepository {
    async fn get_latest(&self, ticker: &Ticker) -> Result<Option<PriceRow>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM price_history
            WHERE ticker = ? AND interval IN ('REALTIME', 'DAILY')
            ORDER BY timestamp DESC
            LIMIT 1
            "#,
        )
        .bind(ticker.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("loading latest price")?;

        row.as_ref().map(price_row_from_row).transpose()
    }

    async fn get_at(
        &self,
        ticker: &Ticker,
        as_of: DateTime<Utc>,
        not_before: DateTime<Utc>,
    ) -> Result<Option<PriceRow>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM price_history
            WHERE ticker = ? AND timestamp <= ? AND timestamp >= ?
            ORDER BY timestamp DESC
            LIMIT 1
            "#,
        )
        .bind(ticker.as_str())
        .bind(as_of.timestamp_millis())
        .bind(not_before.timestamp_millis())
        .fetch_optional(&self.pool)
        .await
        .context("loading point-in-time price")?;

        row.as_ref().map(price_row_from_row).transpose()
    }

    async fn get_range(
        &self,
        ticker: &Ticker,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: PriceInterval,
        limit: usize,
    ) -> Result<Vec<PriceRow>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM price_history
            WHERE ticker = ? AND interval = ? AND timestamp >= ? AND timestamp <= ?
            ORDER BY timestamp ASC
            LIMIT ?
            "#,
        )
        .bind(ticker.as_str())
        .bind(interval.to_string())
        .bind(start.timestamp_millis())
        .bind(end.timestamp_millis())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("loading price range")?;

        rows.iter().map(price_row_from_row).collect()
    }

    async fn upsert(&self, rows: &[PriceRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.context("beginning price upsert")?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO price_history
                (ticker, timestamp, interval, price, currency,
                 open, high, low, close, volume, source, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(row.ticker.as_str())
            .bind(row.timestamp.timestamp_millis())
            .bind(row.interval.to_string())
            .bind(row.price.amount().to_string())
            .bind(row.price.currency().as_str())
            .bind(row.ohlcv.as_ref().map(|o| o.open.to_string()))
            .bind(row.ohlcv.as_ref().map(|o| o.high.to_string()))
            .bind(row.ohlcv.as_ref().map(|o| o.low.to_string()))
            .bind(row.ohlcv.as_ref().map(|o| o.close.to_string()))
            .bind(row.ohlcv.as_ref().map(|o| o.volume.to_string()))
            .bind(row.source.to_string())
            .bind(row.created_at.timestamp_millis())
            .execute(&mut *tx)
            .await
            .context("upserting price row")?;
        }
        tx.commit().await.context("committing price upsert")?;
        debug!("Upserted {} price row(s)", rows.len());
        Ok(())
    }

    async fn list_active_tickers(&self, since: DateTime<Utc>) -> Result<Vec<Ticker>> {
        // Active = currently held somewhere, or traded inside the window
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ticker FROM (
                SELECT ticker,
                       SUM(CASE kind
                           WHEN 'BUY' THEN quantity
                           WHEN 'SELL' THEN -quantity
                           ELSE 0 END) AS net
                FROM transactions
                WHERE ticker IS NOT NULL
                GROUP BY portfolio_id, ticker
                HAVING net > 0
            )
            UNION
            SELECT DISTINCT ticker FROM transactions
            WHERE ticker IS NOT NULL AND timestamp >= ?
            ORDER BY ticker ASC
            "#,
        )
        .bind(since.timestamp_millis())
        .fetch_all(&self.pool)
        .await
        .context("listing active tickers")?;

        rows.iter()
            .map(|row| {
                let symbol: String = row.try_get("ticker")?;
                symbol
                    .parse::<Ticker>()
                    .map_err(|e| anyhow!("stored ticker is invalid: {e}"))
            })
            .collect()
    }
}

fn price_row_from_row(row: &SqliteRow) -> Result<PriceRow> {
    let ticker: String = row.try_get("ticker")?;
    let timestamp: i64 = row.try_get("timestamp")?;
    let interval: String = row.try_get("interval")?;
    let price: String = row.try_get("price")?;
    let currency: String = row.try_get("currency")?;
    let source: String = row.try_get("source")?;
    let created_at: i64 = row.try_get("created_at")?;

    let open: Option<String> = row.try_get("open")?;
    let high: Option<String> = row.try_get("high")?;
    let low: Option<String> = row.try_get("low")?;
    let close: Option<String> = row.try_get("close")?;
    let volume: Option<String> = row.try_get("volume")?;
    let ohlcv = match (open, high, low, close, volume) {
        (Some(o), Some(h), Some(l), Some(c), Some(v)) => Some(Ohlcv {
            open: Decimal::from_str(&o).context("parsing open")?,
            high: Decimal::from_str(&h).context("parsing high")?,
            low: Decimal::from_str(&l).context("parsing low")?,
            close: Decimal::from_str(&c).context("parsing close")?,
            volume: Decimal::from_str(&v).context("parsing volume")?,
        }),
        _ => None,
    };

    Ok(PriceRow {
        ticker: ticker
            .parse()
            .map_err(|e| anyhow!("stored ticker is invalid: {e}"))?,
        timestamp: DateTime::from_timestamp_millis(timestamp)
            .ok_or_else(|| anyhow!("timestamp {timestamp} out of range"))?,
        interval: PriceInterval::from_str(&interval).map_err(|e| anyhow!(e))?,
        price: Money::new(
            Decimal::from_str(&price).context("parsing price")?,
            Currency::new(&currency).map_err(|e| anyhow!(e))?,
        ),
        ohlcv,
        source: PriceSource::from_str(&source).map_err(|e| anyhow!(e))?,
        created_at: DateTime::from_timestamp_millis(created_at)
            .ok_or_else(|| anyhow!("timestamp {created_at} out of range"))?,
    })
}
