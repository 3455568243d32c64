use crate::domain::clock::Clock;
use crate::domain::errors::ProviderError;
use crate::domain::money::{Currency, Money};
use crate::domain::ports::{DailyBar, MarketDataProvider, ProviderQuote};
use crate::domain::price::Ohlcv;
use crate::domain::ticker::Ticker;
use crate::infrastructure::http_client_factory::{build_url_with_query, HttpClientFactory};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use reqwest_middleware::ClientWithMiddleware;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Alpha Vantage JSON adapter.
///
/// Free-tier quotas (5 calls/minute, 500/day) match the engine's default
/// rate-limit budgets; the adapter itself never throttles, it only reports
/// `RateLimited` when the provider does.
pub struct AlphaVantageProvider {
    client: ClientWithMiddleware,
    base_url: String,
    api_key: String,
    /// Alpha Vantage quotes carry no currency; US listings are USD.
    currency: Currency,
    /// Daily bars carry a date only; they are stamped at this close time.
    close_time_utc: NaiveTime,
    clock: Arc<dyn Clock>,
}

impl AlphaVantageProvider {
    pub fn new(
        base_url: String,
        api_key: String,
        close_time_utc: NaiveTime,
        timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client: HttpClientFactory::create_client(timeout),
            base_url,
            api_key,
            currency: Currency::USD,
            close_time_utc,
            clock,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        params: &[(&str, &str)],
    ) -> Result<T, ProviderError> {
        let url = build_url_with_query(&format!("{}/query", self.base_url), params);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(anyhow!(e).context("sending provider request")))?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(ProviderError::Auth(format!(
                "provider returned HTTP {status}"
            )));
        }
        if status.as_u16() == 429 {
            return Err(ProviderError::RateLimited);
        }
        if !status.is_success() {
            return Err(ProviderError::Transient(anyhow!(
                "provider returned HTTP {status}"
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ProviderError::Transient(anyhow!(e).context("decoding provider response")))
    }

    /// Alpha Vantage signals most failures inside a 200 response body.
    fn classify_body_error(
        &self,
        symbol: &str,
        note: Option<String>,
        information: Option<String>,
        error_message: Option<String>,
    ) -> ProviderError {
        if let Some(message) = error_message {
            let lower = message.to_lowercase();
            if lower.contains("apikey") || lower.contains("api key") {
                return ProviderError::Auth(message);
            }
            debug!("Provider rejected symbol {}: {}", symbol, message);
            return ProviderError::NotFound(symbol.to_string());
        }
        if let Some(message) = note.or(information) {
            warn!("Provider throttling response: {}", message);
            return ProviderError::RateLimited;
        }
        ProviderError::Transient(anyhow!("provider response carried no usable payload"))
    }

    fn quote_timestamp(&self, date: NaiveDate) -> chrono::DateTime<chrono::Utc> {
        let stamped = date.and_time(self.close_time_utc).and_utc();
        // Today's quote is published intraday; never stamp it ahead of now
        stamped.min(self.clock.now())
    }

    /// Daily bars apply from the start of their trading day, so a
    /// backtest at any intraday time resolves that day's row.
    fn bar_timestamp(&self, date: NaiveDate) -> chrono::DateTime<chrono::Utc> {
        date.and_time(NaiveTime::MIN).and_utc()
    }
}

#[derive(Debug, Deserialize)]
struct QuoteEnvelope {
    #[serde(rename = "Global Quote")]
    quote: Option<BTreeMap<String, String>>,
    #[serde(rename = "Note")]
    note: Option<String>,
    #[serde(rename = "Information")]
    information: Option<String>,
    #[serde(rename = "Error Message")]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SeriesEnvelope {
    #[serde(rename = "Time Series (Daily)")]
    series: Option<BTreeMap<String, RawDailyBar>>,
    #[serde(rename = "Note")]
    note: Option<String>,
    #[serde(rename = "Information")]
    information: Option<String>,
    #[serde(rename = "Error Message")]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDailyBar {
    #[serde(rename = "1. open")]
    open: String,
    #[serde(rename = "2. high")]
    high: String,
    #[serde(rename = "3. low")]
    low: String,
    #[serde(rename = "4. close")]
    close: String,
    #[serde(rename = "5. volume")]
    volume: String,
}

#[async_trait]
impl MarketDataProvider for AlphaVantageProvider {
    async fn fetch_current(&self, ticker: &Ticker) -> Result<ProviderQuote, ProviderError> {
        let envelope: QuoteEnvelope = self
            .get_json(&[
                ("function", "GLOBAL_QUOTE"),
                ("symbol", ticker.as_str()),
                ("apikey", &self.api_key),
            ])
            .await?;

        let quote = match envelope.quote {
            Some(fields) if !fields.is_empty() => fields,
            // An empty quote object is the provider's "no such symbol"
            Some(_) => return Err(ProviderError::NotFound(ticker.to_string())),
            None => {
                return Err(self.classify_body_error(
                    ticker.as_str(),
                    envelope.note,
                    envelope.information,
                    envelope.error_message,
                ));
            }
        };

        let parse = || -> anyhow::Result<ProviderQuote> {
            let price = quote
                .get("05. price")
                .ok_or_else(|| anyhow!("quote missing price field"))?;
            let latest_day = quote
                .get("07. latest trading day")
                .ok_or_else(|| anyhow!("quote missing trading day field"))?;
            let price = Decimal::from_str(price).context("parsing quote price")?;
            let date = NaiveDate::from_str(latest_day).context("parsing trading day")?;
            Ok(ProviderQuote {
                ticker: ticker.clone(),
                price: Money::new(price, self.currency),
                timestamp: self.quote_timestamp(date),
            })
        };
        parse().map_err(ProviderError::Transient)
    }

    async fn fetch_daily_series(&self, ticker: &Ticker) -> Result<Vec<DailyBar>, ProviderError> {
        let envelope: SeriesEnvelope = self
            .get_json(&[
                ("function", "TIME_SERIES_DAILY"),
                ("symbol", ticker.as_str()),
                ("outputsize", "full"),
                ("apikey", &self.api_key),
            ])
            .await?;

        let Some(series) = envelope.series else {
            return Err(self.classify_body_error(
                ticker.as_str(),
                envelope.note,
                envelope.information,
                envelope.error_message,
            ));
        };

        // BTreeMap keys are ISO dates, so iteration is already ascending
        let mut bars = Vec::with_capacity(series.len());
        for (date, raw) in &series {
            let parse = || -> anyhow::Result<DailyBar> {
                let date = NaiveDate::from_str(date).context("parsing series date")?;
                let close = Decimal::from_str(&raw.close).context("parsing close")?;
                Ok(DailyBar {
                    timestamp: self.bar_timestamp(date),
                    close: Money::new(close, self.currency),
                    ohlcv: Some(Ohlcv {
                        open: Decimal::from_str(&raw.open).context("parsing open")?,
                        high: Decimal::from_str(&raw.high).context("parsing high")?,
                        low: Decimal::from_str(&raw.low).context("parsing low")?,
                        close,
                        volume: Decimal::from_str(&raw.volume).context("parsing volume")?,
                    }),
                })
            };
            match parse() {
                Ok(bar) => bars.push(bar),
                Err(e) => warn!("Skipping malformed bar {} for {}: {:#}", date, ticker, e),
            }
        }
        debug!("Fetched {} daily bars for {}", bars.len(), ticker);
        Ok(bars)
    }
}
