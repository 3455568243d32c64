use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveTime};
use std::env;
use std::fmt::Display;
use std::str::FromStr;

/// Which market-data provider adapter to wire up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// Deterministic in-process provider for tests and offline use.
    Mock,
    AlphaVantage,
}

impl FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mock" => Ok(ProviderKind::Mock),
            "alphavantage" => Ok(ProviderKind::AlphaVantage),
            _ => anyhow::bail!("Invalid PROVIDER: {}. Must be 'mock' or 'alphavantage'", s),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub provider: ProviderKind,
    pub alpha_vantage_api_key: String,
    pub alpha_vantage_base_url: String,
    // Provider quota
    pub rate_limit_per_minute: u32,
    pub rate_limit_per_day: u32,
    pub provider_timeout_seconds: u64,
    // Hot-cache lifetimes
    pub cache_current_ttl_seconds: u64,
    pub cache_history_ttl_recent_seconds: u64,
    pub cache_history_ttl_midday_seconds: u64,
    pub cache_history_ttl_historical_seconds: u64,
    // Background refresher
    pub scheduler_cron: String,
    pub scheduler_active_window_days: i64,
    // Market calendar
    pub market_close_time_utc: NaiveTime,
    pub market_holidays: Vec<NaiveDate>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://data/papertrade.db".to_string(),
            provider: ProviderKind::Mock,
            alpha_vantage_api_key: String::new(),
            alpha_vantage_base_url: "https://www.alphavantage.co".to_string(),
            rate_limit_per_minute: 5,
            rate_limit_per_day: 500,
            provider_timeout_seconds: 10,
            cache_current_ttl_seconds: 300,
            cache_history_ttl_recent_seconds: 3_600,
            cache_history_ttl_midday_seconds: 14_400,
            cache_history_ttl_historical_seconds: 604_800,
            scheduler_cron: "0 0 * * *".to_string(),
            scheduler_active_window_days: 30,
            market_close_time_utc: NaiveTime::from_hms_opt(21, 0, 0).unwrap_or_default(),
            market_holidays: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Config::default();

        let provider_str = env::var("PROVIDER").unwrap_or_else(|_| "mock".to_string());
        let provider = ProviderKind::from_str(&provider_str)?;

        let database_url = env::var("DATABASE_URL").unwrap_or(defaults.database_url);
        let alpha_vantage_api_key = env::var("ALPHA_VANTAGE_API_KEY").unwrap_or_default();
        let alpha_vantage_base_url =
            env::var("ALPHA_VANTAGE_BASE_URL").unwrap_or(defaults.alpha_vantage_base_url);

        let market_close_time_utc = env::var("MARKET_CLOSE_TIME_UTC")
            .unwrap_or_else(|_| "21:00".to_string());
        let market_close_time_utc = NaiveTime::parse_from_str(&market_close_time_utc, "%H:%M")
            .context("Failed to parse MARKET_CLOSE_TIME_UTC (expected HH:MM)")?;

        let market_holidays = env::var("MARKET_HOLIDAYS")
            .unwrap_or_default()
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(|s| {
                s.trim()
                    .parse::<NaiveDate>()
                    .with_context(|| format!("Failed to parse holiday date '{}'", s.trim()))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            database_url,
            provider,
            alpha_vantage_api_key,
            alpha_vantage_base_url,
            rate_limit_per_minute: env_parse("RATE_LIMIT_PER_MINUTE", defaults.rate_limit_per_minute)?,
            rate_limit_per_day: env_parse("RATE_LIMIT_PER_DAY", defaults.rate_limit_per_day)?,
            provider_timeout_seconds: env_parse(
                "PROVIDER_TIMEOUT_SECONDS",
                defaults.provider_timeout_seconds,
            )?,
            cache_current_ttl_seconds: env_parse(
                "CACHE_CURRENT_TTL_SECONDS",
                defaults.cache_current_ttl_seconds,
            )?,
            cache_history_ttl_recent_seconds: env_parse(
                "CACHE_HISTORY_TTL_RECENT_SECONDS",
                defaults.cache_history_ttl_recent_seconds,
            )?,
            cache_history_ttl_midday_seconds: env_parse(
                "CACHE_HISTORY_TTL_MIDDAY_SECONDS",
                defaults.cache_history_ttl_midday_seconds,
            )?,
            cache_history_ttl_historical_seconds: env_parse(
                "CACHE_HISTORY_TTL_HISTORICAL_SECONDS",
                defaults.cache_history_ttl_historical_seconds,
            )?,
            scheduler_cron: env::var("SCHEDULER_CRON").unwrap_or(defaults.scheduler_cron),
            scheduler_active_window_days: env_parse(
                "SCHEDULER_ACTIVE_WINDOW_DAYS",
                defaults.scheduler_active_window_days,
            )?,
            market_close_time_utc,
            market_holidays,
        })
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", key, e)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let c = Config::default();
        assert_eq!(c.rate_limit_per_minute, 5);
        assert_eq!(c.rate_limit_per_day, 500);
        assert_eq!(c.provider_timeout_seconds, 10);
        assert_eq!(c.cache_current_ttl_seconds, 300);
        assert_eq!(c.cache_history_ttl_recent_seconds, 3_600);
        assert_eq!(c.cache_history_ttl_midday_seconds, 14_400);
        assert_eq!(c.cache_history_ttl_historical_seconds, 604_800);
        assert_eq!(c.scheduler_cron, "0 0 * * *");
        assert_eq!(c.scheduler_active_window_days, 30);
        assert_eq!(
            c.market_close_time_utc,
            NaiveTime::from_hms_opt(21, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_provider_kind_parsing() {
        assert_eq!("mock".parse::<ProviderKind>().unwrap(), ProviderKind::Mock);
        assert_eq!(
            "AlphaVantage".parse::<ProviderKind>().unwrap(),
            ProviderKind::AlphaVantage
        );
        assert!("binance".parse::<ProviderKind>().is_err());
    }
}
