//! Dependency graph construction.
//!
//! The whole core is wired here, explicitly, from a [`Config`]: stores,
//! cache, provider, rate limiter, engine, trading service and refresher.
//! No global registry; everything flows down through constructors.

use crate::application::market_data::{
    FreshnessPolicy, HistoryTtl, MarketDataEngine, MarketDataEngineConfig, ProviderRateLimiter,
    RateLimiterConfig,
};
use crate::application::refresh::{RefreshConfig, RefreshScheduler, Schedule};
use crate::application::trading::TradeExecutionService;
use crate::config::{Config, ProviderKind};
use crate::domain::calendar::MarketCalendar;
use crate::domain::clock::{Clock, SystemClock};
use crate::domain::ports::{HotCache, MarketDataProvider, PortfolioRepository, PriceRepository};
use crate::infrastructure::alpha_vantage::AlphaVantageProvider;
use crate::infrastructure::cache::InMemoryHotCache;
use crate::infrastructure::mock::MockMarketDataProvider;
use crate::infrastructure::persistence::{
    Database, SqlitePortfolioRepository, SqlitePriceRepository,
};
use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// The assembled core: every component the surrounding HTTP layer needs.
pub struct Core {
    pub config: Config,
    pub database: Database,
    pub ledger: Arc<dyn PortfolioRepository>,
    pub prices: Arc<dyn PriceRepository>,
    pub hot_cache: Arc<dyn HotCache>,
    pub rate_limiter: Arc<ProviderRateLimiter>,
    pub engine: Arc<MarketDataEngine>,
    pub trading: Arc<TradeExecutionService>,
    pub refresher: Arc<RefreshScheduler>,
    pub clock: Arc<dyn Clock>,
}

impl Core {
    /// Build against the system clock and the provider selected by config.
    pub async fn build(config: Config) -> Result<Core> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let provider: Arc<dyn MarketDataProvider> = match config.provider {
            ProviderKind::Mock => {
                info!("Using mock market-data provider");
                Arc::new(MockMarketDataProvider::new())
            }
            ProviderKind::AlphaVantage => Arc::new(AlphaVantageProvider::new(
                config.alpha_vantage_base_url.clone(),
                config.alpha_vantage_api_key.clone(),
                config.market_close_time_utc,
                Duration::from_secs(config.provider_timeout_seconds),
                clock.clone(),
            )),
        };
        Self::build_with(config, clock, provider).await
    }

    /// Build with an explicit clock and provider; the test entry point.
    pub async fn build_with(
        config: Config,
        clock: Arc<dyn Clock>,
        provider: Arc<dyn MarketDataProvider>,
    ) -> Result<Core> {
        let database = Database::new(&config.database_url)
            .await
            .context("opening core database")?;
        Self::assemble(config, clock, provider, database)
    }

    /// Build on an already-open database (tests use the in-memory one).
    pub fn assemble(
        config: Config,
        clock: Arc<dyn Clock>,
        provider: Arc<dyn MarketDataProvider>,
        database: Database,
    ) -> Result<Core> {
        let ledger: Arc<dyn PortfolioRepository> = Arc::new(SqlitePortfolioRepository::new(
            database.pool.clone(),
            clock.clone(),
        ));
        let prices: Arc<dyn PriceRepository> =
            Arc::new(SqlitePriceRepository::new(database.pool.clone()));
        let hot_cache: Arc<dyn HotCache> = Arc::new(InMemoryHotCache::new(clock.clone()));

        let calendar = MarketCalendar::new(
            config.market_close_time_utc,
            config.market_holidays.iter().copied(),
        );
        let policy = FreshnessPolicy::new(
            calendar,
            Duration::from_secs(config.cache_current_ttl_seconds),
            HistoryTtl {
                recent: Duration::from_secs(config.cache_history_ttl_recent_seconds),
                midday: Duration::from_secs(config.cache_history_ttl_midday_seconds),
                historical: Duration::from_secs(config.cache_history_ttl_historical_seconds),
            },
        );

        let rate_limiter = Arc::new(ProviderRateLimiter::new(
            RateLimiterConfig {
                per_minute: config.rate_limit_per_minute,
                per_day: config.rate_limit_per_day,
            },
            clock.clone(),
        ));

        let engine = Arc::new(MarketDataEngine::new(
            provider,
            prices.clone(),
            hot_cache.clone(),
            rate_limiter.clone(),
            clock.clone(),
            policy,
            MarketDataEngineConfig {
                provider_timeout: Duration::from_secs(config.provider_timeout_seconds),
            },
        ));

        let trading = Arc::new(TradeExecutionService::new(
            ledger.clone(),
            engine.clone(),
            clock.clone(),
        ));

        let schedule = Schedule::parse(&config.scheduler_cron)
            .context("parsing scheduler cron expression")?;
        let refresher = Arc::new(RefreshScheduler::new(
            prices.clone(),
            engine.clone(),
            rate_limiter.clone(),
            clock.clone(),
            RefreshConfig {
                schedule,
                active_window: ChronoDuration::days(config.scheduler_active_window_days),
            },
        ));

        Ok(Core {
            config,
            database,
            ledger,
            prices,
            hot_cache,
            rate_limiter,
            engine,
            trading,
            refresher,
            clock,
        })
    }
}
