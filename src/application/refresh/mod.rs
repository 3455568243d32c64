//! Background price refresher.
//!
//! Keeps the warm store populated for actively-held tickers, pacing its
//! provider traffic so the quota stays available for interactive requests.

use crate::application::market_data::{MarketDataEngine, ProviderRateLimiter};
use crate::domain::clock::Clock;
use crate::domain::ports::PriceRepository;
use crate::domain::price::PriceSource;
use crate::domain::ticker::Ticker;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Slack kept between the end of a run and the next tick.
const RUN_DEADLINE_MARGIN: ChronoDuration = ChronoDuration::minutes(5);

/// Supported recurrence shapes, parsed from a cron expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// `M H * * *` - once a day at the given UTC time.
    DailyAt(NaiveTime),
    /// `*/N * * * *` - every N minutes.
    EveryMinutes(u32),
}

impl Schedule {
    /// Parse the two cron shapes the scheduler supports.
    pub fn parse(cron: &str) -> Result<Self> {
        let fields: Vec<&str> = cron.split_whitespace().collect();
        if fields.len() != 5 {
            bail!("cron expression must have 5 fields, got '{cron}'");
        }
        if fields[1..] == ["*", "*", "*", "*"] {
            if let Some(step) = fields[0].strip_prefix("*/") {
                let minutes: u32 = step
                    .parse()
                    .with_context(|| format!("invalid minute step in '{cron}'"))?;
                if minutes == 0 || minutes > 1440 {
                    bail!("minute step out of range in '{cron}'");
                }
                return Ok(Schedule::EveryMinutes(minutes));
            }
        }
        if fields[2..] == ["*", "*", "*"] {
            let minute: u32 = fields[0]
                .parse()
                .with_context(|| format!("invalid minute in '{cron}'"))?;
            let hour: u32 = fields[1]
                .parse()
                .with_context(|| format!("invalid hour in '{cron}'"))?;
            let time = NaiveTime::from_hms_opt(hour, minute, 0)
                .with_context(|| format!("time out of range in '{cron}'"))?;
            return Ok(Schedule::DailyAt(time));
        }
        bail!("unsupported cron expression '{cron}' (use 'M H * * *' or '*/N * * * *')")
    }

    /// The first tick strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Schedule::DailyAt(time) => {
                let today = now.date_naive().and_time(*time).and_utc();
                if today > now {
                    today
                } else {
                    today + ChronoDuration::days(1)
                }
            }
            Schedule::EveryMinutes(n) => {
                let step = ChronoDuration::minutes(*n as i64);
                let since_midnight = now - now.date_naive().and_hms_opt(0, 0, 0)
                    .map(|dt| dt.and_utc())
                    .unwrap_or(now);
                let steps_done = since_midnight.num_minutes() / *n as i64;
                let next = now.date_naive().and_hms_opt(0, 0, 0)
                    .map(|dt| dt.and_utc())
                    .unwrap_or(now)
                    + step * (steps_done as i32 + 1);
                next
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RefreshConfig {
    pub schedule: Schedule,
    /// Lookback window for "active" tickers.
    pub active_window: ChronoDuration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            schedule: Schedule::DailyAt(NaiveTime::MIN),
            active_window: ChronoDuration::days(30),
        }
    }
}

/// Per-ticker outcome of the most recent refresh attempt.
#[derive(Debug, Clone, Default)]
pub struct TickerRefresh {
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Observable job state; informative only, never authoritative.
#[derive(Debug, Clone, Default)]
pub struct RefreshStatus {
    pub last_run_started: Option<DateTime<Utc>>,
    pub last_run_finished: Option<DateTime<Utc>>,
    pub last_run_refreshed: usize,
    pub last_run_failed: usize,
    pub tickers: HashMap<Ticker, TickerRefresh>,
}

/// Outcome of one scheduler pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Completed { refreshed: usize, failed: usize },
    /// The provider budget or the deadline ran out mid-run.
    Truncated { refreshed: usize, failed: usize },
    /// Another run already held the lease.
    Skipped,
}

/// Periodic job warming the price store for every actively-held ticker.
pub struct RefreshScheduler {
    prices: Arc<dyn PriceRepository>,
    engine: Arc<MarketDataEngine>,
    limiter: Arc<ProviderRateLimiter>,
    clock: Arc<dyn Clock>,
    config: RefreshConfig,
    status: RwLock<RefreshStatus>,
    /// At most one run at a time, enforced with a try-lock lease.
    run_lock: Mutex<()>,
}

impl RefreshScheduler {
    pub fn new(
        prices: Arc<dyn PriceRepository>,
        engine: Arc<MarketDataEngine>,
        limiter: Arc<ProviderRateLimiter>,
        clock: Arc<dyn Clock>,
        config: RefreshConfig,
    ) -> Self {
        Self {
            prices,
            engine,
            limiter,
            clock,
            config,
            status: RwLock::new(RefreshStatus::default()),
            run_lock: Mutex::new(()),
        }
    }

    pub async fn status(&self) -> RefreshStatus {
        self.status.read().await.clone()
    }

    /// One full refresh pass. Public so operators and tests can trigger a
    /// run outside the schedule.
    pub async fn run_once(&self) -> Result<RefreshOutcome> {
        let Ok(_lease) = self.run_lock.try_lock() else {
            info!("Refresh run already in progress, skipping tick");
            return Ok(RefreshOutcome::Skipped);
        };

        let started = self.clock.now();
        let deadline = self.config.schedule.next_after(started) - RUN_DEADLINE_MARGIN;
        let since = started - self.config.active_window;

        {
            let mut status = self.status.write().await;
            status.last_run_started = Some(started);
        }

        let tickers = self
            .prices
            .list_active_tickers(since)
            .await
            .context("listing active tickers")?;
        info!(
            "Refreshing {} active tickers (window {} days)",
            tickers.len(),
            self.config.active_window.num_days()
        );

        let mut refreshed = 0usize;
        let mut failed = 0usize;
        let mut truncated = false;

        for ticker in tickers {
            if !self.limiter.wait_acquire(deadline).await {
                warn!(
                    "Provider budget exhausted until past the run deadline, stopping refresh"
                );
                truncated = true;
                break;
            }
            let attempt_at = self.clock.now();
            // One ticker failing must not abort the run
            match self.engine.get_current_price(&ticker).await {
                Ok(point) => {
                    if point.source == PriceSource::Stale {
                        debug!("Refresh of {} produced a stale price", ticker);
                    }
                    refreshed += 1;
                    let mut status = self.status.write().await;
                    let entry = status.tickers.entry(ticker.clone()).or_default();
                    entry.last_attempt = Some(attempt_at);
                    entry.last_success = Some(attempt_at);
                    entry.last_error = None;
                }
                Err(e) => {
                    warn!("Refresh failed for {}: {}", ticker, e);
                    failed += 1;
                    let mut status = self.status.write().await;
                    let entry = status.tickers.entry(ticker.clone()).or_default();
                    entry.last_attempt = Some(attempt_at);
                    entry.last_error = Some(e.to_string());
                }
            }
        }

        let finished = self.clock.now();
        {
            let mut status = self.status.write().await;
            status.last_run_finished = Some(finished);
            status.last_run_refreshed = refreshed;
            status.last_run_failed = failed;
        }
        info!(
            "Refresh run finished: {} refreshed, {} failed{}",
            refreshed,
            failed,
            if truncated { " (truncated)" } else { "" }
        );

        Ok(if truncated {
            RefreshOutcome::Truncated { refreshed, failed }
        } else {
            RefreshOutcome::Completed { refreshed, failed }
        })
    }

    /// Spawn the periodic loop. The task runs until aborted via the
    /// returned handle.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let now = self.clock.now();
                let next = self.config.schedule.next_after(now);
                let sleep_for = (next - now).to_std().unwrap_or(Duration::from_secs(60));
                debug!("Next refresh tick at {}", next);
                tokio::time::sleep(sleep_for).await;
                if let Err(e) = self.run_once().await {
                    warn!("Refresh run errored: {:#}", e);
                }
            }
        })
    }
}
