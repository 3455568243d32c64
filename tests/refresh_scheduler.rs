//! Background refresher runs against the assembled core.

use chrono::{DateTime, Utc};
use papertrade::application::bootstrap::Core;
use papertrade::application::refresh::RefreshOutcome;
use papertrade::config::Config;
use papertrade::domain::money::Money;
use papertrade::domain::ticker::Ticker;
use papertrade::infrastructure::mock::{MockClock, MockMarketDataProvider};
use papertrade::infrastructure::persistence::Database;
use rust_decimal_macros::dec;
use std::sync::Arc;

fn ts(s: &str) -> DateTime<Utc> {
    s.parse().unwrap()
}

fn ticker(s: &str) -> Ticker {
    Ticker::new(s).unwrap()
}

const OPEN_SESSION: &str = "2024-01-16T15:00:00Z";

async fn core_with(
    config: Config,
    now: &str,
) -> (Core, Arc<MockClock>, Arc<MockMarketDataProvider>) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_test_writer()
        .try_init();

    let clock = Arc::new(MockClock::at(ts(now)));
    let provider = Arc::new(MockMarketDataProvider::new());
    let database = Database::in_memory().await.unwrap();
    let core = Core::assemble(config, clock.clone(), provider.clone(), database).unwrap();
    (core, clock, provider)
}

async fn seed_holding(core: &Core, provider: &MockMarketDataProvider, sym: &str) {
    let t = ticker(sym);
    provider.set_quote(&t, Money::usd(dec!(100.00)), ts(OPEN_SESSION));
    let portfolio = core
        .trading
        .create_portfolio("user-1", &format!("holds-{sym}"), Money::usd(dec!(10000)))
        .await
        .unwrap();
    core.trading
        .execute_buy(portfolio.id, &t, 5, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_run_refreshes_held_tickers() {
    let (core, _clock, provider) = core_with(Config::default(), OPEN_SESSION).await;
    seed_holding(&core, &provider, "AAPL").await;
    seed_holding(&core, &provider, "MSFT").await;
    let calls_before = provider.current_calls();

    let outcome = core.refresher.run_once().await.unwrap();
    assert_eq!(
        outcome,
        RefreshOutcome::Completed {
            refreshed: 2,
            failed: 0
        }
    );

    // Both tickers were served (hot cache from the buys still holds them,
    // so no extra provider traffic was needed)
    assert!(provider.current_calls() >= calls_before);

    let status = core.refresher.status().await;
    assert!(status.last_run_started.is_some());
    assert!(status.last_run_finished.is_some());
    assert_eq!(status.last_run_refreshed, 2);
    assert_eq!(status.tickers.len(), 2);
    assert!(
        status
            .tickers
            .get(&ticker("AAPL"))
            .and_then(|t| t.last_success)
            .is_some()
    );
}

#[tokio::test]
async fn test_one_dead_ticker_does_not_abort_run() {
    let (core, clock, provider) = core_with(Config::default(), OPEN_SESSION).await;
    seed_holding(&core, &provider, "AAPL").await;
    seed_holding(&core, &provider, "GONE").await;

    // Make GONE unresolvable from every tier: drop its quote and advance
    // past all cache freshness windows so the provider must be asked
    provider.remove_quote(&ticker("GONE"));
    provider.remove_quote(&ticker("AAPL"));
    clock.set(ts("2024-01-18T15:00:00Z"));
    provider.set_quote(&ticker("AAPL"), Money::usd(dec!(105.00)), ts("2024-01-18T15:00:00Z"));

    let outcome = core.refresher.run_once().await.unwrap();
    match outcome {
        RefreshOutcome::Completed { refreshed, failed } => {
            // AAPL refreshed from the provider; the delisted ticker failed
            // definitively, and the run carried on regardless
            assert_eq!(refreshed, 1);
            assert_eq!(failed, 1);
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    let status = core.refresher.status().await;
    assert_eq!(status.tickers.len(), 2);
}

#[tokio::test]
async fn test_exhausted_budget_truncates_run() {
    let config = Config {
        // Tight schedule puts the run deadline in the past, so a depleted
        // budget stops the run instead of blocking on a refill
        scheduler_cron: "*/1 * * * *".to_string(),
        ..Default::default()
    };
    let (core, _clock, provider) = core_with(config, OPEN_SESSION).await;
    seed_holding(&core, &provider, "AAPL").await;

    while core.rate_limiter.try_acquire().await {}

    let outcome = core.refresher.run_once().await.unwrap();
    assert!(matches!(outcome, RefreshOutcome::Truncated { .. }));
}

#[tokio::test]
async fn test_closed_positions_leave_active_set_after_window() {
    let (core, clock, provider) = core_with(Config::default(), OPEN_SESSION).await;
    let t = ticker("AAPL");
    provider.set_quote(&t, Money::usd(dec!(100.00)), ts(OPEN_SESSION));
    let portfolio = core
        .trading
        .create_portfolio("user-1", "roundtrip", Money::usd(dec!(10000)))
        .await
        .unwrap();
    core.trading.execute_buy(portfolio.id, &t, 5, None).await.unwrap();
    clock.advance(chrono::Duration::minutes(1));
    core.trading.execute_sell(portfolio.id, &t, 5, None).await.unwrap();

    // Still inside the 30-day window: the closed ticker remains active
    let recent = core
        .prices
        .list_active_tickers(ts(OPEN_SESSION) - chrono::Duration::days(30))
        .await
        .unwrap();
    assert_eq!(recent, vec![t.clone()]);

    // Once the window has moved past the trades, nothing is active
    let later = core
        .prices
        .list_active_tickers(ts("2024-06-01T00:00:00Z"))
        .await
        .unwrap();
    assert!(later.is_empty());
}
