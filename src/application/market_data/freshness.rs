use crate::domain::calendar::MarketCalendar;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeSet;
use std::time::Duration;

/// Hot-cache lifetimes for historical series, keyed by how recent the
/// freshest cached row is.
#[derive(Debug, Clone, Copy)]
pub struct HistoryTtl {
    /// Freshest row is from today's trading session.
    pub recent: Duration,
    /// Freshest row is from the previous trading day.
    pub midday: Duration,
    /// Everything older.
    pub historical: Duration,
}

impl Default for HistoryTtl {
    fn default() -> Self {
        Self {
            recent: Duration::from_secs(3_600),
            midday: Duration::from_secs(14_400),
            historical: Duration::from_secs(604_800),
        }
    }
}

/// Weekend/holiday-aware freshness and completeness rules for cached
/// prices. Everything here is a pure function of the supplied `now`; the
/// engine passes its injected clock through.
#[derive(Debug, Clone)]
pub struct FreshnessPolicy {
    calendar: MarketCalendar,
    /// Maximum age of a current quote while the market is open.
    current_ttl: Duration,
    history_ttl: HistoryTtl,
}

impl FreshnessPolicy {
    pub fn new(calendar: MarketCalendar, current_ttl: Duration, history_ttl: HistoryTtl) -> Self {
        Self {
            calendar,
            current_ttl,
            history_ttl,
        }
    }

    pub fn calendar(&self) -> &MarketCalendar {
        &self.calendar
    }

    /// A current-price entry is fresh while the market is open only if it
    /// is from today and at most `current_ttl` old; while the market is
    /// closed, a quote from the last expected trading day stays fresh.
    /// This is what keeps weekends free of provider calls.
    pub fn is_current_fresh(&self, price_ts: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if self.calendar.is_market_open(now) {
            price_ts.date_naive() == now.date_naive()
                && now.signed_duration_since(price_ts)
                    <= chrono::Duration::from_std(self.current_ttl)
                        .unwrap_or(chrono::Duration::seconds(300))
        } else {
            price_ts.date_naive() >= self.calendar.last_expected_trading_day(now)
        }
    }

    /// Hot-cache TTL for a promoted current quote: short while the market
    /// moves, generous once it cannot.
    pub fn current_cache_ttl(&self, now: DateTime<Utc>) -> Duration {
        if self.calendar.is_market_open(now) {
            self.current_ttl
        } else {
            self.history_ttl.recent
        }
    }

    /// Hot-cache TTL for a cached series whose freshest row is `freshest`.
    pub fn history_cache_ttl(&self, freshest: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
        let freshest_day = freshest.date_naive();
        let today = now.date_naive();
        if freshest_day >= today {
            self.history_ttl.recent
        } else if freshest_day >= self.calendar.last_expected_trading_day(now) {
            self.history_ttl.midday
        } else {
            self.history_ttl.historical
        }
    }

    /// Trading days a complete daily series over `[start, end]` must cover,
    /// clipped to the last day for which data can exist at `now`.
    pub fn expected_trading_days(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Vec<NaiveDate> {
        let last_expected = self.calendar.last_expected_trading_day(now);
        let clipped_end = end.date_naive().min(last_expected);
        if clipped_end < start.date_naive() {
            return Vec::new();
        }
        self.calendar
            .trading_days_between(start.date_naive(), clipped_end)
    }

    /// A daily series is complete when every expected trading day has a
    /// row, allowing at most one missing day at either boundary.
    pub fn is_daily_series_complete(
        &self,
        covered_days: &BTreeSet<NaiveDate>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        let expected = self.expected_trading_days(start, end, now);
        let (Some(first), Some(last)) = (expected.first(), expected.last()) else {
            // Nothing can be expected in the window
            return true;
        };
        let missing: Vec<&NaiveDate> = expected
            .iter()
            .filter(|d| !covered_days.contains(d))
            .collect();
        match missing.as_slice() {
            [] => true,
            [only] => *only == first || *only == last,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> FreshnessPolicy {
        FreshnessPolicy::new(
            MarketCalendar::us_default(),
            Duration::from_secs(300),
            HistoryTtl::default(),
        )
    }

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn test_open_market_freshness_window() {
        let p = policy();
        let now = ts("2024-01-16T15:00:00Z");
        assert!(p.is_current_fresh(ts("2024-01-16T14:57:00Z"), now));
        assert!(!p.is_current_fresh(ts("2024-01-16T14:00:00Z"), now));
        assert!(!p.is_current_fresh(ts("2024-01-12T21:00:00Z"), now));
    }

    #[test]
    fn test_weekend_friday_close_stays_fresh() {
        let p = policy();
        // Sunday morning: Friday's close is still the freshest possible data
        let now = ts("2024-01-21T10:00:00Z");
        assert!(p.is_current_fresh(ts("2024-01-19T21:00:00Z"), now));
        assert!(!p.is_current_fresh(ts("2024-01-18T21:00:00Z"), now));
    }

    #[test]
    fn test_after_close_todays_quote_is_fresh() {
        let p = policy();
        let now = ts("2024-01-16T22:00:00Z");
        assert!(p.is_current_fresh(ts("2024-01-16T20:59:00Z"), now));
        assert!(!p.is_current_fresh(ts("2024-01-12T21:00:00Z"), now));
    }

    #[test]
    fn test_history_ttl_tiers() {
        let p = policy();
        let now = ts("2024-01-16T22:00:00Z");
        assert_eq!(
            p.history_cache_ttl(ts("2024-01-16T21:00:00Z"), now),
            Duration::from_secs(3_600)
        );
        // After close the last expected day is today, so yesterday is "older"
        assert_eq!(
            p.history_cache_ttl(ts("2024-01-12T21:00:00Z"), now),
            Duration::from_secs(604_800)
        );

        // Mid-session, the previous trading day is the freshest complete one
        let midday = ts("2024-01-16T15:00:00Z");
        assert_eq!(
            p.history_cache_ttl(ts("2024-01-12T21:00:00Z"), midday),
            Duration::from_secs(14_400)
        );
    }

    #[test]
    fn test_weekend_series_is_complete_through_friday() {
        let p = policy();
        // Request Mon..Sun, on Sunday; the week of Jan 8-12 2024 has 5
        // trading days and all are covered
        let covered: BTreeSet<NaiveDate> = [
            d("2024-01-08"),
            d("2024-01-09"),
            d("2024-01-10"),
            d("2024-01-11"),
            d("2024-01-12"),
        ]
        .into_iter()
        .collect();
        assert!(p.is_daily_series_complete(
            &covered,
            ts("2024-01-08T00:00:00Z"),
            ts("2024-01-14T23:59:59Z"),
            ts("2024-01-14T10:00:00Z"),
        ));
    }

    #[test]
    fn test_missing_interior_day_is_incomplete() {
        let p = policy();
        let covered: BTreeSet<NaiveDate> = [
            d("2024-01-08"),
            d("2024-01-09"),
            // Jan 10 missing
            d("2024-01-11"),
            d("2024-01-12"),
        ]
        .into_iter()
        .collect();
        assert!(!p.is_daily_series_complete(
            &covered,
            ts("2024-01-08T00:00:00Z"),
            ts("2024-01-14T23:59:59Z"),
            ts("2024-01-14T10:00:00Z"),
        ));
    }

    #[test]
    fn test_boundary_tolerance() {
        let p = policy();
        let covered: BTreeSet<NaiveDate> = [
            d("2024-01-09"),
            d("2024-01-10"),
            d("2024-01-11"),
            d("2024-01-12"),
        ]
        .into_iter()
        .collect();
        // First expected day (Jan 8) missing: tolerated
        assert!(p.is_daily_series_complete(
            &covered,
            ts("2024-01-08T00:00:00Z"),
            ts("2024-01-14T23:59:59Z"),
            ts("2024-01-14T10:00:00Z"),
        ));
    }

    #[test]
    fn test_pre_close_excludes_today() {
        let p = policy();
        // Tuesday 14:00, today's bar cannot exist yet; series through
        // Monday is complete
        let covered: BTreeSet<NaiveDate> = [d("2024-01-08"), d("2024-01-09")]
            .into_iter()
            .collect();
        assert!(p.is_daily_series_complete(
            &covered,
            ts("2024-01-08T00:00:00Z"),
            ts("2024-01-09T23:59:59Z"),
            ts("2024-01-09T14:00:00Z"),
        ));
    }

    #[test]
    fn test_future_only_window_is_vacuously_complete() {
        let p = policy();
        assert!(p.is_daily_series_complete(
            &BTreeSet::new(),
            ts("2030-01-07T00:00:00Z"),
            ts("2030-01-11T23:59:59Z"),
            ts("2024-01-16T14:00:00Z"),
        ));
    }
}
