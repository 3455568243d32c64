use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc, Weekday};
use std::collections::BTreeSet;

/// Deterministic US equity market calendar: a date is a trading day iff it
/// is a weekday and not in the holiday set for its year. The holiday set is
/// computed algorithmically, so no external data is consulted.
#[derive(Debug, Clone)]
pub struct MarketCalendar {
    close_time_utc: NaiveTime,
    extra_holidays: BTreeSet<NaiveDate>,
}

impl MarketCalendar {
    pub fn new(close_time_utc: NaiveTime, extra_holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            close_time_utc,
            extra_holidays: extra_holidays.into_iter().collect(),
        }
    }

    /// 21:00 UTC close (4pm New York standard time), no extra holidays.
    pub fn us_default() -> Self {
        Self::new(NaiveTime::from_hms_opt(21, 0, 0).unwrap_or_default(), [])
    }

    pub fn close_time_utc(&self) -> NaiveTime {
        self.close_time_utc
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        !is_weekend(date) && !self.is_holiday(date)
    }

    pub fn is_holiday(&self, date: NaiveDate) -> bool {
        if self.extra_holidays.contains(&date) {
            return true;
        }
        // An observed New Year's Day can land on Dec 31 of the prior year
        holidays_for_year(date.year()).contains(&date)
            || holidays_for_year(date.year() + 1).contains(&date)
    }

    /// Whether the market is open at `now`: a trading day, before the close.
    /// No open-time is modelled; the pre-open stretch counts as open so a
    /// same-day quote is considered current.
    pub fn is_market_open(&self, now: DateTime<Utc>) -> bool {
        self.is_trading_day(now.date_naive()) && now.time() < self.close_time_utc
    }

    pub fn previous_trading_day(&self, date: NaiveDate) -> NaiveDate {
        let mut d = date - Duration::days(1);
        while !self.is_trading_day(d) {
            d -= Duration::days(1);
        }
        d
    }

    pub fn next_trading_day(&self, date: NaiveDate) -> NaiveDate {
        let mut d = date + Duration::days(1);
        while !self.is_trading_day(d) {
            d += Duration::days(1);
        }
        d
    }

    /// The most recent trading day for which complete data can exist at
    /// `now`. Walks backwards from today, skipping non-trading days; while
    /// today's session has not yet closed, today is excluded.
    pub fn last_expected_trading_day(&self, now: DateTime<Utc>) -> NaiveDate {
        let today = now.date_naive();
        if self.is_trading_day(today) && now.time() >= self.close_time_utc {
            return today;
        }
        let mut d = today - Duration::days(1);
        while !self.is_trading_day(d) {
            d -= Duration::days(1);
        }
        d
    }

    /// All trading days in `[start, end]` inclusive, ascending.
    pub fn trading_days_between(&self, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
        let mut days = Vec::new();
        let mut d = start;
        while d <= end {
            if self.is_trading_day(d) {
                days.push(d);
            }
            d += Duration::days(1);
        }
        days
    }

    /// Walk `n` trading days backwards from `date` (exclusive).
    pub fn trading_days_back(&self, date: NaiveDate, n: usize) -> NaiveDate {
        let mut d = date;
        for _ in 0..n {
            d = self.previous_trading_day(d);
        }
        d
    }
}

fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Weekend observation shift: Saturday holidays are observed the prior
/// Friday, Sunday holidays the following Monday.
fn observed(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date - Duration::days(1),
        Weekday::Sun => date + Duration::days(1),
        _ => date,
    }
}

fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u32) -> NaiveDate {
    let first = NaiveDate::from_ymd_opt(year, month, 1).unwrap_or_default();
    let offset = (7 + weekday.num_days_from_monday() - first.weekday().num_days_from_monday()) % 7;
    first + Duration::days((offset + (n - 1) * 7) as i64)
}

fn last_weekday(year: i32, month: u32, weekday: Weekday) -> NaiveDate {
    let first_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .unwrap_or_default();
    let last = first_next - Duration::days(1);
    let offset = (7 + last.weekday().num_days_from_monday() - weekday.num_days_from_monday()) % 7;
    last - Duration::days(offset as i64)
}

/// Easter Sunday by the Meeus/Jones/Butcher Gregorian algorithm.
fn easter_sunday(year: i32) -> NaiveDate {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = ((h + l - 7 * m + 114) % 31) + 1;
    NaiveDate::from_ymd_opt(year, month as u32, day as u32).unwrap_or_default()
}

fn fixed(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or_default()
}

/// The US market holiday set for one year, with weekend observation applied.
pub fn holidays_for_year(year: i32) -> BTreeSet<NaiveDate> {
    let mut set = BTreeSet::new();
    set.insert(observed(fixed(year, 1, 1))); // New Year's Day
    set.insert(nth_weekday(year, 1, Weekday::Mon, 3)); // MLK Day
    set.insert(nth_weekday(year, 2, Weekday::Mon, 3)); // Presidents' Day
    set.insert(easter_sunday(year) - Duration::days(2)); // Good Friday
    set.insert(last_weekday(year, 5, Weekday::Mon)); // Memorial Day
    set.insert(observed(fixed(year, 6, 19))); // Juneteenth
    set.insert(observed(fixed(year, 7, 4))); // Independence Day
    set.insert(nth_weekday(year, 9, Weekday::Mon, 1)); // Labor Day
    set.insert(nth_weekday(year, 11, Weekday::Thu, 4)); // Thanksgiving
    set.insert(observed(fixed(year, 12, 25))); // Christmas
    set
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn test_weekends_are_not_trading_days() {
        let cal = MarketCalendar::us_default();
        assert!(!cal.is_trading_day(d("2024-01-13"))); // Saturday
        assert!(!cal.is_trading_day(d("2024-01-14"))); // Sunday
        assert!(cal.is_trading_day(d("2024-01-16"))); // Tuesday
    }

    #[test]
    fn test_2024_holidays() {
        let h = holidays_for_year(2024);
        assert!(h.contains(&d("2024-01-01"))); // New Year's
        assert!(h.contains(&d("2024-01-15"))); // MLK
        assert!(h.contains(&d("2024-02-19"))); // Presidents'
        assert!(h.contains(&d("2024-03-29"))); // Good Friday
        assert!(h.contains(&d("2024-05-27"))); // Memorial
        assert!(h.contains(&d("2024-06-19"))); // Juneteenth
        assert!(h.contains(&d("2024-07-04"))); // Independence
        assert!(h.contains(&d("2024-09-02"))); // Labor
        assert!(h.contains(&d("2024-11-28"))); // Thanksgiving
        assert!(h.contains(&d("2024-12-25"))); // Christmas
    }

    #[test]
    fn test_observation_rules() {
        // Jul 4 2026 is a Saturday: observed Friday Jul 3
        assert!(holidays_for_year(2026).contains(&d("2026-07-03")));
        // Jan 1 2023 is a Sunday: observed Monday Jan 2
        assert!(holidays_for_year(2023).contains(&d("2023-01-02")));
    }

    #[test]
    fn test_new_year_observed_in_prior_december() {
        // Jan 1 2022 is a Saturday, observed Friday 2021-12-31
        let cal = MarketCalendar::us_default();
        assert!(!cal.is_trading_day(d("2021-12-31")));
    }

    #[test]
    fn test_easter_computus() {
        assert_eq!(easter_sunday(2024), d("2024-03-31"));
        assert_eq!(easter_sunday(2025), d("2025-04-20"));
        assert_eq!(easter_sunday(2026), d("2026-04-05"));
    }

    #[test]
    fn test_last_expected_trading_day_pre_close() {
        let cal = MarketCalendar::us_default();
        // Tuesday 2024-01-16 before the 21:00 close: last complete day is Friday 1/12
        // (Monday 1/15 was MLK Day)
        assert_eq!(
            cal.last_expected_trading_day(ts("2024-01-16T15:00:00Z")),
            d("2024-01-12")
        );
        // Same day after close: today counts
        assert_eq!(
            cal.last_expected_trading_day(ts("2024-01-16T21:30:00Z")),
            d("2024-01-16")
        );
    }

    #[test]
    fn test_last_expected_trading_day_weekend() {
        let cal = MarketCalendar::us_default();
        // Sunday: Friday is the last expected day
        assert_eq!(
            cal.last_expected_trading_day(ts("2024-01-21T10:00:00Z")),
            d("2024-01-19")
        );
    }

    #[test]
    fn test_trading_days_between_skips_weekend_and_holiday() {
        let cal = MarketCalendar::us_default();
        let days = cal.trading_days_between(d("2024-01-12"), d("2024-01-16"));
        // Fri 12th, (Sat, Sun, MLK Monday skipped), Tue 16th
        assert_eq!(days, vec![d("2024-01-12"), d("2024-01-16")]);
    }

    #[test]
    fn test_trading_days_back() {
        let cal = MarketCalendar::us_default();
        // 5 trading days back from Mon 2024-01-22 crosses the MLK week
        assert_eq!(cal.trading_days_back(d("2024-01-22"), 5), d("2024-01-12"));
    }

    #[test]
    fn test_configured_extra_holidays() {
        let cal = MarketCalendar::new(
            NaiveTime::from_hms_opt(21, 0, 0).unwrap(),
            [d("2024-01-17")],
        );
        assert!(!cal.is_trading_day(d("2024-01-17")));
    }

    #[test]
    fn test_market_open_window() {
        let cal = MarketCalendar::us_default();
        assert!(cal.is_market_open(ts("2024-01-16T14:00:00Z")));
        assert!(!cal.is_market_open(ts("2024-01-16T21:00:00Z")));
        assert!(!cal.is_market_open(ts("2024-01-13T14:00:00Z"))); // Saturday
    }
}
