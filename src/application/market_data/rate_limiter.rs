use crate::domain::clock::Clock;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Token budgets for the external provider.
#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    pub per_minute: u32,
    pub per_day: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            per_minute: 5,
            per_day: 500,
        }
    }
}

#[derive(Debug)]
struct BucketState {
    minute_window_start: DateTime<Utc>,
    minute_used: u32,
    /// Per-day accounting resets at UTC midnight.
    day: NaiveDate,
    day_used: u32,
}

/// Remaining budget view for observability.
#[derive(Debug, Clone, Copy)]
pub struct RateLimiterSnapshot {
    pub minute_remaining: u32,
    pub day_remaining: u32,
}

/// Process-wide token bucket governing calls to the external provider.
///
/// A fixed one-minute window plus a UTC-day counter; both must have budget
/// for an acquisition to succeed. State is not persisted - the budget is
/// conservatively re-seeded on restart.
pub struct ProviderRateLimiter {
    config: RateLimiterConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<BucketState>,
}

impl ProviderRateLimiter {
    pub fn new(config: RateLimiterConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            config,
            state: Mutex::new(BucketState {
                minute_window_start: now,
                minute_used: 0,
                day: now.date_naive(),
                day_used: 0,
            }),
            clock,
        }
    }

    /// Non-blocking, atomic acquisition of one provider call.
    pub async fn try_acquire(&self) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        Self::refill(&mut state, now);

        if state.minute_used < self.config.per_minute && state.day_used < self.config.per_day {
            state.minute_used += 1;
            state.day_used += 1;
            true
        } else {
            debug!(
                "Rate limiter depleted: {}/{} this minute, {}/{} today",
                state.minute_used, self.config.per_minute, state.day_used, self.config.per_day
            );
            false
        }
    }

    /// Wait until a provider slot is free or `deadline` passes. Does not
    /// consume the slot; the subsequent fetch claims it via `try_acquire`.
    pub async fn wait_acquire(&self, deadline: DateTime<Utc>) -> bool {
        loop {
            let now = self.clock.now();
            if now >= deadline {
                return false;
            }

            let wake_at = {
                let mut state = self.state.lock().await;
                Self::refill(&mut state, now);
                if state.minute_used < self.config.per_minute
                    && state.day_used < self.config.per_day
                {
                    return true;
                }
                if state.day_used >= self.config.per_day {
                    // Day budget exhausted: next refill at UTC midnight
                    match state.day.succ_opt() {
                        Some(next_day) => next_day
                            .and_hms_opt(0, 0, 0)
                            .map(|dt| dt.and_utc())
                            .unwrap_or(deadline),
                        None => deadline,
                    }
                } else {
                    state.minute_window_start + ChronoDuration::seconds(60)
                }
            };

            let wake_at = wake_at.min(deadline);
            let sleep_for = (wake_at - now)
                .to_std()
                .unwrap_or(Duration::from_millis(100))
                .max(Duration::from_millis(50));
            tokio::time::sleep(sleep_for).await;
        }
    }

    pub async fn snapshot(&self) -> RateLimiterSnapshot {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        Self::refill(&mut state, now);
        RateLimiterSnapshot {
            minute_remaining: self.config.per_minute.saturating_sub(state.minute_used),
            day_remaining: self.config.per_day.saturating_sub(state.day_used),
        }
    }

    fn refill(state: &mut BucketState, now: DateTime<Utc>) {
        if now - state.minute_window_start >= ChronoDuration::seconds(60) {
            state.minute_window_start = now;
            state.minute_used = 0;
        }
        let today = now.date_naive();
        if today != state.day {
            if state.day_used > 0 {
                debug!(
                    "Rate limiter day rollover: {} calls spent on {}",
                    state.day_used, state.day
                );
            }
            state.day = today;
            state.day_used = 0;
        }
        if now < state.minute_window_start {
            // Clock moved backwards; restart the window rather than stall
            warn!("Rate limiter observed clock going backwards, resetting window");
            state.minute_window_start = now;
        }
    }
}
