pub mod engine;
pub mod freshness;
pub mod rate_limiter;
pub mod single_flight;

pub use engine::{MarketDataEngine, MarketDataEngineConfig};
pub use freshness::{FreshnessPolicy, HistoryTtl};
pub use rate_limiter::{ProviderRateLimiter, RateLimiterConfig};
pub use single_flight::SingleFlight;
