pub mod execution;

pub use execution::{PortfolioState, TradeExecutionService};
