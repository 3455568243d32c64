pub mod database;
pub mod portfolio_repository;
pub mod price_repository;

pub use database::Database;
pub use portfolio_repository::SqlitePortfolioRepository;
pub use price_repository::SqlitePriceRepository;
