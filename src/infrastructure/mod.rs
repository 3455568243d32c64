pub mod alpha_vantage;
pub mod cache;
pub mod http_client_factory;
pub mod mock;
pub mod persistence;
