// Core modules
pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod execution;
pub mod indicators;
pub mod models;
pub mod risk;
pub mod strategy;

// Re-export commonly used types
pub use config::BotConfig;
pub use engine::TradingLoopController;
pub use exchange::ExchangeGateway;
pub use models::*;
pub use strategy::Strategy;
