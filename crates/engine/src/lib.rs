//! Strategy Bots Engine: declarative strategies, backtesting and live bots
//!
//! Provides:
//! - Indicator registry with a closed catalog of 23 indicators
//! - Strategy validation, compilation and signal evaluation
//! - Bar-by-bar backtest simulator with fees, safety exits and statistics
//! - Live bot runtime and supervisor over a signed exchange client

pub mod api;
pub mod bot;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod fees;
pub mod indicators;
pub mod registry;
pub mod store;
pub mod strategy;
pub mod supervisor;
pub mod types;
pub mod validator;

#[cfg(test)]
mod testkit;

// Re-exports for convenience
pub use api::{
    CredentialProvider, Credentials, Exchange, ExchangeConnector, RateLimitConfig, RateLimiter,
    UpbitClient, UpbitConnector,
};
pub use bot::{BotRecord, BotRunner, BotStore, EngineSettings, FillUpdate, StrategyRecord};
pub use engine::{run_backtest, BacktestEngine};
pub use error::{BacktestError, ControlError, CycleError, ExchangeError, StoreError};
pub use evaluator::{last_signal, signal_series};
pub use fees::FeeSchedule;
pub use registry::{catalog, CatalogEntry, IndicatorKind};
pub use store::SqliteBotStore;
pub use strategy::{CompiledStrategy, StrategyConfig};
pub use supervisor::{BotSupervisor, ControlResponse, ReconcilePolicy};
pub use types::*;
pub use validator::{compile, validate, Violation};
