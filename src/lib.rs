pub mod config;
pub mod engine;
pub mod errors;
pub mod indicators;
pub mod models;
pub mod param_utils;
pub mod performance;
pub mod provider;
pub mod status;
pub mod strategy;
pub mod synthetic;
pub mod wallet;

pub use config::{BacktestConfig, BacktestRequest, StrategySpec};
pub use engine::{BacktestEngine, RunOutcome};
pub use errors::BacktestError;
pub use models::{
    BacktestResult, Bar, DataSource, EquitySnapshot, PerformanceReport, Position, RunState,
    SignalAction, StrategySignal, Timeframe, Trade, TradeSide,
};
pub use performance::PerformanceCalculator;
pub use provider::{BarFetcher, BarSeries, HistoricalDataProvider, ProviderSettings, RestFetcher};
pub use status::{RunStatus, RunStatusSnapshot};
pub use strategy::{create_strategy, Strategy};
pub use wallet::MockWallet;
