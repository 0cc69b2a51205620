use crate::config::StrategySpec;
use crate::errors::BacktestError;
use crate::models::{Bar, Position, StrategySignal};
use anyhow::Result;

/// Pluggable signal generator. The engine hands each strategy the current
/// bar, a rolling window of that symbol's history ending at the current
/// bar, and the open position state for the symbol; the strategy answers
/// with zero or more signals. Implementations must be pure functions of
/// their inputs so that replays reproduce exactly.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    /// Bars of history the strategy wants before it starts signalling.
    fn lookback(&self) -> usize;

    fn on_bar(
        &self,
        bar: &Bar,
        window: &[Bar],
        position: Option<&Position>,
    ) -> Result<Vec<StrategySignal>>;
}

#[path = "strategies/ema_crossover.rs"]
pub mod ema_crossover;

pub use ema_crossover::EmaCrossoverStrategy;

#[path = "strategies/rsi_reversion.rs"]
pub mod rsi_reversion;

pub use rsi_reversion::RsiReversionStrategy;

#[path = "strategies/momentum.rs"]
pub mod momentum;

pub use momentum::MomentumStrategy;

/// Closed factory over the built-in strategy variants. Custom strategies
/// implement [`Strategy`] and enter the engine via `run_with_strategy`.
pub fn create_strategy(spec: &StrategySpec) -> Result<Box<dyn Strategy>, BacktestError> {
    match spec.name.as_str() {
        "ema_crossover" => Ok(Box::new(EmaCrossoverStrategy::new(&spec.parameters))),
        "rsi_reversion" => Ok(Box::new(RsiReversionStrategy::new(&spec.parameters))),
        "momentum" => Ok(Box::new(MomentumStrategy::new(&spec.parameters))),
        other => Err(BacktestError::Configuration(format!(
            "Unknown strategy '{}'",
            other
        ))),
    }
}
