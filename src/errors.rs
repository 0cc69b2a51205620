use thiserror::Error;

/// Error taxonomy for a backtest run. Fatal variants abort the run with a
/// structured reason; `InsufficientFunds` and `Numeric` are handled per
/// trade / per bar and accumulate into the result warnings instead.
#[derive(Debug, Error)]
pub enum BacktestError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("market data unavailable for {symbol}: {reason}")]
    DataUnavailable { symbol: String, reason: String },

    #[error("insufficient funds: required {required:.2}, available {available:.2}")]
    InsufficientFunds { required: f64, available: f64 },

    #[error("strategy '{name}' failed: {reason}")]
    Strategy { name: String, reason: String },

    #[error("numeric error: {0}")]
    Numeric(String),
}

impl BacktestError {
    pub fn configuration(message: impl Into<String>) -> Self {
        BacktestError::Configuration(message.into())
    }
}
