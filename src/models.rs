use anyhow::anyhow;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }

    /// Duration of a single bar interval.
    pub fn step(&self) -> Duration {
        match self {
            Timeframe::H1 => Duration::hours(1),
            Timeframe::H4 => Duration::hours(4),
            Timeframe::D1 => Duration::days(1),
        }
    }

    /// Bars per calendar year for a 24/7 market, used to annualize metrics.
    pub fn bars_per_year(&self) -> f64 {
        match self {
            Timeframe::H1 => 8760.0,
            Timeframe::H4 => 2190.0,
            Timeframe::D1 => 365.0,
        }
    }
}

impl FromStr for Timeframe {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "1h" => Ok(Timeframe::H1),
            "4h" => Ok(Timeframe::H4),
            "1d" => Ok(Timeframe::D1),
            other => Err(anyhow!("Unsupported timeframe '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// A bar is usable when every price is finite and positive, the range
    /// is consistent and volume is not negative.
    pub fn is_well_formed(&self) -> bool {
        let prices = [self.open, self.high, self.low, self.close];
        prices.iter().all(|p| p.is_finite() && *p > 0.0)
            && self.high >= self.low
            && self.volume.is_finite()
            && self.volume >= 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

impl SignalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::Buy => "buy",
            SignalAction::Sell => "sell",
            SignalAction::Hold => "hold",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySignal {
    pub action: SignalAction,
    /// Target order size expressed as a fraction of current total equity.
    pub size_fraction_of_equity: f64,
}

impl StrategySignal {
    pub fn buy(size_fraction_of_equity: f64) -> Self {
        Self {
            action: SignalAction::Buy,
            size_fraction_of_equity,
        }
    }

    pub fn sell(size_fraction_of_equity: f64) -> Self {
        Self {
            action: SignalAction::Sell,
            size_fraction_of_equity,
        }
    }

    pub fn hold() -> Self {
        Self {
            action: SignalAction::Hold,
            size_fraction_of_equity: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "buy",
            TradeSide::Sell => "sell",
        }
    }

    pub fn sign(&self) -> f64 {
        match self {
            TradeSide::Buy => 1.0,
            TradeSide::Sell => -1.0,
        }
    }
}

/// One aggregated open position per symbol. `size` is signed: positive for
/// long, negative for short. `entry_price` is the volume-weighted average
/// of the fills still open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub size: f64,
    pub entry_price: f64,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    pub fn is_long(&self) -> bool {
        self.size > 0.0
    }

    pub fn market_value(&self, price: f64) -> f64 {
        self.size * price
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.size
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub order_id: String,
    pub symbol: String,
    pub side: TradeSide,
    pub requested_size: f64,
    pub fill_price: f64,
    pub commission: f64,
    pub slippage_applied: f64,
    /// Gross profit realized by the closing portion of this fill; None when
    /// the trade only opened or increased a position.
    pub realized_pnl: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub strategy_tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquitySnapshot {
    pub timestamp: DateTime<Utc>,
    pub cash: f64,
    pub positions_value: f64,
    pub total_equity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataSource {
    Live,
    CachedStale,
    Synthetic,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::Live => "LIVE",
            DataSource::CachedStale => "CACHED_STALE",
            DataSource::Synthetic => "SYNTHETIC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceReport {
    pub total_return: f64,
    pub annualized_return: f64,
    /// None when the periodic return volatility is zero.
    pub sharpe_ratio: Option<f64>,
    /// None when there are no negative periodic returns.
    pub sortino_ratio: Option<f64>,
    pub max_drawdown: f64,
    pub max_drawdown_duration_bars: usize,
    pub drawdown_ongoing: bool,
    /// None when no trade closed any quantity.
    pub win_rate: Option<f64>,
    /// None when there are no losing trades; see `no_losing_trades`.
    pub profit_factor: Option<f64>,
    pub no_losing_trades: bool,
    pub total_trades: usize,
    pub closed_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub total_commission: f64,
    pub final_equity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestResult {
    pub run_id: String,
    pub strategy_name: String,
    pub symbols: Vec<String>,
    pub timeframe: Timeframe,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub initial_capital: f64,
    pub final_equity: f64,
    pub metrics: PerformanceReport,
    pub equity_curve: Vec<EquitySnapshot>,
    pub trades: Vec<Trade>,
    pub data_sources: BTreeMap<String, DataSource>,
    pub warnings: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Order ids are derived from replay state so that identical runs produce
/// byte-identical ledgers.
pub fn generate_order_id(sequence: usize, symbol: &str, timestamp: DateTime<Utc>) -> String {
    format!(
        "{:06}_{}_{}",
        sequence,
        symbol,
        timestamp.format("%Y%m%dT%H%M%S")
    )
}
