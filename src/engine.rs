use crate::config::{BacktestConfig, BacktestRequest};
use crate::errors::BacktestError;
use crate::models::{
    Bar, BacktestResult, DataSource, RunState, SignalAction, StrategySignal, TradeSide,
};
use crate::performance::PerformanceCalculator;
use crate::provider::HistoricalDataProvider;
use crate::status::RunStatus;
use crate::strategy::{create_strategy, Strategy};
use crate::wallet::MockWallet;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

const CONSERVATION_TOLERANCE: f64 = 1e-6;

/// Terminal outcome of a run. Cancellation is not an error, but it also
/// carries no result: the partial wallet state is discarded.
#[derive(Debug)]
pub enum RunOutcome {
    Completed(Box<BacktestResult>),
    Cancelled,
}

/// Replays historical bars through a strategy against a fresh MockWallet.
/// The engine owns no per-run state; everything a run touches lives in
/// `run`'s stack frame, so concurrent runs only share the provider.
pub struct BacktestEngine {
    provider: Arc<HistoricalDataProvider>,
}

struct SymbolHistory {
    symbol: String,
    bars: Vec<Bar>,
}

/// One entry of the merged chronological event stream.
struct ReplayEvent {
    open_time: DateTime<Utc>,
    symbol_index: usize,
    bar_index: usize,
}

impl BacktestEngine {
    pub fn new(provider: Arc<HistoricalDataProvider>) -> Self {
        Self { provider }
    }

    /// Validates the request, resolves the strategy from the closed factory
    /// set, and replays. Invalid configuration fails here, before any data
    /// is fetched.
    pub async fn run(
        &self,
        request: BacktestRequest,
        status: &RunStatus,
    ) -> Result<RunOutcome, BacktestError> {
        let config = match request.validate() {
            Ok(config) => config,
            Err(error) => {
                status.set_state(RunState::Failed);
                return Err(error);
            }
        };
        let strategy = match create_strategy(&config.strategy) {
            Ok(strategy) => strategy,
            Err(error) => {
                status.set_state(RunState::Failed);
                return Err(error);
            }
        };
        self.run_with_strategy(&config, strategy.as_ref(), status)
            .await
    }

    /// Entry point for callers bringing their own [`Strategy`] implementation.
    pub async fn run_with_strategy(
        &self,
        config: &BacktestConfig,
        strategy: &dyn Strategy,
        status: &RunStatus,
    ) -> Result<RunOutcome, BacktestError> {
        status.set_state(RunState::Running);
        let outcome = self.replay(config, strategy, status).await;
        match &outcome {
            Ok(RunOutcome::Completed(_)) => status.set_state(RunState::Completed),
            Ok(RunOutcome::Cancelled) => status.set_state(RunState::Cancelled),
            Err(_) => status.set_state(RunState::Failed),
        }
        outcome
    }

    async fn replay(
        &self,
        config: &BacktestConfig,
        strategy: &dyn Strategy,
        status: &RunStatus,
    ) -> Result<RunOutcome, BacktestError> {
        let mut warnings: Vec<String> = Vec::new();
        let mut data_sources: BTreeMap<String, DataSource> = BTreeMap::new();

        let fetches = config.symbols.iter().map(|symbol| {
            self.provider
                .get_bars(symbol, config.timeframe, config.start, config.end)
        });
        let mut histories: Vec<SymbolHistory> = Vec::with_capacity(config.symbols.len());
        for (symbol, fetched) in config.symbols.iter().zip(join_all(fetches).await) {
            let series = fetched?;
            warnings.extend(series.warnings.iter().cloned());
            data_sources.insert(symbol.clone(), series.source);
            if series.source != DataSource::Live {
                info!(
                    "Data for {} degraded to {}",
                    symbol,
                    series.source.as_str()
                );
            }

            let total = series.bars.len();
            let bars: Vec<Bar> = series
                .bars
                .iter()
                .filter(|bar| bar.is_well_formed())
                .cloned()
                .collect();
            let skipped = total - bars.len();
            if skipped > 0 {
                let message = format!(
                    "{}: skipped {} malformed bar{}",
                    symbol,
                    skipped,
                    if skipped == 1 { "" } else { "s" }
                );
                warn!("{}", message);
                warnings.push(message);
            }
            if bars.is_empty() {
                return Err(BacktestError::DataUnavailable {
                    symbol: symbol.clone(),
                    reason: "no usable bars in the requested range".to_string(),
                });
            }
            histories.push(SymbolHistory {
                symbol: symbol.clone(),
                bars,
            });
        }

        // Merge per-symbol streams into one chronological sequence. Ties
        // across symbols break by symbol name so replay is reproducible.
        let mut events: Vec<ReplayEvent> = Vec::new();
        for (symbol_index, history) in histories.iter().enumerate() {
            for (bar_index, bar) in history.bars.iter().enumerate() {
                events.push(ReplayEvent {
                    open_time: bar.open_time,
                    symbol_index,
                    bar_index,
                });
            }
        }
        events.sort_by(|a, b| {
            a.open_time.cmp(&b.open_time).then_with(|| {
                histories[a.symbol_index]
                    .symbol
                    .cmp(&histories[b.symbol_index].symbol)
            })
        });

        status.set_total(events.len());
        info!(
            "Replaying {} bars across {} symbol{} with strategy {}",
            events.len(),
            histories.len(),
            if histories.len() == 1 { "" } else { "s" },
            strategy.name()
        );

        let mut wallet = MockWallet::new(config.initial_capital, config.max_leverage);
        let mut pending_signals: HashMap<usize, Vec<StrategySignal>> = HashMap::new();
        let mut marks: HashMap<String, f64> = HashMap::new();
        let mut conservation_warned = false;
        let lookback = strategy.lookback().max(1);

        for (processed, event) in events.iter().enumerate() {
            // Cooperative cancellation, observed once per bar boundary.
            if status.is_cancelled() {
                info!("Run cancelled after {} bars; discarding wallet", processed);
                return Ok(RunOutcome::Cancelled);
            }

            let history = &histories[event.symbol_index];
            let bar = &history.bars[event.bar_index];

            // (1) Execute signals generated on this symbol's previous bar at
            // this bar's open. Never at the signal bar's own prices.
            if let Some(signals) = pending_signals.remove(&event.symbol_index) {
                for signal in signals {
                    self.execute_signal(
                        config,
                        &mut wallet,
                        &history.symbol,
                        &signal,
                        bar,
                        strategy.name(),
                        &mut warnings,
                    );
                }
            }

            // (2) Mark to market at this bar's close.
            marks.insert(history.symbol.clone(), bar.close);
            wallet.mark_to_market(bar.open_time, &marks);

            let drift = wallet.conservation_drift();
            if drift.abs() > CONSERVATION_TOLERANCE && !conservation_warned {
                conservation_warned = true;
                let message = format!(
                    "conservation drift {:.9} detected at {}",
                    drift, bar.open_time
                );
                warn!("{}", message);
                warnings.push(message);
            }

            // (3) Ask the strategy for signals on the bar just closed.
            let window_start = (event.bar_index + 1).saturating_sub(lookback);
            let window = &history.bars[window_start..=event.bar_index];
            let position = wallet.position(&history.symbol);
            let signals = strategy.on_bar(bar, window, position).map_err(|error| {
                BacktestError::Strategy {
                    name: strategy.name().to_string(),
                    reason: error.to_string(),
                }
            })?;

            // (4) Queue for the next bar of this symbol. Signals on the last
            // bar have no future bar to fill on and are dropped.
            let actionable: Vec<StrategySignal> = signals
                .into_iter()
                .filter(|signal| {
                    signal.action != SignalAction::Hold && signal.size_fraction_of_equity > 0.0
                })
                .collect();
            if !actionable.is_empty() {
                if event.bar_index + 1 < history.bars.len() {
                    pending_signals
                        .entry(event.symbol_index)
                        .or_default()
                        .extend(actionable);
                } else {
                    let message = format!(
                        "{}: dropped {} signal{} emitted on the final bar",
                        history.symbol,
                        actionable.len(),
                        if actionable.len() == 1 { "" } else { "s" }
                    );
                    debug!("{}", message);
                    warnings.push(message);
                }
            }

            status.set_processed(processed + 1);
        }

        let final_equity = wallet.total_equity();
        let (trades, equity_curve) = wallet.into_parts();
        let metrics = PerformanceCalculator::from_equity_curve(
            &equity_curve,
            &trades,
            config.timeframe.bars_per_year(),
        );

        info!(
            "Backtest completed: {} trades, final equity {:.2}",
            trades.len(),
            final_equity
        );

        Ok(RunOutcome::Completed(Box::new(BacktestResult {
            run_id: Uuid::new_v4().to_string(),
            strategy_name: strategy.name().to_string(),
            symbols: config.symbols.clone(),
            timeframe: config.timeframe,
            start: config.start,
            end: config.end,
            initial_capital: config.initial_capital,
            final_equity,
            metrics,
            equity_curve,
            trades,
            data_sources,
            warnings,
            created_at: Utc::now(),
        })))
    }

    /// Executes one queued signal at the fill bar's open. Per-trade
    /// rejections become warnings; the run keeps going.
    #[allow(clippy::too_many_arguments)]
    fn execute_signal(
        &self,
        config: &BacktestConfig,
        wallet: &mut MockWallet,
        symbol: &str,
        signal: &StrategySignal,
        fill_bar: &Bar,
        strategy_tag: &str,
        warnings: &mut Vec<String>,
    ) {
        let side = match signal.action {
            SignalAction::Buy => TradeSide::Buy,
            SignalAction::Sell => TradeSide::Sell,
            SignalAction::Hold => return,
        };

        let equity = wallet.total_equity();
        let notional = signal.size_fraction_of_equity.min(1.0) * equity;
        if notional <= 0.0 || fill_bar.open <= 0.0 {
            return;
        }
        let mut size = notional / fill_bar.open;

        if side == TradeSide::Sell && !config.allow_short_selling {
            let held = wallet.position(symbol).map(|p| p.size).unwrap_or(0.0);
            if held <= 0.0 {
                debug!(
                    "{}: sell signal with no long position and shorting disabled",
                    symbol
                );
                return;
            }
            size = size.min(held);
        }

        match wallet.execute_trade(
            symbol,
            side,
            size,
            fill_bar.open,
            fill_bar.open_time,
            config.commission_rate,
            config.slippage_bps,
            strategy_tag,
        ) {
            Ok(trade) => {
                debug!(
                    "{} {} {:.8} {} at {:.8}",
                    trade.timestamp,
                    trade.side.as_str(),
                    trade.requested_size,
                    symbol,
                    trade.fill_price
                );
            }
            Err(error @ BacktestError::InsufficientFunds { .. }) => {
                let message = format!("{} at {}: {}", symbol, fill_bar.open_time, error);
                warn!("Trade rejected: {}", message);
                warnings.push(format!("trade rejected: {}", message));
            }
            Err(error) => {
                let message = format!("{} at {}: {}", symbol, fill_bar.open_time, error);
                warn!("Trade skipped: {}", message);
                warnings.push(format!("trade skipped: {}", message));
            }
        }
    }
}
