use anyhow::{anyhow, Result as AnyResult};
use async_trait::async_trait;
use backtester::{
    BacktestEngine, BacktestRequest, Bar, BarFetcher, DataSource, HistoricalDataProvider,
    Position, ProviderSettings, RunOutcome, RunState, RunStatus, Strategy, StrategySignal,
    StrategySpec, Timeframe,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration as StdDuration;

fn ensure_test_env() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
}

fn hourly_bars(symbol: &str, prices: &[(f64, f64)]) -> Vec<Bar> {
    prices
        .iter()
        .enumerate()
        .map(|(i, (open, close))| Bar {
            symbol: symbol.to_string(),
            timeframe: Timeframe::H1,
            open_time: base_time() + Duration::hours(i as i64),
            open: *open,
            high: open.max(*close) * 1.01,
            low: open.min(*close) * 0.99,
            close: *close,
            volume: 100.0,
        })
        .collect()
}

struct StaticFetcher {
    data: HashMap<String, Vec<Bar>>,
    calls: AtomicUsize,
}

impl StaticFetcher {
    fn new(data: HashMap<String, Vec<Bar>>) -> Self {
        Self {
            data,
            calls: AtomicUsize::new(0),
        }
    }

    fn single(symbol: &str, bars: Vec<Bar>) -> Self {
        let mut data = HashMap::new();
        data.insert(symbol.to_string(), bars);
        Self::new(data)
    }
}

#[async_trait]
impl BarFetcher for StaticFetcher {
    async fn fetch(
        &self,
        symbol: &str,
        _timeframe: Timeframe,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> AnyResult<Vec<Bar>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.data
            .get(symbol)
            .cloned()
            .ok_or_else(|| anyhow!("no data feed for {}", symbol))
    }
}

fn fast_settings() -> ProviderSettings {
    ProviderSettings {
        cache_ttl: StdDuration::from_secs(300),
        max_retries: 0,
        base_retry_delay: StdDuration::from_millis(1),
        max_retry_delay: StdDuration::from_millis(2),
        min_request_gap: StdDuration::from_millis(0),
    }
}

fn engine_over(fetcher: StaticFetcher) -> BacktestEngine {
    BacktestEngine::new(Arc::new(HistoricalDataProvider::new(
        Box::new(fetcher),
        fast_settings(),
    )))
}

fn request(symbols: &[&str], strategy: &str, hours: i64, capital: f64) -> BacktestRequest {
    BacktestRequest {
        strategy: StrategySpec {
            name: strategy.to_string(),
            parameters: HashMap::new(),
        },
        symbols: symbols.iter().map(|s| s.to_string()).collect(),
        start: base_time(),
        end: base_time() + Duration::hours(hours),
        initial_capital: capital,
        timeframe: Timeframe::H1,
        commission_rate: 0.001,
        slippage_bps: 1.0,
        max_leverage: 1.0,
        allow_short_selling: false,
    }
}

/// Emits a fixed signal whenever the replay reaches a scheduled bar time.
struct ScriptedStrategy {
    schedule: HashMap<DateTime<Utc>, StrategySignal>,
}

impl ScriptedStrategy {
    fn new(entries: Vec<(DateTime<Utc>, StrategySignal)>) -> Self {
        Self {
            schedule: entries.into_iter().collect(),
        }
    }
}

impl Strategy for ScriptedStrategy {
    fn name(&self) -> &str {
        "scripted"
    }

    fn lookback(&self) -> usize {
        1
    }

    fn on_bar(
        &self,
        bar: &Bar,
        _window: &[Bar],
        _position: Option<&Position>,
    ) -> AnyResult<Vec<StrategySignal>> {
        Ok(self
            .schedule
            .get(&bar.open_time)
            .cloned()
            .map(|signal| vec![signal])
            .unwrap_or_default())
    }
}

struct PanickyStrategy;

impl Strategy for PanickyStrategy {
    fn name(&self) -> &str {
        "panicky"
    }

    fn lookback(&self) -> usize {
        1
    }

    fn on_bar(
        &self,
        _bar: &Bar,
        _window: &[Bar],
        _position: Option<&Position>,
    ) -> AnyResult<Vec<StrategySignal>> {
        Err(anyhow!("indicator buffer underflow"))
    }
}

#[tokio::test]
async fn worked_example_fills_at_next_bar_open_with_exact_decimals() {
    ensure_test_env();
    // Opens/closes per bar: signal on bar 0 fills at bar 1 open (108),
    // signal on bar 1 fills at bar 2 open (105).
    let bars = hourly_bars("BTC-USD", &[(100.0, 104.0), (108.0, 110.0), (105.0, 106.0)]);
    let engine = engine_over(StaticFetcher::single("BTC-USD", bars));

    // Buy a 0.108 equity fraction: 1000 * 0.108 / 108 = exactly one unit.
    let strategy = ScriptedStrategy::new(vec![
        (base_time(), StrategySignal::buy(0.108)),
        (
            base_time() + Duration::hours(1),
            StrategySignal::sell(1.0),
        ),
    ]);

    let config = request(&["BTC-USD"], "scripted", 3, 1_000.0)
        .validate()
        .unwrap();
    let status = RunStatus::new();
    let outcome = engine
        .run_with_strategy(&config, &strategy, &status)
        .await
        .unwrap();

    let result = match outcome {
        RunOutcome::Completed(result) => result,
        RunOutcome::Cancelled => panic!("run should complete"),
    };

    assert_eq!(result.trades.len(), 2);
    let buy = &result.trades[0];
    let sell = &result.trades[1];

    // Slippage of 1 bp moves fills against the trader.
    assert!((buy.fill_price - 108.0108).abs() < 1e-9);
    assert!((buy.commission - 0.1080108).abs() < 1e-9);
    assert!((buy.requested_size - 1.0).abs() < 1e-9);
    assert!(buy.realized_pnl.is_none());

    let expected_sell_fill = 105.0 * (1.0 - 0.0001);
    assert!((sell.fill_price - expected_sell_fill).abs() < 1e-9);
    assert!((sell.commission - expected_sell_fill * 0.001).abs() < 1e-9);
    let expected_pnl = expected_sell_fill - 108.0108;
    assert!((sell.realized_pnl.unwrap() - expected_pnl).abs() < 1e-9);

    // Anti-lookahead: each fill lands on the bar after its signal bar.
    assert_eq!(buy.timestamp, base_time() + Duration::hours(1));
    assert_eq!(sell.timestamp, base_time() + Duration::hours(2));

    // The run ends flat, so equity reconciles to realized pnl less costs.
    let expected_final = 1_000.0 + expected_pnl - buy.commission - sell.commission;
    assert!((result.final_equity - expected_final).abs() < 1e-6);
    assert!(!result
        .warnings
        .iter()
        .any(|w| w.contains("conservation drift")));
}

#[tokio::test]
async fn zero_trade_run_reports_flat_metrics() {
    ensure_test_env();
    let bars = hourly_bars(
        "BTC-USD",
        &[(100.0, 100.0), (100.0, 100.0), (100.0, 100.0), (100.0, 100.0)],
    );
    let engine = engine_over(StaticFetcher::single("BTC-USD", bars));
    let strategy = ScriptedStrategy::new(Vec::new());

    let config = request(&["BTC-USD"], "scripted", 4, 1_000.0)
        .validate()
        .unwrap();
    let status = RunStatus::new();
    let outcome = engine
        .run_with_strategy(&config, &strategy, &status)
        .await
        .unwrap();

    let result = match outcome {
        RunOutcome::Completed(result) => result,
        RunOutcome::Cancelled => panic!("run should complete"),
    };

    assert!(result.trades.is_empty());
    assert_eq!(result.metrics.total_return, 0.0);
    assert_eq!(result.metrics.max_drawdown, 0.0);
    assert!(result.metrics.sharpe_ratio.is_none());
    assert!(result.metrics.win_rate.is_none());
    assert_eq!(result.final_equity, 1_000.0);
    assert_eq!(status.snapshot().state, RunState::Completed);
}

#[tokio::test]
async fn identical_runs_produce_identical_ledgers() {
    ensure_test_env();
    let closes: Vec<(f64, f64)> = (0..120)
        .map(|i| {
            let wave = 100.0 + 10.0 * ((i as f64) * 0.37).sin() + (i as f64) * 0.05;
            (wave, wave * 1.002)
        })
        .collect();
    let bars = hourly_bars("BTC-USD", &closes);

    let mut ledgers = Vec::new();
    for _ in 0..2 {
        let engine = engine_over(StaticFetcher::single("BTC-USD", bars.clone()));
        let status = RunStatus::new();
        let outcome = engine
            .run(request(&["BTC-USD"], "momentum", 120, 10_000.0), &status)
            .await
            .unwrap();
        let result = match outcome {
            RunOutcome::Completed(result) => result,
            RunOutcome::Cancelled => panic!("run should complete"),
        };
        let ledger = serde_json::to_string(&(&result.trades, &result.equity_curve)).unwrap();
        ledgers.push(ledger);
        assert!(!result.trades.is_empty(), "fixture should produce trades");
    }

    assert_eq!(ledgers[0], ledgers[1]);
}

#[tokio::test]
async fn every_fill_happens_strictly_after_its_signal_bar() {
    ensure_test_env();
    let closes: Vec<(f64, f64)> = (0..90)
        .map(|i| {
            let wave = 100.0 + 15.0 * ((i as f64) * 0.21).sin();
            (wave, wave * 0.999)
        })
        .collect();
    let bars = hourly_bars("BTC-USD", &closes);
    let bar_times: Vec<DateTime<Utc>> = bars.iter().map(|b| b.open_time).collect();
    let engine = engine_over(StaticFetcher::single("BTC-USD", bars));

    let status = RunStatus::new();
    let outcome = engine
        .run(request(&["BTC-USD"], "rsi_reversion", 90, 10_000.0), &status)
        .await
        .unwrap();
    let result = match outcome {
        RunOutcome::Completed(result) => result,
        RunOutcome::Cancelled => panic!("run should complete"),
    };

    assert!(!result.trades.is_empty(), "fixture should produce trades");
    for trade in &result.trades {
        // A fill on the first bar would mean the signal used future data.
        assert!(trade.timestamp > bar_times[0]);
        // Fill price is the open of the fill bar (adjusted by slippage),
        // never the close of the signal bar.
        let fill_bar_index = bar_times
            .iter()
            .position(|t| *t == trade.timestamp)
            .expect("trade timestamp matches a bar");
        assert!(fill_bar_index >= 1);
        let expected_ref = closes[fill_bar_index].0;
        let slip = 1.0 / 10_000.0;
        let adjusted = match trade.side {
            backtester::TradeSide::Buy => expected_ref * (1.0 + slip),
            backtester::TradeSide::Sell => expected_ref * (1.0 - slip),
        };
        assert!((trade.fill_price - adjusted).abs() < 1e-9);
    }

    // Drawdown stays a ratio.
    assert!(result.metrics.max_drawdown >= 0.0);
    assert!(result.metrics.max_drawdown <= 1.0);
}

#[tokio::test]
async fn failing_symbol_degrades_to_synthetic_and_completes() {
    ensure_test_env();
    let mut data = HashMap::new();
    data.insert(
        "BTC-USD".to_string(),
        hourly_bars(
            "BTC-USD",
            &(0..48)
                .map(|i| (100.0 + i as f64, 100.5 + i as f64))
                .collect::<Vec<_>>(),
        ),
    );
    // ETH-USD has no feed: every fetch errors and the provider falls back.
    let engine = engine_over(StaticFetcher::new(data));

    let status = RunStatus::new();
    let outcome = engine
        .run(
            request(&["BTC-USD", "ETH-USD"], "momentum", 48, 10_000.0),
            &status,
        )
        .await
        .unwrap();
    let result = match outcome {
        RunOutcome::Completed(result) => result,
        RunOutcome::Cancelled => panic!("run should complete"),
    };

    assert_eq!(result.data_sources["BTC-USD"], DataSource::Live);
    assert_eq!(result.data_sources["ETH-USD"], DataSource::Synthetic);
    assert!(result
        .warnings
        .iter()
        .any(|w| w.contains("synthetic")));
    assert_eq!(status.snapshot().state, RunState::Completed);
}

#[tokio::test]
async fn cancellation_discards_the_partial_run() {
    ensure_test_env();
    let closes: Vec<(f64, f64)> = (0..200).map(|i| (100.0 + i as f64, 100.0 + i as f64)).collect();
    let engine = engine_over(StaticFetcher::single("BTC-USD", hourly_bars("BTC-USD", &closes)));

    let status = RunStatus::new();
    status.cancel();
    let outcome = engine
        .run(request(&["BTC-USD"], "momentum", 200, 10_000.0), &status)
        .await
        .unwrap();

    assert!(matches!(outcome, RunOutcome::Cancelled));
    assert_eq!(status.snapshot().state, RunState::Cancelled);
}

#[tokio::test]
async fn invalid_configuration_fails_before_any_fetch() {
    ensure_test_env();
    let fetcher = StaticFetcher::new(HashMap::new());
    let calls = Arc::new(AtomicUsize::new(0));

    struct CountingFetcher {
        calls: Arc<AtomicUsize>,
        inner: StaticFetcher,
    }

    #[async_trait]
    impl BarFetcher for CountingFetcher {
        async fn fetch(
            &self,
            symbol: &str,
            timeframe: Timeframe,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> AnyResult<Vec<Bar>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.fetch(symbol, timeframe, start, end).await
        }
    }

    let engine = BacktestEngine::new(Arc::new(HistoricalDataProvider::new(
        Box::new(CountingFetcher {
            calls: calls.clone(),
            inner: fetcher,
        }),
        fast_settings(),
    )));

    let mut bad_request = request(&[], "momentum", 48, 10_000.0);
    bad_request.symbols.clear();
    let status = RunStatus::new();
    let error = engine.run(bad_request, &status).await.unwrap_err();

    assert!(matches!(
        error,
        backtester::BacktestError::Configuration(_)
    ));
    assert_eq!(status.snapshot().state, RunState::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn strategy_failure_aborts_the_run_as_failed() {
    ensure_test_env();
    let bars = hourly_bars("BTC-USD", &[(100.0, 101.0), (101.0, 102.0), (102.0, 103.0)]);
    let engine = engine_over(StaticFetcher::single("BTC-USD", bars));

    let config = request(&["BTC-USD"], "panicky", 3, 1_000.0)
        .validate()
        .unwrap();
    let status = RunStatus::new();
    let error = engine
        .run_with_strategy(&config, &PanickyStrategy, &status)
        .await
        .unwrap_err();

    match error {
        backtester::BacktestError::Strategy { name, reason } => {
            assert_eq!(name, "panicky");
            assert!(reason.contains("indicator buffer underflow"));
        }
        other => panic!("expected a strategy error, got {}", other),
    }
    assert_eq!(status.snapshot().state, RunState::Failed);
}

#[tokio::test]
async fn malformed_bars_are_skipped_with_a_warning() {
    ensure_test_env();
    let mut bars = hourly_bars(
        "BTC-USD",
        &[(100.0, 101.0), (101.0, 102.0), (102.0, 103.0), (103.0, 104.0)],
    );
    bars[2].close = f64::NAN;
    let engine = engine_over(StaticFetcher::single("BTC-USD", bars));

    let status = RunStatus::new();
    let outcome = engine
        .run(request(&["BTC-USD"], "momentum", 4, 1_000.0), &status)
        .await
        .unwrap();
    let result = match outcome {
        RunOutcome::Completed(result) => result,
        RunOutcome::Cancelled => panic!("run should complete"),
    };

    assert!(result
        .warnings
        .iter()
        .any(|w| w.contains("malformed")));
    assert_eq!(result.equity_curve.len(), 3);
    assert_eq!(status.snapshot().state, RunState::Completed);
}

#[tokio::test]
async fn rejected_trades_leave_a_warning_and_the_run_continues() {
    ensure_test_env();
    let bars = hourly_bars(
        "BTC-USD",
        &[
            (100.0, 100.0),
            (100.0, 100.0),
            (100.0, 100.0),
            (100.0, 100.0),
            (100.0, 100.0),
        ],
    );
    let engine = engine_over(StaticFetcher::single("BTC-USD", bars));

    // The first buy consumes ~90% of cash; the second asks for a full
    // equity fraction that the remaining cash cannot cover.
    let strategy = ScriptedStrategy::new(vec![
        (base_time(), StrategySignal::buy(0.9)),
        (base_time() + Duration::hours(1), StrategySignal::buy(1.0)),
    ]);

    let config = request(&["BTC-USD"], "scripted", 5, 1_000.0)
        .validate()
        .unwrap();
    let status = RunStatus::new();
    let outcome = engine
        .run_with_strategy(&config, &strategy, &status)
        .await
        .unwrap();
    let result = match outcome {
        RunOutcome::Completed(result) => result,
        RunOutcome::Cancelled => panic!("run should complete"),
    };

    assert_eq!(result.trades.len(), 1);
    assert!(result
        .warnings
        .iter()
        .any(|w| w.contains("trade rejected")));
    assert_eq!(status.snapshot().state, RunState::Completed);
}

#[tokio::test]
async fn tied_timestamps_replay_in_symbol_order() {
    ensure_test_env();
    let rising: Vec<(f64, f64)> = (0..40).map(|i| (50.0 + i as f64, 50.5 + i as f64)).collect();
    let mut data = HashMap::new();
    data.insert("ETH-USD".to_string(), hourly_bars("ETH-USD", &rising));
    data.insert("BTC-USD".to_string(), hourly_bars("BTC-USD", &rising));
    let engine = engine_over(StaticFetcher::new(data));

    let status = RunStatus::new();
    let outcome = engine
        .run(
            request(&["ETH-USD", "BTC-USD"], "momentum", 40, 100_000.0),
            &status,
        )
        .await
        .unwrap();
    let result = match outcome {
        RunOutcome::Completed(result) => result,
        RunOutcome::Cancelled => panic!("run should complete"),
    };

    // Same-timestamp snapshots always appear BTC first, then ETH.
    for pair in result.equity_curve.chunks(2) {
        if pair.len() == 2 {
            assert_eq!(pair[0].timestamp, pair[1].timestamp);
        }
    }
    let first_two: Vec<_> = result.trades.iter().take(2).collect();
    if first_two.len() == 2 && first_two[0].timestamp == first_two[1].timestamp {
        assert!(first_two[0].symbol <= first_two[1].symbol);
    }
}
