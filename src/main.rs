use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use backtester::{
    BacktestEngine, BacktestRequest, BarFetcher, DataSource, HistoricalDataProvider,
    ProviderSettings, RestFetcher, RunOutcome, RunStatus, StrategySpec, Timeframe,
};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_DATA_URL: &str = "https://api.binance.com/api/v3";
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "backtester")]
#[command(about = "Replay historical market data against a trading strategy")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a backtest and print the result as JSON
    Run {
        /// Path to a JSON BacktestRequest; flags below override nothing when set
        #[arg(long = "request", value_name = "PATH")]
        request: Option<PathBuf>,
        /// Strategy name (ema_crossover, rsi_reversion, momentum)
        #[arg(long, default_value = "ema_crossover")]
        strategy: String,
        /// Strategy parameters as a JSON object of numbers
        #[arg(long, value_name = "JSON")]
        params: Option<String>,
        /// Comma separated symbols, e.g. BTCUSDT,ETHUSDT
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,
        /// Range start (RFC3339 or YYYY-MM-DD)
        #[arg(long)]
        start: Option<String>,
        /// Range end (RFC3339 or YYYY-MM-DD)
        #[arg(long)]
        end: Option<String>,
        /// Starting cash
        #[arg(long, default_value_t = 10_000.0)]
        capital: f64,
        /// Bar interval: 1h, 4h or 1d
        #[arg(long, default_value = "1d")]
        timeframe: String,
        #[arg(long, default_value_t = 0.001)]
        commission_rate: f64,
        #[arg(long, default_value_t = 1.0)]
        slippage_bps: f64,
        #[arg(long, default_value_t = 1.0)]
        max_leverage: f64,
        #[arg(long)]
        allow_short_selling: bool,
        /// Base URL of the klines data source
        #[arg(long, default_value = DEFAULT_DATA_URL)]
        data_url: String,
        /// Skip the network entirely and replay deterministic synthetic data
        #[arg(long)]
        offline: bool,
        /// Write the result JSON here instead of stdout
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

/// Fetcher that never reaches the network; the provider degrades straight
/// to its deterministic synthetic tier.
struct OfflineFetcher;

#[async_trait]
impl BarFetcher for OfflineFetcher {
    async fn fetch(
        &self,
        _symbol: &str,
        _timeframe: Timeframe,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<Vec<backtester::Bar>> {
        Err(anyhow!("offline mode"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            request,
            strategy,
            params,
            symbols,
            start,
            end,
            capital,
            timeframe,
            commission_rate,
            slippage_bps,
            max_leverage,
            allow_short_selling,
            data_url,
            offline,
            output,
        } => {
            let request = if let Some(path) = request {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read request file {}", path.display()))?;
                serde_json::from_str::<BacktestRequest>(&raw)
                    .with_context(|| format!("invalid request file {}", path.display()))?
            } else {
                build_request_from_flags(
                    strategy,
                    params,
                    symbols,
                    start,
                    end,
                    capital,
                    timeframe,
                    commission_rate,
                    slippage_bps,
                    max_leverage,
                    allow_short_selling,
                )?
            };

            let fetcher: Box<dyn BarFetcher> = if offline {
                info!("Offline mode: every symbol will use synthetic data");
                Box::new(OfflineFetcher)
            } else {
                Box::new(RestFetcher::new(&data_url, FETCH_TIMEOUT)?)
            };
            let provider = Arc::new(HistoricalDataProvider::new(
                fetcher,
                ProviderSettings::default(),
            ));
            let engine = Arc::new(BacktestEngine::new(provider));
            let status = RunStatus::new();

            // Ctrl-C requests cooperative cancellation; the engine notices
            // at the next bar boundary and discards the partial run.
            let cancel_status = status.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Cancellation requested");
                    cancel_status.cancel();
                }
            });

            let run_status = status.clone();
            let run_engine = engine.clone();
            let handle =
                tokio::spawn(async move { run_engine.run(request, &run_status).await });

            let progress = ProgressBar::new(0);
            progress.set_style(
                ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} bars {msg}")
                    .expect("progress template is valid"),
            );
            loop {
                let snapshot = status.snapshot();
                progress.set_length(snapshot.bars_total as u64);
                progress.set_position(snapshot.bars_processed as u64);
                if handle.is_finished() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            progress.finish_and_clear();

            match handle.await.context("backtest task panicked")?? {
                RunOutcome::Completed(result) => {
                    for (symbol, source) in &result.data_sources {
                        if *source != DataSource::Live {
                            warn!(
                                "{} replayed {} data; metrics do not reflect validated market data",
                                symbol,
                                source.as_str()
                            );
                        }
                    }
                    for warning in &result.warnings {
                        warn!("{}", warning);
                    }

                    let rendered = serde_json::to_string_pretty(&result)?;
                    match output {
                        Some(path) => {
                            std::fs::write(&path, rendered).with_context(|| {
                                format!("failed to write result to {}", path.display())
                            })?;
                            info!("Result written to {}", path.display());
                        }
                        None => println!("{}", rendered),
                    }
                }
                RunOutcome::Cancelled => {
                    info!("Run cancelled; no result produced");
                }
            }
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn build_request_from_flags(
    strategy: String,
    params: Option<String>,
    symbols: Vec<String>,
    start: Option<String>,
    end: Option<String>,
    capital: f64,
    timeframe: String,
    commission_rate: f64,
    slippage_bps: f64,
    max_leverage: f64,
    allow_short_selling: bool,
) -> Result<BacktestRequest> {
    let parameters: HashMap<String, f64> = match params {
        Some(raw) => serde_json::from_str(&raw).context("--params must be a JSON object of numbers")?,
        None => HashMap::new(),
    };
    let start = parse_datetime(
        &start.ok_or_else(|| anyhow!("--start is required without --request"))?,
    )?;
    let end = parse_datetime(&end.ok_or_else(|| anyhow!("--end is required without --request"))?)?;

    Ok(BacktestRequest {
        strategy: StrategySpec {
            name: strategy,
            parameters,
        },
        symbols,
        start,
        end,
        initial_capital: capital,
        timeframe: timeframe.parse::<Timeframe>()?,
        commission_rate,
        slippage_bps,
        max_leverage,
        allow_short_selling,
    })
}

fn parse_datetime(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| anyhow!("'{}' is not an RFC3339 timestamp or YYYY-MM-DD date", raw))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| anyhow!("invalid date '{}'", raw))?;
    Ok(DateTime::<Utc>::from_naive_utc_and_offset(midnight, Utc))
}
