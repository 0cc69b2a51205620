use crate::models::{EquitySnapshot, PerformanceReport, Trade};
use statrs::statistics::Statistics;

pub struct PerformanceCalculator;

impl PerformanceCalculator {
    /// Turns a finished equity curve and trade ledger into summary
    /// statistics. Pure function of its inputs: no clock, no I/O, no
    /// randomness, so identical runs report identical numbers.
    pub fn from_equity_curve(
        curve: &[EquitySnapshot],
        trades: &[Trade],
        bars_per_year: f64,
    ) -> PerformanceReport {
        let initial_equity = curve.first().map(|s| s.total_equity).unwrap_or(0.0);
        let final_equity = curve.last().map(|s| s.total_equity).unwrap_or(0.0);

        let total_return = if initial_equity > 0.0 {
            final_equity / initial_equity - 1.0
        } else {
            0.0
        };

        let annualized_return = if !curve.is_empty() && total_return > -1.0 {
            (1.0 + total_return).powf(bars_per_year / curve.len() as f64) - 1.0
        } else if total_return <= -1.0 {
            -1.0
        } else {
            0.0
        };

        let returns = periodic_returns(curve);
        let sharpe_ratio = sharpe(&returns, bars_per_year);
        let sortino_ratio = sortino(&returns, bars_per_year);
        let (max_drawdown, max_drawdown_duration_bars, drawdown_ongoing) = max_drawdown(curve);

        let closed: Vec<f64> = trades.iter().filter_map(|t| t.realized_pnl).collect();
        let winning: Vec<f64> = closed.iter().copied().filter(|pnl| *pnl > 0.0).collect();
        let losing: Vec<f64> = closed.iter().copied().filter(|pnl| *pnl < 0.0).collect();

        let win_rate = if closed.is_empty() {
            None
        } else {
            Some(winning.len() as f64 / closed.len() as f64)
        };

        let no_losing_trades = losing.is_empty() && !closed.is_empty();
        let profit_factor = if losing.is_empty() {
            None
        } else {
            let gross_loss: f64 = losing.iter().sum::<f64>().abs();
            let gross_profit: f64 = winning.iter().sum();
            Some(gross_profit / gross_loss)
        };

        let total_commission = trades.iter().map(|t| t.commission).sum();

        PerformanceReport {
            total_return,
            annualized_return,
            sharpe_ratio,
            sortino_ratio,
            max_drawdown,
            max_drawdown_duration_bars,
            drawdown_ongoing,
            win_rate,
            profit_factor,
            no_losing_trades,
            total_trades: trades.len(),
            closed_trades: closed.len(),
            winning_trades: winning.len(),
            losing_trades: losing.len(),
            total_commission,
            final_equity,
        }
    }
}

/// Simple returns between consecutive snapshots.
fn periodic_returns(curve: &[EquitySnapshot]) -> Vec<f64> {
    curve
        .windows(2)
        .map(|window| {
            let prev = window[0].total_equity;
            let curr = window[1].total_equity;
            if prev > 0.0 {
                (curr - prev) / prev
            } else {
                0.0
            }
        })
        .collect()
}

/// Annualized Sharpe ratio with a zero risk-free rate. None (not a crash,
/// not infinity) when volatility is zero.
fn sharpe(returns: &[f64], bars_per_year: f64) -> Option<f64> {
    if returns.len() < 2 {
        return None;
    }
    let mean = returns.mean();
    let std_dev = returns.std_dev();
    if !std_dev.is_finite() || std_dev == 0.0 {
        return None;
    }
    Some(mean / std_dev * bars_per_year.sqrt())
}

/// Sortino ratio: mean return over the deviation of negative returns only.
fn sortino(returns: &[f64], bars_per_year: f64) -> Option<f64> {
    if returns.len() < 2 {
        return None;
    }
    let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
    if downside.is_empty() {
        return None;
    }
    let downside_dev = downside.std_dev();
    if !downside_dev.is_finite() || downside_dev == 0.0 {
        return None;
    }
    Some(returns.mean() / downside_dev * bars_per_year.sqrt())
}

/// Peak-to-trough drawdown as a ratio in [0, 1], with the longest
/// underwater stretch in bars and whether the curve ends underwater.
fn max_drawdown(curve: &[EquitySnapshot]) -> (f64, usize, bool) {
    if curve.is_empty() {
        return (0.0, 0, false);
    }

    let mut peak = curve[0].total_equity;
    let mut max_dd = 0.0f64;
    let mut max_duration = 0usize;
    let mut current_duration = 0usize;

    for snapshot in curve {
        if snapshot.total_equity >= peak {
            peak = snapshot.total_equity;
            current_duration = 0;
        } else {
            current_duration += 1;
            if current_duration > max_duration {
                max_duration = current_duration;
            }
            if peak > 0.0 {
                let dd = (peak - snapshot.total_equity) / peak;
                if dd > max_dd {
                    max_dd = dd;
                }
            }
        }
    }

    (max_dd.clamp(0.0, 1.0), max_duration, current_duration > 0)
}
