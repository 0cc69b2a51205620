use crate::errors::BacktestError;
use crate::models::{generate_order_id, EquitySnapshot, Position, Trade, TradeSide};
use chrono::{DateTime, Utc};
use log::debug;
use std::collections::HashMap;

const SIZE_EPSILON: f64 = 1e-12;
const CASH_EPSILON: f64 = 1e-9;
const LEVERAGE_EPSILON: f64 = 1e-9;

/// Virtual portfolio for a single run. Applies fills with adverse slippage
/// and commission, keeps one aggregated position per symbol, and records an
/// append-only trade ledger and equity curve. Created per run, mutated only
/// by the engine, discarded afterwards.
pub struct MockWallet {
    initial_capital: f64,
    cash: f64,
    max_leverage: f64,
    positions: HashMap<String, Position>,
    trades: Vec<Trade>,
    equity_curve: Vec<EquitySnapshot>,
    last_prices: HashMap<String, f64>,
    realized_pnl_total: f64,
    commission_total: f64,
}

impl MockWallet {
    pub fn new(initial_capital: f64, max_leverage: f64) -> Self {
        Self {
            initial_capital,
            cash: initial_capital,
            max_leverage,
            positions: HashMap::new(),
            trades: Vec::new(),
            equity_curve: Vec::new(),
            last_prices: HashMap::new(),
            realized_pnl_total: 0.0,
            commission_total: 0.0,
        }
    }

    pub fn cash(&self) -> f64 {
        self.cash
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn equity_curve(&self) -> &[EquitySnapshot] {
        &self.equity_curve
    }

    pub fn commission_total(&self) -> f64 {
        self.commission_total
    }

    pub fn realized_pnl_total(&self) -> f64 {
        self.realized_pnl_total
    }

    fn mark_for(&self, position: &Position) -> f64 {
        self.last_prices
            .get(&position.symbol)
            .copied()
            .unwrap_or(position.entry_price)
    }

    pub fn positions_value(&self) -> f64 {
        self.positions
            .values()
            .map(|position| position.market_value(self.mark_for(position)))
            .sum()
    }

    fn gross_exposure(&self) -> f64 {
        self.positions
            .values()
            .map(|position| (position.size * self.mark_for(position)).abs())
            .sum()
    }

    pub fn total_equity(&self) -> f64 {
        self.cash + self.positions_value()
    }

    pub fn unrealized_pnl_total(&self) -> f64 {
        self.positions
            .values()
            .map(|position| position.unrealized_pnl(self.mark_for(position)))
            .sum()
    }

    /// Drift of the conservation identity
    /// `cash + positions - initial == realized - commissions + unrealized`.
    /// Zero (within tolerance) for any sequence of accepted trades.
    pub fn conservation_drift(&self) -> f64 {
        let lhs = self.cash + self.positions_value() - self.initial_capital;
        let rhs = self.realized_pnl_total - self.commission_total + self.unrealized_pnl_total();
        lhs - rhs
    }

    /// Applies one order. Slippage moves the fill against the trader, the
    /// commission is charged on the filled notional, and the funds check
    /// runs before any state changes so a rejected trade leaves the wallet
    /// untouched.
    #[allow(clippy::too_many_arguments)]
    pub fn execute_trade(
        &mut self,
        symbol: &str,
        side: TradeSide,
        requested_size: f64,
        reference_price: f64,
        timestamp: DateTime<Utc>,
        commission_rate: f64,
        slippage_bps: f64,
        strategy_tag: &str,
    ) -> Result<&Trade, BacktestError> {
        if !requested_size.is_finite() || requested_size <= 0.0 {
            return Err(BacktestError::Numeric(format!(
                "requested size must be positive (value: {})",
                requested_size
            )));
        }
        if !reference_price.is_finite() || reference_price <= 0.0 {
            return Err(BacktestError::Numeric(format!(
                "reference price must be positive (value: {})",
                reference_price
            )));
        }

        let slippage = slippage_bps / 10_000.0;
        let fill_price = reference_price * (1.0 + side.sign() * slippage);
        let commission = fill_price * requested_size * commission_rate;
        let signed_delta = side.sign() * requested_size;
        let cash_delta = -(fill_price * signed_delta) - commission;

        let projected_cash = self.cash + cash_delta;
        if projected_cash < -CASH_EPSILON {
            return Err(BacktestError::InsufficientFunds {
                required: -cash_delta,
                available: self.cash,
            });
        }

        let old_size = self.positions.get(symbol).map(|p| p.size).unwrap_or(0.0);
        let new_size = old_size + signed_delta;

        // Leverage check on post-trade state, marking this symbol at the
        // fill price and everything else at its latest mark.
        let other_gross = self
            .positions
            .values()
            .filter(|p| p.symbol != symbol)
            .map(|p| (p.size * self.mark_for(p)).abs())
            .sum::<f64>();
        let other_value = self
            .positions
            .values()
            .filter(|p| p.symbol != symbol)
            .map(|p| p.size * self.mark_for(p))
            .sum::<f64>();
        let gross_after = other_gross + (new_size * fill_price).abs();
        let equity_after = projected_cash + other_value + new_size * fill_price;
        if gross_after > self.max_leverage * equity_after + LEVERAGE_EPSILON {
            return Err(BacktestError::InsufficientFunds {
                required: gross_after / self.max_leverage,
                available: equity_after.max(0.0),
            });
        }

        // Portion of the existing position closed by this fill, signed like
        // the old position. Gross realized P&L comes from it.
        let mut realized_pnl = None;
        let entry_price = self
            .positions
            .get(symbol)
            .map(|p| p.entry_price)
            .unwrap_or(fill_price);
        if old_size != 0.0 && old_size.signum() != signed_delta.signum() {
            let closed = old_size.abs().min(signed_delta.abs()) * old_size.signum();
            realized_pnl = Some((fill_price - entry_price) * closed);
        }

        self.cash = projected_cash;
        self.commission_total += commission;
        if let Some(pnl) = realized_pnl {
            self.realized_pnl_total += pnl;
        }

        if new_size.abs() < SIZE_EPSILON {
            self.positions.remove(symbol);
        } else if old_size == 0.0 || new_size.signum() != old_size.signum() {
            // Fresh open, or a flip through zero: the surviving position is
            // entirely at this fill.
            self.positions.insert(
                symbol.to_string(),
                Position {
                    symbol: symbol.to_string(),
                    size: new_size,
                    entry_price: fill_price,
                    opened_at: timestamp,
                },
            );
        } else if new_size.abs() > old_size.abs() {
            // Same-direction increase re-bases the entry by weighted average.
            let position = self
                .positions
                .get_mut(symbol)
                .expect("position exists when increasing");
            let added = (new_size - old_size).abs();
            position.entry_price = (position.entry_price * old_size.abs() + fill_price * added)
                / (old_size.abs() + added);
            position.size = new_size;
        } else {
            // Partial reduce keeps the entry price.
            let position = self
                .positions
                .get_mut(symbol)
                .expect("position exists when reducing");
            position.size = new_size;
        }

        self.last_prices.insert(symbol.to_string(), fill_price);

        let trade = Trade {
            order_id: generate_order_id(self.trades.len() + 1, symbol, timestamp),
            symbol: symbol.to_string(),
            side,
            requested_size,
            fill_price,
            commission,
            slippage_applied: (fill_price - reference_price).abs(),
            realized_pnl,
            timestamp,
            strategy_tag: strategy_tag.to_string(),
        };
        debug!(
            "Filled {} {} {:.8} @ {:.8} (commission {:.8})",
            trade.side.as_str(),
            trade.symbol,
            trade.requested_size,
            trade.fill_price,
            trade.commission
        );
        self.trades.push(trade);
        Ok(self.trades.last().expect("trade was just pushed"))
    }

    /// Recomputes unrealized value at the given marks and appends one
    /// equity snapshot. Never touches the trade ledger.
    pub fn mark_to_market(&mut self, timestamp: DateTime<Utc>, prices: &HashMap<String, f64>) {
        for (symbol, price) in prices {
            if price.is_finite() && *price > 0.0 {
                self.last_prices.insert(symbol.clone(), *price);
            }
        }

        let positions_value = self.positions_value();
        self.equity_curve.push(EquitySnapshot {
            timestamp,
            cash: self.cash,
            positions_value,
            total_equity: self.cash + positions_value,
        });
    }

    /// Consumes the wallet, yielding the ledger and equity curve for the
    /// final result.
    pub fn into_parts(self) -> (Vec<Trade>, Vec<EquitySnapshot>) {
        (self.trades, self.equity_curve)
    }
}
