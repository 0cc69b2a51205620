use crate::indicators;
use crate::models::{Bar, Position, StrategySignal};
use crate::param_utils::{get_param_f64_clamped, get_param_usize};
use anyhow::Result;
use std::collections::HashMap;

pub struct EmaCrossoverStrategy {
    fast_period: usize,
    slow_period: usize,
    size_fraction: f64,
}

impl EmaCrossoverStrategy {
    pub fn new(parameters: &HashMap<String, f64>) -> Self {
        let fast_period = get_param_usize(parameters, "fastPeriod", 12, 1);
        let slow_period = get_param_usize(parameters, "slowPeriod", 26, 2);
        let size_fraction = get_param_f64_clamped(parameters, "sizeFraction", 0.25, 0.01, 1.0);
        Self {
            fast_period,
            slow_period,
            size_fraction,
        }
    }
}

impl super::Strategy for EmaCrossoverStrategy {
    fn name(&self) -> &str {
        "ema_crossover"
    }

    fn lookback(&self) -> usize {
        self.slow_period.max(self.fast_period) + 2
    }

    fn on_bar(
        &self,
        _bar: &Bar,
        window: &[Bar],
        position: Option<&Position>,
    ) -> Result<Vec<StrategySignal>> {
        if window.len() < self.lookback() {
            return Ok(Vec::new());
        }

        let closes: Vec<f64> = window.iter().map(|b| b.close).collect();
        let fast = indicators::ema_series(&closes, self.fast_period);
        let slow = indicators::ema_series(&closes, self.slow_period);

        let n = closes.len();
        let prev_diff = fast[n - 2] - slow[n - 2];
        let curr_diff = fast[n - 1] - slow[n - 1];
        let holding_long = position.map(|p| p.is_long()).unwrap_or(false);

        // Fast crossing above slow opens a long, crossing below closes it.
        if prev_diff <= 0.0 && curr_diff > 0.0 && !holding_long {
            return Ok(vec![StrategySignal::buy(self.size_fraction)]);
        }
        if prev_diff >= 0.0 && curr_diff < 0.0 && holding_long {
            return Ok(vec![StrategySignal::sell(self.size_fraction)]);
        }

        Ok(Vec::new())
    }
}
