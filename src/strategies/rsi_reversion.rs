use crate::indicators;
use crate::models::{Bar, Position, StrategySignal};
use crate::param_utils::{get_param_f64, get_param_f64_clamped, get_param_usize};
use anyhow::Result;
use std::collections::HashMap;

pub struct RsiReversionStrategy {
    period: usize,
    oversold_level: f64,
    overbought_level: f64,
    size_fraction: f64,
}

impl RsiReversionStrategy {
    pub fn new(parameters: &HashMap<String, f64>) -> Self {
        let period = get_param_usize(parameters, "period", 14, 2);
        let oversold_level = get_param_f64(parameters, "oversoldLevel", 30.0);
        let overbought_level = get_param_f64(parameters, "overboughtLevel", 70.0);
        let size_fraction = get_param_f64_clamped(parameters, "sizeFraction", 0.25, 0.01, 1.0);
        Self {
            period,
            oversold_level,
            overbought_level,
            size_fraction,
        }
    }
}

impl super::Strategy for RsiReversionStrategy {
    fn name(&self) -> &str {
        "rsi_reversion"
    }

    fn lookback(&self) -> usize {
        self.period + 1
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
        let rsi = indicators::rsi_series(&closes, self.period);
        let current = rsi[rsi.len() - 1];
        let holding_long = position.map(|p| p.is_long()).unwrap_or(false);

        // Mean reversion: buy exhaustion selling, exit into strength.
        if current < self.oversold_level && !holding_long {
            return Ok(vec![StrategySignal::buy(self.size_fraction)]);
        }
        if current > self.overbought_level && holding_long {
            return Ok(vec![StrategySignal::sell(self.size_fraction)]);
        }

        Ok(Vec::new())
    }
}
