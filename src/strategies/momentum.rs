use crate::indicators;
use crate::models::{Bar, Position, StrategySignal};
use crate::param_utils::{get_param_f64, get_param_f64_clamped, get_param_usize};
use anyhow::Result;
use std::collections::HashMap;

pub struct MomentumStrategy {
    period: usize,
    entry_threshold: f64,
    exit_threshold: f64,
    size_fraction: f64,
}

impl MomentumStrategy {
    pub fn new(parameters: &HashMap<String, f64>) -> Self {
        let period = get_param_usize(parameters, "period", 24, 1);
        let entry_threshold = get_param_f64(parameters, "entryThreshold", 0.02);
        let exit_threshold = get_param_f64(parameters, "exitThreshold", -0.01);
        let size_fraction = get_param_f64_clamped(parameters, "sizeFraction", 0.25, 0.01, 1.0);
        Self {
            period,
            entry_threshold,
            exit_threshold,
            size_fraction,
        }
    }
}

impl super::Strategy for MomentumStrategy {
    fn name(&self) -> &str {
        "momentum"
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
        let closes: Vec<f64> = window.iter().map(|b| b.close).collect();
        let Some(roc) = indicators::rate_of_change(&closes, self.period) else {
            return Ok(Vec::new());
        };
        let holding_long = position.map(|p| p.is_long()).unwrap_or(false);

        if roc > self.entry_threshold && !holding_long {
            return Ok(vec![StrategySignal::buy(self.size_fraction)]);
        }
        if roc < self.exit_threshold && holding_long {
            return Ok(vec![StrategySignal::sell(self.size_fraction)]);
        }

        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SignalAction, Timeframe};
    use crate::strategy::Strategy;
    use chrono::{Duration, TimeZone, Utc};

    fn bars_from_closes(closes: &[f64]) -> Vec<Bar> {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, close)| Bar {
                symbol: "SOL-USD".to_string(),
                timeframe: Timeframe::H1,
                open_time: base + Duration::hours(i as i64),
                open: *close,
                high: *close * 1.01,
                low: *close * 0.99,
                close: *close,
                volume: 1.0,
            })
            .collect()
    }

    #[test]
    fn strong_trend_opens_a_long() {
        let mut params = HashMap::new();
        params.insert("period".to_string(), 5.0);
        let strategy = MomentumStrategy::new(&params);

        let closes: Vec<f64> = (0..10).map(|i| 100.0 * 1.01f64.powi(i)).collect();
        let window = bars_from_closes(&closes);

        let signals = strategy
            .on_bar(window.last().unwrap(), &window, None)
            .unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].action, SignalAction::Buy);
    }

    #[test]
    fn fading_momentum_exits_the_long() {
        let mut params = HashMap::new();
        params.insert("period".to_string(), 5.0);
        let strategy = MomentumStrategy::new(&params);

        let closes: Vec<f64> = (0..10).map(|i| 100.0 - 2.0 * i as f64).collect();
        let window = bars_from_closes(&closes);
        let position = Position {
            symbol: "SOL-USD".to_string(),
            size: 1.0,
            entry_price: 100.0,
            opened_at: window[0].open_time,
        };

        let signals = strategy
            .on_bar(window.last().unwrap(), &window, Some(&position))
            .unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].action, SignalAction::Sell);
    }
}
