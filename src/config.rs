use crate::errors::BacktestError;
use crate::models::Timeframe;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

pub const DEFAULT_COMMISSION_RATE: f64 = 0.001;
pub const DEFAULT_SLIPPAGE_BPS: f64 = 1.0;
pub const DEFAULT_MAX_LEVERAGE: f64 = 1.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategySpec {
    pub name: String,
    #[serde(default)]
    pub parameters: HashMap<String, f64>,
}

/// Raw backtest request as submitted by a caller (CLI flags or a JSON
/// payload from the out-of-scope serving layer). Validated into a
/// [`BacktestConfig`] before any data is fetched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestRequest {
    pub strategy: StrategySpec,
    pub symbols: Vec<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub initial_capital: f64,
    pub timeframe: Timeframe,
    #[serde(default = "default_commission_rate")]
    pub commission_rate: f64,
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: f64,
    #[serde(default = "default_max_leverage")]
    pub max_leverage: f64,
    #[serde(default)]
    pub allow_short_selling: bool,
}

fn default_commission_rate() -> f64 {
    DEFAULT_COMMISSION_RATE
}

fn default_slippage_bps() -> f64 {
    DEFAULT_SLIPPAGE_BPS
}

fn default_max_leverage() -> f64 {
    DEFAULT_MAX_LEVERAGE
}

/// Validated run configuration. Construction is the single fail-fast
/// gate: an instance always satisfies every invariant checked below.
#[derive(Debug, Clone)]
pub struct BacktestConfig {
    pub strategy: StrategySpec,
    pub symbols: Vec<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub initial_capital: f64,
    pub timeframe: Timeframe,
    pub commission_rate: f64,
    pub slippage_bps: f64,
    pub max_leverage: f64,
    pub allow_short_selling: bool,
}

impl BacktestRequest {
    pub fn validate(self) -> Result<BacktestConfig, BacktestError> {
        let strategy_name = self.strategy.name.trim();
        if strategy_name.is_empty() {
            return Err(BacktestError::configuration("strategy name is empty"));
        }

        let mut symbols = Vec::with_capacity(self.symbols.len());
        let mut seen = HashSet::new();
        for raw in &self.symbols {
            let normalized = raw.trim().to_uppercase();
            if normalized.is_empty() {
                return Err(BacktestError::configuration("symbols contain an empty entry"));
            }
            if seen.insert(normalized.clone()) {
                symbols.push(normalized);
            }
        }
        if symbols.is_empty() {
            return Err(BacktestError::configuration("symbols must not be empty"));
        }

        if self.start >= self.end {
            return Err(BacktestError::Configuration(format!(
                "start {} must be before end {}",
                self.start, self.end
            )));
        }

        require_positive_finite("initialCapital", self.initial_capital)?;
        require_non_negative_finite("commissionRate", self.commission_rate)?;
        require_non_negative_finite("slippageBps", self.slippage_bps)?;
        if !self.max_leverage.is_finite() || self.max_leverage < 1.0 {
            return Err(BacktestError::Configuration(format!(
                "maxLeverage must be >= 1 (value: {})",
                self.max_leverage
            )));
        }

        Ok(BacktestConfig {
            strategy: StrategySpec {
                name: strategy_name.to_string(),
                parameters: self.strategy.parameters,
            },
            symbols,
            start: self.start,
            end: self.end,
            initial_capital: self.initial_capital,
            timeframe: self.timeframe,
            commission_rate: self.commission_rate,
            slippage_bps: self.slippage_bps,
            max_leverage: self.max_leverage,
            allow_short_selling: self.allow_short_selling,
        })
    }
}

fn require_positive_finite(key: &str, value: f64) -> Result<(), BacktestError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(BacktestError::Configuration(format!(
            "{} must be a positive number (value: {})",
            key, value
        )));
    }
    Ok(())
}

fn require_non_negative_finite(key: &str, value: f64) -> Result<(), BacktestError> {
    if !value.is_finite() || value < 0.0 {
        return Err(BacktestError::Configuration(format!(
            "{} must be a non-negative number (value: {})",
            key, value
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn request() -> BacktestRequest {
        BacktestRequest {
            strategy: StrategySpec {
                name: "momentum".to_string(),
                parameters: HashMap::new(),
            },
            symbols: vec!["btc-usd".to_string(), "BTC-USD".to_string()],
            start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
            initial_capital: 10_000.0,
            timeframe: Timeframe::H1,
            commission_rate: DEFAULT_COMMISSION_RATE,
            slippage_bps: DEFAULT_SLIPPAGE_BPS,
            max_leverage: DEFAULT_MAX_LEVERAGE,
            allow_short_selling: false,
        }
    }

    #[test]
    fn validation_normalizes_and_dedupes_symbols() {
        let config = request().validate().unwrap();
        assert_eq!(config.symbols, vec!["BTC-USD".to_string()]);
    }

    #[test]
    fn validation_rejects_inverted_range() {
        let mut req = request();
        std::mem::swap(&mut req.start, &mut req.end);
        let err = req.validate().unwrap_err();
        assert!(matches!(err, BacktestError::Configuration(_)));
    }

    #[test]
    fn validation_rejects_non_positive_capital() {
        let mut req = request();
        req.initial_capital = 0.0;
        assert!(req.validate().is_err());
    }

    #[test]
    fn validation_rejects_empty_symbols() {
        let mut req = request();
        req.symbols.clear();
        assert!(req.validate().is_err());
    }

    #[test]
    fn request_defaults_apply_when_fields_missing() {
        let raw = r#"{
            "strategy": {"name": "momentum"},
            "symbols": ["BTC-USD"],
            "start": "2024-01-01T00:00:00Z",
            "end": "2024-02-01T00:00:00Z",
            "initialCapital": 1000.0,
            "timeframe": "1h"
        }"#;
        let req: BacktestRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.commission_rate, DEFAULT_COMMISSION_RATE);
        assert_eq!(req.slippage_bps, DEFAULT_SLIPPAGE_BPS);
        assert!(!req.allow_short_selling);
    }
}
