use crate::models::{Bar, Timeframe};
use chrono::{DateTime, Utc};
use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand::SeedableRng;
use statrs::distribution::Normal;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

// Annualized volatility of the generated walk. High enough that strategies
// see realistic swings, low enough to keep prices positive over long ranges.
const ANNUALIZED_VOLATILITY: f64 = 0.6;
const BASE_VOLUME: f64 = 1_000.0;

/// Deterministic seeded random-walk bar generator, used as the last resort
/// of the data fallback chain. Identical inputs always produce identical
/// bars, so runs that degrade to synthetic data stay reproducible.
pub fn generate_bars(
    symbol: &str,
    timeframe: Timeframe,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<Bar> {
    let seed = seed_for(symbol, timeframe, start);
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).expect("unit normal parameters are valid");

    let sigma = ANNUALIZED_VOLATILITY / timeframe.bars_per_year().sqrt();
    // Base price in [20, 520), derived from the seed so each symbol gets a
    // stable but distinct level.
    let mut price = 20.0 + (seed % 500) as f64;

    let step = timeframe.step();
    let mut bars = Vec::new();
    let mut open_time = start;

    while open_time < end {
        let open = price;
        let log_return = normal.sample(&mut rng) * sigma;
        let close = open * log_return.exp();
        let wick_up = normal.sample(&mut rng).abs() * sigma * 0.5;
        let wick_down = normal.sample(&mut rng).abs() * sigma * 0.5;
        let high = open.max(close) * (1.0 + wick_up);
        let low = open.min(close) * (1.0 - wick_down);
        let volume = BASE_VOLUME * (normal.sample(&mut rng) * 0.5).exp();

        bars.push(Bar {
            symbol: symbol.to_string(),
            timeframe,
            open_time,
            open,
            high,
            low,
            close,
            volume,
        });

        price = close;
        open_time += step;
    }

    bars
}

fn seed_for(symbol: &str, timeframe: Timeframe, start: DateTime<Utc>) -> u64 {
    let mut hasher = DefaultHasher::new();
    symbol.hash(&mut hasher);
    timeframe.as_str().hash(&mut hasher);
    start.timestamp().hash(&mut hasher);
    hasher.finish()
}
