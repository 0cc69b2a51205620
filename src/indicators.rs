/// Exponential moving average over the full series. The first value seeds
/// the average, so early entries are biased toward it; strategies guard
/// with their lookback before acting on the output.
pub fn ema_series(prices: &[f64], period: usize) -> Vec<f64> {
    if prices.is_empty() {
        return Vec::new();
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut ema_values = Vec::with_capacity(prices.len());
    ema_values.push(prices[0]);

    for i in 1..prices.len() {
        let ema = (prices[i] * multiplier) + (ema_values[i - 1] * (1.0 - multiplier));
        ema_values.push(ema);
    }

    ema_values
}

/// Wilder-smoothed RSI. Entries before the first full period stay at the
/// neutral 50 value.
pub fn rsi_series(prices: &[f64], period: usize) -> Vec<f64> {
    if prices.is_empty() {
        return Vec::new();
    }
    if period == 0 || prices.len() < period + 1 {
        return vec![50.0; prices.len()];
    }

    let mut rsi_values = vec![50.0; prices.len()];
    let mut sum_gain = 0.0f64;
    let mut sum_loss = 0.0f64;
    for i in 1..=period {
        let delta = prices[i] - prices[i - 1];
        if delta >= 0.0 {
            sum_gain += delta;
        } else {
            sum_loss += -delta;
        }
    }

    let mut avg_gain = sum_gain / period as f64;
    let mut avg_loss = sum_loss / period as f64;
    rsi_values[period] = rsi_from_avgs(avg_gain, avg_loss);

    for i in (period + 1)..prices.len() {
        let delta = prices[i] - prices[i - 1];
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { -delta } else { 0.0 };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
        rsi_values[i] = rsi_from_avgs(avg_gain, avg_loss);
    }

    rsi_values
}

fn rsi_from_avgs(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        if avg_gain == 0.0 {
            50.0
        } else {
            100.0
        }
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    }
}

/// Simple rate of change over `period` steps ending at the last element.
pub fn rate_of_change(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() <= period {
        return None;
    }
    let past = prices[prices.len() - 1 - period];
    if past == 0.0 {
        return None;
    }
    Some(prices[prices.len() - 1] / past - 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_tracks_a_constant_series() {
        let prices = vec![10.0; 20];
        let ema = ema_series(&prices, 5);
        assert_eq!(ema.len(), 20);
        assert!((ema[19] - 10.0).abs() < 1e-12);
    }

    #[test]
    fn rsi_saturates_on_a_monotonic_series() {
        let prices: Vec<f64> = (1..=30).map(|i| i as f64).collect();
        let rsi = rsi_series(&prices, 14);
        assert!(rsi[29] > 99.0);

        let falling: Vec<f64> = (1..=30).rev().map(|i| i as f64).collect();
        let rsi = rsi_series(&falling, 14);
        assert!(rsi[29] < 1.0);
    }

    #[test]
    fn rate_of_change_measures_the_window() {
        let prices = vec![100.0, 101.0, 102.0, 110.0];
        let roc = rate_of_change(&prices, 3).unwrap();
        assert!((roc - 0.1).abs() < 1e-12);
        assert!(rate_of_change(&prices, 10).is_none());
    }
}
