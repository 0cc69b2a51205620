use std::collections::HashMap;

/// Extract a parameter as f64 with a default value
pub fn get_param_f64(params: &HashMap<String, f64>, key: &str, default: f64) -> f64 {
    let value = params.get(key).copied().unwrap_or(default);
    if value.is_finite() {
        value
    } else {
        default
    }
}

/// Extract a parameter as usize with a default and a minimum
pub fn get_param_usize(params: &HashMap<String, f64>, key: &str, default: usize, min: usize) -> usize {
    let raw = params.get(key).copied().unwrap_or(default as f64);
    if !raw.is_finite() {
        return default.max(min);
    }
    (raw.round().max(min as f64)) as usize
}

/// Extract a parameter as f64, clamped to a range with finite checks
pub fn get_param_f64_clamped(
    params: &HashMap<String, f64>,
    key: &str,
    default: f64,
    min: f64,
    max: f64,
) -> f64 {
    let raw = params.get(key).copied().unwrap_or(default);
    if !raw.is_finite() {
        return default;
    }
    raw.clamp(min, max)
}
