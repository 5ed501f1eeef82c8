//! Stability and improvement arithmetic.

/// Dispersion-based stability score of a hashrate series, in `[0, 1]`.
///
/// Uses the population coefficient of variation `cv = stddev / mean` and
/// maps it to `1 - 10 * cv`, clamped. A series of fewer than two points or
/// with a non-positive mean scores 0.
///
/// # Panics
///
/// This function never panics.
pub fn stability(hashrates: &[f64]) -> f64 {
    if hashrates.len() < 2 {
        return 0.0;
    }
    let n = hashrates.len() as f64;
    let mean = hashrates.iter().sum::<f64>() / n;
    if mean <= 0.0 {
        return 0.0;
    }
    let variance = hashrates.iter().map(|h| (h - mean).powi(2)).sum::<f64>() / n;
    let cv = variance.sqrt() / mean;
    (1.0 - 10.0 * cv).clamp(0.0, 1.0)
}

/// Relative change from `before` to `after` in percent.
///
/// Defined as 0 when `before` is not positive.
pub fn improvement_percent(before: f64, after: f64) -> f64 {
    if before <= 0.0 {
        return 0.0;
    }
    (after - before) / before * 100.0
}
