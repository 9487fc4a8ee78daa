use crate::error::IndicatorError;

/// Calculate Relative Strength Index (RSI) with Wilder's smoothing
///
/// RSI measures the magnitude of recent price changes to evaluate
/// overbought or oversold conditions.
///
/// Values:
/// - RSI > 70: Overbought
/// - RSI < 30: Oversold
///
/// The first average gain/loss is the simple mean of the first `period`
/// changes; every later change is folded in as `(avg * (period - 1) + x) / period`.
/// Needs at least `period + 1` prices.
pub fn calculate_rsi(prices: &[f64], period: usize) -> Result<f64, IndicatorError> {
    if period == 0 {
        return Err(IndicatorError::InvalidParameter(
            "RSI period must be positive".to_string(),
        ));
    }
    IndicatorError::check_len(prices.len(), period + 1)?;

    let changes: Vec<f64> = prices.windows(2).map(|w| w[1] - w[0]).collect();
    let period_f = period as f64;

    let mut avg_gain = changes[..period].iter().map(|c| c.max(0.0)).sum::<f64>() / period_f;
    let mut avg_loss = changes[..period].iter().map(|c| (-c).max(0.0)).sum::<f64>() / period_f;

    for change in &changes[period..] {
        avg_gain = (avg_gain * (period_f - 1.0) + change.max(0.0)) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + (-change).max(0.0)) / period_f;
    }

    if avg_loss == 0.0 {
        // No movement at all is neutral, only gains is maximal strength
        return Ok(if avg_gain == 0.0 { 50.0 } else { 100.0 });
    }

    let rs = avg_gain / avg_loss;
    Ok(100.0 - (100.0 / (1.0 + rs)))
}
