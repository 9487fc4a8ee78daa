use super::moving_average::{calculate_ema_series, Crossover};
use crate::error::IndicatorError;

/// Latest MACD sample plus the previous histogram value for cross detection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Macd {
    pub macd_line: f64,
    pub signal_line: f64,
    pub histogram: f64,
    pub prev_histogram: f64,
}

impl Macd {
    /// Golden when the histogram flipped negative to positive on the latest sample
    pub fn crossover(&self) -> Crossover {
        Crossover::from_diffs(self.prev_histogram, self.histogram)
    }
}

/// Calculate MACD (fast EMA - slow EMA), its signal EMA and the histogram
///
/// Needs `slow + signal` prices: `slow + signal - 1` for the first signal
/// value and one more for the previous histogram sample.
pub fn calculate_macd(
    prices: &[f64],
    fast: usize,
    slow: usize,
    signal: usize,
) -> Result<Macd, IndicatorError> {
    if fast == 0 || signal == 0 || fast >= slow {
        return Err(IndicatorError::InvalidParameter(format!(
            "MACD periods must satisfy 0 < fast < slow and signal > 0 (got {}/{}/{})",
            fast, slow, signal
        )));
    }
    IndicatorError::check_len(prices.len(), slow + signal)?;

    let fast_ema = calculate_ema_series(prices, fast)?;
    let slow_ema = calculate_ema_series(prices, slow)?;

    // fast_ema starts (slow - fast) samples earlier than slow_ema
    let offset = slow - fast;
    let macd_line: Vec<f64> = slow_ema
        .iter()
        .enumerate()
        .map(|(i, slow_value)| fast_ema[i + offset] - slow_value)
        .collect();

    let signal_line = calculate_ema_series(&macd_line, signal)?;
    let histogram: Vec<f64> = signal_line
        .iter()
        .enumerate()
        .map(|(i, signal_value)| macd_line[i + signal - 1] - signal_value)
        .collect();

    let last = histogram.len() - 1;
    Ok(Macd {
        macd_line: macd_line[macd_line.len() - 1],
        signal_line: signal_line[last],
        histogram: histogram[last],
        prev_histogram: histogram[last - 1],
    })
}
