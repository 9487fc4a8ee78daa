use super::moving_average::calculate_sma;
use crate::error::IndicatorError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

impl BollingerBands {
    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }
}

/// Calculate Bollinger Bands over the last `period` prices
///
/// Middle band is the SMA, the outer bands are `num_std` sample standard
/// deviations away from it.
pub fn calculate_bollinger(
    prices: &[f64],
    period: usize,
    num_std: f64,
) -> Result<BollingerBands, IndicatorError> {
    if period < 2 || num_std <= 0.0 {
        return Err(IndicatorError::InvalidParameter(format!(
            "Bollinger needs period >= 2 and num_std > 0 (got {}, {})",
            period, num_std
        )));
    }
    IndicatorError::check_len(prices.len(), period)?;

    let middle = calculate_sma(prices, period)?;
    let variance = prices
        .iter()
        .rev()
        .take(period)
        .map(|p| (p - middle).powi(2))
        .sum::<f64>()
        / (period - 1) as f64;
    let std_dev = variance.sqrt();

    Ok(BollingerBands {
        upper: middle + num_std * std_dev,
        middle,
        lower: middle - num_std * std_dev,
    })
}
