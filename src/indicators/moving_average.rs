use crate::error::IndicatorError;

fn check_period(period: usize, name: &str) -> Result<(), IndicatorError> {
    if period == 0 {
        return Err(IndicatorError::InvalidParameter(format!(
            "{} period must be positive",
            name
        )));
    }
    Ok(())
}

/// Calculate Simple Moving Average (SMA) of the last `period` values
pub fn calculate_sma(prices: &[f64], period: usize) -> Result<f64, IndicatorError> {
    check_period(period, "SMA")?;
    IndicatorError::check_len(prices.len(), period)?;

    let sum: f64 = prices.iter().rev().take(period).sum();
    Ok(sum / period as f64)
}

/// Calculate Exponential Moving Average (EMA) series
///
/// Seeded with the SMA of the first `period` values, so the series has
/// `prices.len() - period + 1` entries and the first one lines up with
/// `prices[period - 1]`.
pub fn calculate_ema_series(prices: &[f64], period: usize) -> Result<Vec<f64>, IndicatorError> {
    check_period(period, "EMA")?;
    IndicatorError::check_len(prices.len(), period)?;

    let multiplier = 2.0 / (period as f64 + 1.0);

    // Start with SMA
    let mut ema = prices[..period].iter().sum::<f64>() / period as f64;
    let mut series = Vec::with_capacity(prices.len() - period + 1);
    series.push(ema);

    for price in &prices[period..] {
        ema = (price - ema) * multiplier + ema;
        series.push(ema);
    }

    Ok(series)
}

/// Calculate Exponential Moving Average (EMA)
pub fn calculate_ema(prices: &[f64], period: usize) -> Result<f64, IndicatorError> {
    let series = calculate_ema_series(prices, period)?;
    Ok(series[series.len() - 1])
}

/// Sign change of a difference series between two consecutive samples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crossover {
    /// Negative (or zero) to positive
    Golden,
    /// Positive (or zero) to negative
    Death,
    None,
}

impl Crossover {
    pub fn from_diffs(previous: f64, current: f64) -> Self {
        if previous <= 0.0 && current > 0.0 {
            Crossover::Golden
        } else if previous >= 0.0 && current < 0.0 {
            Crossover::Death
        } else {
            Crossover::None
        }
    }
}

/// Outcome of comparing a short and a long SMA at the last two timestamps
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaCrossover {
    pub short_ma: f64,
    pub long_ma: f64,
    pub crossover: Crossover,
}

/// Detect whether the short SMA crossed the long SMA on the latest candle
///
/// Needs `long_period + 1` prices so both averages exist one step back.
pub fn detect_ma_crossover(
    prices: &[f64],
    short_period: usize,
    long_period: usize,
) -> Result<MaCrossover, IndicatorError> {
    check_period(short_period, "short MA")?;
    if long_period <= short_period {
        return Err(IndicatorError::InvalidParameter(format!(
            "long MA period {} must exceed short MA period {}",
            long_period, short_period
        )));
    }
    IndicatorError::check_len(prices.len(), long_period + 1)?;

    let previous = &prices[..prices.len() - 1];
    let prev_diff = calculate_sma(previous, short_period)? - calculate_sma(previous, long_period)?;

    let short_ma = calculate_sma(prices, short_period)?;
    let long_ma = calculate_sma(prices, long_period)?;

    Ok(MaCrossover {
        short_ma,
        long_ma,
        crossover: Crossover::from_diffs(prev_diff, short_ma - long_ma),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sma() {
        let prices = vec![100.0, 102.0, 104.0, 106.0, 108.0];
        let sma = calculate_sma(&prices, 5);
        assert_eq!(sma, Ok(104.0));
    }

    #[test]
    fn test_sma_uses_latest_values() {
        let prices = vec![1.0, 2.0, 3.0, 4.0];
        assert_eq!(calculate_sma(&prices, 2), Ok(3.5));
    }

    #[test]
    fn test_sma_insufficient_data() {
        let prices = vec![100.0, 102.0];
        let sma = calculate_sma(&prices, 5);
        assert!(matches!(
            sma,
            Err(IndicatorError::InsufficientData { required: 5, available: 2 })
        ));
    }

    #[test]
    fn test_ema() {
        let prices = vec![100.0, 102.0, 104.0, 106.0, 108.0, 110.0];
        let ema = calculate_ema(&prices, 5).unwrap();
        assert!(ema > 104.0); // EMA should be above initial SMA
    }

    #[test]
    fn test_ema_series_alignment() {
        let prices = vec![2.0, 4.0, 6.0, 8.0];
        let series = calculate_ema_series(&prices, 3).unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series[0], 4.0); // SMA seed
        assert_eq!(series[1], 6.0); // (8 - 4) * 0.5 + 4
    }

    #[test]
    fn test_crossover_from_diffs() {
        assert_eq!(Crossover::from_diffs(-0.1, 0.2), Crossover::Golden);
        assert_eq!(Crossover::from_diffs(0.0, 0.2), Crossover::Golden);
        assert_eq!(Crossover::from_diffs(0.3, -0.2), Crossover::Death);
        assert_eq!(Crossover::from_diffs(0.3, 0.2), Crossover::None);
        assert_eq!(Crossover::from_diffs(-0.3, -0.2), Crossover::None);
        assert_eq!(Crossover::from_diffs(0.0, 0.0), Crossover::None);
    }

    #[test]
    fn test_ma_golden_cross() {
        // Short MA (2) below long MA (4) until the last candle jumps
        let prices = vec![10.0, 10.0, 10.0, 9.0, 9.0, 14.0];
        let result = detect_ma_crossover(&prices, 2, 4).unwrap();
        assert_eq!(result.crossover, Crossover::Golden);
        assert!(result.short_ma > result.long_ma);
    }

    #[test]
    fn test_ma_death_cross() {
        let prices = vec![10.0, 10.0, 10.0, 11.0, 11.0, 6.0];
        let result = detect_ma_crossover(&prices, 2, 4).unwrap();
        assert_eq!(result.crossover, Crossover::Death);
    }

    #[test]
    fn test_ma_crossover_requires_long_plus_one() {
        let prices = vec![1.0, 2.0, 3.0, 4.0];
        assert!(matches!(
            detect_ma_crossover(&prices, 2, 4),
            Err(IndicatorError::InsufficientData { required: 5, available: 4 })
        ));
    }

    #[test]
    fn test_ma_crossover_rejects_inverted_periods() {
        let prices = vec![1.0; 40];
        assert!(matches!(
            detect_ma_crossover(&prices, 30, 10),
            Err(IndicatorError::InvalidParameter(_))
        ));
    }
}
