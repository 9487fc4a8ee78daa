use super::{build_signal, Assessment, Strategy};
use crate::error::IndicatorError;
use crate::indicators::{calculate_macd, calculate_rsi, Crossover, Macd};
use crate::models::{Direction, MarketDataSnapshot, Signal};

/// RSI + MACD reversal strategy
///
/// Entry conditions:
/// - Long: RSI below `rsi_oversold` AND MACD histogram turned positive this candle
/// - Short: RSI above `rsi_overbought` AND MACD histogram turned negative this candle
///
/// Strength is the distance of RSI past its threshold, scaled by the room
/// left to the end of the RSI range (0 or 100).
#[derive(Debug, Clone)]
pub struct RsiMacdStrategy {
    config: RsiMacdConfig,
}

#[derive(Debug, Clone)]
pub struct RsiMacdConfig {
    pub rsi_period: usize,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
}

impl Default for RsiMacdConfig {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
        }
    }
}

impl RsiMacdStrategy {
    pub fn new(config: RsiMacdConfig) -> Self {
        Self { config }
    }

    /// Combine an RSI reading with the MACD histogram transition
    pub fn assess(&self, rsi: f64, macd: &Macd) -> Assessment {
        let oversold = rsi < self.config.rsi_oversold;
        let overbought = rsi > self.config.rsi_overbought;

        match macd.crossover() {
            Crossover::Golden if oversold => Assessment::directional(
                Direction::Long,
                (self.config.rsi_oversold - rsi) / self.config.rsi_oversold,
                format!("RSI oversold ({:.2}) + MACD golden cross", rsi),
            ),
            Crossover::Death if overbought => Assessment::directional(
                Direction::Short,
                (rsi - self.config.rsi_overbought) / (100.0 - self.config.rsi_overbought),
                format!("RSI overbought ({:.2}) + MACD death cross", rsi),
            ),
            crossover => Assessment::flat(format!(
                "No confirmed setup (RSI {:.2}, MACD {:?})",
                rsi, crossover
            )),
        }
    }

    fn generate(&self, closes: &[f64]) -> Result<Assessment, IndicatorError> {
        let rsi = calculate_rsi(closes, self.config.rsi_period)?;
        let macd = calculate_macd(
            closes,
            self.config.macd_fast,
            self.config.macd_slow,
            self.config.macd_signal,
        )?;

        tracing::debug!(
            "RSI/MACD check: rsi={:.2}, macd={:.4}, signal={:.4}, hist {:.4} -> {:.4}",
            rsi,
            macd.macd_line,
            macd.signal_line,
            macd.prev_histogram,
            macd.histogram
        );

        Ok(self.assess(rsi, &macd))
    }
}

impl Default for RsiMacdStrategy {
    fn default() -> Self {
        Self::new(RsiMacdConfig::default())
    }
}

impl Strategy for RsiMacdStrategy {
    fn evaluate(&self, snapshot: &MarketDataSnapshot) -> Signal {
        build_signal(snapshot, self.name(), self.generate(&snapshot.closes()))
    }

    fn name(&self) -> &str {
        "rsi_macd"
    }

    fn min_candles_required(&self) -> usize {
        (self.config.rsi_period + 1).max(self.config.macd_slow + self.config.macd_signal)
    }
}
