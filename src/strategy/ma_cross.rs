use super::{build_signal, Assessment, Strategy};
use crate::error::IndicatorError;
use crate::indicators::{detect_ma_crossover, Crossover};
use crate::models::{Direction, MarketDataSnapshot, Signal};

/// Short/long simple moving average crossover
#[derive(Debug, Clone)]
pub struct MaCrossStrategy {
    config: MaCrossConfig,
}

#[derive(Debug, Clone)]
pub struct MaCrossConfig {
    pub short_period: usize,
    pub long_period: usize,
}

impl Default for MaCrossConfig {
    fn default() -> Self {
        Self {
            short_period: 10,
            long_period: 30,
        }
    }
}

impl MaCrossStrategy {
    pub fn new(config: MaCrossConfig) -> Self {
        Self { config }
    }

    fn generate(&self, closes: &[f64]) -> Result<Assessment, IndicatorError> {
        let cross = detect_ma_crossover(closes, self.config.short_period, self.config.long_period)?;
        let strength = (cross.short_ma - cross.long_ma).abs() / cross.long_ma;

        Ok(match cross.crossover {
            Crossover::Golden => Assessment::directional(
                Direction::Long,
                strength,
                format!(
                    "Short MA ({:.2}) crossed above long MA ({:.2})",
                    cross.short_ma, cross.long_ma
                ),
            ),
            Crossover::Death => Assessment::directional(
                Direction::Short,
                strength,
                format!(
                    "Short MA ({:.2}) crossed below long MA ({:.2})",
                    cross.short_ma, cross.long_ma
                ),
            ),
            Crossover::None => Assessment::flat("No moving average crossover"),
        })
    }
}

impl Default for MaCrossStrategy {
    fn default() -> Self {
        Self::new(MaCrossConfig::default())
    }
}

impl Strategy for MaCrossStrategy {
    fn evaluate(&self, snapshot: &MarketDataSnapshot) -> Signal {
        build_signal(snapshot, self.name(), self.generate(&snapshot.closes()))
    }

    fn name(&self) -> &str {
        "moving_average"
    }

    fn min_candles_required(&self) -> usize {
        self.config.long_period + 1
    }
}
