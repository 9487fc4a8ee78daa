use super::{build_signal, Assessment, Strategy};
use crate::error::IndicatorError;
use crate::indicators::{calculate_bollinger, BollingerBands};
use crate::models::{Direction, MarketDataSnapshot, Signal};

/// Band-touch mean reversion
///
/// Long when the latest close is at or below the lower band, Short when at
/// or above the upper band. Strength is penetration depth relative to band width.
#[derive(Debug, Clone)]
pub struct BollingerStrategy {
    config: BollingerConfig,
}

#[derive(Debug, Clone)]
pub struct BollingerConfig {
    pub period: usize,
    pub num_std: f64,
}

impl Default for BollingerConfig {
    fn default() -> Self {
        Self {
            period: 20,
            num_std: 2.0,
        }
    }
}

impl BollingerStrategy {
    pub fn new(config: BollingerConfig) -> Self {
        Self { config }
    }

    pub fn assess(&self, price: f64, bands: &BollingerBands) -> Assessment {
        let width = bands.width();
        if width <= 0.0 {
            // Collapsed bands: price touches both, which is no signal at all
            return Assessment::flat("Bollinger bands collapsed");
        }

        if price <= bands.lower {
            Assessment::directional(
                Direction::Long,
                (bands.lower - price) / width,
                format!("Price {:.2} at lower band {:.2}", price, bands.lower),
            )
        } else if price >= bands.upper {
            Assessment::directional(
                Direction::Short,
                (price - bands.upper) / width,
                format!("Price {:.2} at upper band {:.2}", price, bands.upper),
            )
        } else {
            Assessment::flat("Price inside Bollinger bands")
        }
    }

    fn generate(&self, closes: &[f64]) -> Result<Assessment, IndicatorError> {
        let bands = calculate_bollinger(closes, self.config.period, self.config.num_std)?;
        let price = closes[closes.len() - 1];
        Ok(self.assess(price, &bands))
    }
}

impl Default for BollingerStrategy {
    fn default() -> Self {
        Self::new(BollingerConfig::default())
    }
}

impl Strategy for BollingerStrategy {
    fn evaluate(&self, snapshot: &MarketDataSnapshot) -> Signal {
        build_signal(snapshot, self.name(), self.generate(&snapshot.closes()))
    }

    fn name(&self) -> &str {
        "bollinger"
    }

    fn min_candles_required(&self) -> usize {
        self.config.period
    }
}
