// Trading strategy module
pub mod bollinger;
pub mod ma_cross;
pub mod rsi_macd;

pub use bollinger::{BollingerConfig, BollingerStrategy};
pub use ma_cross::{MaCrossConfig, MaCrossStrategy};
pub use rsi_macd::{RsiMacdConfig, RsiMacdStrategy};

use crate::config::{AlgorithmConfig, StrategySelector};
use crate::error::IndicatorError;
use crate::models::{Direction, MarketDataSnapshot, Signal};

/// Base trait for all trading strategies
pub trait Strategy: Send + Sync {
    /// Generate a trading signal from an immutable snapshot
    ///
    /// Never fails: missing history degrades to a Flat signal.
    fn evaluate(&self, snapshot: &MarketDataSnapshot) -> Signal;

    /// Get strategy name
    fn name(&self) -> &str;

    /// Minimum candles required for this strategy
    fn min_candles_required(&self) -> usize;
}

/// Direction and weight a strategy derived from its indicators
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub direction: Direction,
    pub strength: f64,
    pub reason: String,
}

impl Assessment {
    pub fn flat(reason: impl Into<String>) -> Self {
        Self {
            direction: Direction::Flat,
            strength: 0.0,
            reason: reason.into(),
        }
    }

    pub fn directional(direction: Direction, strength: f64, reason: impl Into<String>) -> Self {
        Self {
            direction,
            strength: clamp_strength(strength),
            reason: reason.into(),
        }
    }
}

pub(crate) fn clamp_strength(strength: f64) -> f64 {
    if strength.is_nan() {
        0.0
    } else {
        strength.clamp(0.0, 1.0)
    }
}

/// Turn an indicator outcome into a signal stamped with the latest candle
///
/// The timestamp comes from the snapshot, never the wall clock, so the same
/// snapshot always yields the same signal.
pub(crate) fn build_signal(
    snapshot: &MarketDataSnapshot,
    strategy: &str,
    outcome: Result<Assessment, IndicatorError>,
) -> Signal {
    let latest = snapshot.latest();
    let assessment = outcome.unwrap_or_else(|e| {
        tracing::debug!(
            symbol = %snapshot.symbol(),
            strategy = %strategy,
            "No signal this cycle: {}",
            e
        );
        Assessment::flat(e.to_string())
    });

    Signal {
        symbol: snapshot.symbol().to_string(),
        direction: assessment.direction,
        strength: assessment.strength,
        strategy: strategy.to_string(),
        price: latest.close,
        reason: assessment.reason,
        timestamp: latest.open_time,
    }
}

/// The strategy variant active for a session, selected once from configuration
#[derive(Debug, Clone)]
pub enum StrategyKind {
    RsiMacd(RsiMacdStrategy),
    Bollinger(BollingerStrategy),
    MovingAverageCross(MaCrossStrategy),
}

impl StrategyKind {
    pub fn from_config(config: &AlgorithmConfig) -> Self {
        match config.strategy {
            StrategySelector::RsiMacd => StrategyKind::RsiMacd(RsiMacdStrategy::new(RsiMacdConfig {
                rsi_period: config.rsi_period,
                rsi_oversold: config.rsi_oversold,
                rsi_overbought: config.rsi_overbought,
                macd_fast: config.macd_fast,
                macd_slow: config.macd_slow,
                macd_signal: config.macd_signal,
            })),
            StrategySelector::Bollinger => {
                StrategyKind::Bollinger(BollingerStrategy::new(BollingerConfig {
                    period: config.bollinger_period,
                    num_std: config.bollinger_std,
                }))
            }
            StrategySelector::MovingAverage => {
                StrategyKind::MovingAverageCross(MaCrossStrategy::new(MaCrossConfig {
                    short_period: config.ma_short,
                    long_period: config.ma_long,
                }))
            }
        }
    }

    fn inner(&self) -> &dyn Strategy {
        match self {
            StrategyKind::RsiMacd(s) => s,
            StrategyKind::Bollinger(s) => s,
            StrategyKind::MovingAverageCross(s) => s,
        }
    }
}

impl Strategy for StrategyKind {
    fn evaluate(&self, snapshot: &MarketDataSnapshot) -> Signal {
        self.inner().evaluate(snapshot)
    }

    fn name(&self) -> &str {
        self.inner().name()
    }

    fn min_candles_required(&self) -> usize {
        self.inner().min_candles_required()
    }
}
