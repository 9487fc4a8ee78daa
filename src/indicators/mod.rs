// Technical indicators module
// Pure functions over close prices: RSI, SMA/EMA, MACD, Bollinger Bands

pub mod bollinger;
pub mod macd;
pub mod moving_average;
pub mod rsi;

pub use bollinger::{calculate_bollinger, BollingerBands};
pub use macd::{calculate_macd, Macd};
pub use moving_average::{
    calculate_ema, calculate_ema_series, calculate_sma, detect_ma_crossover, Crossover,
};
pub use rsi::calculate_rsi;
