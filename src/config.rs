use std::collections::HashSet;
use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::models::{parse_interval, OrderType};
use crate::strategy::{Strategy, StrategyKind};

const DEFAULT_CONFIG_FILE: &str = "tradebot";
const ENV_PREFIX: &str = "TRADEBOT";

/// Full bot configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub trading: TradingConfig,
    pub algorithm: AlgorithmConfig,
    pub exchange: ExchangeConfig,
    pub accounts: Vec<AccountConfig>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            trading: TradingConfig::default(),
            algorithm: AlgorithmConfig::default(),
            exchange: ExchangeConfig::default(),
            accounts: vec![AccountConfig::default()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    pub enabled: bool,
    pub symbols: Vec<String>,
    pub interval: String,
    pub candle_limit: usize,
    /// Seconds between sweeps
    pub trading_frequency: u64,
    pub max_position_size: f64,
    pub min_trade_amount: f64,
    pub position_fraction: f64,
    pub profit_target: f64,
    pub stop_loss: f64,
    pub max_daily_trades: u32,
    pub max_concurrent_positions: usize,
    pub max_drawdown: f64,
    pub allow_pyramiding: bool,
    pub opposite_signal_policy: OppositeSignalPolicy,
    pub partial_fill_policy: PartialFillPolicy,
    pub order_type: OrderType,
    pub limit_offset: f64,
    pub concurrent_symbols: bool,
    pub close_positions_on_shutdown: bool,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            symbols: vec!["BTC/USDT".to_string()],
            interval: "1h".to_string(),
            candle_limit: 100,
            trading_frequency: 300,
            max_position_size: 1000.0,
            min_trade_amount: 10.0,
            position_fraction: 0.1,
            profit_target: 0.05,
            stop_loss: 0.05,
            max_daily_trades: 50,
            max_concurrent_positions: 3,
            max_drawdown: 0.1,
            allow_pyramiding: false,
            opposite_signal_policy: OppositeSignalPolicy::Ignore,
            partial_fill_policy: PartialFillPolicy::CancelRemainder,
            order_type: OrderType::Market,
            limit_offset: 0.001,
            concurrent_symbols: false,
            close_positions_on_shutdown: false,
        }
    }
}

/// What to do with a signal against an open position on the other side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OppositeSignalPolicy {
    /// Reject the signal, keep the position
    Ignore,
    /// Exit the position, do not reverse
    Close,
    /// Exit the position and open the reverse one
    Flip,
}

/// What to do with the unfilled remainder of an order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialFillPolicy {
    CancelRemainder,
    KeepResting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategySelector {
    RsiMacd,
    Bollinger,
    MovingAverage,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlgorithmConfig {
    pub strategy: StrategySelector,
    pub rsi_period: usize,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub bollinger_period: usize,
    pub bollinger_std: f64,
    pub ma_short: usize,
    pub ma_long: usize,
}

impl Default for AlgorithmConfig {
    fn default() -> Self {
        Self {
            strategy: StrategySelector::RsiMacd,
            rsi_period: 14,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            bollinger_period: 20,
            bollinger_std: 2.0,
            ma_short: 10,
            ma_long: 30,
        }
    }
}

/// Retry and timeout budget for exchange calls
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Attempts after the first one
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub call_timeout_ms: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            call_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub name: String,
    #[serde(default = "default_initial_balance")]
    pub initial_balance: f64,
}

fn default_initial_balance() -> f64 {
    10_000.0
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            name: "paper".to_string(),
            initial_balance: default_initial_balance(),
        }
    }
}

impl BotConfig {
    /// Load from `path` (or `tradebot.toml` when present) and `TRADEBOT__*` env vars
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let settings = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("trading.symbols"),
            )
            .build()?;

        Self::finish(settings)
    }

    /// Parse a TOML document without touching the environment
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?;
        Self::finish(settings)
    }

    fn finish(settings: Config) -> Result<Self, ConfigError> {
        let config: BotConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject malformed limits before any cycle runs
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.trading;

        if !(t.stop_loss > 0.0 && t.stop_loss < 1.0) {
            return Err(ConfigError::invalid("trading.stop_loss", "must be in (0, 1)"));
        }
        if !(t.profit_target > 0.0 && t.profit_target < 1.0) {
            return Err(ConfigError::invalid(
                "trading.profit_target",
                "must be in (0, 1)",
            ));
        }
        if !(t.max_drawdown > 0.0 && t.max_drawdown <= 1.0) {
            return Err(ConfigError::invalid(
                "trading.max_drawdown",
                "must be in (0, 1]",
            ));
        }
        if !(t.position_fraction > 0.0 && t.position_fraction <= 1.0) {
            return Err(ConfigError::invalid(
                "trading.position_fraction",
                "must be in (0, 1]",
            ));
        }
        if !(t.max_position_size > 0.0) {
            return Err(ConfigError::invalid(
                "trading.max_position_size",
                "must be positive",
            ));
        }
        if !(t.min_trade_amount >= 0.0 && t.min_trade_amount <= t.max_position_size) {
            return Err(ConfigError::invalid(
                "trading.min_trade_amount",
                format!("must be in [0, {}]", t.max_position_size),
            ));
        }
        if t.max_daily_trades == 0 {
            return Err(ConfigError::invalid(
                "trading.max_daily_trades",
                "must be positive",
            ));
        }
        if t.max_concurrent_positions == 0 {
            return Err(ConfigError::invalid(
                "trading.max_concurrent_positions",
                "must be positive",
            ));
        }
        if t.trading_frequency == 0 {
            return Err(ConfigError::invalid(
                "trading.trading_frequency",
                "must be positive",
            ));
        }
        if t.candle_limit == 0 {
            return Err(ConfigError::invalid("trading.candle_limit", "must be positive"));
        }
        if !(t.limit_offset >= 0.0 && t.limit_offset < 1.0) {
            return Err(ConfigError::invalid(
                "trading.limit_offset",
                "must be in [0, 1)",
            ));
        }
        if t.symbols.is_empty() {
            return Err(ConfigError::invalid("trading.symbols", "no symbols configured"));
        }
        let mut seen = HashSet::new();
        for symbol in &t.symbols {
            if !seen.insert(symbol.as_str()) {
                return Err(ConfigError::invalid(
                    "trading.symbols",
                    format!("duplicate symbol {}", symbol),
                ));
            }
        }
        if parse_interval(&t.interval).is_none() {
            return Err(ConfigError::invalid(
                "trading.interval",
                format!("unknown interval {:?}", t.interval),
            ));
        }

        self.validate_algorithm()?;

        let lookback = StrategyKind::from_config(&self.algorithm).min_candles_required();
        if t.candle_limit < lookback {
            return Err(ConfigError::invalid(
                "trading.candle_limit",
                format!(
                    "{} candles cannot feed {:?}, which needs {}",
                    t.candle_limit, self.algorithm.strategy, lookback
                ),
            ));
        }

        if self.accounts.is_empty() {
            return Err(ConfigError::invalid("accounts", "no accounts configured"));
        }
        let mut names = HashSet::new();
        for account in &self.accounts {
            if !names.insert(account.name.as_str()) {
                return Err(ConfigError::invalid(
                    "accounts",
                    format!("duplicate account {}", account.name),
                ));
            }
        }

        Ok(())
    }

    fn validate_algorithm(&self) -> Result<(), ConfigError> {
        let a = &self.algorithm;

        if a.rsi_period == 0 || a.macd_fast == 0 || a.macd_signal == 0 || a.ma_short == 0 {
            return Err(ConfigError::invalid("algorithm", "periods must be positive"));
        }
        if a.bollinger_period < 2 {
            return Err(ConfigError::invalid(
                "algorithm.bollinger_period",
                "must be at least 2",
            ));
        }
        if !(a.rsi_oversold > 0.0 && a.rsi_oversold < a.rsi_overbought && a.rsi_overbought < 100.0)
        {
            return Err(ConfigError::invalid(
                "algorithm.rsi_oversold",
                "need 0 < rsi_oversold < rsi_overbought < 100",
            ));
        }
        if a.macd_fast >= a.macd_slow {
            return Err(ConfigError::invalid(
                "algorithm.macd_fast",
                "must be less than macd_slow",
            ));
        }
        if a.ma_short >= a.ma_long {
            return Err(ConfigError::invalid(
                "algorithm.ma_short",
                "must be less than ma_long",
            ));
        }
        if !(a.bollinger_std > 0.0) {
            return Err(ConfigError::invalid(
                "algorithm.bollinger_std",
                "must be positive",
            ));
        }
        Ok(())
    }
}
