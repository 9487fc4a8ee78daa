use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Indicator could not be computed from the candles at hand
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IndicatorError {
    #[error("insufficient data: need {required} samples, got {available}")]
    InsufficientData { required: usize, available: usize },

    #[error("invalid indicator parameter: {0}")]
    InvalidParameter(String),
}

impl IndicatorError {
    pub(crate) fn check_len(available: usize, required: usize) -> Result<(), Self> {
        if available < required {
            return Err(Self::InsufficientData {
                required,
                available,
            });
        }
        Ok(())
    }
}

/// Malformed market data returned by an exchange
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SnapshotError {
    #[error("snapshot for {symbol} contains no candles")]
    Empty { symbol: String },

    #[error("candles for {symbol} are not strictly increasing at index {index}")]
    NotIncreasing { symbol: String, index: usize },

    #[error("gap in {symbol} candles at index {index}: {actual_secs}s between candles, expected {expected_secs}s")]
    Gap {
        symbol: String,
        index: usize,
        expected_secs: i64,
        actual_secs: i64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExchangeErrorKind {
    RateLimited,
    AuthFailed,
    NetworkError,
    InvalidSymbol,
    InsufficientBalance,
}

impl ExchangeErrorKind {
    /// Transient failures worth another attempt
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::RateLimited | Self::NetworkError)
    }
}

/// Failure of a call through the exchange gateway
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind:?}: {message}")]
pub struct ExchangeError {
    pub kind: ExchangeErrorKind,
    pub message: String,
}

impl ExchangeError {
    pub fn new(kind: ExchangeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ExchangeErrorKind::NetworkError, message)
    }

    pub fn timeout(operation: &str, after_ms: u128) -> Self {
        Self::network(format!("{} timed out after {}ms", operation, after_ms))
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrackerError {
    #[error("position {0} not found")]
    NotFound(Uuid),

    #[error("already have an active position for {0}")]
    DuplicatePosition(String),

    #[error("position {0} is not open")]
    NotOpen(Uuid),

    #[error("invalid fill: {0}")]
    InvalidFill(String),
}

/// Configuration integrity failure, fatal at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration value `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Failure of an operator command on the trading loop
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown account {0}")]
    UnknownAccount(String),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}
