use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SnapshotError;

/// OHLCV candlestick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Immutable view of recent candles for one symbol
///
/// Candles are in chronological order with strictly increasing open times.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketDataSnapshot {
    symbol: String,
    candles: Vec<Candle>,
}

impl MarketDataSnapshot {
    pub fn new(symbol: impl Into<String>, candles: Vec<Candle>) -> Result<Self, SnapshotError> {
        let symbol = symbol.into();
        if candles.is_empty() {
            return Err(SnapshotError::Empty { symbol });
        }

        for (i, window) in candles.windows(2).enumerate() {
            if window[1].open_time <= window[0].open_time {
                return Err(SnapshotError::NotIncreasing {
                    symbol,
                    index: i + 1,
                });
            }
        }

        Ok(Self { symbol, candles })
    }

    /// Reject snapshots with missing candles inside the lookback window
    pub fn validate_spacing(&self, interval: Duration) -> Result<(), SnapshotError> {
        let expected_secs = interval.num_seconds();
        for (i, window) in self.candles.windows(2).enumerate() {
            let actual_secs = (window[1].open_time - window[0].open_time).num_seconds();
            if actual_secs != expected_secs {
                return Err(SnapshotError::Gap {
                    symbol: self.symbol.clone(),
                    index: i + 1,
                    expected_secs,
                    actual_secs,
                });
            }
        }
        Ok(())
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }

    pub fn latest(&self) -> &Candle {
        // Non-empty by construction
        &self.candles[self.candles.len() - 1]
    }
}

/// Parse an exchange kline interval such as "5m", "1h" or "1d"
pub fn parse_interval(interval: &str) -> Option<Duration> {
    let interval = interval.trim();
    if interval.len() < 2 {
        return None;
    }
    let (amount, unit) = interval.split_at(interval.len() - 1);
    let amount: i64 = amount.parse().ok().filter(|n| *n > 0)?;
    match unit {
        "m" => Some(Duration::minutes(amount)),
        "h" => Some(Duration::hours(amount)),
        "d" => Some(Duration::days(amount)),
        "w" => Some(Duration::weeks(amount)),
        _ => None,
    }
}

/// Directional recommendation of a strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
    Flat,
}

impl Direction {
    pub fn side(self) -> Option<Side> {
        match self {
            Direction::Long => Some(Side::Long),
            Direction::Short => Some(Side::Short),
            Direction::Flat => None,
        }
    }
}

/// Trading signal for one symbol in one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub direction: Direction,
    /// Confidence-like weight in [0, 1]
    pub strength: f64,
    pub strategy: String,
    /// Latest close, used as the entry estimate
    pub price: f64,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl Signal {
    pub fn flat(
        symbol: impl Into<String>,
        strategy: impl Into<String>,
        price: f64,
        reason: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            direction: Direction::Flat,
            strength: 0.0,
            strategy: strategy.into(),
            price,
            reason: reason.into(),
            timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    /// Order side that opens a position on this side
    pub fn entry_order_side(self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    /// Order side that exits a position on this side
    pub fn exit_order_side(self) -> OrderSide {
        self.opposite().entry_order_side()
    }

    /// P&L of `quantity` units moved from `entry` to `exit`
    pub fn pnl(self, entry: f64, exit: f64, quantity: f64) -> f64 {
        match self {
            Side::Long => (exit - entry) * quantity,
            Side::Short => (entry - exit) * quantity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    PendingClose,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    /// Closed because an opposite signal arrived
    SignalReversal,
    Shutdown,
    Manual,
}

/// Position in a symbol on one account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64, // Average fill price
    pub quantity: f64,
    pub stop_loss_price: f64,
    pub take_profit_price: f64,
    pub opened_at: DateTime<Utc>,
    pub status: PositionStatus,
    /// Entry order still working on the exchange
    pub resting_order_id: Option<String>,
}

impl Position {
    pub fn is_active(&self) -> bool {
        self.status != PositionStatus::Closed
    }

    pub fn unrealized_pnl(&self, current_price: f64) -> f64 {
        self.side.pnl(self.entry_price, current_price, self.quantity)
    }

    pub fn notional(&self) -> f64 {
        self.entry_price * self.quantity
    }
}

/// Fully or partially exited position with realized result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub position_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub realized_pnl: f64,
    pub reason: ExitReason,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

impl ClosedTrade {
    pub fn pnl_pct(&self) -> f64 {
        let cost = self.entry_price * self.quantity;
        if cost == 0.0 {
            0.0
        } else {
            self.realized_pnl / cost
        }
    }
}

/// Balance view of an exchange account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
    pub account: String,
    pub available_balance: f64,
    pub total_equity: f64,
    /// High-water mark used for drawdown
    pub peak_equity: f64,
}

impl AccountState {
    /// Fractional loss from the high-water mark, 0 when at or above peak
    pub fn drawdown(&self) -> f64 {
        if self.peak_equity <= 0.0 {
            return 0.0;
        }
        (1.0 - self.total_equity / self.peak_equity).max(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub order_type: OrderType,
    pub price: Option<f64>,
}

impl OrderRequest {
    pub fn market(symbol: impl Into<String>, side: OrderSide, quantity: f64) -> Self {
        Self {
            client_order_id: Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            side,
            quantity,
            order_type: OrderType::Market,
            price: None,
        }
    }

    pub fn limit(symbol: impl Into<String>, side: OrderSide, quantity: f64, price: f64) -> Self {
        Self {
            order_type: OrderType::Limit,
            price: Some(price),
            ..Self::market(symbol, side, quantity)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub client_order_id: String,
    pub filled_qty: f64,
    pub avg_price: f64,
    pub status: OrderStatus,
}

/// Order still working on the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub filled_qty: f64,
    pub avg_price: f64,
    pub price: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle_at(ts: DateTime<Utc>, price: f64) -> Candle {
        Candle {
            open_time: ts,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 1.0,
        }
    }

    #[test]
    fn test_snapshot_rejects_unordered_candles() {
        let now = Utc::now();
        let candles = vec![candle_at(now, 1.0), candle_at(now - Duration::hours(1), 2.0)];
        let result = MarketDataSnapshot::new("BTC/USDT", candles);
        assert!(matches!(
            result,
            Err(SnapshotError::NotIncreasing { index: 1, .. })
        ));
    }

    #[test]
    fn test_snapshot_rejects_duplicate_timestamps() {
        let now = Utc::now();
        let candles = vec![candle_at(now, 1.0), candle_at(now, 2.0)];
        assert!(MarketDataSnapshot::new("BTC/USDT", candles).is_err());
    }

    #[test]
    fn test_snapshot_rejects_empty() {
        let result = MarketDataSnapshot::new("BTC/USDT", Vec::new());
        assert!(matches!(result, Err(SnapshotError::Empty { .. })));
    }

    #[test]
    fn test_snapshot_spacing() {
        let start = Utc::now();
        let candles: Vec<Candle> = (0..5)
            .map(|i| candle_at(start + Duration::hours(i), 100.0))
            .collect();
        let snapshot = MarketDataSnapshot::new("BTC/USDT", candles.clone()).unwrap();
        assert!(snapshot.validate_spacing(Duration::hours(1)).is_ok());

        let mut gapped = candles;
        gapped.remove(2);
        let snapshot = MarketDataSnapshot::new("BTC/USDT", gapped).unwrap();
        let err = snapshot.validate_spacing(Duration::hours(1)).unwrap_err();
        assert!(matches!(err, SnapshotError::Gap { index: 2, actual_secs: 7200, .. }));
    }

    #[test]
    fn test_parse_interval() {
        assert_eq!(parse_interval("5m"), Some(Duration::minutes(5)));
        assert_eq!(parse_interval("1h"), Some(Duration::hours(1)));
        assert_eq!(parse_interval("4h"), Some(Duration::hours(4)));
        assert_eq!(parse_interval("1d"), Some(Duration::days(1)));
        assert_eq!(parse_interval("0h"), None);
        assert_eq!(parse_interval("h"), None);
        assert_eq!(parse_interval("3x"), None);
    }

    #[test]
    fn test_side_pnl() {
        assert_eq!(Side::Long.pnl(100.0, 110.0, 2.0), 20.0);
        assert_eq!(Side::Short.pnl(100.0, 110.0, 2.0), -20.0);
        assert_eq!(Side::Long.exit_order_side(), OrderSide::Sell);
        assert_eq!(Side::Short.entry_order_side(), OrderSide::Sell);
    }

    #[test]
    fn test_account_drawdown() {
        let state = AccountState {
            account: "paper".to_string(),
            available_balance: 800.0,
            total_equity: 900.0,
            peak_equity: 1000.0,
        };
        assert!((state.drawdown() - 0.1).abs() < 1e-12);

        let above_peak = AccountState {
            total_equity: 1100.0,
            ..state
        };
        assert_eq!(above_peak.drawdown(), 0.0);
    }
}
