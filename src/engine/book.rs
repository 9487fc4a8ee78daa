use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::execution::PositionTracker;
use crate::models::AccountState;
use crate::risk::{RiskMetrics, TradeFrequencyCounter};

/// Fill progress already booked for a resting entry order
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BookedFill {
    pub filled_qty: f64,
    pub avg_price: f64,
}

/// Order whose cancel did not go through
#[derive(Debug, Clone, PartialEq)]
pub struct StaleOrder {
    pub symbol: String,
    pub order_id: String,
}

/// Mutable trading state of one account
///
/// Lives behind the account's mutex; every write to positions, the trade
/// counter or the high-water mark goes through it.
#[derive(Debug)]
pub struct AccountBook {
    pub name: String,
    pub tracker: PositionTracker,
    pub counter: TradeFrequencyCounter,
    /// Set on authentication failure, cleared by the operator
    pub halted: Option<String>,
    pub resting: HashMap<String, BookedFill>,
    pub stale_orders: Vec<StaleOrder>,
    pub last_state: Option<AccountState>,
}

impl AccountBook {
    pub fn new(name: impl Into<String>, initial_equity: f64, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            tracker: PositionTracker::new(initial_equity),
            counter: TradeFrequencyCounter::new(now),
            halted: None,
            resting: HashMap::new(),
            stale_orders: Vec::new(),
            last_state: None,
        }
    }

    /// Fold the exchange's balance view into the book's high-water mark
    pub fn account_state(&mut self, mut state: AccountState) -> AccountState {
        self.tracker.observe_equity(state.total_equity);
        state.peak_equity = self.tracker.peak_equity();
        self.last_state = Some(state.clone());
        state
    }

    pub fn metrics(&self) -> RiskMetrics {
        let (equity, drawdown) = match &self.last_state {
            Some(state) => (state.total_equity, state.drawdown()),
            None => (self.tracker.peak_equity(), 0.0),
        };
        RiskMetrics {
            equity,
            peak_equity: self.tracker.peak_equity(),
            drawdown,
            daily_trades: self.counter.daily_count(),
            trades_24h: self.counter.rolling_count(),
            realized_pnl: self.tracker.realized_pnl_total(),
            open_positions: self.tracker.active_positions().len(),
            win_rate: self.tracker.win_rate(),
        }
    }
}
