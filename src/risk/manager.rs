//! Pre-trade risk checks and position sizing.
//!
//! The risk manager sits between the strategy and order submission. It is a
//! pure function of its inputs: account balances, the account's positions and
//! the frequency counter are all passed in, nothing is remembered between calls.

use std::fmt;

use serde::Serialize;
use uuid::Uuid;

use super::TradeFrequencyCounter;
use crate::config::{OppositeSignalPolicy, TradingConfig};
use crate::models::{AccountState, Direction, Position, Side, Signal};

/// Slack for equity ratios that land a rounding error under the limit
const DRAWDOWN_TOLERANCE: f64 = 1e-9;

/// Limits applied to every signal
#[derive(Debug, Clone)]
pub struct RiskConfig {
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
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self::from(&TradingConfig::default())
    }
}

impl From<&TradingConfig> for RiskConfig {
    fn from(t: &TradingConfig) -> Self {
        Self {
            max_position_size: t.max_position_size,
            min_trade_amount: t.min_trade_amount,
            position_fraction: t.position_fraction,
            profit_target: t.profit_target,
            stop_loss: t.stop_loss,
            max_daily_trades: t.max_daily_trades,
            max_concurrent_positions: t.max_concurrent_positions,
            max_drawdown: t.max_drawdown,
            allow_pyramiding: t.allow_pyramiding,
            opposite_signal_policy: t.opposite_signal_policy,
        }
    }
}

/// Why a signal did not become an order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RejectionReason {
    NoSignal,
    FrequencyLimitExceeded,
    DuplicatePosition,
    OppositePositionOpen,
    MaxConcurrentPositions,
    DrawdownLimitExceeded,
    BelowMinimumSize,
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RejectionReason::NoSignal => "no directional signal",
            RejectionReason::FrequencyLimitExceeded => "daily trade limit reached",
            RejectionReason::DuplicatePosition => "position already open in this direction",
            RejectionReason::OppositePositionOpen => "opposite position open",
            RejectionReason::MaxConcurrentPositions => "too many open positions",
            RejectionReason::DrawdownLimitExceeded => "drawdown limit exceeded",
            RejectionReason::BelowMinimumSize => "order below minimum trade amount",
        };
        f.write_str(text)
    }
}

/// What an approved decision asks the executor to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RiskAction {
    /// Open a new position on `RiskDecision::side`
    Open,
    /// Exit an existing position without reversing
    Close { position_id: Uuid },
    /// Exit an existing position, then open the reverse one
    Flip { position_id: Uuid },
}

/// Outcome of checking one signal
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskDecision {
    pub approved: bool,
    pub action: Option<RiskAction>,
    pub side: Option<Side>,
    /// Quote-currency notional
    pub size: f64,
    /// Base-asset quantity, `size / entry_price`
    pub quantity: f64,
    pub entry_price: f64,
    pub stop_loss_price: f64,
    pub take_profit_price: f64,
    pub rejection: Option<RejectionReason>,
}

impl RiskDecision {
    pub fn reject(reason: RejectionReason) -> Self {
        Self {
            approved: false,
            action: None,
            side: None,
            size: 0.0,
            quantity: 0.0,
            entry_price: 0.0,
            stop_loss_price: 0.0,
            take_profit_price: 0.0,
            rejection: Some(reason),
        }
    }

    fn close(position: &Position, price: f64) -> Self {
        Self {
            approved: true,
            action: Some(RiskAction::Close {
                position_id: position.id,
            }),
            side: Some(position.side),
            size: position.quantity * price,
            quantity: position.quantity,
            entry_price: price,
            stop_loss_price: 0.0,
            take_profit_price: 0.0,
            rejection: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RiskManager {
    config: RiskConfig,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Check a signal against the account. First failing check wins.
    ///
    /// `positions` are the account's positions across all symbols; inactive
    /// ones are ignored.
    pub fn assess(
        &self,
        signal: &Signal,
        account: &AccountState,
        positions: &[Position],
        counter: &TradeFrequencyCounter,
    ) -> RiskDecision {
        let side = match signal.direction {
            Direction::Long => Side::Long,
            Direction::Short => Side::Short,
            Direction::Flat => return RiskDecision::reject(RejectionReason::NoSignal),
        };

        if counter.daily_count() >= self.config.max_daily_trades {
            return RiskDecision::reject(RejectionReason::FrequencyLimitExceeded);
        }

        let mut action = RiskAction::Open;
        for position in positions
            .iter()
            .filter(|p| p.is_active() && p.symbol == signal.symbol)
        {
            if position.side == side {
                if !self.config.allow_pyramiding {
                    return RiskDecision::reject(RejectionReason::DuplicatePosition);
                }
                continue;
            }

            match self.config.opposite_signal_policy {
                OppositeSignalPolicy::Ignore => {
                    return RiskDecision::reject(RejectionReason::OppositePositionOpen)
                }
                // Exits reduce risk, so drawdown and sizing do not apply
                OppositeSignalPolicy::Close => {
                    return RiskDecision::close(position, signal.price)
                }
                OppositeSignalPolicy::Flip => {
                    action = RiskAction::Flip {
                        position_id: position.id,
                    };
                }
            }
        }

        if action == RiskAction::Open {
            let active = positions.iter().filter(|p| p.is_active()).count();
            if active >= self.config.max_concurrent_positions {
                return RiskDecision::reject(RejectionReason::MaxConcurrentPositions);
            }
        }

        let drawdown = account.drawdown();
        if drawdown + DRAWDOWN_TOLERANCE >= self.config.max_drawdown {
            tracing::warn!(
                account = %account.account,
                "Drawdown {:.2}% at or above limit {:.2}%, new entries blocked",
                drawdown * 100.0,
                self.config.max_drawdown * 100.0
            );
            return RiskDecision::reject(RejectionReason::DrawdownLimitExceeded);
        }

        let size = self.position_size(account.available_balance, signal.strength);
        if size < self.config.min_trade_amount || size <= 0.0 || !(signal.price > 0.0) {
            return RiskDecision::reject(RejectionReason::BelowMinimumSize);
        }

        let entry = signal.price;
        let (stop_loss_price, take_profit_price) = self.exit_prices(side, entry);

        RiskDecision {
            approved: true,
            action: Some(action),
            side: Some(side),
            size,
            quantity: size / entry,
            entry_price: entry,
            stop_loss_price,
            take_profit_price,
            rejection: None,
        }
    }

    /// Quote notional for a new entry
    pub fn position_size(&self, available_balance: f64, strength: f64) -> f64 {
        let scaled = available_balance.max(0.0) * strength * self.config.position_fraction;
        self.config.max_position_size.min(scaled)
    }

    /// Stop-loss and take-profit levels around an entry price
    pub fn exit_prices(&self, side: Side, entry: f64) -> (f64, f64) {
        match side {
            Side::Long => (
                entry * (1.0 - self.config.stop_loss),
                entry * (1.0 + self.config.profit_target),
            ),
            Side::Short => (
                entry * (1.0 + self.config.stop_loss),
                entry * (1.0 - self.config.profit_target),
            ),
        }
    }
}
