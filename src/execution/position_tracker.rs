use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::TrackerError;
use crate::models::{ClosedTrade, ExitReason, Position, PositionStatus, Side};

/// Quantities below this are treated as fully exited
const QTY_EPSILON: f64 = 1e-12;

/// Entry fill to turn into a position
#[derive(Debug, Clone)]
pub struct EntryFill {
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
    pub stop_loss_price: f64,
    pub take_profit_price: f64,
    pub at: DateTime<Utc>,
}

/// Stop-loss or take-profit breach found by `check_exits`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitInstruction {
    pub position_id: Uuid,
    pub reason: ExitReason,
    /// Level that was breached
    pub trigger_price: f64,
}

/// Authoritative record of one account's positions and realized P&L
///
/// Holds at most one active position per symbol. Fully exited positions move
/// to the closed-trade history.
#[derive(Debug, Clone)]
pub struct PositionTracker {
    positions: Vec<Position>,
    closed: Vec<ClosedTrade>,
    realized_pnl: f64,
    peak_equity: f64,
}

impl PositionTracker {
    pub fn new(initial_equity: f64) -> Self {
        Self {
            positions: Vec::new(),
            closed: Vec::new(),
            realized_pnl: 0.0,
            peak_equity: initial_equity,
        }
    }

    /// Record a confirmed entry fill as a new open position
    pub fn open_position(&mut self, fill: EntryFill) -> Result<Uuid, TrackerError> {
        if !(fill.quantity > 0.0) || !(fill.price > 0.0) {
            return Err(TrackerError::InvalidFill(format!(
                "{} @ {} for {}",
                fill.quantity, fill.price, fill.symbol
            )));
        }
        if self.active_for(&fill.symbol).is_some() {
            return Err(TrackerError::DuplicatePosition(fill.symbol));
        }

        let id = Uuid::new_v4();
        tracing::info!(
            "Opened {:?} {} {:.6} @ ${:.2} (SL ${:.2}, TP ${:.2})",
            fill.side,
            fill.symbol,
            fill.quantity,
            fill.price,
            fill.stop_loss_price,
            fill.take_profit_price
        );

        self.positions.push(Position {
            id,
            symbol: fill.symbol,
            side: fill.side,
            entry_price: fill.price,
            quantity: fill.quantity,
            stop_loss_price: fill.stop_loss_price,
            take_profit_price: fill.take_profit_price,
            opened_at: fill.at,
            status: PositionStatus::Open,
            resting_order_id: None,
        });
        Ok(id)
    }

    /// Grow a position by an additional fill, averaging the entry price
    pub fn add_fill(&mut self, id: Uuid, price: f64, quantity: f64) -> Result<(), TrackerError> {
        if !(quantity > 0.0) || !(price > 0.0) {
            return Err(TrackerError::InvalidFill(format!("{} @ {}", quantity, price)));
        }
        let position = self.active_mut(id)?;

        let cost = position.entry_price * position.quantity + price * quantity;
        position.quantity += quantity;
        position.entry_price = cost / position.quantity;

        tracing::info!(
            "Added {:.6} {} @ ${:.2} (avg: ${:.2}, total qty: {:.6})",
            quantity,
            position.symbol,
            price,
            position.entry_price,
            position.quantity
        );
        Ok(())
    }

    pub fn set_resting_order(&mut self, id: Uuid, order_id: Option<String>) -> Result<(), TrackerError> {
        self.active_mut(id)?.resting_order_id = order_id;
        Ok(())
    }

    /// Find stop-loss and take-profit breaches for `symbol` within a price range
    ///
    /// `low` and `high` bound the prices traded since the last check; pass the
    /// same value twice for a single tick. When both levels are breached the
    /// stop-loss wins. Breached positions move to `PendingClose`.
    pub fn check_exits(&mut self, symbol: &str, low: f64, high: f64) -> Vec<ExitInstruction> {
        let mut exits = Vec::new();
        for position in self
            .positions
            .iter_mut()
            .filter(|p| p.status == PositionStatus::Open && p.symbol == symbol)
        {
            if let Some((reason, trigger_price)) = exit_trigger(position, low, high) {
                position.status = PositionStatus::PendingClose;
                exits.push(ExitInstruction {
                    position_id: position.id,
                    reason,
                    trigger_price,
                });
            }
        }
        exits
    }

    pub fn mark_pending_close(&mut self, id: Uuid) -> Result<(), TrackerError> {
        self.active_mut(id)?.status = PositionStatus::PendingClose;
        Ok(())
    }

    /// Put a position back to Open after its exit order failed
    pub fn reopen(&mut self, id: Uuid) -> Result<(), TrackerError> {
        self.active_mut(id)?.status = PositionStatus::Open;
        Ok(())
    }

    /// Record an exit fill of `quantity` at `exit_price`
    ///
    /// A partial exit reduces the position and leaves it active; a full exit
    /// moves it to history. Either way the realized part is returned. The
    /// high-water mark is left alone: it only moves on marked-to-market
    /// equity passed to `observe_equity`.
    pub fn close_position(
        &mut self,
        id: Uuid,
        exit_price: f64,
        quantity: f64,
        reason: ExitReason,
        at: DateTime<Utc>,
    ) -> Result<ClosedTrade, TrackerError> {
        if !(quantity > 0.0) || !(exit_price > 0.0) {
            return Err(TrackerError::InvalidFill(format!(
                "exit {} @ {}",
                quantity, exit_price
            )));
        }
        let idx = self
            .positions
            .iter()
            .position(|p| p.id == id)
            .ok_or(TrackerError::NotFound(id))?;

        let position = &mut self.positions[idx];
        let quantity = quantity.min(position.quantity);
        let pnl = position.side.pnl(position.entry_price, exit_price, quantity);

        let trade = ClosedTrade {
            position_id: position.id,
            symbol: position.symbol.clone(),
            side: position.side,
            entry_price: position.entry_price,
            exit_price,
            quantity,
            realized_pnl: pnl,
            reason,
            opened_at: position.opened_at,
            closed_at: at,
        };

        position.quantity -= quantity;
        if position.quantity <= QTY_EPSILON {
            position.status = PositionStatus::Closed;
            self.positions.remove(idx);
        } else {
            position.status = PositionStatus::Open;
        }

        self.realized_pnl += pnl;
        self.closed.push(trade.clone());

        tracing::info!(
            "Closed {} {:.6} @ ${:.2} ({:?}) P&L: ${:.2}",
            trade.symbol,
            trade.quantity,
            exit_price,
            reason,
            pnl
        );
        Ok(trade)
    }

    /// Raise the high-water mark if `equity` exceeds it
    pub fn observe_equity(&mut self, equity: f64) {
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
    }

    /// Operator reset of the high-water mark to current equity
    pub fn reset_peak_equity(&mut self, equity: f64) {
        tracing::warn!(
            "Peak equity reset from ${:.2} to ${:.2}",
            self.peak_equity,
            equity
        );
        self.peak_equity = equity;
    }

    pub fn peak_equity(&self) -> f64 {
        self.peak_equity
    }

    pub fn realized_pnl_total(&self) -> f64 {
        self.realized_pnl
    }

    /// Unrealized P&L of the active position in `symbol`, 0 when flat
    pub fn unrealized_pnl(&self, symbol: &str, current_price: f64) -> f64 {
        self.positions
            .iter()
            .filter(|p| p.symbol == symbol)
            .map(|p| p.unrealized_pnl(current_price))
            .sum()
    }

    pub fn active_positions(&self) -> &[Position] {
        &self.positions
    }

    pub fn active_for(&self, symbol: &str) -> Option<&Position> {
        self.positions.iter().find(|p| p.symbol == symbol)
    }

    pub fn position(&self, id: Uuid) -> Option<&Position> {
        self.positions.iter().find(|p| p.id == id)
    }

    pub fn closed_trades(&self) -> &[ClosedTrade] {
        &self.closed
    }

    /// Share of fully or partially closed trades with positive P&L
    pub fn win_rate(&self) -> Option<f64> {
        if self.closed.is_empty() {
            return None;
        }
        let wins = self.closed.iter().filter(|t| t.realized_pnl > 0.0).count();
        Some(wins as f64 / self.closed.len() as f64)
    }

    fn active_mut(&mut self, id: Uuid) -> Result<&mut Position, TrackerError> {
        let position = self
            .positions
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or(TrackerError::NotFound(id))?;
        if !position.is_active() {
            return Err(TrackerError::NotOpen(id));
        }
        Ok(position)
    }
}

fn exit_trigger(position: &Position, low: f64, high: f64) -> Option<(ExitReason, f64)> {
    let (stop_hit, target_hit) = match position.side {
        Side::Long => (
            low <= position.stop_loss_price,
            high >= position.take_profit_price,
        ),
        Side::Short => (
            high >= position.stop_loss_price,
            low <= position.take_profit_price,
        ),
    };

    if stop_hit {
        Some((ExitReason::StopLoss, position.stop_loss_price))
    } else if target_hit {
        Some((ExitReason::TakeProfit, position.take_profit_price))
    } else {
        None
    }
}
