use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use uuid::Uuid;

use crate::error::ExchangeErrorKind;
use crate::models::{Direction, ExitReason, OrderSide, OrderStatus, OrderType};
use crate::risk::RejectionReason;

/// Category of a failed or skipped cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleErrorKind {
    Exchange(ExchangeErrorKind),
    /// Snapshot failed ordering or spacing checks
    InvalidData,
    /// Account halted after an authentication failure
    AccountHalted,
    /// Local position bookkeeping refused an update
    Tracker,
}

/// Decision trail of the trading loop
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    CycleStart {
        account: String,
        symbol: String,
    },
    SignalGenerated {
        account: String,
        symbol: String,
        strategy: String,
        direction: Direction,
        strength: f64,
        reason: String,
    },
    RiskDecision {
        account: String,
        symbol: String,
        approved: bool,
        reason: Option<RejectionReason>,
        size: f64,
    },
    OrderSubmitted {
        account: String,
        symbol: String,
        client_order_id: String,
        side: OrderSide,
        order_type: OrderType,
        quantity: f64,
        price: Option<f64>,
    },
    OrderFilled {
        account: String,
        symbol: String,
        order_id: String,
        filled_qty: f64,
        avg_price: f64,
        status: OrderStatus,
    },
    PositionClosed {
        account: String,
        symbol: String,
        position_id: Uuid,
        reason: ExitReason,
        pnl: f64,
    },
    CycleError {
        account: String,
        symbol: String,
        kind: CycleErrorKind,
        message: String,
    },
}

impl AuditEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AuditEvent::CycleStart { .. } => "cycle_start",
            AuditEvent::SignalGenerated { .. } => "signal_generated",
            AuditEvent::RiskDecision { .. } => "risk_decision",
            AuditEvent::OrderSubmitted { .. } => "order_submitted",
            AuditEvent::OrderFilled { .. } => "order_filled",
            AuditEvent::PositionClosed { .. } => "position_closed",
            AuditEvent::CycleError { .. } => "cycle_error",
        }
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Emits each event as JSON on the `tradebot::audit` target
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => tracing::info!(target: "tradebot::audit", "{}", json),
            Err(e) => tracing::error!(
                target: "tradebot::audit",
                "Failed to serialize {} event: {}",
                event.name(),
                e
            ),
        }
    }
}

/// Keeps events in memory for inspection
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Event names in emission order
    pub fn names(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(AuditEvent::name)
            .collect()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let event = AuditEvent::RiskDecision {
            account: "paper".to_string(),
            symbol: "BTC/USDT".to_string(),
            approved: false,
            reason: Some(RejectionReason::DrawdownLimitExceeded),
            size: 0.0,
        };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();

        assert_eq!(json["event"], "risk_decision");
        assert_eq!(json["approved"], false);
        assert_eq!(json["reason"], "DrawdownLimitExceeded");
    }

    #[test]
    fn test_cycle_error_kind_serialization() {
        let event = AuditEvent::CycleError {
            account: "paper".to_string(),
            symbol: "BTC/USDT".to_string(),
            kind: CycleErrorKind::Exchange(ExchangeErrorKind::NetworkError),
            message: "timed out".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"]["exchange"], "NetworkError");
    }

    #[test]
    fn test_memory_sink_keeps_order() {
        let sink = MemoryAuditSink::new();
        sink.record(AuditEvent::CycleStart {
            account: "a".to_string(),
            symbol: "BTC/USDT".to_string(),
        });
        sink.record(AuditEvent::CycleError {
            account: "a".to_string(),
            symbol: "BTC/USDT".to_string(),
            kind: CycleErrorKind::InvalidData,
            message: "gap".to_string(),
        });

        assert_eq!(sink.names(), vec!["cycle_start", "cycle_error"]);
        sink.clear();
        assert!(sink.events().is_empty());
    }
}
