// Risk management module
pub mod frequency;
pub mod manager;
pub mod metrics;

pub use frequency::TradeFrequencyCounter;
pub use manager::{RejectionReason, RiskAction, RiskConfig, RiskDecision, RiskManager};
pub use metrics::{RiskLevel, RiskMetrics};
