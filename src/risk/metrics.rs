use serde::Serialize;

/// Coarse health grade of an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Point-in-time risk summary for one account
#[derive(Debug, Clone, Serialize)]
pub struct RiskMetrics {
    pub equity: f64,
    pub peak_equity: f64,
    pub drawdown: f64,
    pub daily_trades: u32,
    /// Submissions in the 24 hours before the last counter roll
    pub trades_24h: usize,
    pub realized_pnl: f64,
    pub open_positions: usize,
    /// None until at least one trade has closed
    pub win_rate: Option<f64>,
}

struct Thresholds {
    drawdown: f64,
    daily_trades: u32,
    win_rate: f64,
}

const CRITICAL: Thresholds = Thresholds {
    drawdown: 0.15,
    daily_trades: 40,
    win_rate: 0.30,
};

const HIGH: Thresholds = Thresholds {
    drawdown: 0.10,
    daily_trades: 30,
    win_rate: 0.40,
};

const MEDIUM: Thresholds = Thresholds {
    drawdown: 0.05,
    daily_trades: 20,
    win_rate: 0.50,
};

impl RiskMetrics {
    pub fn risk_level(&self) -> RiskLevel {
        if self.breaches(&CRITICAL) {
            RiskLevel::Critical
        } else if self.breaches(&HIGH) {
            RiskLevel::High
        } else if self.breaches(&MEDIUM) {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    fn breaches(&self, limits: &Thresholds) -> bool {
        self.drawdown > limits.drawdown
            || self.daily_trades > limits.daily_trades
            || self.win_rate.is_some_and(|w| w < limits.win_rate)
    }
}
