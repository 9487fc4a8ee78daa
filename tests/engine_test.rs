use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use tokio::sync::watch;
use tokio_test::{assert_err, assert_ok};

use tradebot::audit::{AuditEvent, CycleErrorKind, MemoryAuditSink};
use tradebot::config::{
    BotConfig, ExchangeConfig, OppositeSignalPolicy, PartialFillPolicy, StrategySelector,
};
use tradebot::engine::{CycleOutcome, CycleReport, TradingLoopController};
use tradebot::error::{EngineError, ExchangeError, ExchangeErrorKind};
use tradebot::exchange::{ExchangeGateway, PaperExchange, PaperOp};
use tradebot::risk::{RejectionReason, RiskAction};
use tradebot::{ExitReason, Side};

const BTC: &str = "BTC/USDT";
const ETH: &str = "ETH/USDT";

// Flat history at 10, then a jump to 14 gives a 2/4 golden cross with
// short MA 12 and long MA 11: strength 1/11, size $909.09, qty 64.935 @ 14
const ENTRY_QTY: f64 = 10_000.0 / 11.0 / 14.0;

struct Harness {
    controller: TradingLoopController,
    exchange: Arc<PaperExchange>,
    audit: Arc<MemoryAuditSink>,
    shutdown: watch::Sender<bool>,
}

fn bot_config(symbols: &[&str]) -> BotConfig {
    let mut config = BotConfig::default();
    config.trading.symbols = symbols.iter().map(|s| s.to_string()).collect();
    config.trading.trading_frequency = 1;
    config.trading.position_fraction = 1.0;
    config.algorithm.strategy = StrategySelector::MovingAverage;
    config.algorithm.ma_short = 2;
    config.algorithm.ma_long = 4;
    config.exchange = ExchangeConfig {
        max_retries: 2,
        base_delay_ms: 1,
        max_delay_ms: 2,
        call_timeout_ms: 1_000,
    };
    config
}

fn paper(symbols: &[&str]) -> PaperExchange {
    symbols
        .iter()
        .fold(PaperExchange::new("paper", 10_000.0, 7), |ex, symbol| {
            ex.with_history(*symbol, &[10.0; 20])
        })
}

fn harness(config: BotConfig, exchange: PaperExchange) -> Harness {
    let exchange = Arc::new(exchange);
    let audit = Arc::new(MemoryAuditSink::new());
    let (shutdown, shutdown_rx) = watch::channel(false);

    let mut gateways: HashMap<String, Arc<dyn ExchangeGateway>> = HashMap::new();
    gateways.insert("paper".to_string(), exchange.clone());

    let controller =
        TradingLoopController::new(&config, gateways, audit.clone(), shutdown_rx).unwrap();
    Harness {
        controller,
        exchange,
        audit,
        shutdown,
    }
}

impl Harness {
    async fn sweep(&self, prices: &[(&str, f64)]) -> Vec<CycleReport> {
        for (symbol, price) in prices {
            self.exchange.push_prices(symbol, &[*price]).await;
        }
        self.controller.run_once().await
    }
}

fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-6,
        "expected {}, got {}",
        expected,
        actual
    );
}

#[tokio::test]
async fn test_golden_cross_opens_long_with_exit_levels() {
    let h = harness(bot_config(&[BTC]), paper(&[BTC]));

    let reports = h.sweep(&[(BTC, 14.0)]).await;
    assert_eq!(reports.len(), 1);
    match reports[0].outcome {
        CycleOutcome::Traded {
            action: RiskAction::Open,
            filled_qty,
        } => assert_close(filled_qty, ENTRY_QTY),
        ref other => panic!("expected an entry, got {:?}", other),
    }

    let positions = h.controller.positions("paper").await.unwrap();
    assert_eq!(positions.len(), 1);
    let position = &positions[0];
    assert_eq!(position.side, Side::Long);
    assert_close(position.entry_price, 14.0);
    assert_close(position.stop_loss_price, 13.3);
    assert_close(position.take_profit_price, 14.7);
    assert_close(h.exchange.holdings(BTC).await, ENTRY_QTY);

    let metrics = h.controller.metrics("paper").await.unwrap();
    assert_eq!(metrics.daily_trades, 1);
    assert_eq!(metrics.trades_24h, 1);
    assert_eq!(metrics.open_positions, 1);
}

#[tokio::test]
async fn test_entry_cycle_audit_trail() {
    let h = harness(bot_config(&[BTC]), paper(&[BTC]));
    h.sweep(&[(BTC, 14.0)]).await;

    assert_eq!(
        h.audit.names(),
        vec![
            "cycle_start",
            "signal_generated",
            "risk_decision",
            "order_submitted",
            "order_filled"
        ]
    );
    let approved = h.audit.events().into_iter().any(|e| {
        matches!(
            e,
            AuditEvent::RiskDecision {
                approved: true,
                reason: None,
                ..
            }
        )
    });
    assert!(approved);
}

#[tokio::test]
async fn test_take_profit_exit() {
    let h = harness(bot_config(&[BTC]), paper(&[BTC]));
    h.sweep(&[(BTC, 14.0)]).await;

    // Candle trades 14 -> 15, through the 14.7 target
    let reports = h.sweep(&[(BTC, 15.0)]).await;
    assert_eq!(reports[0].exits.len(), 1);
    assert_eq!(
        reports[0].outcome,
        CycleOutcome::NoTrade(RejectionReason::NoSignal)
    );

    let trade = &reports[0].exits[0];
    assert_eq!(trade.reason, ExitReason::TakeProfit);
    assert_close(trade.realized_pnl, ENTRY_QTY);
    assert!(h.controller.positions("paper").await.unwrap().is_empty());
    assert!(h.audit.names().contains(&"position_closed"));
}

#[tokio::test]
async fn test_stop_loss_exit() {
    let h = harness(bot_config(&[BTC]), paper(&[BTC]));
    h.sweep(&[(BTC, 14.0)]).await;

    let reports = h.sweep(&[(BTC, 13.0)]).await;
    assert_eq!(reports[0].exits.len(), 1);
    assert_eq!(reports[0].exits[0].reason, ExitReason::StopLoss);
    assert_close(reports[0].exits[0].realized_pnl, -ENTRY_QTY);

    let closed = h.controller.closed_trades("paper").await.unwrap();
    assert_eq!(closed.len(), 1);
    assert!(h.controller.positions("paper").await.unwrap().is_empty());
    assert_close(h.exchange.holdings(BTC).await, 0.0);
}

/// Long at 14, then a drop to 5 crosses the 2/4 averages down without
/// reaching the (wide) stop
async fn opposite_signal(policy: OppositeSignalPolicy) -> (Harness, CycleReport) {
    let mut config = bot_config(&[BTC]);
    config.trading.stop_loss = 0.9;
    config.trading.opposite_signal_policy = policy;
    let h = harness(config, paper(&[BTC]));

    h.sweep(&[(BTC, 14.0)]).await;
    let mut reports = h.sweep(&[(BTC, 5.0)]).await;
    let report = reports.remove(0);
    assert!(report.exits.is_empty());
    (h, report)
}

#[tokio::test]
async fn test_opposite_signal_ignored() {
    let (h, report) = opposite_signal(OppositeSignalPolicy::Ignore).await;

    assert_eq!(
        report.outcome,
        CycleOutcome::NoTrade(RejectionReason::OppositePositionOpen)
    );
    let positions = h.controller.positions("paper").await.unwrap();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].side, Side::Long);
}

#[tokio::test]
async fn test_opposite_signal_closes() {
    let (h, report) = opposite_signal(OppositeSignalPolicy::Close).await;

    assert!(matches!(
        report.outcome,
        CycleOutcome::Traded {
            action: RiskAction::Close { .. },
            ..
        }
    ));
    assert!(h.controller.positions("paper").await.unwrap().is_empty());

    let closed = h.controller.closed_trades("paper").await.unwrap();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].reason, ExitReason::SignalReversal);
    assert_close(closed[0].realized_pnl, (5.0 - 14.0) * ENTRY_QTY);
}

#[tokio::test]
async fn test_opposite_signal_flips() {
    let (h, report) = opposite_signal(OppositeSignalPolicy::Flip).await;

    assert!(matches!(
        report.outcome,
        CycleOutcome::Traded {
            action: RiskAction::Flip { .. },
            ..
        }
    ));
    let positions = h.controller.positions("paper").await.unwrap();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].side, Side::Short);
    assert_close(positions[0].entry_price, 5.0);
    // Short exits mirror the long ones
    assert!(positions[0].stop_loss_price > 5.0);
    assert!(positions[0].take_profit_price < 5.0);

    let closed = h.controller.closed_trades("paper").await.unwrap();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].side, Side::Long);

    let metrics = h.controller.metrics("paper").await.unwrap();
    assert_eq!(metrics.daily_trades, 3);
}

#[tokio::test]
async fn test_network_failures_skip_symbol_and_continue() {
    let h = harness(bot_config(&[BTC, ETH]), paper(&[BTC, ETH]));
    for _ in 0..3 {
        h.exchange
            .fail_next(PaperOp::FetchOhlcv, ExchangeError::network("connection reset"))
            .await;
    }

    let reports = h.sweep(&[(ETH, 10.0)]).await;
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].symbol, BTC);
    assert_eq!(
        reports[0].outcome,
        CycleOutcome::Skipped(CycleErrorKind::Exchange(ExchangeErrorKind::NetworkError))
    );
    assert_eq!(reports[1].symbol, ETH);
    assert_eq!(
        reports[1].outcome,
        CycleOutcome::NoTrade(RejectionReason::NoSignal)
    );

    // Initial attempt plus two retries for BTC, one call for ETH
    assert_eq!(h.exchange.calls(PaperOp::FetchOhlcv).await, 4);
    assert!(!h.controller.is_halted("paper").await.unwrap());
    assert!(h.audit.names().contains(&"cycle_error"));
}

#[tokio::test]
async fn test_auth_failure_halts_until_resumed() {
    let h = harness(bot_config(&[BTC, ETH]), paper(&[BTC, ETH]));
    h.exchange
        .fail_next(
            PaperOp::FetchBalance,
            ExchangeError::new(ExchangeErrorKind::AuthFailed, "bad signature"),
        )
        .await;

    let reports = h.sweep(&[(BTC, 10.0), (ETH, 10.0)]).await;
    assert_eq!(
        reports[0].outcome,
        CycleOutcome::Skipped(CycleErrorKind::Exchange(ExchangeErrorKind::AuthFailed))
    );
    assert_eq!(
        reports[1].outcome,
        CycleOutcome::Skipped(CycleErrorKind::AccountHalted)
    );
    // Not retried, and ETH never reached the exchange
    assert_eq!(h.exchange.calls(PaperOp::FetchBalance).await, 1);
    assert_eq!(h.exchange.calls(PaperOp::FetchOhlcv).await, 1);
    assert!(h.controller.is_halted("paper").await.unwrap());

    assert_ok!(h.controller.resume_account("paper").await);
    assert!(!h.controller.is_halted("paper").await.unwrap());

    // Both markets stay flat, so neither symbol has a cross
    let reports = h.sweep(&[(BTC, 10.0), (ETH, 10.0)]).await;
    assert_eq!(reports.len(), 2);
    for report in &reports {
        assert_eq!(
            report.outcome,
            CycleOutcome::NoTrade(RejectionReason::NoSignal)
        );
    }
}

#[tokio::test]
async fn test_drawdown_blocks_entries_until_peak_reset() {
    let mut config = bot_config(&[BTC, ETH]);
    config.trading.stop_loss = 0.9;
    config.trading.max_drawdown = 0.05;
    let h = harness(config, paper(&[BTC, ETH]));

    h.sweep(&[(BTC, 14.0), (ETH, 10.0)]).await;

    // BTC falls to 5: equity 9090.91 + 64.935 * 5 = 9415.58, 5.8% below peak
    let reports = h.sweep(&[(BTC, 5.0), (ETH, 14.0)]).await;
    assert_eq!(
        reports[1].outcome,
        CycleOutcome::NoTrade(RejectionReason::DrawdownLimitExceeded)
    );
    let metrics = h.controller.metrics("paper").await.unwrap();
    assert!(metrics.drawdown >= 0.05);

    let equity = h.controller.reset_peak_equity("paper").await.unwrap();
    assert_close(equity, 10_000.0 - 9.0 * ENTRY_QTY);
    let metrics = h.controller.metrics("paper").await.unwrap();
    assert_close(metrics.drawdown, 0.0);

    // ETH 14 -> 4 crosses down: a fresh short is allowed again
    let reports = h.sweep(&[(BTC, 5.0), (ETH, 4.0)]).await;
    assert!(matches!(
        reports[1].outcome,
        CycleOutcome::Traded {
            action: RiskAction::Open,
            ..
        }
    ));
    let positions = h.controller.positions("paper").await.unwrap();
    assert_eq!(positions.len(), 2);
}

#[tokio::test]
async fn test_profitable_exit_does_not_lift_peak_over_marked_equity() {
    let mut config = bot_config(&[BTC, ETH]);
    config.trading.stop_loss = 0.9;
    let h = harness(config, paper(&[BTC, ETH]));

    h.sweep(&[(BTC, 14.0), (ETH, 14.0)]).await;
    assert_eq!(h.controller.positions("paper").await.unwrap().len(), 2);

    // ETH takes profit while BTC sits deep under water
    let reports = h.sweep(&[(BTC, 5.0), (ETH, 15.0)]).await;
    assert_eq!(reports[1].exits.len(), 1);
    assert!(reports[1].exits[0].realized_pnl > 0.0);

    let metrics = h.controller.metrics("paper").await.unwrap();
    assert_close(metrics.peak_equity, 10_000.0);
    assert!(metrics.equity < 10_000.0);
    assert_close(metrics.drawdown, 1.0 - metrics.equity / 10_000.0);
}

#[tokio::test]
async fn test_daily_trade_limit() {
    let mut config = bot_config(&[BTC, ETH]);
    config.trading.max_daily_trades = 1;
    let h = harness(config, paper(&[BTC, ETH]));

    let reports = h.sweep(&[(BTC, 14.0), (ETH, 14.0)]).await;
    assert!(matches!(reports[0].outcome, CycleOutcome::Traded { .. }));
    assert_eq!(
        reports[1].outcome,
        CycleOutcome::NoTrade(RejectionReason::FrequencyLimitExceeded)
    );
    assert_eq!(h.exchange.calls(PaperOp::PlaceOrder).await, 1);
}

#[tokio::test]
async fn test_resting_remainder_reconciled_next_cycle() {
    let mut config = bot_config(&[BTC]);
    config.trading.partial_fill_policy = PartialFillPolicy::KeepResting;
    let h = harness(config, paper(&[BTC]).with_fill_ratio(0.5));

    let reports = h.sweep(&[(BTC, 14.0)]).await;
    match reports[0].outcome {
        CycleOutcome::Traded { filled_qty, .. } => assert_close(filled_qty, ENTRY_QTY / 2.0),
        ref other => panic!("expected a partial entry, got {:?}", other),
    }
    let positions = h.controller.positions("paper").await.unwrap();
    assert!(positions[0].resting_order_id.is_some());
    assert_close(positions[0].quantity, ENTRY_QTY / 2.0);

    // Remainder fills on the next candle and is folded into the position
    h.sweep(&[(BTC, 14.0)]).await;
    let positions = h.controller.positions("paper").await.unwrap();
    assert_eq!(positions.len(), 1);
    assert!(positions[0].resting_order_id.is_none());
    assert_close(positions[0].quantity, ENTRY_QTY);
    assert_close(positions[0].entry_price, 14.0);
}

#[tokio::test]
async fn test_partial_fill_remainder_cancelled() {
    let h = harness(bot_config(&[BTC]), paper(&[BTC]).with_fill_ratio(0.5));

    h.sweep(&[(BTC, 14.0)]).await;
    let positions = h.controller.positions("paper").await.unwrap();
    assert_close(positions[0].quantity, ENTRY_QTY / 2.0);
    assert!(positions[0].resting_order_id.is_none());
    assert_eq!(h.exchange.calls(PaperOp::CancelOrder).await, 1);

    // Cancelled remainder never fills later
    h.sweep(&[(BTC, 14.0)]).await;
    assert_close(h.exchange.holdings(BTC).await, ENTRY_QTY / 2.0);
}

#[tokio::test]
async fn test_trading_disabled_only_monitors() {
    let mut config = bot_config(&[BTC]);
    config.trading.enabled = false;
    let h = harness(config, paper(&[BTC]));

    let reports = h.sweep(&[(BTC, 14.0)]).await;
    assert_eq!(reports[0].outcome, CycleOutcome::TradingDisabled);
    assert_eq!(h.exchange.calls(PaperOp::PlaceOrder).await, 0);
    assert!(!h.audit.names().contains(&"signal_generated"));
}

#[tokio::test]
async fn test_gapped_history_is_skipped() {
    // Exchange serves 4h candles to a bot configured for 1h
    let exchange = PaperExchange::new("paper", 10_000.0, 7)
        .with_interval(chrono::Duration::hours(4))
        .with_history(BTC, &[10.0; 20]);
    let h = harness(bot_config(&[BTC]), exchange);

    let reports = h.sweep(&[(BTC, 14.0)]).await;
    assert_eq!(
        reports[0].outcome,
        CycleOutcome::Skipped(CycleErrorKind::InvalidData)
    );
    assert_eq!(h.exchange.calls(PaperOp::PlaceOrder).await, 0);
}

#[tokio::test]
async fn test_overlapping_sweeps_are_single_flight() {
    let exchange = paper(&[BTC]).with_latency(StdDuration::from_millis(20));
    let h = harness(bot_config(&[BTC]), exchange);
    h.exchange.push_prices(BTC, &[10.0]).await;

    let (first, second) = tokio::join!(h.controller.run_once(), h.controller.run_once());
    assert_eq!(
        first[0].outcome,
        CycleOutcome::NoTrade(RejectionReason::NoSignal)
    );
    assert_eq!(second[0].outcome, CycleOutcome::InFlight);
    assert_eq!(h.exchange.calls(PaperOp::FetchOhlcv).await, 1);
}

#[tokio::test]
async fn test_concurrent_symbols_keep_config_order() {
    let mut config = bot_config(&[BTC, ETH]);
    config.trading.concurrent_symbols = true;
    let h = harness(config, paper(&[BTC, ETH]));

    let reports = h.sweep(&[(BTC, 14.0), (ETH, 14.0)]).await;
    let symbols: Vec<&str> = reports.iter().map(|r| r.symbol.as_str()).collect();
    assert_eq!(symbols, vec![BTC, ETH]);

    assert_eq!(h.controller.positions("paper").await.unwrap().len(), 2);
    assert_eq!(h.controller.metrics("paper").await.unwrap().daily_trades, 2);
}

#[tokio::test]
async fn test_concurrent_symbols_share_account_limits() {
    let mut config = bot_config(&[BTC, ETH]);
    config.trading.concurrent_symbols = true;
    config.trading.max_daily_trades = 1;
    let h = harness(
        config,
        paper(&[BTC, ETH]).with_latency(StdDuration::from_millis(20)),
    );

    // Both symbols cross at once; only one fits under the limit
    let reports = h.sweep(&[(BTC, 14.0), (ETH, 14.0)]).await;
    let traded = reports
        .iter()
        .filter(|r| matches!(r.outcome, CycleOutcome::Traded { .. }))
        .count();
    let limited = reports
        .iter()
        .filter(|r| r.outcome == CycleOutcome::NoTrade(RejectionReason::FrequencyLimitExceeded))
        .count();
    assert_eq!((traded, limited), (1, 1));
    assert_eq!(h.exchange.calls(PaperOp::PlaceOrder).await, 1);
    assert_eq!(h.controller.positions("paper").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_shutdown_flattens_positions() {
    let mut config = bot_config(&[BTC]);
    config.trading.close_positions_on_shutdown = true;
    let h = harness(config, paper(&[BTC]));
    h.exchange.push_prices(BTC, &[14.0]).await;

    let controller = h.controller.clone();
    let task = tokio::spawn(async move { controller.run().await });
    tokio::time::sleep(StdDuration::from_millis(200)).await;

    h.shutdown.send(true).unwrap();
    tokio::time::timeout(StdDuration::from_secs(2), task)
        .await
        .expect("trading loop did not stop")
        .unwrap();

    assert!(h.controller.positions("paper").await.unwrap().is_empty());
    let closed = h.controller.closed_trades("paper").await.unwrap();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].reason, ExitReason::Shutdown);
}

#[tokio::test]
async fn test_unknown_account() {
    let h = harness(bot_config(&[BTC]), paper(&[BTC]));
    let err = assert_err!(h.controller.resume_account("nobody").await);
    assert!(matches!(err, EngineError::UnknownAccount(ref name) if name == "nobody"));
    assert_err!(h.controller.metrics("nobody").await);
}

#[test]
fn test_missing_gateway_is_config_error() {
    let (_tx, rx) = watch::channel(false);
    let result = TradingLoopController::new(
        &bot_config(&[BTC]),
        HashMap::new(),
        Arc::new(MemoryAuditSink::new()),
        rx,
    );
    assert!(result.is_err());
}
