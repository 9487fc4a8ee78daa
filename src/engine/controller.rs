use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use uuid::Uuid;

use super::book::{AccountBook, BookedFill, StaleOrder};
use crate::audit::{AuditEvent, AuditSink, CycleErrorKind};
use crate::config::{BotConfig, TradingConfig};
use crate::error::{ConfigError, EngineError, ExchangeError, ExchangeErrorKind, TrackerError};
use crate::exchange::ExchangeGateway;
use crate::execution::{EntryFill, Execution, OrderExecutor, Remainder, RetryPolicy};
use crate::models::{
    parse_interval, ClosedTrade, ExitReason, OrderRequest, OrderStatus, Position, Side,
};
use crate::risk::{RejectionReason, RiskAction, RiskConfig, RiskDecision, RiskManager, RiskMetrics};
use crate::strategy::{Strategy, StrategyKind};

const QTY_EPSILON: f64 = 1e-12;

/// Step of a per-symbol cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CycleState {
    Idle,
    FetchingData,
    Evaluating,
    RiskChecking,
    Submitting,
    AwaitingFill,
    Updating,
}

/// How a cycle ended
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Evaluated, nothing approved
    NoTrade(RejectionReason),
    /// Exits monitored only
    TradingDisabled,
    Traded { action: RiskAction, filled_qty: f64 },
    /// Order accepted but nothing filled; the counter slot was released
    Unfilled,
    Skipped(CycleErrorKind),
    /// Another cycle for this symbol was still running
    InFlight,
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub account: String,
    pub symbol: String,
    pub outcome: CycleOutcome,
    /// Positions exited this cycle by stop-loss or take-profit
    pub exits: Vec<ClosedTrade>,
    /// Furthest state reached
    pub reached: CycleState,
}

struct Cycle<'a> {
    account: &'a str,
    symbol: &'a str,
    state: CycleState,
    reached: CycleState,
    exits: Vec<ClosedTrade>,
}

impl<'a> Cycle<'a> {
    fn new(account: &'a str, symbol: &'a str) -> Self {
        Self {
            account,
            symbol,
            state: CycleState::Idle,
            reached: CycleState::Idle,
            exits: Vec::new(),
        }
    }

    fn enter(&mut self, next: CycleState) {
        tracing::debug!(
            account = %self.account,
            symbol = %self.symbol,
            "{:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
        self.reached = next;
    }

    fn finish(mut self, outcome: CycleOutcome) -> CycleReport {
        let reached = self.reached;
        self.enter(CycleState::Idle);
        CycleReport {
            account: self.account.to_string(),
            symbol: self.symbol.to_string(),
            outcome,
            exits: self.exits,
            reached,
        }
    }
}

/// One configured account: its gateway and its book
struct AccountSlot {
    name: String,
    executor: OrderExecutor,
    book: Mutex<AccountBook>,
}

/// Releases a single-flight claim when dropped
struct FlightClaim<'a> {
    in_flight: &'a StdMutex<HashSet<(String, String)>>,
    key: (String, String),
}

impl Drop for FlightClaim<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

struct Inner {
    trading: TradingConfig,
    interval: chrono::Duration,
    strategy: StrategyKind,
    risk: RiskManager,
    accounts: Vec<AccountSlot>,
    audit: Arc<dyn AuditSink>,
    in_flight: StdMutex<HashSet<(String, String)>>,
    shutdown: watch::Receiver<bool>,
}

/// Drives fetch, evaluate, risk-check, submit and update for every
/// configured (account, symbol) pair
#[derive(Clone)]
pub struct TradingLoopController {
    inner: Arc<Inner>,
}

impl TradingLoopController {
    /// `gateways` maps every configured account name to its exchange connection
    pub fn new(
        config: &BotConfig,
        mut gateways: HashMap<String, Arc<dyn ExchangeGateway>>,
        audit: Arc<dyn AuditSink>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let interval = parse_interval(&config.trading.interval).ok_or_else(|| {
            ConfigError::invalid("trading.interval", config.trading.interval.clone())
        })?;

        let retry = RetryPolicy::from(&config.exchange);
        let now = Utc::now();
        let mut accounts = Vec::with_capacity(config.accounts.len());
        for account in &config.accounts {
            let gateway = gateways.remove(&account.name).ok_or_else(|| {
                ConfigError::invalid("accounts", format!("no gateway for {}", account.name))
            })?;
            accounts.push(AccountSlot {
                name: account.name.clone(),
                executor: OrderExecutor::new(gateway, retry.clone(), &config.trading),
                book: Mutex::new(AccountBook::new(&account.name, account.initial_balance, now)),
            });
        }

        let strategy = StrategyKind::from_config(&config.algorithm);
        tracing::info!(
            "Trading loop configured: strategy {}, {} symbol(s), {} account(s)",
            strategy.name(),
            config.trading.symbols.len(),
            accounts.len()
        );

        Ok(Self {
            inner: Arc::new(Inner {
                trading: config.trading.clone(),
                interval,
                strategy,
                risk: RiskManager::new(RiskConfig::from(&config.trading)),
                accounts,
                audit,
                in_flight: StdMutex::new(HashSet::new()),
                shutdown,
            }),
        })
    }

    /// Sweep until shutdown is signalled, one sweep every `trading_frequency` seconds
    pub async fn run(&self) {
        let period = Duration::from_secs(self.inner.trading.trading_frequency);
        let mut ticker = interval_at(Instant::now(), period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut shutdown = self.inner.shutdown.clone();

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    tracing::info!("💹 [TRADING] Tick at {}", Utc::now().format("%H:%M:%S"));
                    self.run_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Trading loop stopping");
        if self.inner.trading.close_positions_on_shutdown {
            self.close_all_positions().await;
        }
    }

    /// One sweep over every account and symbol
    ///
    /// Reports come back in configuration order whether or not symbols were
    /// evaluated concurrently.
    pub async fn run_once(&self) -> Vec<CycleReport> {
        let reports = if self.inner.trading.concurrent_symbols {
            self.sweep_concurrent().await
        } else {
            self.sweep_sequential().await
        };

        for slot in &self.inner.accounts {
            let book = slot.book.lock().await;
            log_status(&book);
        }
        reports
    }

    async fn sweep_sequential(&self) -> Vec<CycleReport> {
        let mut reports = Vec::new();
        for slot in &self.inner.accounts {
            for symbol in &self.inner.trading.symbols {
                if *self.inner.shutdown.borrow() {
                    tracing::info!("Shutdown requested, ending sweep early");
                    return reports;
                }
                reports.push(self.inner.run_cycle(slot, symbol).await);
            }
        }
        reports
    }

    /// Market data is fetched in parallel; the account-writing part of each
    /// cycle still runs one symbol at a time per account
    async fn sweep_concurrent(&self) -> Vec<CycleReport> {
        let mut tasks = JoinSet::new();
        let mut index = 0;
        for account_idx in 0..self.inner.accounts.len() {
            for symbol in &self.inner.trading.symbols {
                let inner = self.inner.clone();
                let symbol = symbol.clone();
                let order = index;
                tasks.spawn(async move {
                    let slot = &inner.accounts[account_idx];
                    (order, inner.run_cycle(slot, &symbol).await)
                });
                index += 1;
            }
        }

        let mut reports = Vec::with_capacity(index);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => tracing::error!("Symbol worker failed: {}", e),
            }
        }
        reports.sort_by_key(|(order, _)| *order);
        reports.into_iter().map(|(_, report)| report).collect()
    }

    /// Exit every active position at market
    pub async fn close_all_positions(&self) -> Vec<ClosedTrade> {
        let mut closed = Vec::new();
        for slot in &self.inner.accounts {
            let mut book = slot.book.lock().await;
            let ids: Vec<Uuid> = book
                .tracker
                .active_positions()
                .iter()
                .map(|p| p.id)
                .collect();
            tracing::info!("Closing {} position(s) on {}", ids.len(), slot.name);

            for id in ids {
                match self
                    .inner
                    .close_position(slot, &mut book, id, ExitReason::Shutdown)
                    .await
                {
                    Ok(Some(trade)) => closed.push(trade),
                    Ok(None) => tracing::warn!("Shutdown exit for {} did not fill", id),
                    Err(e) => tracing::error!("Shutdown exit for {} failed: {}", id, e),
                }
            }
        }
        closed
    }

    /// Move the account's high-water mark down to its current equity
    pub async fn reset_peak_equity(&self, account: &str) -> Result<f64, EngineError> {
        let slot = self.inner.slot(account)?;
        let state = slot
            .executor
            .retry()
            .run("fetch_balance", || slot.executor.gateway().fetch_balance(account))
            .await?;

        let mut book = slot.book.lock().await;
        book.tracker.reset_peak_equity(state.total_equity);
        book.account_state(state.clone());
        Ok(state.total_equity)
    }

    /// Lift an authentication halt
    pub async fn resume_account(&self, account: &str) -> Result<(), EngineError> {
        let slot = self.inner.slot(account)?;
        let mut book = slot.book.lock().await;
        if book.halted.take().is_some() {
            tracing::info!("Account {} resumed by operator", account);
        }
        Ok(())
    }

    pub async fn is_halted(&self, account: &str) -> Result<bool, EngineError> {
        let slot = self.inner.slot(account)?;
        let halted = slot.book.lock().await.halted.is_some();
        Ok(halted)
    }

    pub async fn positions(&self, account: &str) -> Result<Vec<Position>, EngineError> {
        let slot = self.inner.slot(account)?;
        let positions = slot.book.lock().await.tracker.active_positions().to_vec();
        Ok(positions)
    }

    pub async fn closed_trades(&self, account: &str) -> Result<Vec<ClosedTrade>, EngineError> {
        let slot = self.inner.slot(account)?;
        let trades = slot.book.lock().await.tracker.closed_trades().to_vec();
        Ok(trades)
    }

    pub async fn metrics(&self, account: &str) -> Result<RiskMetrics, EngineError> {
        let slot = self.inner.slot(account)?;
        let metrics = slot.book.lock().await.metrics();
        Ok(metrics)
    }
}

impl Inner {
    fn slot(&self, account: &str) -> Result<&AccountSlot, EngineError> {
        self.accounts
            .iter()
            .find(|s| s.name == account)
            .ok_or_else(|| EngineError::UnknownAccount(account.to_string()))
    }

    fn claim(&self, account: &str, symbol: &str) -> Option<FlightClaim<'_>> {
        let key = (account.to_string(), symbol.to_string());
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(key.clone()) {
            return None;
        }
        Some(FlightClaim {
            in_flight: &self.in_flight,
            key,
        })
    }

    fn emit(&self, event: AuditEvent) {
        self.audit.record(event);
    }

    fn cycle_error(&self, account: &str, symbol: &str, kind: CycleErrorKind, message: String) {
        self.emit(AuditEvent::CycleError {
            account: account.to_string(),
            symbol: symbol.to_string(),
            kind,
            message,
        });
    }

    /// Record an exchange failure; authentication failures halt the account
    fn exchange_failure(
        &self,
        book: &mut AccountBook,
        symbol: &str,
        operation: &str,
        error: &ExchangeError,
    ) -> CycleErrorKind {
        if error.kind == ExchangeErrorKind::AuthFailed {
            tracing::error!(
                account = %book.name,
                "🛑 Authentication failed during {}, account halted until resumed: {}",
                operation,
                error
            );
            book.halted = Some(error.to_string());
        } else {
            tracing::warn!(
                account = %book.name,
                symbol = %symbol,
                "{} failed after retries, skipping cycle: {}",
                operation,
                error
            );
        }
        let kind = CycleErrorKind::Exchange(error.kind);
        self.cycle_error(&book.name, symbol, kind, format!("{}: {}", operation, error));
        kind
    }

    async fn run_cycle(&self, slot: &AccountSlot, symbol: &str) -> CycleReport {
        let mut cycle = Cycle::new(&slot.name, symbol);
        self.emit(AuditEvent::CycleStart {
            account: slot.name.clone(),
            symbol: symbol.to_string(),
        });

        let Some(_claim) = self.claim(&slot.name, symbol) else {
            tracing::debug!("{} on {} still in flight, skipping", symbol, slot.name);
            return cycle.finish(CycleOutcome::InFlight);
        };

        if let Some(reason) = slot.book.lock().await.halted.clone() {
            self.cycle_error(
                &slot.name,
                symbol,
                CycleErrorKind::AccountHalted,
                reason,
            );
            return cycle.finish(CycleOutcome::Skipped(CycleErrorKind::AccountHalted));
        }

        cycle.enter(CycleState::FetchingData);
        let gateway = slot.executor.gateway();
        let fetched = slot
            .executor
            .retry()
            .run("fetch_ohlcv", || {
                gateway.fetch_ohlcv(symbol, &self.trading.interval, self.trading.candle_limit)
            })
            .await;

        let snapshot = match fetched {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let mut book = slot.book.lock().await;
                let kind = self.exchange_failure(&mut book, symbol, "fetch_ohlcv", &e);
                return cycle.finish(CycleOutcome::Skipped(kind));
            }
        };

        if let Err(e) = snapshot.validate_spacing(self.interval) {
            tracing::warn!("  {} - Skipping due to data quality issue: {}", symbol, e);
            self.cycle_error(
                &slot.name,
                symbol,
                CycleErrorKind::InvalidData,
                e.to_string(),
            );
            return cycle.finish(CycleOutcome::Skipped(CycleErrorKind::InvalidData));
        }

        let latest = snapshot.latest().clone();
        tracing::info!(
            "  {} @ ${:.4} ({} candles)",
            symbol,
            latest.close,
            snapshot.len()
        );

        // Held to the end of the cycle: limits are checked and recorded under
        // one lock, so symbols of an account serialize from here on
        let mut book = slot.book.lock().await;

        self.reconcile_orders(slot, &mut book, symbol).await;
        if book.halted.is_some() {
            return cycle.finish(CycleOutcome::Skipped(CycleErrorKind::AccountHalted));
        }

        for exit in book.tracker.check_exits(symbol, latest.low, latest.high) {
            tracing::info!(
                "  {} - {:?} triggered at ${:.4}",
                symbol,
                exit.reason,
                exit.trigger_price
            );
            match self
                .close_position(slot, &mut book, exit.position_id, exit.reason)
                .await
            {
                Ok(Some(trade)) => cycle.exits.push(trade),
                Ok(None) => {}
                Err(e) => {
                    let kind = self.exchange_failure(&mut book, symbol, "exit order", &e);
                    return cycle.finish(CycleOutcome::Skipped(kind));
                }
            }
        }

        if !self.trading.enabled {
            // Exits still move equity; fold the marked balance into the peak
            if !cycle.exits.is_empty() {
                let balance = slot
                    .executor
                    .retry()
                    .run("fetch_balance", || gateway.fetch_balance(&slot.name))
                    .await;
                if let Err(e) = balance.map(|state| book.account_state(state)) {
                    let kind = self.exchange_failure(&mut book, symbol, "fetch_balance", &e);
                    return cycle.finish(CycleOutcome::Skipped(kind));
                }
            }
            return cycle.finish(CycleOutcome::TradingDisabled);
        }

        cycle.enter(CycleState::Evaluating);
        let signal = self.strategy.evaluate(&snapshot);
        self.emit(AuditEvent::SignalGenerated {
            account: slot.name.clone(),
            symbol: symbol.to_string(),
            strategy: signal.strategy.clone(),
            direction: signal.direction,
            strength: signal.strength,
            reason: signal.reason.clone(),
        });

        cycle.enter(CycleState::RiskChecking);
        let balance = slot
            .executor
            .retry()
            .run("fetch_balance", || gateway.fetch_balance(&slot.name))
            .await;
        let account = match balance {
            Ok(state) => book.account_state(state),
            Err(e) => {
                let kind = self.exchange_failure(&mut book, symbol, "fetch_balance", &e);
                return cycle.finish(CycleOutcome::Skipped(kind));
            }
        };

        book.counter.roll(Utc::now());
        let decision = self.risk.assess(
            &signal,
            &account,
            book.tracker.active_positions(),
            &book.counter,
        );
        self.emit(AuditEvent::RiskDecision {
            account: slot.name.clone(),
            symbol: symbol.to_string(),
            approved: decision.approved,
            reason: decision.rejection,
            size: decision.size,
        });

        let (Some(action), Some(side)) = (decision.action, decision.side) else {
            let reason = decision.rejection.unwrap_or(RejectionReason::NoSignal);
            tracing::info!("    → {} ({})", reason, signal.reason);
            return cycle.finish(CycleOutcome::NoTrade(reason));
        };

        tracing::info!(
            "    → {:?} approved: {:?} size ${:.2} ({})",
            action,
            side,
            decision.size,
            signal.reason
        );

        let outcome = match action {
            RiskAction::Open => {
                self.open_entry(slot, &mut book, symbol, side, &decision, &mut cycle)
                    .await
            }
            RiskAction::Close { position_id } => {
                cycle.enter(CycleState::Submitting);
                match self
                    .close_position(slot, &mut book, position_id, ExitReason::SignalReversal)
                    .await
                {
                    Ok(Some(trade)) => Ok(CycleOutcome::Traded {
                        action,
                        filled_qty: trade.quantity,
                    }),
                    Ok(None) => Ok(CycleOutcome::Unfilled),
                    Err(e) => Err(e),
                }
            }
            RiskAction::Flip { position_id } => {
                cycle.enter(CycleState::Submitting);
                match self
                    .close_position(slot, &mut book, position_id, ExitReason::SignalReversal)
                    .await
                {
                    Ok(Some(_)) if book.tracker.position(position_id).is_none() => {
                        self.open_entry(slot, &mut book, symbol, side, &decision, &mut cycle)
                            .await
                            .map(|outcome| match outcome {
                                CycleOutcome::Traded { filled_qty, .. } => {
                                    CycleOutcome::Traded { action, filled_qty }
                                }
                                other => other,
                            })
                    }
                    Ok(_) => {
                        tracing::warn!(
                            "  {} - flip exit incomplete, not opening reverse position",
                            symbol
                        );
                        Ok(CycleOutcome::Unfilled)
                    }
                    Err(e) => Err(e),
                }
            }
        };

        match outcome {
            Ok(outcome) => cycle.finish(outcome),
            Err(e) => {
                let kind = self.exchange_failure(&mut book, symbol, "place_order", &e);
                cycle.finish(CycleOutcome::Skipped(kind))
            }
        }
    }

    fn order_submitted(&self, account: &str, request: &OrderRequest) {
        self.emit(AuditEvent::OrderSubmitted {
            account: account.to_string(),
            symbol: request.symbol.clone(),
            client_order_id: request.client_order_id.clone(),
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            price: request.price,
        });
    }

    fn order_filled(
        &self,
        account: &str,
        symbol: &str,
        order_id: &str,
        qty: f64,
        price: f64,
        status: OrderStatus,
    ) {
        self.emit(AuditEvent::OrderFilled {
            account: account.to_string(),
            symbol: symbol.to_string(),
            order_id: order_id.to_string(),
            filled_qty: qty,
            avg_price: price,
            status,
        });
    }

    /// Submit an entry and book whatever filled
    async fn open_entry(
        &self,
        slot: &AccountSlot,
        book: &mut AccountBook,
        symbol: &str,
        side: Side,
        decision: &RiskDecision,
        cycle: &mut Cycle<'_>,
    ) -> Result<CycleOutcome, ExchangeError> {
        cycle.enter(CycleState::Submitting);
        let request = slot
            .executor
            .entry_order(symbol, side, decision.quantity, decision.entry_price);
        self.order_submitted(&slot.name, &request);

        let submitted_at = Utc::now();
        let execution = slot.executor.execute_entry(request).await?;
        book.counter.record(submitted_at);

        cycle.enter(CycleState::AwaitingFill);
        self.track_remainder(book, symbol, &execution);
        if !execution.is_filled() {
            book.counter.rollback(submitted_at);
            tracing::info!(
                "  {} - order {} did not fill, slot released",
                symbol,
                execution.result.order_id
            );
            return Ok(CycleOutcome::Unfilled);
        }

        let result = &execution.result;
        self.order_filled(
            &slot.name,
            symbol,
            &result.order_id,
            result.filled_qty,
            result.avg_price,
            result.status,
        );

        cycle.enter(CycleState::Updating);
        match self.book_entry(book, symbol, side, &execution) {
            Ok(()) => Ok(CycleOutcome::Traded {
                action: RiskAction::Open,
                filled_qty: result.filled_qty,
            }),
            Err(e) => {
                tracing::error!("  {} - fill could not be booked: {}", symbol, e);
                self.cycle_error(&slot.name, symbol, CycleErrorKind::Tracker, e.to_string());
                Ok(CycleOutcome::Skipped(CycleErrorKind::Tracker))
            }
        }
    }

    fn book_entry(
        &self,
        book: &mut AccountBook,
        symbol: &str,
        side: Side,
        execution: &Execution,
    ) -> Result<(), TrackerError> {
        let result = &execution.result;
        let existing = book
            .tracker
            .active_for(symbol)
            .filter(|p| p.side == side)
            .map(|p| p.id);

        let id = match existing {
            Some(id) => {
                book.tracker.add_fill(id, result.avg_price, result.filled_qty)?;
                id
            }
            None => {
                // Exit levels follow the actual fill, not the signal's estimate
                let (stop_loss_price, take_profit_price) =
                    self.risk.exit_prices(side, result.avg_price);
                book.tracker.open_position(EntryFill {
                    symbol: symbol.to_string(),
                    side,
                    price: result.avg_price,
                    quantity: result.filled_qty,
                    stop_loss_price,
                    take_profit_price,
                    at: Utc::now(),
                })?
            }
        };

        if let Remainder::Resting { order_id } = &execution.remainder {
            book.tracker.set_resting_order(id, Some(order_id.clone()))?;
            book.resting.insert(
                order_id.clone(),
                BookedFill {
                    filled_qty: result.filled_qty,
                    avg_price: result.avg_price,
                },
            );
        }
        Ok(())
    }

    fn track_remainder(&self, book: &mut AccountBook, symbol: &str, execution: &Execution) {
        if let Remainder::CancelFailed { order_id } = &execution.remainder {
            book.stale_orders.push(StaleOrder {
                symbol: symbol.to_string(),
                order_id: order_id.clone(),
            });
        }
    }

    /// Exit a position at market
    ///
    /// Returns the realized trade, or None when nothing filled. On error the
    /// position is back to Open.
    async fn close_position(
        &self,
        slot: &AccountSlot,
        book: &mut AccountBook,
        position_id: Uuid,
        reason: ExitReason,
    ) -> Result<Option<ClosedTrade>, ExchangeError> {
        let Some(position) = book.tracker.position(position_id).cloned() else {
            return Ok(None);
        };
        // Status is already PendingClose when the exit came from check_exits
        let _ = book.tracker.mark_pending_close(position_id);

        if let Some(order_id) = &position.resting_order_id {
            self.drop_resting(slot, book, &position, order_id).await;
        }
        // Resting fills may have grown the position
        let quantity = book
            .tracker
            .position(position_id)
            .map(|p| p.quantity)
            .unwrap_or(position.quantity);

        let request = slot
            .executor
            .exit_order(&position.symbol, position.side, quantity);
        self.order_submitted(&slot.name, &request);

        let submitted_at = Utc::now();
        let execution = match slot.executor.execute_exit(request).await {
            Ok(execution) => execution,
            Err(e) => {
                let _ = book.tracker.reopen(position_id);
                return Err(e);
            }
        };
        book.counter.record(submitted_at);
        self.track_remainder(book, &position.symbol, &execution);

        if !execution.is_filled() {
            book.counter.rollback(submitted_at);
            let _ = book.tracker.reopen(position_id);
            tracing::warn!("  {} - exit order did not fill", position.symbol);
            return Ok(None);
        }

        let result = &execution.result;
        self.order_filled(
            &slot.name,
            &position.symbol,
            &result.order_id,
            result.filled_qty,
            result.avg_price,
            result.status,
        );

        match book.tracker.close_position(
            position_id,
            result.avg_price,
            result.filled_qty,
            reason,
            Utc::now(),
        ) {
            Ok(trade) => {
                self.emit(AuditEvent::PositionClosed {
                    account: slot.name.clone(),
                    symbol: trade.symbol.clone(),
                    position_id,
                    reason,
                    pnl: trade.realized_pnl,
                });
                Ok(Some(trade))
            }
            Err(e) => {
                tracing::error!("  {} - exit could not be booked: {}", position.symbol, e);
                let _ = book.tracker.reopen(position_id);
                self.cycle_error(
                    &slot.name,
                    &position.symbol,
                    CycleErrorKind::Tracker,
                    e.to_string(),
                );
                Ok(None)
            }
        }
    }

    /// Cancel a resting entry before exiting, booking any last fills
    async fn drop_resting(
        &self,
        slot: &AccountSlot,
        book: &mut AccountBook,
        position: &Position,
        order_id: &str,
    ) {
        self.sync_resting(slot, book, position.id, &position.symbol, order_id)
            .await;
        if book.resting.contains_key(order_id) {
            if let Err(e) = slot.executor.cancel(&position.symbol, order_id).await {
                tracing::warn!("Failed to cancel resting order {}: {}", order_id, e);
                book.stale_orders.push(StaleOrder {
                    symbol: position.symbol.clone(),
                    order_id: order_id.to_string(),
                });
            }
            book.resting.remove(order_id);
        }
        let _ = book.tracker.set_resting_order(position.id, None);
    }

    /// Retry failed cancels and fold resting-order fills into positions
    async fn reconcile_orders(&self, slot: &AccountSlot, book: &mut AccountBook, symbol: &str) {
        let stale: Vec<StaleOrder> = book
            .stale_orders
            .iter()
            .filter(|o| o.symbol == symbol)
            .cloned()
            .collect();
        for order in stale {
            match slot.executor.cancel(symbol, &order.order_id).await {
                Ok(()) => {
                    tracing::info!("Cancelled leftover order {}", order.order_id);
                    book.stale_orders.retain(|o| o != &order);
                }
                Err(e) if e.kind == ExchangeErrorKind::AuthFailed => {
                    self.exchange_failure(book, symbol, "cancel_order", &e);
                    return;
                }
                Err(e) if !e.is_retryable() => {
                    // Exchange no longer knows the order
                    tracing::info!("Leftover order {} gone: {}", order.order_id, e);
                    book.stale_orders.retain(|o| o != &order);
                }
                Err(e) => tracing::warn!(
                    "Leftover order {} still not cancelled: {}",
                    order.order_id,
                    e
                ),
            }
        }

        let resting: Vec<(Uuid, String)> = book
            .tracker
            .active_positions()
            .iter()
            .filter(|p| p.symbol == symbol)
            .filter_map(|p| p.resting_order_id.clone().map(|o| (p.id, o)))
            .collect();
        for (position_id, order_id) in resting {
            self.sync_resting(slot, book, position_id, symbol, &order_id)
                .await;
        }
    }

    /// Grow the position by fills of its resting order since the last look
    async fn sync_resting(
        &self,
        slot: &AccountSlot,
        book: &mut AccountBook,
        position_id: Uuid,
        symbol: &str,
        order_id: &str,
    ) {
        let result = match slot.executor.order_status(symbol, order_id).await {
            Ok(result) => result,
            Err(e) => {
                if e.kind == ExchangeErrorKind::AuthFailed {
                    self.exchange_failure(book, symbol, "fetch_order", &e);
                } else {
                    tracing::warn!("Could not check resting order {}: {}", order_id, e);
                }
                return;
            }
        };

        let booked = book.resting.get(order_id).copied().unwrap_or(BookedFill {
            filled_qty: 0.0,
            avg_price: 0.0,
        });
        let delta = result.filled_qty - booked.filled_qty;
        if delta > QTY_EPSILON {
            let delta_price = (result.avg_price * result.filled_qty
                - booked.avg_price * booked.filled_qty)
                / delta;
            match book.tracker.add_fill(position_id, delta_price, delta) {
                Ok(()) => {
                    self.order_filled(
                        &slot.name,
                        symbol,
                        order_id,
                        delta,
                        delta_price,
                        result.status,
                    );
                    book.resting.insert(
                        order_id.to_string(),
                        BookedFill {
                            filled_qty: result.filled_qty,
                            avg_price: result.avg_price,
                        },
                    );
                }
                Err(e) => tracing::error!("Resting fill for {} not booked: {}", order_id, e),
            }
        }

        if !matches!(result.status, OrderStatus::New | OrderStatus::PartiallyFilled) {
            tracing::info!("Resting order {} done ({:?})", order_id, result.status);
            book.resting.remove(order_id);
            let _ = book.tracker.set_resting_order(position_id, None);
        }
    }
}

fn log_status(book: &AccountBook) {
    let metrics = book.metrics();
    tracing::info!("\n📊 Account Summary [{}]:", book.name);
    tracing::info!(
        "  Equity: ${:.2} (peak ${:.2}, drawdown {:.2}%)",
        metrics.equity,
        metrics.peak_equity,
        metrics.drawdown * 100.0
    );
    tracing::info!(
        "  Realized P&L: ${:.2} | Trades today: {} (24h: {}) | Win rate: {}",
        metrics.realized_pnl,
        metrics.daily_trades,
        metrics.trades_24h,
        metrics
            .win_rate
            .map(|w| format!("{:.1}%", w * 100.0))
            .unwrap_or_else(|| "n/a".to_string())
    );
    tracing::info!(
        "  Open Positions: {} | Risk level: {:?}",
        metrics.open_positions,
        metrics.risk_level()
    );
    if book.halted.is_some() {
        tracing::warn!("  🛑 Account halted, waiting for operator");
    }
}
