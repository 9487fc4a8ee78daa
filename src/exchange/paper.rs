use std::collections::{HashMap, VecDeque};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{Mutex, MutexGuard};

use super::ExchangeGateway;
use crate::error::{ExchangeError, ExchangeErrorKind};
use crate::models::{
    AccountState, Candle, MarketDataSnapshot, OpenOrder, OrderRequest, OrderResult, OrderSide,
    OrderStatus, OrderType,
};

const DEFAULT_HISTORY: usize = 200;
const DEFAULT_VOLATILITY: f64 = 0.01;
const QTY_EPSILON: f64 = 1e-12;

/// Gateway operations that can be scripted to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaperOp {
    FetchOhlcv,
    FetchBalance,
    PlaceOrder,
    CancelOrder,
    FetchOpenOrders,
    FetchOrder,
}

struct Failure {
    error: ExchangeError,
    /// Order is booked before the error is returned
    after_accept: bool,
}

struct Market {
    candles: Vec<Candle>,
    scripted: VecDeque<f64>,
    volatility: f64,
}

struct PaperOrder {
    order_id: String,
    request: OrderRequest,
    filled_qty: f64,
    avg_price: f64,
    status: OrderStatus,
}

impl PaperOrder {
    fn remaining(&self) -> f64 {
        (self.request.quantity - self.filled_qty).max(0.0)
    }

    fn is_open(&self) -> bool {
        matches!(self.status, OrderStatus::New | OrderStatus::PartiallyFilled)
    }

    fn apply_fill(&mut self, quantity: f64, price: f64) {
        let total = self.filled_qty + quantity;
        self.avg_price = (self.avg_price * self.filled_qty + price * quantity) / total;
        self.filled_qty = total;
        self.status = if self.remaining() <= QTY_EPSILON {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
    }

    fn to_result(&self) -> OrderResult {
        OrderResult {
            order_id: self.order_id.clone(),
            client_order_id: self.request.client_order_id.clone(),
            filled_qty: self.filled_qty,
            avg_price: self.avg_price,
            status: self.status,
        }
    }

    fn to_open(&self) -> OpenOrder {
        OpenOrder {
            order_id: self.order_id.clone(),
            client_order_id: self.request.client_order_id.clone(),
            symbol: self.request.symbol.clone(),
            side: self.request.side,
            quantity: self.request.quantity,
            filled_qty: self.filled_qty,
            avg_price: self.avg_price,
            price: self.request.price,
        }
    }
}

struct PaperState {
    rng: StdRng,
    markets: HashMap<String, Market>,
    cash: f64,
    holdings: HashMap<String, f64>,
    orders: Vec<PaperOrder>,
    failures: HashMap<PaperOp, VecDeque<Failure>>,
    calls: HashMap<PaperOp, u32>,
    next_order_id: u64,
    fill_ratio: f64,
}

impl PaperState {
    fn last_price(&self, symbol: &str) -> Option<f64> {
        self.markets
            .get(symbol)
            .and_then(|m| m.candles.last())
            .map(|c| c.close)
    }

    /// Append the next candle: scripted close if queued, random walk otherwise
    fn advance(&mut self, symbol: &str, interval: Duration) -> Result<Candle, ExchangeError> {
        let market = self
            .markets
            .get_mut(symbol)
            .ok_or_else(|| invalid_symbol(symbol))?;

        let (open, open_time) = market
            .candles
            .last()
            .map(|c| (c.close, c.open_time + interval))
            .unwrap_or((100.0, genesis()));

        let candle = match market.scripted.pop_front() {
            Some(close) => Candle {
                open_time,
                open,
                high: open.max(close),
                low: open.min(close),
                close,
                volume: 1000.0,
            },
            None => {
                let v = market.volatility;
                let close = (open * (1.0 + self.rng.gen_range(-v..v))).max(0.01);
                let wick_up = self.rng.gen_range(0.0..v / 2.0);
                let wick_down = self.rng.gen_range(0.0..v / 2.0);
                Candle {
                    open_time,
                    open,
                    high: open.max(close) * (1.0 + wick_up),
                    low: open.min(close) * (1.0 - wick_down),
                    close,
                    volume: self.rng.gen_range(500.0..1500.0),
                }
            }
        };

        market.candles.push(candle.clone());
        Ok(candle)
    }

    /// Fill working orders whose price the new candle traded through
    fn fill_resting(&mut self, symbol: &str, candle: &Candle) {
        for order in self
            .orders
            .iter_mut()
            .filter(|o| o.is_open() && o.request.symbol == symbol)
        {
            let price = match (order.request.side, order.request.price) {
                (_, None) => candle.close,
                (OrderSide::Buy, Some(limit)) if candle.low <= limit => limit,
                (OrderSide::Sell, Some(limit)) if candle.high >= limit => limit,
                _ => continue,
            };

            let quantity = order.remaining();
            if settle(
                &mut self.cash,
                &mut self.holdings,
                symbol,
                order.request.side,
                quantity,
                price,
            ) {
                order.apply_fill(quantity, price);
                tracing::debug!(
                    "Paper resting order {} filled {:.6} @ {:.2}",
                    order.order_id,
                    quantity,
                    price
                );
            }
        }
    }
}

/// Move cash and holdings for a fill. Buys beyond available cash are refused.
fn settle(
    cash: &mut f64,
    holdings: &mut HashMap<String, f64>,
    symbol: &str,
    side: OrderSide,
    quantity: f64,
    price: f64,
) -> bool {
    let notional = quantity * price;
    let held = holdings.entry(symbol.to_string()).or_insert(0.0);
    match side {
        OrderSide::Buy => {
            if notional > *cash + 1e-9 {
                return false;
            }
            *cash -= notional;
            *held += quantity;
        }
        OrderSide::Sell => {
            *cash += notional;
            *held -= quantity;
        }
    }
    true
}

fn genesis() -> DateTime<Utc> {
    Utc.timestamp_opt(1_704_067_200, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

fn invalid_symbol(symbol: &str) -> ExchangeError {
    ExchangeError::new(
        ExchangeErrorKind::InvalidSymbol,
        format!("unknown symbol {}", symbol),
    )
}

fn unknown_order(order_id: &str) -> ExchangeError {
    ExchangeError::new(
        ExchangeErrorKind::InvalidSymbol,
        format!("unknown order {}", order_id),
    )
}

/// In-memory exchange for paper trading and tests
///
/// Serves a single account. Each `fetch_ohlcv` call produces exactly one new
/// candle per symbol, either from prices queued with `push_prices` or from a
/// seeded random walk, and fills resting orders against it.
pub struct PaperExchange {
    account: String,
    interval: Duration,
    latency: Option<StdDuration>,
    state: Mutex<PaperState>,
}

impl PaperExchange {
    pub fn new(account: impl Into<String>, initial_balance: f64, seed: u64) -> Self {
        Self {
            account: account.into(),
            interval: Duration::hours(1),
            latency: None,
            state: Mutex::new(PaperState {
                rng: StdRng::seed_from_u64(seed),
                markets: HashMap::new(),
                cash: initial_balance,
                holdings: HashMap::new(),
                orders: Vec::new(),
                failures: HashMap::new(),
                calls: HashMap::new(),
                next_order_id: 1,
                fill_ratio: 1.0,
            }),
        }
    }

    /// Candle spacing; set before adding markets
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Fraction of each new order filled immediately; the rest rests
    pub fn with_fill_ratio(mut self, fill_ratio: f64) -> Self {
        self.state.get_mut().fill_ratio = fill_ratio.clamp(0.0, 1.0);
        self
    }

    /// Delay applied to every call
    pub fn with_latency(mut self, latency: StdDuration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Random-walk market seeded with a history of candles
    pub fn with_market(mut self, symbol: impl Into<String>, start_price: f64) -> Self {
        let symbol = symbol.into();
        let interval = self.interval;
        let state = self.state.get_mut();
        state.markets.insert(
            symbol.clone(),
            Market {
                candles: vec![Candle {
                    open_time: genesis(),
                    open: start_price,
                    high: start_price,
                    low: start_price,
                    close: start_price,
                    volume: 1000.0,
                }],
                scripted: VecDeque::new(),
                volatility: DEFAULT_VOLATILITY,
            },
        );
        for _ in 1..DEFAULT_HISTORY {
            // Symbol was just inserted
            let _ = state.advance(&symbol, interval);
        }
        self
    }

    /// Market whose history closes at exactly `closes`
    pub fn with_history(mut self, symbol: impl Into<String>, closes: &[f64]) -> Self {
        let interval = self.interval;
        let candles = closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Candle {
                open_time: genesis() + interval * i as i32,
                open: close,
                high: close,
                low: close,
                close,
                volume: 1000.0,
            })
            .collect();

        self.state.get_mut().markets.insert(
            symbol.into(),
            Market {
                candles,
                scripted: VecDeque::new(),
                volatility: DEFAULT_VOLATILITY,
            },
        );
        self
    }

    /// Queue closes for the next candles of `symbol`
    pub async fn push_prices(&self, symbol: &str, closes: &[f64]) {
        let mut state = self.state.lock().await;
        if let Some(market) = state.markets.get_mut(symbol) {
            market.scripted.extend(closes.iter().copied());
        }
    }

    /// Make the next call of `op` fail with `error`
    pub async fn fail_next(&self, op: PaperOp, error: ExchangeError) {
        self.push_failure(op, error, false).await;
    }

    /// Book the next order, then report `error` to the caller
    pub async fn fail_next_after_accept(&self, error: ExchangeError) {
        self.push_failure(PaperOp::PlaceOrder, error, true).await;
    }

    async fn push_failure(&self, op: PaperOp, error: ExchangeError, after_accept: bool) {
        self.state
            .lock()
            .await
            .failures
            .entry(op)
            .or_default()
            .push_back(Failure {
                error,
                after_accept,
            });
    }

    /// Number of calls made to `op`, failed ones included
    pub async fn calls(&self, op: PaperOp) -> u32 {
        self.state.lock().await.calls.get(&op).copied().unwrap_or(0)
    }

    pub async fn last_price(&self, symbol: &str) -> Option<f64> {
        self.state.lock().await.last_price(symbol)
    }

    pub async fn holdings(&self, symbol: &str) -> f64 {
        self.state
            .lock()
            .await
            .holdings
            .get(symbol)
            .copied()
            .unwrap_or(0.0)
    }

    /// Enter a call: latency, bookkeeping, scripted failure
    async fn begin(&self, op: PaperOp) -> Result<MutexGuard<'_, PaperState>, ExchangeError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock().await;
        *state.calls.entry(op).or_insert(0) += 1;

        if let Some(queue) = state.failures.get_mut(&op) {
            if queue.front().is_some_and(|f| !f.after_accept) {
                if let Some(failure) = queue.pop_front() {
                    return Err(failure.error);
                }
            }
        }
        Ok(state)
    }
}

#[async_trait]
impl ExchangeGateway for PaperExchange {
    fn name(&self) -> &str {
        "paper"
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        _interval: &str,
        limit: usize,
    ) -> Result<MarketDataSnapshot, ExchangeError> {
        let mut guard = self.begin(PaperOp::FetchOhlcv).await?;
        let state = &mut *guard;

        let candle = state.advance(symbol, self.interval)?;
        state.fill_resting(symbol, &candle);

        let candles = &state
            .markets
            .get(symbol)
            .ok_or_else(|| invalid_symbol(symbol))?
            .candles;
        let start = candles.len().saturating_sub(limit);

        MarketDataSnapshot::new(symbol, candles[start..].to_vec())
            .map_err(|e| ExchangeError::network(e.to_string()))
    }

    async fn fetch_balance(&self, account: &str) -> Result<AccountState, ExchangeError> {
        let state = self.begin(PaperOp::FetchBalance).await?;
        if account != self.account {
            return Err(ExchangeError::new(
                ExchangeErrorKind::AuthFailed,
                format!("no credentials for account {}", account),
            ));
        }

        let positions_value: f64 = state
            .holdings
            .iter()
            .map(|(symbol, qty)| qty * state.last_price(symbol).unwrap_or(0.0))
            .sum();
        let equity = state.cash + positions_value;

        Ok(AccountState {
            account: self.account.clone(),
            available_balance: state.cash,
            total_equity: equity,
            peak_equity: equity,
        })
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderResult, ExchangeError> {
        let mut guard = self.begin(PaperOp::PlaceOrder).await?;
        let state = &mut *guard;

        let last = state
            .last_price(&order.symbol)
            .ok_or_else(|| invalid_symbol(&order.symbol))?;

        let fill_price = match (order.order_type, order.price) {
            (OrderType::Market, _) => Some(last),
            (OrderType::Limit, Some(limit)) => {
                let marketable = match order.side {
                    OrderSide::Buy => limit >= last,
                    OrderSide::Sell => limit <= last,
                };
                marketable.then_some(limit)
            }
            (OrderType::Limit, None) => {
                return Err(ExchangeError::new(
                    ExchangeErrorKind::InvalidSymbol,
                    "limit order without price",
                ))
            }
        };

        let mut booked = PaperOrder {
            order_id: format!("paper-{}", state.next_order_id),
            request: order.clone(),
            filled_qty: 0.0,
            avg_price: 0.0,
            status: OrderStatus::New,
        };

        if !(order.quantity > 0.0) {
            booked.status = OrderStatus::Rejected;
            return Ok(booked.to_result());
        }

        if let Some(price) = fill_price {
            let quantity = order.quantity * state.fill_ratio;
            if quantity > 0.0 {
                if !settle(
                    &mut state.cash,
                    &mut state.holdings,
                    &order.symbol,
                    order.side,
                    quantity,
                    price,
                ) {
                    return Err(ExchangeError::new(
                        ExchangeErrorKind::InsufficientBalance,
                        format!(
                            "need {:.2} to buy {:.6} {}, have {:.2}",
                            quantity * price,
                            quantity,
                            order.symbol,
                            state.cash
                        ),
                    ));
                }
                booked.apply_fill(quantity, price);
            }
        }

        state.next_order_id += 1;
        let result = booked.to_result();
        state.orders.push(booked);

        if let Some(queue) = state.failures.get_mut(&PaperOp::PlaceOrder) {
            if queue.front().is_some_and(|f| f.after_accept) {
                if let Some(failure) = queue.pop_front() {
                    return Err(failure.error);
                }
            }
        }
        Ok(result)
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        let mut state = self.begin(PaperOp::CancelOrder).await?;
        let order = state
            .orders
            .iter_mut()
            .find(|o| o.order_id == order_id && o.request.symbol == symbol)
            .ok_or_else(|| unknown_order(order_id))?;

        if order.is_open() {
            order.status = OrderStatus::Canceled;
        }
        Ok(())
    }

    async fn fetch_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError> {
        let state = self.begin(PaperOp::FetchOpenOrders).await?;
        Ok(state
            .orders
            .iter()
            .filter(|o| o.is_open() && o.request.symbol == symbol)
            .map(PaperOrder::to_open)
            .collect())
    }

    async fn fetch_order(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<OrderResult, ExchangeError> {
        let state = self.begin(PaperOp::FetchOrder).await?;
        state
            .orders
            .iter()
            .find(|o| o.order_id == order_id && o.request.symbol == symbol)
            .map(PaperOrder::to_result)
            .ok_or_else(|| unknown_order(order_id))
    }
}
