use std::sync::Arc;

use crate::config::{PartialFillPolicy, TradingConfig};
use crate::error::ExchangeError;
use crate::exchange::ExchangeGateway;
use crate::execution::RetryPolicy;
use crate::models::{OrderRequest, OrderResult, OrderSide, OrderStatus, OrderType, Side};

const QTY_EPSILON: f64 = 1e-12;

/// What happened to the unfilled part of an order
#[derive(Debug, Clone, PartialEq)]
pub enum Remainder {
    /// Fully filled, or nothing left working
    None,
    Cancelled,
    /// Cancel did not go through; the order may still be working
    CancelFailed { order_id: String },
    /// Left on the book on purpose
    Resting { order_id: String },
}

#[derive(Debug, Clone)]
pub struct Execution {
    pub request: OrderRequest,
    pub result: OrderResult,
    pub remainder: Remainder,
}

impl Execution {
    pub fn filled_qty(&self) -> f64 {
        self.result.filled_qty
    }

    pub fn is_filled(&self) -> bool {
        self.result.filled_qty > QTY_EPSILON
    }
}

/// Sends orders through the gateway and deals with what comes back
pub struct OrderExecutor {
    gateway: Arc<dyn ExchangeGateway>,
    retry: RetryPolicy,
    order_type: OrderType,
    limit_offset: f64,
    partial_fill_policy: PartialFillPolicy,
}

impl OrderExecutor {
    pub fn new(gateway: Arc<dyn ExchangeGateway>, retry: RetryPolicy, trading: &TradingConfig) -> Self {
        Self {
            gateway,
            retry,
            order_type: trading.order_type,
            limit_offset: trading.limit_offset,
            partial_fill_policy: trading.partial_fill_policy,
        }
    }

    pub fn gateway(&self) -> &Arc<dyn ExchangeGateway> {
        &self.gateway
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Order opening `side`; limit entries are priced just inside the reference
    pub fn entry_order(&self, symbol: &str, side: Side, quantity: f64, price: f64) -> OrderRequest {
        let order_side = side.entry_order_side();
        match self.order_type {
            OrderType::Market => OrderRequest::market(symbol, order_side, quantity),
            OrderType::Limit => {
                let limit = match order_side {
                    OrderSide::Buy => price * (1.0 - self.limit_offset),
                    OrderSide::Sell => price * (1.0 + self.limit_offset),
                };
                OrderRequest::limit(symbol, order_side, quantity, limit)
            }
        }
    }

    /// Exits always go out at market
    pub fn exit_order(&self, symbol: &str, side: Side, quantity: f64) -> OrderRequest {
        OrderRequest::market(symbol, side.exit_order_side(), quantity)
    }

    /// Submit an entry and apply the configured partial-fill policy
    pub async fn execute_entry(&self, request: OrderRequest) -> Result<Execution, ExchangeError> {
        let keep_resting = self.partial_fill_policy == PartialFillPolicy::KeepResting;
        self.execute(request, keep_resting).await
    }

    /// Submit an exit; unfilled exit quantity is never left working
    pub async fn execute_exit(&self, request: OrderRequest) -> Result<Execution, ExchangeError> {
        self.execute(request, false).await
    }

    async fn execute(
        &self,
        request: OrderRequest,
        keep_resting: bool,
    ) -> Result<Execution, ExchangeError> {
        let result = self.submit(&request).await?;

        let working = matches!(
            result.status,
            OrderStatus::New | OrderStatus::PartiallyFilled
        );
        let unfilled = request.quantity - result.filled_qty;

        let remainder = if !working || unfilled <= QTY_EPSILON {
            Remainder::None
        } else if keep_resting && result.filled_qty > QTY_EPSILON {
            tracing::info!(
                "Order {} partially filled ({:.6}/{:.6}), remainder left resting",
                result.order_id,
                result.filled_qty,
                request.quantity
            );
            Remainder::Resting {
                order_id: result.order_id.clone(),
            }
        } else {
            match self.cancel(&request.symbol, &result.order_id).await {
                Ok(()) => {
                    tracing::info!(
                        "Cancelled unfilled {:.6} of order {}",
                        unfilled,
                        result.order_id
                    );
                    Remainder::Cancelled
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to cancel remainder of order {}: {}",
                        result.order_id,
                        e
                    );
                    Remainder::CancelFailed {
                        order_id: result.order_id.clone(),
                    }
                }
            }
        };

        Ok(Execution {
            request,
            result,
            remainder,
        })
    }

    /// Place an order with bounded retries
    ///
    /// A retryable failure may hide an order that did reach the exchange, so
    /// before each retry the open orders are searched for the client order id
    /// and a match is adopted instead of submitting again.
    pub async fn submit(&self, request: &OrderRequest) -> Result<OrderResult, ExchangeError> {
        tracing::info!(
            "Submitting {:?} {:?} {} qty {:.6} (client id {})",
            request.order_type,
            request.side,
            request.symbol,
            request.quantity,
            request.client_order_id
        );

        let mut backoff = self.retry.backoff();
        loop {
            let err = match self
                .retry
                .timed("place_order", self.gateway.place_order(request))
                .await
            {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e),
            };

            if let Some(adopted) = self.find_submitted(request).await {
                tracing::warn!(
                    "place_order reported {} but order {} is on the book, adopting it",
                    err,
                    adopted.order_id
                );
                return Ok(adopted);
            }

            if backoff.attempt() >= self.retry.max_retries {
                return Err(err);
            }
            let delay = backoff.next_delay();
            tracing::warn!(
                "place_order failed (attempt {}/{}): {}, retrying in {:?}",
                backoff.attempt(),
                self.retry.max_retries + 1,
                err,
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn find_submitted(&self, request: &OrderRequest) -> Option<OrderResult> {
        let open = match self
            .retry
            .timed(
                "fetch_open_orders",
                self.gateway.fetch_open_orders(&request.symbol),
            )
            .await
        {
            Ok(open) => open,
            Err(e) => {
                tracing::warn!("Could not check open orders for {}: {}", request.symbol, e);
                return None;
            }
        };

        open.into_iter()
            .find(|o| o.client_order_id == request.client_order_id)
            .map(|o| OrderResult {
                status: if o.filled_qty > QTY_EPSILON {
                    OrderStatus::PartiallyFilled
                } else {
                    OrderStatus::New
                },
                order_id: o.order_id,
                client_order_id: o.client_order_id,
                filled_qty: o.filled_qty,
                avg_price: o.avg_price,
            })
    }

    pub async fn cancel(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        self.retry
            .run("cancel_order", || self.gateway.cancel_order(symbol, order_id))
            .await
    }

    pub async fn order_status(&self, symbol: &str, order_id: &str) -> Result<OrderResult, ExchangeError> {
        self.retry
            .run("fetch_order", || self.gateway.fetch_order(symbol, order_id))
            .await
    }
}
