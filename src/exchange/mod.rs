// Exchange connectivity
pub mod paper;

pub use paper::{PaperExchange, PaperOp};

use async_trait::async_trait;

use crate::error::ExchangeError;
use crate::models::{AccountState, MarketDataSnapshot, OpenOrder, OrderRequest, OrderResult};

/// Capability set every exchange connection exposes to the trading loop
///
/// One gateway instance serves one account. Implementations return the
/// exchange's view of the account; `peak_equity` in `fetch_balance` is a
/// placeholder that the account book overrides with its own high-water mark.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<MarketDataSnapshot, ExchangeError>;

    async fn fetch_balance(&self, account: &str) -> Result<AccountState, ExchangeError>;

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderResult, ExchangeError>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError>;

    async fn fetch_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError>;

    /// Current state of a single order, open or not
    async fn fetch_order(&self, symbol: &str, order_id: &str)
        -> Result<OrderResult, ExchangeError>;
}
