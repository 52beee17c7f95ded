// =============================================================================
// Broker Port (C1)
// =============================================================================
//
// A uniform, venue-agnostic capability surface. The executor, bracket
// manager, and reconciliation engine depend only on this trait — never on a
// concrete venue client — so that adding a venue means writing one adapter,
// never touching the trading core. `async_trait` is used for the trait
// itself (grounded in barter-rs and the latency-tdh-glowback example repos;
// the Binance client this daemon's REST/signing pattern is grounded on used
// inherent async methods on a concrete struct, which is insufficient once a
// second venue and a test stub both need to satisfy the same contract).
// =============================================================================

pub mod memory;
pub mod perpetual;
pub mod stub;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::types::{Balance, BrokerPosition, InstrumentMeta, OrderRequest, OrderStatus, Tick};

#[derive(Clone)]
pub struct BrokerCredentials {
    pub api_key: String,
    pub api_secret: String,
}

impl std::fmt::Debug for BrokerCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerCredentials")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Live,
    Testnet,
}

/// Uniform capability surface for a derivatives venue (§4.1).
#[async_trait]
pub trait Broker: Send + Sync {
    /// Establish (or confirm) the session. Idempotent: calling twice with the
    /// same credentials must not open a second session.
    async fn connect(&self, creds: &BrokerCredentials, env: Environment) -> anyhow::Result<()>;

    async fn get_balance(&self, currency: &str) -> anyhow::Result<Balance>;

    async fn get_instrument(&self, symbol: &str) -> anyhow::Result<InstrumentMeta>;

    async fn get_candles(&self, symbol: &str, timeframe: &str, limit: u32) -> anyhow::Result<Vec<crate::types::Candle>>;

    /// Subscribe to a ticker stream. Delivery is lossy on backpressure: the
    /// transport drops the oldest tick rather than blocking (§5).
    async fn subscribe_ticker(&self, symbol: &str) -> anyhow::Result<BoxStream<'static, Tick>>;

    async fn get_positions(&self, currency: &str) -> anyhow::Result<Vec<BrokerPosition>>;

    async fn get_open_orders(&self, symbol: &str) -> anyhow::Result<Vec<OpenOrder>>;

    /// Submit an order. Returns the venue-assigned order id.
    async fn place(&self, symbol: &str, order: OrderRequest) -> anyhow::Result<String>;

    async fn get_order_state(&self, symbol: &str, order_id: &str) -> anyhow::Result<OrderStatus>;

    /// Cancel an order. Must be idempotent: cancelling an already-cancelled
    /// or already-filled order is not an error.
    async fn cancel(&self, symbol: &str, order_id: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct OpenOrder {
    pub order_id: String,
    pub symbol: String,
    pub is_trigger: bool,
    pub reduce_only: bool,
}
