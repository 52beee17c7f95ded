// =============================================================================
// Unimplemented-venue stub
// =============================================================================
//
// Per §9/§10: a broker stub for a venue this daemon does not yet implement
// must refuse to connect, never silently no-op. Emergency close and cancel
// on a stub are errors, not successes — a silent no-op there would leave an
// operator believing a position was flattened when it was not.
// =============================================================================

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use super::{Broker, BrokerCredentials, Environment, OpenOrder};
use crate::types::{Balance, BrokerPosition, Candle, InstrumentMeta, OrderRequest, OrderStatus, Tick};

pub struct UnimplementedBroker {
    pub venue_name: String,
}

impl UnimplementedBroker {
    pub fn new(venue_name: impl Into<String>) -> Self {
        Self { venue_name: venue_name.into() }
    }

    fn refuse(&self, op: &str) -> anyhow::Error {
        anyhow::anyhow!("broker adapter for venue '{}' is not implemented (attempted: {})", self.venue_name, op)
    }
}

#[async_trait]
impl Broker for UnimplementedBroker {
    async fn connect(&self, _creds: &BrokerCredentials, _env: Environment) -> anyhow::Result<()> {
        Err(self.refuse("connect"))
    }

    async fn get_balance(&self, _currency: &str) -> anyhow::Result<Balance> {
        Err(self.refuse("get_balance"))
    }

    async fn get_instrument(&self, _symbol: &str) -> anyhow::Result<InstrumentMeta> {
        Err(self.refuse("get_instrument"))
    }

    async fn get_candles(&self, _symbol: &str, _timeframe: &str, _limit: u32) -> anyhow::Result<Vec<Candle>> {
        Err(self.refuse("get_candles"))
    }

    async fn subscribe_ticker(&self, _symbol: &str) -> anyhow::Result<BoxStream<'static, Tick>> {
        Err(self.refuse("subscribe_ticker"))
    }

    async fn get_positions(&self, _currency: &str) -> anyhow::Result<Vec<BrokerPosition>> {
        Err(self.refuse("get_positions"))
    }

    async fn get_open_orders(&self, _symbol: &str) -> anyhow::Result<Vec<OpenOrder>> {
        Err(self.refuse("get_open_orders"))
    }

    async fn place(&self, _symbol: &str, _order: OrderRequest) -> anyhow::Result<String> {
        Err(self.refuse("place"))
    }

    async fn get_order_state(&self, _symbol: &str, _order_id: &str) -> anyhow::Result<OrderStatus> {
        Err(self.refuse("get_order_state"))
    }

    async fn cancel(&self, _symbol: &str, _order_id: &str) -> anyhow::Result<()> {
        Err(self.refuse("cancel"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refuses_to_connect() {
        let stub = UnimplementedBroker::new("dydx");
        let creds = BrokerCredentials { api_key: "x".into(), api_secret: "y".into() };
        let err = stub.connect(&creds, Environment::Testnet).await.unwrap_err();
        assert!(err.to_string().contains("not implemented"));
    }

    #[tokio::test]
    async fn cancel_is_an_error_not_a_silent_noop() {
        let stub = UnimplementedBroker::new("dydx");
        assert!(stub.cancel("BTC-USD-PERP", "1").await.is_err());
    }
}
