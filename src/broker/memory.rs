// =============================================================================
// In-memory Broker — test double
// =============================================================================
//
// Generalizes this daemon's demo-mode execution path (which simulated a fill
// locally and opened a position in the in-process position manager) into a
// reusable, fully in-memory implementation of the Broker Port. Used by C4-C7
// integration tests so the trading core can be exercised deterministically
// without any network access (§9: "ephemeral store exists only for tests").
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use parking_lot::RwLock;

use super::{Broker, BrokerCredentials, Environment, OpenOrder};
use crate::types::{Balance, BrokerPosition, Candle, InstrumentMeta, OrderKind, OrderRequest, OrderState, OrderStatus, OrderSide, Tick};

#[derive(Debug, Clone)]
struct SimOrder {
    symbol: String,
    side: OrderSide,
    kind: OrderKind,
    amount: f64,
    price: Option<f64>,
    trigger_price: Option<f64>,
    reduce_only: bool,
    state: OrderState,
    filled_amount: f64,
    average_price: f64,
}

/// A fully in-memory broker. Market orders fill immediately at `mark_price`;
/// trigger/limit orders stay `Open` until the test explicitly resolves them
/// via `fill_order` / `reject_order`, mirroring how a real venue settles
/// protective orders asynchronously.
pub struct MemoryBroker {
    next_order_id: AtomicU64,
    orders: RwLock<HashMap<String, SimOrder>>,
    positions: RwLock<HashMap<String, f64>>, // symbol -> signed size
    entry_prices: RwLock<HashMap<String, f64>>,
    mark_prices: RwLock<HashMap<String, f64>>,
    instruments: RwLock<HashMap<String, InstrumentMeta>>,
    balance: RwLock<Balance>,
    connected: RwLock<bool>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            next_order_id: AtomicU64::new(1),
            orders: RwLock::new(HashMap::new()),
            positions: RwLock::new(HashMap::new()),
            entry_prices: RwLock::new(HashMap::new()),
            mark_prices: RwLock::new(HashMap::new()),
            instruments: RwLock::new(HashMap::new()),
            balance: RwLock::new(Balance { equity: 10_000.0, available: 10_000.0 }),
            connected: RwLock::new(false),
        }
    }

    pub fn set_instrument(&self, meta: InstrumentMeta) {
        self.instruments.write().insert(meta.symbol.clone(), meta);
    }

    pub fn set_mark_price(&self, symbol: &str, price: f64) {
        self.mark_prices.write().insert(symbol.to_string(), price);
    }

    pub fn set_balance(&self, balance: Balance) {
        *self.balance.write() = balance;
    }

    /// Force an existing position to a given signed size/entry (used to seed
    /// orphan/ghost reconciliation scenarios in tests).
    pub fn seed_position(&self, symbol: &str, size: f64, entry_price: f64) {
        self.positions.write().insert(symbol.to_string(), size);
        self.entry_prices.write().insert(symbol.to_string(), entry_price);
    }

    pub fn clear_position(&self, symbol: &str) {
        self.positions.write().remove(symbol);
        self.entry_prices.write().remove(symbol);
    }

    pub fn fill_order(&self, order_id: &str, price: f64) {
        let mut orders = self.orders.write();
        if let Some(order) = orders.get_mut(order_id) {
            order.state = OrderState::Filled;
            order.filled_amount = order.amount;
            order.average_price = price;
            self.apply_fill(order);
        }
    }

    pub fn reject_order(&self, order_id: &str) {
        if let Some(order) = self.orders.write().get_mut(order_id) {
            order.state = OrderState::Rejected;
        }
    }

    fn apply_fill(&self, order: &SimOrder) {
        let delta = match order.side {
            OrderSide::Buy => order.amount,
            OrderSide::Sell => -order.amount,
        };
        let mut positions = self.positions.write();
        let entry = positions.entry(order.symbol.clone()).or_insert(0.0);
        *entry += delta;
        if *entry == 0.0 {
            positions.remove(&order.symbol);
            self.entry_prices.write().remove(&order.symbol);
        } else {
            self.entry_prices.write().insert(order.symbol.clone(), order.average_price);
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self, _creds: &BrokerCredentials, _env: Environment) -> anyhow::Result<()> {
        *self.connected.write() = true;
        Ok(())
    }

    async fn get_balance(&self, _currency: &str) -> anyhow::Result<Balance> {
        Ok(*self.balance.read())
    }

    async fn get_instrument(&self, symbol: &str) -> anyhow::Result<InstrumentMeta> {
        self.instruments
            .read()
            .get(symbol)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no instrument metadata seeded for {symbol}"))
    }

    async fn get_candles(&self, _symbol: &str, _timeframe: &str, _limit: u32) -> anyhow::Result<Vec<Candle>> {
        Ok(Vec::new())
    }

    async fn subscribe_ticker(&self, _symbol: &str) -> anyhow::Result<BoxStream<'static, Tick>> {
        Ok(Box::pin(futures_util::stream::empty()))
    }

    async fn get_positions(&self, _currency: &str) -> anyhow::Result<Vec<BrokerPosition>> {
        let positions = self.positions.read();
        let entries = self.entry_prices.read();
        let marks = self.mark_prices.read();
        Ok(positions
            .iter()
            .map(|(symbol, &size)| BrokerPosition {
                instrument: symbol.clone(),
                size,
                average_price: entries.get(symbol).copied().unwrap_or(0.0),
                mark_price: marks.get(symbol).copied().unwrap_or(0.0),
            })
            .collect())
    }

    async fn get_open_orders(&self, symbol: &str) -> anyhow::Result<Vec<OpenOrder>> {
        Ok(self
            .orders
            .read()
            .iter()
            .filter(|(_, o)| o.symbol == symbol && o.state == OrderState::Open)
            .map(|(id, o)| OpenOrder {
                order_id: id.clone(),
                symbol: o.symbol.clone(),
                is_trigger: matches!(o.kind, OrderKind::StopMarket | OrderKind::TakeLimit),
                reduce_only: o.reduce_only,
            })
            .collect())
    }

    async fn place(&self, symbol: &str, order: OrderRequest) -> anyhow::Result<String> {
        let id = self.next_order_id.fetch_add(1, Ordering::Relaxed).to_string();
        let mark = self.mark_prices.read().get(symbol).copied().unwrap_or(order.price.unwrap_or(0.0));

        let mut sim = SimOrder {
            symbol: symbol.to_string(),
            side: order.side,
            kind: order.kind,
            amount: order.amount,
            price: order.price,
            trigger_price: order.trigger_price,
            reduce_only: order.reduce_only,
            state: OrderState::Open,
            filled_amount: 0.0,
            average_price: 0.0,
        };

        if order.kind == OrderKind::Market {
            sim.state = OrderState::Filled;
            sim.filled_amount = order.amount;
            sim.average_price = mark;
        }

        self.orders.write().insert(id.clone(), sim.clone());
        if sim.state == OrderState::Filled {
            self.apply_fill(&sim);
        }
        Ok(id)
    }

    async fn get_order_state(&self, _symbol: &str, order_id: &str) -> anyhow::Result<OrderStatus> {
        let orders = self.orders.read();
        let order = orders.get(order_id).ok_or_else(|| anyhow::anyhow!("unknown order id {order_id}"))?;
        Ok(OrderStatus { state: order.state, filled_amount: order.filled_amount, average_price: order.average_price })
    }

    async fn cancel(&self, _symbol: &str, order_id: &str) -> anyhow::Result<()> {
        if let Some(order) = self.orders.write().get_mut(order_id) {
            if order.state == OrderState::Open {
                order.state = OrderState::Cancelled;
            }
        }
        // Idempotent: cancelling an unknown/already-cancelled id is not an error.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> InstrumentMeta {
        InstrumentMeta {
            symbol: "BTC-USD-PERP".to_string(),
            quote_currency: "USD".to_string(),
            tick_size: 0.5,
            lot_size: 1.0,
            min_trade_amount: 5.0,
            max_leverage: 20.0,
            quantity_is_notional: true,
        }
    }

    #[tokio::test]
    async fn market_order_fills_immediately() {
        let broker = MemoryBroker::new();
        broker.set_instrument(meta());
        broker.set_mark_price("BTC-USD-PERP", 60000.0);

        let order_id = broker.place("BTC-USD-PERP", OrderRequest::market(OrderSide::Buy, 1000.0, false)).await.unwrap();
        let status = broker.get_order_state("BTC-USD-PERP", &order_id).await.unwrap();
        assert_eq!(status.state, OrderState::Filled);

        let positions = broker.get_positions("USD").await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].size, 1000.0);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let broker = MemoryBroker::new();
        broker.cancel("BTC-USD-PERP", "does-not-exist").await.unwrap();
    }

    #[tokio::test]
    async fn trigger_order_stays_open_until_resolved() {
        let broker = MemoryBroker::new();
        broker.set_instrument(meta());
        let id = broker.place("BTC-USD-PERP", OrderRequest::stop_market(OrderSide::Sell, 1000.0, 59400.0)).await.unwrap();
        let status = broker.get_order_state("BTC-USD-PERP", &id).await.unwrap();
        assert_eq!(status.state, OrderState::Open);

        broker.fill_order(&id, 59400.0);
        let status = broker.get_order_state("BTC-USD-PERP", &id).await.unwrap();
        assert_eq!(status.state, OrderState::Filled);
    }
}
