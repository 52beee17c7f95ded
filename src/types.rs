// =============================================================================
// Shared domain types used across the daemon
// =============================================================================

use serde::{Deserialize, Serialize};

/// Long or short, as recorded on a position / trade record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// The order side that closes a position on this side.
    pub fn closing_side(self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        }
    }

    /// The order side that opens a position on this side.
    pub fn opening_side(self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionSide::Long => write!(f, "long"),
            PositionSide::Short => write!(f, "short"),
        }
    }
}

/// Buy or sell, as submitted on an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

/// The four order types the Broker Port understands (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Market,
    Limit,
    StopMarket,
    TakeLimit,
}

/// Venue-reported lifecycle of a single order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    Open,
    Filled,
    Cancelled,
    Rejected,
}

/// Balance snapshot for a single currency from the broker. `available` is
/// distinct from `equity`: equity includes unrealized PnL and margin in use,
/// available is free margin that can back a new order. The Risk Engine's
/// `InsufficientBalance` check is against `available`, not `equity`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub equity: f64,
    pub available: f64,
}

/// Static metadata about a tradable instrument (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentMeta {
    pub symbol: String,
    pub quote_currency: String,
    pub tick_size: f64,
    pub lot_size: f64,
    pub min_trade_amount: f64,
    pub max_leverage: f64,
    /// True when order `amount` is denominated in quote-asset notional
    /// (e.g. USD-margined perpetuals) rather than base-asset quantity. This
    /// is the convention flag the worked sizing example in §8 implies.
    pub quantity_is_notional: bool,
}

/// One order as submitted to the Broker Port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub side: OrderSide,
    pub kind: OrderKind,
    pub amount: f64,
    pub price: Option<f64>,
    pub trigger_price: Option<f64>,
    pub reduce_only: bool,
    pub post_only: bool,
}

impl OrderRequest {
    pub fn market(side: OrderSide, amount: f64, reduce_only: bool) -> Self {
        Self {
            side,
            kind: OrderKind::Market,
            amount,
            price: None,
            trigger_price: None,
            reduce_only,
            post_only: false,
        }
    }

    pub fn stop_market(side: OrderSide, amount: f64, trigger_price: f64) -> Self {
        Self {
            side,
            kind: OrderKind::StopMarket,
            amount,
            price: None,
            trigger_price: Some(trigger_price),
            reduce_only: true,
            post_only: false,
        }
    }

    pub fn take_limit(side: OrderSide, amount: f64, price: f64) -> Self {
        Self {
            side,
            kind: OrderKind::TakeLimit,
            amount,
            price: Some(price),
            trigger_price: None,
            reduce_only: true,
            post_only: false,
        }
    }
}

/// Snapshot of an order's state as reported by `get_order_state`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrderStatus {
    pub state: OrderState,
    pub filled_amount: f64,
    pub average_price: f64,
}

/// A venue-reported open position for one instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub instrument: String,
    /// Signed size: positive is long, negative is short.
    pub size: f64,
    pub average_price: f64,
    pub mark_price: f64,
}

impl BrokerPosition {
    pub fn side(&self) -> Option<PositionSide> {
        if self.size > 0.0 {
            Some(PositionSide::Long)
        } else if self.size < 0.0 {
            Some(PositionSide::Short)
        } else {
            None
        }
    }
}

/// A single OHLCV candle. Kept compatible with the richer, exchange-shaped
/// candle used by the reference strategy's indicators while satisfying the
/// plain `(t, o, h, l, c, v)` contract strategies consume.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// A single ticker update delivered off a live subscription.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Tick {
    pub timestamp_ms: i64,
    pub price: f64,
}

/// A directional trading signal produced by a strategy plug-in (§4.2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub kind: SignalKind,
    pub entry: f64,
    pub stop: f64,
    pub take_profit: f64,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    EnterLong,
    EnterShort,
    None,
}

impl Signal {
    pub fn none() -> Self {
        Self {
            kind: SignalKind::None,
            entry: 0.0,
            stop: 0.0,
            take_profit: 0.0,
            reasons: Vec::new(),
        }
    }

    pub fn position_side(&self) -> Option<PositionSide> {
        match self.kind {
            SignalKind::EnterLong => Some(PositionSide::Long),
            SignalKind::EnterShort => Some(PositionSide::Short),
            SignalKind::None => None,
        }
    }
}
