// =============================================================================
// Perpetual-futures Broker adapter — HMAC-signed REST client
// =============================================================================
//
// Generalizes the signed-request pattern of this daemon's single-exchange
// spot client (api key as header, HMAC-SHA256 query signature, recvWindow
// tolerance for clock drift) to a USD-margined perpetual-futures venue: the
// endpoints carry position/leverage concepts the spot API never needed, and
// order placement takes the Broker Port's richer `OrderRequest` shape
// (reduce_only, trigger_price, post_only) instead of spot's flat params.
// =============================================================================

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, instrument, warn};

use super::{Broker, BrokerCredentials, Environment, OpenOrder};
use crate::types::{
    Balance, BrokerPosition, Candle, InstrumentMeta, OrderKind, OrderRequest, OrderSide, OrderState, OrderStatus, Tick,
};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW_MS: u64 = 5000;

/// Rate-limit bookkeeping carried from the spot client's tracker (ambient
/// reliability concern, not itself a spec requirement, but a complete venue
/// adapter needs some notion of request budget to avoid tripping venue bans).
#[derive(Debug, Default)]
pub struct RateLimitTracker {
    pub used_weight_1m: std::sync::atomic::AtomicU32,
    pub order_count_10s: std::sync::atomic::AtomicU32,
}

impl RateLimitTracker {
    const WEIGHT_WARN_THRESHOLD: u32 = 800;
    const ORDER_10S_LIMIT: u32 = 10;

    pub fn can_send_request(&self, weight: u32) -> bool {
        self.used_weight_1m.load(std::sync::atomic::Ordering::Relaxed) + weight < Self::WEIGHT_WARN_THRESHOLD
    }

    pub fn can_place_order(&self) -> bool {
        self.order_count_10s.load(std::sync::atomic::Ordering::Relaxed) < Self::ORDER_10S_LIMIT
    }

    pub fn record_order_sent(&self) {
        self.order_count_10s.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}

/// HMAC-signed REST client for a perpetual-futures venue.
pub struct PerpetualBroker {
    api_key: RwLock<String>,
    secret: RwLock<String>,
    base_url: String,
    client: reqwest::Client,
    rate_limit: Arc<RateLimitTracker>,
}

impl PerpetualBroker {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            api_key: RwLock::new(String::new()),
            secret: RwLock::new(String::new()),
            base_url: base_url.into(),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client"),
            rate_limit: Arc::new(RateLimitTracker::default()),
        }
    }

    fn sign(&self, query: &str) -> String {
        let secret = self.secret.read();
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW_MS}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW_MS}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&self.api_key.read()) {
            headers.insert("X-MBX-APIKEY", val);
        }
        headers
    }

    fn order_kind_str(kind: OrderKind) -> &'static str {
        match kind {
            OrderKind::Market => "MARKET",
            OrderKind::Limit => "LIMIT",
            OrderKind::StopMarket => "STOP_MARKET",
            OrderKind::TakeLimit => "TAKE_PROFIT_LIMIT",
        }
    }

    fn side_str(side: OrderSide) -> &'static str {
        match side {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

#[async_trait]
impl Broker for PerpetualBroker {
    #[instrument(skip(self, creds), name = "perpetual::connect")]
    async fn connect(&self, creds: &BrokerCredentials, env: Environment) -> Result<()> {
        *self.api_key.write() = creds.api_key.clone();
        *self.secret.write() = creds.api_secret.clone();
        debug!(env = ?env, "perpetual broker session established");
        Ok(())
    }

    #[instrument(skip(self), name = "perpetual::get_balance")]
    async fn get_balance(&self, currency: &str) -> Result<Balance> {
        let qs = self.signed_query("");
        let url = format!("{}/fapi/v2/balance?{}", self.base_url, qs);

        let resp = self
            .client
            .get(&url)
            .headers(self.headers())
            .send()
            .await
            .context("GET /fapi/v2/balance request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse balance response")?;
        if !status.is_success() {
            anyhow::bail!("perpetual broker GET /fapi/v2/balance returned {}: {}", status, body);
        }

        let entries = body.as_array().context("balance response is not an array")?;
        for entry in entries {
            if entry["asset"].as_str() == Some(currency) {
                let available: f64 = entry["availableBalance"].as_str().unwrap_or("0").parse().unwrap_or(0.0);
                let equity: f64 = entry["balance"].as_str().unwrap_or("0").parse().unwrap_or(available);
                return Ok(Balance { equity, available });
            }
        }
        warn!(currency, "currency not found in balance response — returning zero balance");
        Ok(Balance { equity: 0.0, available: 0.0 })
    }

    #[instrument(skip(self), name = "perpetual::get_instrument")]
    async fn get_instrument(&self, symbol: &str) -> Result<InstrumentMeta> {
        let url = format!("{}/fapi/v1/exchangeInfo", self.base_url);
        let resp = self.client.get(&url).send().await.context("GET /fapi/v1/exchangeInfo request failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse exchangeInfo response")?;
        if !status.is_success() {
            anyhow::bail!("perpetual broker GET /fapi/v1/exchangeInfo returned {}: {}", status, body);
        }

        let entry = body["symbols"]
            .as_array()
            .and_then(|arr| arr.iter().find(|s| s["symbol"].as_str() == Some(symbol)))
            .with_context(|| format!("symbol {symbol} not found in exchangeInfo response"))?;

        let tick_size = entry["filters"]
            .as_array()
            .and_then(|f| f.iter().find(|x| x["filterType"] == "PRICE_FILTER"))
            .and_then(|x| x["tickSize"].as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.01);
        let lot_size = entry["filters"]
            .as_array()
            .and_then(|f| f.iter().find(|x| x["filterType"] == "LOT_SIZE"))
            .and_then(|x| x["stepSize"].as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.001);
        let min_trade_amount = entry["filters"]
            .as_array()
            .and_then(|f| f.iter().find(|x| x["filterType"] == "MIN_NOTIONAL"))
            .and_then(|x| x["notional"].as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(5.0);

        Ok(InstrumentMeta {
            symbol: symbol.to_string(),
            quote_currency: entry["quoteAsset"].as_str().unwrap_or("USD").to_string(),
            tick_size,
            lot_size,
            min_trade_amount,
            max_leverage: entry["maxLeverage"].as_f64().unwrap_or(20.0),
            quantity_is_notional: true,
        })
    }

    #[instrument(skip(self), name = "perpetual::get_candles")]
    async fn get_candles(&self, symbol: &str, timeframe: &str, limit: u32) -> Result<Vec<Candle>> {
        let url = format!("{}/fapi/v1/klines?symbol={}&interval={}&limit={}", self.base_url, symbol, timeframe, limit);
        let resp = self.client.get(&url).send().await.context("GET /fapi/v1/klines request failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse klines response")?;
        if !status.is_success() {
            anyhow::bail!("perpetual broker GET /fapi/v1/klines returned {}: {}", status, body);
        }

        let raw = body.as_array().context("klines response is not an array")?;
        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = entry.as_array().context("kline entry is not an array")?;
            if arr.len() < 7 {
                warn!(len = arr.len(), "skipping malformed kline entry");
                continue;
            }
            candles.push(Candle {
                open_time: arr[0].as_i64().unwrap_or(0),
                close_time: arr[6].as_i64().unwrap_or(0),
                open: parse_str_f64(&arr[1])?,
                high: parse_str_f64(&arr[2])?,
                low: parse_str_f64(&arr[3])?,
                close: parse_str_f64(&arr[4])?,
                volume: parse_str_f64(&arr[5])?,
            });
        }
        debug!(symbol, timeframe, count = candles.len(), "candles fetched");
        Ok(candles)
    }

    async fn subscribe_ticker(&self, symbol: &str) -> Result<BoxStream<'static, Tick>> {
        let lower = symbol.to_lowercase();
        let url = format!("wss://fstream.binance.com/ws/{lower}@markPrice@1s");
        info!(symbol, url = %url, "connecting to mark price websocket");

        let (ws_stream, _response) = connect_async(&url).await.context("failed to connect to mark price websocket")?;
        let (_write, mut read) = ws_stream.split();

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Tick>();
        let symbol = symbol.to_string();
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => match parse_mark_price_tick(&text) {
                        Ok(tick) => {
                            if tx.send(tick).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(symbol, error = %e, "failed to parse mark price message"),
                    },
                    Ok(_) => {}
                    Err(e) => {
                        error!(symbol, error = %e, "mark price websocket read error");
                        break;
                    }
                }
            }
            info!(symbol, "mark price websocket stream ended");
        });

        Ok(Box::pin(futures_util::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|tick| (tick, rx)) })))
    }

    #[instrument(skip(self), name = "perpetual::get_positions")]
    async fn get_positions(&self, currency: &str) -> Result<Vec<BrokerPosition>> {
        let qs = self.signed_query("");
        let url = format!("{}/fapi/v2/positionRisk?{}", self.base_url, qs);
        let resp = self
            .client
            .get(&url)
            .headers(self.headers())
            .send()
            .await
            .context("GET /fapi/v2/positionRisk request failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse positionRisk response")?;
        if !status.is_success() {
            anyhow::bail!("perpetual broker GET /fapi/v2/positionRisk returned {}: {}", status, body);
        }

        let raw = body.as_array().context("positionRisk response is not an array")?;
        let mut positions = Vec::new();
        for entry in raw {
            let size: f64 = entry["positionAmt"].as_str().unwrap_or("0").parse().unwrap_or(0.0);
            if size == 0.0 {
                continue;
            }
            if !entry["symbol"].as_str().map(|s| s.ends_with(currency)).unwrap_or(false) {
                continue;
            }
            positions.push(BrokerPosition {
                instrument: entry["symbol"].as_str().unwrap_or_default().to_string(),
                size,
                average_price: entry["entryPrice"].as_str().unwrap_or("0").parse().unwrap_or(0.0),
                mark_price: entry["markPrice"].as_str().unwrap_or("0").parse().unwrap_or(0.0),
            });
        }
        Ok(positions)
    }

    #[instrument(skip(self), name = "perpetual::get_open_orders")]
    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>> {
        let params = format!("symbol={symbol}");
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/openOrders?{}", self.base_url, qs);
        let resp = self
            .client
            .get(&url)
            .headers(self.headers())
            .send()
            .await
            .context("GET /fapi/v1/openOrders request failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse openOrders response")?;
        if !status.is_success() {
            anyhow::bail!("perpetual broker GET /fapi/v1/openOrders returned {}: {}", status, body);
        }

        let raw = body.as_array().cloned().unwrap_or_default();
        let orders = raw
            .into_iter()
            .map(|o| OpenOrder {
                order_id: o["orderId"].as_u64().map(|i| i.to_string()).unwrap_or_default(),
                symbol: o["symbol"].as_str().unwrap_or_default().to_string(),
                is_trigger: matches!(o["type"].as_str(), Some("STOP_MARKET") | Some("TAKE_PROFIT_LIMIT") | Some("TAKE_PROFIT_MARKET")),
                reduce_only: o["reduceOnly"].as_bool().unwrap_or(false),
            })
            .collect();
        Ok(orders)
    }

    #[instrument(skip(self, order), name = "perpetual::place")]
    async fn place(&self, symbol: &str, order: OrderRequest) -> Result<String> {
        if !self.rate_limit.can_place_order() {
            anyhow::bail!("order rate limit reached for this venue session");
        }

        let mut params = format!(
            "symbol={}&side={}&type={}&quantity={}&reduceOnly={}",
            symbol,
            Self::side_str(order.side),
            Self::order_kind_str(order.kind),
            order.amount,
            order.reduce_only
        );
        if let Some(price) = order.price {
            params.push_str(&format!("&price={price}&timeInForce=GTC"));
        }
        if let Some(trigger) = order.trigger_price {
            params.push_str(&format!("&stopPrice={trigger}"));
        }
        if order.post_only {
            params.push_str("&timeInForce=GTX");
        }

        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);

        debug!(symbol, side = ?order.side, kind = ?order.kind, amount = order.amount, "placing order");

        let resp = self.client.post(&url).headers(self.headers()).send().await.context("POST /fapi/v1/order request failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse order response")?;
        self.rate_limit.record_order_sent();

        if !status.is_success() {
            anyhow::bail!("perpetual broker POST /fapi/v1/order returned {}: {}", status, body);
        }

        let order_id = body["orderId"].as_u64().context("order response missing orderId")?;
        Ok(order_id.to_string())
    }

    #[instrument(skip(self), name = "perpetual::get_order_state")]
    async fn get_order_state(&self, symbol: &str, order_id: &str) -> Result<OrderStatus> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);
        let resp = self.client.get(&url).headers(self.headers()).send().await.context("GET /fapi/v1/order request failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse order-state response")?;
        if !status.is_success() {
            anyhow::bail!("perpetual broker GET /fapi/v1/order returned {}: {}", status, body);
        }

        let state = match body["status"].as_str().unwrap_or("") {
            "FILLED" => OrderState::Filled,
            "CANCELED" | "EXPIRED" => OrderState::Cancelled,
            "REJECTED" => OrderState::Rejected,
            _ => OrderState::Open,
        };

        Ok(OrderStatus {
            state,
            filled_amount: body["executedQty"].as_str().unwrap_or("0").parse().unwrap_or(0.0),
            average_price: body["avgPrice"].as_str().unwrap_or("0").parse().unwrap_or(0.0),
        })
    }

    #[instrument(skip(self), name = "perpetual::cancel")]
    async fn cancel(&self, symbol: &str, order_id: &str) -> Result<()> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);
        let resp = self.client.delete(&url).headers(self.headers()).send().await.context("DELETE /fapi/v1/order request failed")?;
        let status = resp.status();

        // Idempotent: "order does not exist" is not an error for our purposes.
        if status.is_success() {
            return Ok(());
        }
        let body: serde_json::Value = resp.json().await.unwrap_or_default();
        if body["code"].as_i64() == Some(-2011) {
            debug!(symbol, order_id, "cancel target already gone — treating as success");
            return Ok(());
        }
        anyhow::bail!("perpetual broker DELETE /fapi/v1/order returned {}: {}", status, body);
    }
}

fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>().with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}

/// Parses one `markPriceUpdate` frame (`{"e":"markPriceUpdate","E":..,"p":".."}`)
/// into a `Tick`.
fn parse_mark_price_tick(text: &str) -> Result<Tick> {
    let body: serde_json::Value = serde_json::from_str(text).context("mark price frame is not valid JSON")?;
    let timestamp_ms = body["E"].as_i64().context("mark price frame missing event time 'E'")?;
    let price = parse_str_f64(&body["p"]).context("mark price frame missing price 'p'")?;
    Ok(Tick { timestamp_ms, price })
}

#[cfg(test)]
mod ws_tests {
    use super::*;

    #[test]
    fn parse_mark_price_tick_reads_price_and_event_time() {
        let frame = r#"{"e":"markPriceUpdate","E":1596663344780,"s":"BTCUSDT","p":"11185.87786614","P":"11215.78505155","r":"0.00038167","T":1596691200000}"#;
        let tick = parse_mark_price_tick(frame).unwrap();
        assert_eq!(tick.timestamp_ms, 1596663344780);
        assert!((tick.price - 11185.87786614).abs() < 1e-6);
    }

    #[test]
    fn parse_mark_price_tick_rejects_malformed_frame() {
        assert!(parse_mark_price_tick("not json").is_err());
        assert!(parse_mark_price_tick(r#"{"e":"markPriceUpdate"}"#).is_err());
    }
}
