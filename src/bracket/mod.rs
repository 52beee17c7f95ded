// =============================================================================
// Bracket Order Manager (C5)
// =============================================================================
//
// The subsystem where correctness is hardest and where most past incidents
// originate: attaching protective stop-loss and take-profit orders to a
// filled entry, re-verifying every assumption rather than trusting the
// caller, retrying with backoff, and falling back to an emergency close
// rather than ever leaving a position unprotected.
//
// Grounded in this daemon's execution engine (`execution.rs`) for the
// risk-gate-then-act shape and in `position_engine.rs` for directional
// long/short symmetry, generalized from a single in-process position record
// to re-querying venue truth via the Broker Port at every step.
// =============================================================================

use std::time::Duration;

use rand::Rng;
use tracing::{error, info, warn};

use crate::broker::Broker;
use crate::error::CoreError;
use crate::types::{InstrumentMeta, OrderRequest, OrderState, PositionSide};

/// Retry backoff cap (§7: "exponential backoff with jitter, cap 13s").
const BACKOFF_CAP_MS: u64 = 13_000;

/// Rounds a price to the instrument's tick size: `round(p / tick) * tick`.
pub fn round_to_tick(price: f64, tick_size: f64) -> f64 {
    if tick_size <= 0.0 {
        return price;
    }
    (price / tick_size).round() * tick_size
}

/// Inputs to `attach_brackets`. The caller (executor) guarantees `entry_order_id`
/// has been submitted; the manager re-verifies everything else itself.
pub struct AttachBracketsParams<'a> {
    pub instrument: &'a InstrumentMeta,
    pub entry_order_id: &'a str,
    pub side: PositionSide,
    pub quantity: f64,
    pub stop: f64,
    pub take_profit: f64,
}

/// Successful outcome of `attach_brackets`.
#[derive(Debug, Clone)]
pub struct Brackets {
    pub sl_order_id: String,
    pub tp_order_id: String,
}

const SETTLE_DELAY_MS: u64 = 200;
const CANCEL_RETRY_DELAY_MS: u64 = 200;
const CANCEL_MAX_RETRIES: u32 = 3;

pub struct BracketManager {
    broker: std::sync::Arc<dyn Broker>,
    backoff_base_ms: u64,
}

impl BracketManager {
    pub fn new(broker: std::sync::Arc<dyn Broker>, backoff_base_ms: u64) -> Self {
        Self { broker, backoff_base_ms }
    }

    /// `attachBrackets(params, maxRetries)` — §4.4, steps 1-10.
    pub async fn attach_brackets(
        &self,
        symbol: &str,
        params: AttachBracketsParams<'_>,
        max_retries: u32,
    ) -> Result<Brackets, CoreError> {
        // 1. Verify entry is filled.
        let entry_status = self
            .broker
            .get_order_state(symbol, params.entry_order_id)
            .await
            .map_err(|e| CoreError::BrokerTransient(e.to_string()))?;
        if entry_status.state != OrderState::Filled {
            return Err(CoreError::BracketPlacementFailed(format!(
                "entry order {} is not filled (state={:?})",
                params.entry_order_id, entry_status.state
            )));
        }

        // 2. Verify position exists with non-zero size.
        let positions = self.broker.get_positions(&params.instrument.quote_currency).await.map_err(|e| CoreError::BrokerTransient(e.to_string()))?;
        let position = positions.iter().find(|p| p.instrument == symbol && p.size != 0.0);
        if position.is_none() {
            return Err(CoreError::BracketPlacementFailed(format!("no open position found for {symbol} after entry fill")));
        }

        // 3. Cleanup orphan triggers (stop/take triggers with no backing position).
        self.cleanup_orphan_triggers(symbol, position.is_some()).await?;

        // 4. Check trigger budget.
        let open_orders = self.broker.get_open_orders(symbol).await.map_err(|e| CoreError::BrokerTransient(e.to_string()))?;
        let trigger_count = open_orders.iter().filter(|o| o.is_trigger).count() as u32;
        const VENUE_TRIGGER_LIMIT: u32 = 10;
        if trigger_count >= VENUE_TRIGGER_LIMIT.saturating_sub(2) {
            return Err(CoreError::BracketPlacementFailed(format!(
                "trigger budget exhausted: {trigger_count} existing triggers for {symbol}"
            )));
        }

        let closing_side = params.side.closing_side();

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.place_sl_and_tp(symbol, &params, closing_side).await {
                Ok(brackets) => return Ok(brackets),
                Err((partial, err)) => {
                    warn!(symbol, attempt, error = %err, "bracket placement attempt failed, cancelling partial leg");
                    if let Some(order_id) = partial {
                        self.cancel_with_retries(symbol, &order_id).await;
                    }
                    if attempt > max_retries {
                        error!(symbol, attempts = attempt, "bracket placement exhausted retries");
                        return Err(CoreError::BracketPlacementFailed(err));
                    }
                    let backoff = (self.backoff_base_ms * 2u64.pow(attempt - 1)).min(BACKOFF_CAP_MS);
                    let jitter = rand::thread_rng().gen_range(0..=backoff / 4);
                    tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
                }
            }
        }
    }

    /// Steps 5-6: place SL then TP, reduce-only, both re-verified via
    /// `get_order_state`. Returns `Err((maybe_placed_leg, message))` so the
    /// caller can cancel whichever leg succeeded before retrying.
    async fn place_sl_and_tp(
        &self,
        symbol: &str,
        params: &AttachBracketsParams<'_>,
        closing_side: crate::types::OrderSide,
    ) -> Result<Brackets, (Option<String>, String)> {
        let tick = params.instrument.tick_size;
        let sl_price = round_to_tick(params.stop, tick);
        let tp_price = round_to_tick(params.take_profit, tick);

        let sl_request = OrderRequest::stop_market(closing_side, params.quantity, sl_price);
        let sl_order_id = self
            .broker
            .place(symbol, sl_request)
            .await
            .map_err(|e| (None, format!("SL placement failed: {e}")))?;

        let sl_status = self
            .broker
            .get_order_state(symbol, &sl_order_id)
            .await
            .map_err(|e| (Some(sl_order_id.clone()), format!("failed to verify SL state: {e}")))?;
        if matches!(sl_status.state, OrderState::Cancelled | OrderState::Rejected) {
            return Err((Some(sl_order_id), format!("SL order was {:?} at the venue", sl_status.state)));
        }

        let tp_request = OrderRequest::take_limit(closing_side, params.quantity, tp_price);
        let tp_order_id = match self.broker.place(symbol, tp_request).await {
            Ok(id) => id,
            Err(e) => return Err((Some(sl_order_id), format!("TP placement failed: {e}"))),
        };

        let tp_status = self
            .broker
            .get_order_state(symbol, &tp_order_id)
            .await
            .map_err(|e| (Some(tp_order_id.clone()), format!("failed to verify TP state: {e}")))?;
        if matches!(tp_status.state, OrderState::Cancelled | OrderState::Rejected) {
            return Err((Some(tp_order_id), format!("TP order was {:?} at the venue", tp_status.state)));
        }

        info!(symbol, %sl_order_id, %tp_order_id, "brackets attached");
        Ok(Brackets { sl_order_id, tp_order_id })
    }

    async fn cleanup_orphan_triggers(&self, symbol: &str, position_exists: bool) -> Result<(), CoreError> {
        if position_exists {
            return Ok(());
        }
        let open_orders = self.broker.get_open_orders(symbol).await.map_err(|e| CoreError::BrokerTransient(e.to_string()))?;
        let orphans: Vec<_> = open_orders.into_iter().filter(|o| o.is_trigger).collect();
        if orphans.is_empty() {
            return Ok(());
        }
        for order in orphans {
            self.cancel_with_retries(symbol, &order.order_id).await;
        }
        tokio::time::sleep(Duration::from_millis(SETTLE_DELAY_MS)).await;
        Ok(())
    }

    async fn cancel_with_retries(&self, symbol: &str, order_id: &str) {
        for attempt in 1..=CANCEL_MAX_RETRIES {
            match self.broker.cancel(symbol, order_id).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(symbol, order_id, attempt, error = %e, "cancel attempt failed");
                    tokio::time::sleep(Duration::from_millis(CANCEL_RETRY_DELAY_MS)).await;
                }
            }
        }
        error!(symbol, order_id, "failed to cancel order after {CANCEL_MAX_RETRIES} retries");
    }

    /// `cancelAllOrders(instrument)` — idempotent with respect to orders
    /// already cancelled.
    pub async fn cancel_all_orders(&self, symbol: &str) -> Result<(), CoreError> {
        let open_orders = self.broker.get_open_orders(symbol).await.map_err(|e| CoreError::BrokerTransient(e.to_string()))?;
        for order in open_orders {
            self.cancel_with_retries(symbol, &order.order_id).await;
        }
        Ok(())
    }

    /// `emergencyClose(side, qty, reason)` — a reduce-only market order in the
    /// opposite direction. Never propagates a transport error as a panic; the
    /// caller is expected to treat a returned `Err` as fatal and escalate via
    /// health.
    pub async fn emergency_close(&self, symbol: &str, position_side: PositionSide, quantity: f64, reason: &str) -> Result<String, CoreError> {
        let closing_side = position_side.closing_side();
        let request = OrderRequest::market(closing_side, quantity, true);
        warn!(symbol, %closing_side, quantity, reason, "emergency close issued");
        self.broker.place(symbol, request).await.map_err(|e| {
            error!(symbol, reason, error = %e, "emergency close failed");
            CoreError::EmergencyCloseFailed(e.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::types::OrderSide;

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

    #[test]
    fn round_to_tick_matches_spec_formula() {
        assert_eq!(round_to_tick(60000.37, 0.5), 60000.5);
        assert_eq!(round_to_tick(60000.1, 0.5), 60000.0);
        assert_eq!(round_to_tick(123.456, 0.0), 123.456);
    }

    #[tokio::test]
    async fn attach_brackets_fails_if_entry_not_filled() {
        let broker = Arc::new(MemoryBroker::new());
        broker.set_instrument(meta());
        let mgr = BracketManager::new(broker.clone(), 10);

        let entry_id = broker.place("BTC-USD-PERP", OrderRequest::stop_market(OrderSide::Buy, 1000.0, 59000.0)).await.unwrap();

        let params = AttachBracketsParams {
            instrument: &meta(),
            entry_order_id: &entry_id,
            side: PositionSide::Long,
            quantity: 1000.0,
            stop: 59400.0,
            take_profit: 61000.0,
        };
        let err = mgr.attach_brackets("BTC-USD-PERP", params, 2).await.unwrap_err();
        assert!(matches!(err, CoreError::BracketPlacementFailed(_)));
    }

    #[tokio::test]
    async fn attach_brackets_succeeds_for_filled_long_entry() {
        let broker = Arc::new(MemoryBroker::new());
        broker.set_instrument(meta());
        broker.set_mark_price("BTC-USD-PERP", 60000.0);
        let mgr = BracketManager::new(broker.clone(), 10);

        let entry_id = broker.place("BTC-USD-PERP", OrderRequest::market(OrderSide::Buy, 1000.0, false)).await.unwrap();

        let params = AttachBracketsParams {
            instrument: &meta(),
            entry_order_id: &entry_id,
            side: PositionSide::Long,
            quantity: 1000.0,
            stop: 59400.0,
            take_profit: 61000.0,
        };
        let brackets = mgr.attach_brackets("BTC-USD-PERP", params, 2).await.unwrap();
        assert!(!brackets.sl_order_id.is_empty());
        assert!(!brackets.tp_order_id.is_empty());

        let sl_status = broker.get_order_state("BTC-USD-PERP", &brackets.sl_order_id).await.unwrap();
        assert_eq!(sl_status.state, OrderState::Open);
    }

    #[tokio::test]
    async fn attach_brackets_fails_if_no_position_exists() {
        let broker = Arc::new(MemoryBroker::new());
        broker.set_instrument(meta());
        let mgr = BracketManager::new(broker.clone(), 10);

        // A reduce-only entry that "fills" but leaves no position (simulates a
        // race where the position closed again before brackets attach).
        let entry_id = broker.place("BTC-USD-PERP", OrderRequest::market(OrderSide::Buy, 1000.0, false)).await.unwrap();
        broker.clear_position("BTC-USD-PERP");

        let params = AttachBracketsParams {
            instrument: &meta(),
            entry_order_id: &entry_id,
            side: PositionSide::Long,
            quantity: 1000.0,
            stop: 59400.0,
            take_profit: 61000.0,
        };
        let err = mgr.attach_brackets("BTC-USD-PERP", params, 2).await.unwrap_err();
        assert!(matches!(err, CoreError::BracketPlacementFailed(_)));
    }

    #[tokio::test]
    async fn emergency_close_issues_reduce_only_opposite_side_order() {
        let broker = Arc::new(MemoryBroker::new());
        broker.set_instrument(meta());
        broker.set_mark_price("BTC-USD-PERP", 59000.0);
        broker.seed_position("BTC-USD-PERP", 1000.0, 60000.0);
        let mgr = BracketManager::new(broker.clone(), 10);

        let order_id = mgr.emergency_close("BTC-USD-PERP", PositionSide::Long, 1000.0, "bracket exhaustion").await.unwrap();
        let status = broker.get_order_state("BTC-USD-PERP", &order_id).await.unwrap();
        assert_eq!(status.state, OrderState::Filled);

        let positions = broker.get_positions("USD").await.unwrap();
        assert!(positions.is_empty());
    }

    #[tokio::test]
    async fn cancel_all_orders_is_idempotent_on_empty_book() {
        let broker = Arc::new(MemoryBroker::new());
        let mgr = BracketManager::new(broker, 10);
        mgr.cancel_all_orders("BTC-USD-PERP").await.unwrap();
    }
}
