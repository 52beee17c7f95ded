// =============================================================================
// Reconciliation Engine (C6)
// =============================================================================
//
// REDESIGN: the predecessor of this module logged drift but never touched
// broker state, leaving discrepancies for a human operator to resolve. That
// posture fit a spot bot with a human always watching; it is wrong for a
// 24/7 unattended daemon. This engine now actively closes ghosts, adopts
// orphans, and forces the lifecycle to match venue truth — see §4.5 and the
// REDESIGN FLAGS section this was distilled from. `reconcile_auto_action`
// in DaemonConfig is the escape hatch back to log-only behavior.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::bracket::BracketManager;
use crate::broker::Broker;
use crate::error::CoreError;
use crate::history::{ExitReason, TradeHistoryStore, TradeQuery, TradeStatus};
use crate::lifecycle::{Lifecycle, LifecycleManager};
use crate::types::PositionSide;

/// Outcome of a single reconciliation case, one per (user, strategy, instrument).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconcileOutcome {
    Valid,
    Ghost,
    Orphan,
    Clean,
}

/// Summary of one reconciliation pass, surfaced via health/metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileResult {
    pub outcome: ReconcileOutcome,
    pub instrument: String,
    pub timestamp: String,
}

/// Runs on startup and on each executor heartbeat for one user's strategy.
pub struct ReconciliationEngine {
    broker: Arc<dyn Broker>,
    history: Arc<dyn TradeHistoryStore>,
    auto_action: bool,
}

impl ReconciliationEngine {
    pub fn new(broker: Arc<dyn Broker>, history: Arc<dyn TradeHistoryStore>, auto_action: bool) -> Self {
        Self { broker, history, auto_action }
    }

    /// Reconciles one (strategy, instrument) pair against venue truth. Must
    /// complete within the caller's recovery window (§5): this call makes a
    /// bounded number of broker RPCs and never loops indefinitely.
    pub async fn reconcile(
        &self,
        lifecycle: &LifecycleManager,
        strategy_name: &str,
        instrument: &str,
    ) -> Result<ReconcileResult, CoreError> {
        let db_open = self
            .history
            .query(&TradeQuery { strategy_name: Some(strategy_name.to_string()), instrument: Some(instrument.to_string()), status: Some(TradeStatus::Open), ..Default::default() })
            .await
            .map_err(|e| CoreError::BrokerTransient(e.to_string()))?
            .into_iter()
            .next();

        let positions = self.broker.get_positions(instrument).await.map_err(|e| CoreError::BrokerTransient(e.to_string()))?;
        let broker_position = positions.into_iter().find(|p| p.instrument == instrument && p.size != 0.0);

        let outcome = match (&db_open, &broker_position) {
            (Some(_), Some(_)) => ReconcileOutcome::Valid,
            (Some(_), None) => ReconcileOutcome::Ghost,
            (None, Some(_)) => ReconcileOutcome::Orphan,
            (None, None) => ReconcileOutcome::Clean,
        };

        if !self.auto_action && outcome != ReconcileOutcome::Valid {
            warn!(instrument, ?outcome, "reconciliation drift detected, auto-action disabled: leaving for operator");
            return Ok(ReconcileResult { outcome, instrument: instrument.to_string(), timestamp: Utc::now().to_rfc3339() });
        }

        match outcome {
            ReconcileOutcome::Valid => self.handle_valid(lifecycle, db_open.unwrap(), broker_position.unwrap()).await?,
            ReconcileOutcome::Ghost => self.handle_ghost(lifecycle, instrument, db_open.unwrap()).await?,
            ReconcileOutcome::Orphan => self.handle_orphan(lifecycle, strategy_name, instrument, broker_position.unwrap()).await?,
            ReconcileOutcome::Clean => self.handle_clean(lifecycle, strategy_name).await?,
        }

        Ok(ReconcileResult { outcome, instrument: instrument.to_string(), timestamp: Utc::now().to_rfc3339() })
    }

    async fn handle_valid(
        &self,
        lifecycle: &LifecycleManager,
        db_open: crate::history::TradeRecord,
        broker_position: crate::types::BrokerPosition,
    ) -> Result<(), CoreError> {
        if (db_open.entry_price - broker_position.average_price).abs() > f64::EPSILON || (db_open.amount - broker_position.size.abs()).abs() > f64::EPSILON {
            warn!(
                instrument = %db_open.instrument,
                db_entry = db_open.entry_price,
                broker_entry = broker_position.average_price,
                db_amount = db_open.amount,
                broker_amount = broker_position.size,
                "valid position drifted from broker truth, adopting broker values"
            );
        }
        if lifecycle.snapshot().lifecycle != Lifecycle::PositionOpen {
            lifecycle.force_lifecycle(Lifecycle::PositionOpen, "reconcile_valid")?;
        }
        Ok(())
    }

    async fn handle_ghost(&self, lifecycle: &LifecycleManager, instrument: &str, db_open: crate::history::TradeRecord) -> Result<(), CoreError> {
        let exit_price = self.last_known_price(instrument, db_open.entry_price).await;
        warn!(instrument, trade_id = %db_open.id, exit_price, "ghost position: closing trade record and cancelling dangling triggers");

        if let Some(sl) = &db_open.sl_order_id {
            let _ = self.broker.cancel(instrument, sl).await;
        }
        if let Some(tp) = &db_open.tp_order_id {
            let _ = self.broker.cancel(instrument, tp).await;
        }

        self.history
            .close_trade(&db_open.id, exit_price, ExitReason::AutoClosedOrphan)
            .await
            .map_err(|e| CoreError::BrokerTransient(e.to_string()))?;

        lifecycle.force_lifecycle(Lifecycle::Analyzing, "reconcile_ghost")?;
        Ok(())
    }

    async fn handle_orphan(
        &self,
        lifecycle: &LifecycleManager,
        strategy_name: &str,
        instrument: &str,
        broker_position: crate::types::BrokerPosition,
    ) -> Result<(), CoreError> {
        let side = broker_position.side().unwrap_or(PositionSide::Long);
        info!(instrument, side = %side, size = broker_position.size, "orphan position adopted from broker, brackets will be attached on next cycle");

        let record = crate::history::TradeRecord::open(
            Uuid::new_v4().to_string(),
            strategy_name,
            instrument,
            side,
            "adopted-orphan",
            broker_position.average_price,
            broker_position.size.abs(),
            0.0,
            0.0,
        );
        self.history.add(record).await.map_err(|e| CoreError::BrokerTransient(e.to_string()))?;

        lifecycle.force_lifecycle(Lifecycle::PositionOpen, "reconcile_orphan")?;
        Ok(())
    }

    async fn handle_clean(&self, lifecycle: &LifecycleManager, strategy_name: &str) -> Result<(), CoreError> {
        let target = if strategy_name.is_empty() { Lifecycle::Idle } else { Lifecycle::Analyzing };
        if lifecycle.snapshot().lifecycle != target {
            lifecycle.force_lifecycle(target, "reconcile_clean")?;
        }
        Ok(())
    }

    /// Best-effort exit price for a ghost close: last ticker price if the
    /// broker still quotes the instrument, falling back to the entry price
    /// so a PnL of zero is recorded rather than a spurious number.
    async fn last_known_price(&self, instrument: &str, fallback: f64) -> f64 {
        match self.broker.get_positions(instrument).await {
            Ok(positions) => positions.into_iter().find(|p| p.instrument == instrument).map(|p| p.mark_price).unwrap_or(fallback),
            Err(_) => fallback,
        }
    }
}

/// Invoked from the executor's main loop immediately after an orphan adoption
/// to trigger the next bracket attempt, rather than waiting for the next
/// heartbeat (§4.5: "triggered immediately").
pub async fn trigger_bracket_attempt_for_orphan(
    bracket_manager: &BracketManager,
    instrument_meta: &crate::types::InstrumentMeta,
    entry_order_id: &str,
    side: PositionSide,
    quantity: f64,
    stop: f64,
    take_profit: f64,
) -> Result<crate::bracket::Brackets, CoreError> {
    bracket_manager
        .attach_brackets(
            &instrument_meta.symbol,
            crate::bracket::AttachBracketsParams { instrument: instrument_meta, entry_order_id, side, quantity, stop, take_profit },
            2,
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::history::memory::MemoryTradeHistoryStore;
    use crate::lifecycle::store::StateStore;
    use crate::lifecycle::StrategyState;
    use crate::types::OrderRequest;

    fn lifecycle_mgr() -> LifecycleManager {
        LifecycleManager::new(StateStore::ephemeral(), StrategyState::idle())
    }

    #[tokio::test]
    async fn clean_case_sets_idle_when_no_strategy_active() {
        let broker = Arc::new(MemoryBroker::new());
        let history = Arc::new(MemoryTradeHistoryStore::new());
        let engine = ReconciliationEngine::new(broker, history, true);
        let lifecycle = lifecycle_mgr();

        let result = engine.reconcile(&lifecycle, "", "BTC-USD-PERP").await.unwrap();
        assert_eq!(result.outcome, ReconcileOutcome::Clean);
        assert_eq!(lifecycle.snapshot().lifecycle, Lifecycle::Idle);
    }

    #[tokio::test]
    async fn ghost_case_closes_trade_record_and_cancels_triggers() {
        let broker = Arc::new(MemoryBroker::new());
        let history = Arc::new(MemoryTradeHistoryStore::new());

        let record = crate::history::TradeRecord::open("t1", "razor", "ETH-USD-PERP", PositionSide::Long, "e1", 3000.0, 1000.0, 2940.0, 3120.0);
        history.add(record).await.unwrap();

        let engine = ReconciliationEngine::new(broker, history.clone(), true);
        let lifecycle = lifecycle_mgr();
        lifecycle.force_lifecycle(Lifecycle::PositionOpen, "test_setup").unwrap();

        let result = engine.reconcile(&lifecycle, "razor", "ETH-USD-PERP").await.unwrap();
        assert_eq!(result.outcome, ReconcileOutcome::Ghost);

        let closed = history.get("t1").await.unwrap().unwrap();
        assert_eq!(closed.status, TradeStatus::Closed);
        assert_eq!(closed.exit_reason, Some(ExitReason::AutoClosedOrphan));
        assert_eq!(lifecycle.snapshot().lifecycle, Lifecycle::Analyzing);
    }

    #[tokio::test]
    async fn orphan_case_adopts_position_without_synthesizing_brackets() {
        let broker = Arc::new(MemoryBroker::new());
        broker.seed_position("BTC-USD-PERP", 1000.0, 58000.0);
        let history = Arc::new(MemoryTradeHistoryStore::new());

        let engine = ReconciliationEngine::new(broker, history.clone(), true);
        let lifecycle = lifecycle_mgr();

        let result = engine.reconcile(&lifecycle, "razor", "BTC-USD-PERP").await.unwrap();
        assert_eq!(result.outcome, ReconcileOutcome::Orphan);
        assert_eq!(lifecycle.snapshot().lifecycle, Lifecycle::PositionOpen);

        let open_trades = history.query(&TradeQuery { status: Some(TradeStatus::Open), ..Default::default() }).await.unwrap();
        assert_eq!(open_trades.len(), 1);
        assert!(open_trades[0].sl_order_id.is_none());
        assert!(open_trades[0].tp_order_id.is_none());
    }

    #[tokio::test]
    async fn valid_case_forces_position_open_lifecycle() {
        let broker = Arc::new(MemoryBroker::new());
        broker.seed_position("BTC-USD-PERP", 1000.0, 60000.0);
        let history = Arc::new(MemoryTradeHistoryStore::new());
        let record = crate::history::TradeRecord::open("t1", "razor", "BTC-USD-PERP", PositionSide::Long, "e1", 60000.0, 1000.0, 59400.0, 61200.0);
        history.add(record).await.unwrap();

        let engine = ReconciliationEngine::new(broker, history, true);
        let lifecycle = lifecycle_mgr();

        let result = engine.reconcile(&lifecycle, "razor", "BTC-USD-PERP").await.unwrap();
        assert_eq!(result.outcome, ReconcileOutcome::Valid);
        assert_eq!(lifecycle.snapshot().lifecycle, Lifecycle::PositionOpen);
    }

    #[tokio::test]
    async fn auto_action_disabled_leaves_drift_for_operator() {
        let broker = Arc::new(MemoryBroker::new());
        let history = Arc::new(MemoryTradeHistoryStore::new());
        let record = crate::history::TradeRecord::open("t1", "razor", "ETH-USD-PERP", PositionSide::Long, "e1", 3000.0, 1000.0, 2940.0, 3120.0);
        history.add(record).await.unwrap();

        let engine = ReconciliationEngine::new(broker, history.clone(), false);
        let lifecycle = lifecycle_mgr();
        lifecycle.force_lifecycle(Lifecycle::PositionOpen, "test_setup").unwrap();

        engine.reconcile(&lifecycle, "razor", "ETH-USD-PERP").await.unwrap();

        let still_open = history.get("t1").await.unwrap().unwrap();
        assert_eq!(still_open.status, TradeStatus::Open);
        assert_eq!(lifecycle.snapshot().lifecycle, Lifecycle::PositionOpen);
        let _ = OrderRequest::market(crate::types::OrderSide::Buy, 1.0, false);
    }
}
