// =============================================================================
// Strategy Executor (C7)
// =============================================================================
//
// Owns one user's trading session end to end: warmup, reconciliation,
// candle/tick dispatch, signal sizing, entry, bracket attachment, and exit
// bookkeeping. Generalizes the teacher's `ExecutionEngine::execute_proposal`
// (risk gate, then act) into the full state-machine-driven loop described in
// §4.6, operating through the `Broker` trait instead of a concrete client.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bracket::{AttachBracketsParams, BracketManager};
use crate::broker::Broker;
use crate::config::DaemonConfig;
use crate::error::CoreError;
use crate::history::{ExitReason, TradeHistoryStore, TradeRecord};
use crate::lifecycle::LifecycleManager;
use crate::reconcile::ReconciliationEngine;
use crate::risk::breaker::RiskBreaker;
use crate::risk::sizer::{size_position, SizingInput};
use crate::strategy::Strategy;
use crate::types::{Candle, OrderRequest, OrderSide, OrderState, SignalKind, Tick};

/// Consecutive transient-tick-error threshold before the executor escalates
/// to a fatal stop (§4.6: "Persistent errors (N consecutive over T seconds)
/// escalate to ERROR state and stop").
const MAX_CONSECUTIVE_TICK_ERRORS: u32 = 10;

/// Candle timeframe the executor aggregates ticks into and warms up against
/// (§4.6: "subscribe to ticker stream; for each new closed candle feed
/// on_candle"). A real deployment would source this per strategy instance;
/// one fixed timeframe is enough for the single shipped reference strategy.
const TIMEFRAME: &str = "5m";

fn timeframe_ms(timeframe: &str) -> i64 {
    let (digits, unit) = timeframe.split_at(timeframe.len().saturating_sub(1));
    let n: i64 = digits.parse().unwrap_or(5);
    match unit {
        "h" => n * 3_600_000,
        "d" => n * 86_400_000,
        _ => n * 60_000,
    }
}

/// Buckets the tick stream into fixed-width candles so a `Strategy` that only
/// trusts candle closes still sees them during live operation, not just
/// during warmup. Mirrors the bucketing the broker's own kline endpoint does
/// server-side, done here against whatever ticks `subscribe_ticker` hands us.
struct CandleAggregator {
    bucket_ms: i64,
    current: Option<Candle>,
}

impl CandleAggregator {
    fn new(bucket_ms: i64) -> Self {
        Self { bucket_ms, current: None }
    }

    /// Feeds one tick. Returns the candle that just closed if this tick
    /// belongs to a new bucket.
    fn on_tick(&mut self, tick: &Tick) -> Option<Candle> {
        let bucket_start = (tick.timestamp_ms / self.bucket_ms) * self.bucket_ms;
        let fresh = || Candle {
            open_time: bucket_start,
            close_time: bucket_start + self.bucket_ms - 1,
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            volume: 0.0,
        };
        match self.current {
            Some(ref mut candle) if candle.open_time == bucket_start => {
                candle.high = candle.high.max(tick.price);
                candle.low = candle.low.min(tick.price);
                candle.close = tick.price;
                None
            }
            Some(candle) => {
                self.current = Some(fresh());
                Some(candle)
            }
            None => {
                self.current = Some(fresh());
                None
            }
        }
    }
}

pub struct Executor {
    pub strategy_name: String,
    pub instrument: String,
    broker: Arc<dyn Broker>,
    history: Arc<dyn TradeHistoryStore>,
    lifecycle: Arc<LifecycleManager>,
    reconciler: ReconciliationEngine,
    bracket_manager: BracketManager,
    risk_breaker: Arc<RiskBreaker>,
    strategy: Box<dyn Strategy>,
    config: DaemonConfig,
    stop_rx: watch::Receiver<StopMode>,
}

/// What the executor should do once it observes a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopMode {
    Running,
    Stop,
    /// Stop and, if a position is open, emergency-close it first (§6
    /// `force=true` on `POST /strategy/stop`).
    StopAndFlatten,
}

pub struct ExecutorHandle {
    stop_tx: watch::Sender<StopMode>,
}

impl ExecutorHandle {
    /// Cooperative stop: sets the cancel flag; the executor finishes the
    /// current atomic step before exiting the loop (§5). `flatten=true`
    /// asks the executor to emergency-close any open position before it
    /// exits rather than leaving it for the next reconciliation pass.
    pub fn stop(&self, flatten: bool) {
        let mode = if flatten { StopMode::StopAndFlatten } else { StopMode::Stop };
        let _ = self.stop_tx.send(mode);
    }
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        strategy_name: impl Into<String>,
        instrument: impl Into<String>,
        broker: Arc<dyn Broker>,
        history: Arc<dyn TradeHistoryStore>,
        lifecycle: Arc<LifecycleManager>,
        risk_breaker: Arc<RiskBreaker>,
        strategy: Box<dyn Strategy>,
        config: DaemonConfig,
    ) -> (Self, ExecutorHandle) {
        let (stop_tx, stop_rx) = watch::channel(StopMode::Running);
        let reconciler = ReconciliationEngine::new(broker.clone(), history.clone(), config.reconcile_auto_action);
        let bracket_manager = BracketManager::new(broker.clone(), config.bracket_backoff_base_ms);
        let executor = Self {
            strategy_name: strategy_name.into(),
            instrument: instrument.into(),
            broker,
            history,
            lifecycle,
            reconciler,
            bracket_manager,
            risk_breaker,
            strategy,
            config,
            stop_rx,
        };
        (executor, ExecutorHandle { stop_tx })
    }

    fn stop_mode(&self) -> StopMode {
        *self.stop_rx.borrow()
    }

    /// Main loop (§4.6, steps 1-6). Runs until a stop request arrives or a
    /// fatal error occurs.
    pub async fn run(&mut self) -> Result<(), CoreError> {
        let instrument_meta = self
            .broker
            .get_instrument(&self.instrument)
            .await
            .map_err(|e| CoreError::BrokerTransient(e.to_string()))?;

        let warmup = self
            .broker
            .get_candles(&self.instrument, TIMEFRAME, self.strategy.required_warmup() as u32)
            .await
            .map_err(|e| CoreError::BrokerTransient(e.to_string()))?;
        for candle in warmup {
            self.strategy.on_candle(candle);
        }

        self.reconciler.reconcile(&self.lifecycle, &self.strategy_name, &self.instrument).await?;

        let mut ticker = self
            .broker
            .subscribe_ticker(&self.instrument)
            .await
            .map_err(|e| CoreError::BrokerTransient(e.to_string()))?;

        let mut candles = CandleAggregator::new(timeframe_ms(TIMEFRAME));
        let mut consecutive_tick_errors = 0u32;

        loop {
            match self.stop_mode() {
                StopMode::Running => {}
                StopMode::Stop => {
                    info!(instrument = %self.instrument, "executor received stop request, exiting main loop");
                    return Ok(());
                }
                StopMode::StopAndFlatten => {
                    info!(instrument = %self.instrument, "executor received force-stop request, flattening before exit");
                    self.flatten_open_position().await;
                    return Ok(());
                }
            }

            let tick = tokio::select! {
                biased;
                _ = self.stop_rx.changed() => {
                    if self.stop_mode() == StopMode::StopAndFlatten {
                        info!(instrument = %self.instrument, "executor force-stop observed during tick wait, flattening before exit");
                        self.flatten_open_position().await;
                    } else {
                        info!(instrument = %self.instrument, "executor stop observed during tick wait");
                    }
                    return Ok(());
                }
                tick = ticker.next() => tick,
            };

            let Some(tick) = tick else {
                warn!(instrument = %self.instrument, "ticker stream ended");
                return Ok(());
            };

            // Feed the candle close first so indicators stay current even
            // while a position is open, the way the candle stream would keep
            // updating regardless of what the strategy decides to do with it.
            let candle_signal = candles.on_tick(&tick).map(|closed| self.strategy.on_candle(closed));

            if self.lifecycle.snapshot().lifecycle == crate::lifecycle::Lifecycle::PositionOpen {
                if let Err(e) = self.check_position_still_open().await {
                    consecutive_tick_errors += 1;
                    warn!(instrument = %self.instrument, error = %e, consecutive_tick_errors, "transient error while checking open position");
                    if consecutive_tick_errors >= MAX_CONSECUTIVE_TICK_ERRORS {
                        error!(instrument = %self.instrument, "persistent tick errors, stopping executor");
                        return Err(e);
                    }
                    continue;
                }
                consecutive_tick_errors = 0;
                continue;
            }

            let tick_signal = self.strategy.on_tick(tick);
            let signal = match candle_signal {
                Some(s) if s.kind != SignalKind::None => s,
                _ => tick_signal,
            };
            if self.lifecycle.should_analyze() && signal.kind != SignalKind::None {
                if let Err(e) = self.handle_signal(&instrument_meta, signal).await {
                    warn!(instrument = %self.instrument, error = %e, "signal handling failed");
                }
            }
        }
    }

    async fn handle_signal(&mut self, instrument_meta: &crate::types::InstrumentMeta, signal: crate::types::Signal) -> Result<(), CoreError> {
        self.lifecycle.on_signal_detected()?;

        let balance = self.broker.get_balance(&instrument_meta.quote_currency).await.map_err(|e| CoreError::BrokerTransient(e.to_string()))?;

        if let Some(reason) = self.risk_breaker.can_trade().1 {
            info!(instrument = %self.instrument, reason, "risk breaker blocked signal, returning to analyzing");
            self.lifecycle.force_lifecycle(crate::lifecycle::Lifecycle::Analyzing, "risk_breaker_blocked")?;
            return Ok(());
        }

        let sizing = size_position(
            SizingInput {
                equity: balance.equity,
                available: balance.available,
                risk_mode: self.config.risk_mode,
                risk_value: self.config.risk_value,
                entry: signal.entry,
                stop: signal.stop,
                max_leverage_cap: self.config.max_leverage_cap,
                leverage_warn_threshold: self.config.leverage_warn_threshold,
            },
            instrument_meta,
        );

        let sizing = match sizing {
            Ok(s) => s,
            Err(e) => {
                info!(instrument = %self.instrument, error = %e, "sizing rejected signal, cooldown before next analysis");
                self.lifecycle.force_lifecycle(crate::lifecycle::Lifecycle::Analyzing, "sizing_rejected")?;
                tokio::time::sleep(Duration::from_millis(self.config.signal_cooldown_ms)).await;
                return Ok(());
            }
        };
        if let Some(warning) = &sizing.warning {
            warn!(instrument = %self.instrument, leverage = warning.leverage, "leverage above warn threshold but within cap");
        }

        self.lifecycle.on_entering_position()?;

        let side = signal.position_side().unwrap_or(crate::types::PositionSide::Long);
        let order_side = match side {
            crate::types::PositionSide::Long => OrderSide::Buy,
            crate::types::PositionSide::Short => OrderSide::Sell,
        };
        let entry_order_id = self
            .broker
            .place(&self.instrument, OrderRequest::market(order_side, sizing.quantity, false))
            .await
            .map_err(|e| CoreError::BrokerTransient(e.to_string()))?;

        let fill = self.poll_until_filled(&entry_order_id).await?;

        self.lifecycle.on_position_opened(fill.average_price, sizing.quantity, side)?;

        let record = TradeRecord::open(Uuid::new_v4().to_string(), &self.strategy_name, &self.instrument, side, &entry_order_id, fill.average_price, sizing.quantity, signal.stop, signal.take_profit);
        let trade_id = record.id.clone();
        self.history.add(record).await.map_err(|e| CoreError::BrokerTransient(e.to_string()))?;

        let brackets = self
            .bracket_manager
            .attach_brackets(
                &self.instrument,
                AttachBracketsParams { instrument: instrument_meta, entry_order_id: &entry_order_id, side, quantity: sizing.quantity, stop: signal.stop, take_profit: signal.take_profit },
                self.config.bracket_max_retries,
            )
            .await;

        match brackets {
            Ok(brackets) => {
                self.history
                    .update(&trade_id, crate::history::TradeRecordPatch { sl_order_id: Some(Some(brackets.sl_order_id)), tp_order_id: Some(Some(brackets.tp_order_id)) })
                    .await
                    .map_err(|e| CoreError::BrokerTransient(e.to_string()))?;
                Ok(())
            }
            Err(e) => {
                error!(instrument = %self.instrument, error = %e, "bracket placement failed, emergency closing");
                match self.bracket_manager.emergency_close(&self.instrument, side, sizing.quantity, "bracket_placement_failed").await {
                    Ok(_) => {
                        self.history.close_trade(&trade_id, fill.average_price, ExitReason::Error).await.ok();
                        self.lifecycle.force_lifecycle(crate::lifecycle::Lifecycle::Idle, "emergency_close_after_bracket_failure")?;
                        Err(e)
                    }
                    Err(close_err) => {
                        error!(instrument = %self.instrument, error = %close_err, "emergency close also failed, user flagged degraded");
                        self.lifecycle.record_error();
                        self.lifecycle.force_lifecycle(crate::lifecycle::Lifecycle::Idle, "degraded_emergency_close_failed")?;
                        Err(close_err)
                    }
                }
            }
        }
    }

    async fn poll_until_filled(&self, order_id: &str) -> Result<crate::types::OrderStatus, CoreError> {
        let start = tokio::time::Instant::now();
        let timeout = Duration::from_millis(self.config.order_fill_timeout_ms);
        let mut delay_ms = 200u64;
        loop {
            let status = self.broker.get_order_state(&self.instrument, order_id).await.map_err(|e| CoreError::BrokerTransient(e.to_string()))?;
            if status.state == OrderState::Filled {
                return Ok(status);
            }
            if start.elapsed() >= timeout {
                let _ = self.broker.cancel(&self.instrument, order_id).await;
                return Err(CoreError::OrderFillTimeout);
            }
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            delay_ms = (delay_ms * 2).min(5_000);
        }
    }

    async fn check_position_still_open(&mut self) -> Result<(), CoreError> {
        let positions = self.broker.get_positions(&self.instrument).await.map_err(|e| CoreError::BrokerTransient(e.to_string()))?;
        let still_open = positions.iter().any(|p| p.instrument == self.instrument && p.size != 0.0);
        if still_open {
            return Ok(());
        }

        self.lifecycle.on_position_closing()?;

        let open_trades = self
            .history
            .query(&crate::history::TradeQuery { strategy_name: Some(self.strategy_name.clone()), instrument: Some(self.instrument.clone()), status: Some(crate::history::TradeStatus::Open), ..Default::default() })
            .await
            .map_err(|e| CoreError::BrokerTransient(e.to_string()))?;

        if let Some(trade) = open_trades.into_iter().next() {
            if let Some(sl) = &trade.sl_order_id {
                let _ = self.broker.cancel(&self.instrument, sl).await;
            }
            if let Some(tp) = &trade.tp_order_id {
                let _ = self.broker.cancel(&self.instrument, tp).await;
            }
            let exit_price = self.last_mark_price().await.unwrap_or(trade.entry_price);
            let reason = self.infer_exit_reason(&trade, exit_price);
            self.history.close_trade(&trade.id, exit_price, reason).await.map_err(|e| CoreError::BrokerTransient(e.to_string()))?;
            self.risk_breaker.record_trade_result(self.history.get(&trade.id).await.ok().flatten().and_then(|r| r.pnl).unwrap_or(0.0));
        }

        self.lifecycle.on_position_closed()?;
        Ok(())
    }

    /// Best-effort emergency close of the current position on a forced stop.
    /// Never propagates an error — a failed flatten still has to let the
    /// executor exit so the task doesn't become un-stoppable; reconciliation
    /// picks up whatever is left on the next startup.
    async fn flatten_open_position(&mut self) {
        let snapshot = self.lifecycle.snapshot();
        if snapshot.lifecycle != crate::lifecycle::Lifecycle::PositionOpen {
            return;
        }
        let (Some(side), Some(size)) = (snapshot.position_side, snapshot.position_size) else {
            return;
        };

        let open_trades = self
            .history
            .query(&crate::history::TradeQuery { strategy_name: Some(self.strategy_name.clone()), instrument: Some(self.instrument.clone()), status: Some(crate::history::TradeStatus::Open), ..Default::default() })
            .await
            .unwrap_or_default();

        if let Some(trade) = open_trades.into_iter().next() {
            if let Some(sl) = &trade.sl_order_id {
                let _ = self.broker.cancel(&self.instrument, sl).await;
            }
            if let Some(tp) = &trade.tp_order_id {
                let _ = self.broker.cancel(&self.instrument, tp).await;
            }
            match self.bracket_manager.emergency_close(&self.instrument, side, size, "operator_force_stop").await {
                Ok(_) => {
                    let exit_price = self.last_mark_price().await.unwrap_or(trade.entry_price);
                    let _ = self.history.close_trade(&trade.id, exit_price, ExitReason::Manual).await;
                }
                Err(e) => {
                    error!(instrument = %self.instrument, error = %e, "force-stop emergency close failed, leaving position for reconciliation");
                }
            }
        }

        let _ = self.lifecycle.force_lifecycle(crate::lifecycle::Lifecycle::Idle, "force_stop_flatten");
    }

    fn infer_exit_reason(&self, trade: &TradeRecord, exit_price: f64) -> ExitReason {
        match trade.side {
            crate::types::PositionSide::Long => {
                if exit_price <= trade.stop_loss {
                    ExitReason::SlHit
                } else {
                    ExitReason::TpHit
                }
            }
            crate::types::PositionSide::Short => {
                if exit_price >= trade.stop_loss {
                    ExitReason::SlHit
                } else {
                    ExitReason::TpHit
                }
            }
        }
    }

    async fn last_mark_price(&self) -> Option<f64> {
        self.broker.get_positions(&self.instrument).await.ok()?.into_iter().find(|p| p.instrument == self.instrument).map(|p| p.mark_price)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::broker::memory::MemoryBroker;
    use crate::history::{memory::MemoryTradeHistoryStore, TradeHistoryStore, TradeQuery, TradeRecord, TradeStatus};
    use crate::lifecycle::{store::StateStore, Lifecycle, LifecycleManager, StrategyState};
    use crate::risk::breaker::RiskBreaker;
    use crate::strategy::TripleEmaAtr;
    use crate::types::PositionSide;

    use super::*;

    const INSTRUMENT: &str = "BTC-USD-PERP";

    fn make_executor() -> (Executor, ExecutorHandle, Arc<LifecycleManager>, Arc<MemoryTradeHistoryStore>) {
        let broker = Arc::new(MemoryBroker::new());
        let history = Arc::new(MemoryTradeHistoryStore::new());
        let lifecycle = Arc::new(LifecycleManager::new(StateStore::ephemeral(), StrategyState::idle()));
        let breaker = Arc::new(RiskBreaker::new(10_000.0, 3.0, 5, 6.0, 50));
        let (executor, handle) =
            Executor::new("razor", INSTRUMENT, broker, history.clone(), lifecycle.clone(), breaker, Box::new(TripleEmaAtr::new()), DaemonConfig::default());
        (executor, handle, lifecycle, history)
    }

    /// Drives a lifecycle from Idle all the way to PositionOpen, the way
    /// `handle_signal` does, so tests can exercise post-entry behavior
    /// without running the full tick loop.
    async fn open_position(lifecycle: &LifecycleManager, history: &MemoryTradeHistoryStore, side: PositionSide) -> String {
        lifecycle.start_strategy("razor", INSTRUMENT).unwrap();
        lifecycle.on_signal_detected().unwrap();
        lifecycle.on_entering_position().unwrap();
        lifecycle.on_position_opened(60_000.0, 1.0, side).unwrap();

        let record = TradeRecord::open(uuid::Uuid::new_v4().to_string(), "razor", INSTRUMENT, side, "entry-1", 60_000.0, 1.0, 58_000.0, 63_000.0);
        let trade_id = record.id.clone();
        history.add(record).await.unwrap();
        trade_id
    }

    #[tokio::test]
    async fn stop_without_flatten_leaves_position_untouched() {
        let (mut executor, handle, lifecycle, history) = make_executor();
        let trade_id = open_position(&lifecycle, &history, PositionSide::Long).await;

        handle.stop(false);
        executor.flatten_open_position().await;

        assert_eq!(lifecycle.snapshot().lifecycle, Lifecycle::PositionOpen);
        let trade = history.get(&trade_id).await.unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Open);
    }

    #[tokio::test]
    async fn force_stop_flattens_open_position_and_closes_trade() {
        let (mut executor, handle, lifecycle, history) = make_executor();
        let trade_id = open_position(&lifecycle, &history, PositionSide::Long).await;

        handle.stop(true);
        executor.flatten_open_position().await;

        assert_eq!(lifecycle.snapshot().lifecycle, Lifecycle::Idle);
        let trade = history.get(&trade_id).await.unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Closed);
        assert_eq!(trade.exit_reason, Some(ExitReason::Manual));

        let still_open = history
            .query(&TradeQuery { strategy_name: Some("razor".to_string()), instrument: Some(INSTRUMENT.to_string()), status: Some(TradeStatus::Open), ..Default::default() })
            .await
            .unwrap();
        assert!(still_open.is_empty());
    }

    #[tokio::test]
    async fn flatten_is_a_no_op_when_no_position_is_open() {
        let (mut executor, _handle, lifecycle, _history) = make_executor();
        executor.flatten_open_position().await;
        assert_eq!(lifecycle.snapshot().lifecycle, Lifecycle::Idle);
    }

    #[test]
    fn handle_stop_sets_flatten_mode() {
        let (executor, handle) = Executor::new(
            "razor",
            INSTRUMENT,
            Arc::new(MemoryBroker::new()),
            Arc::new(MemoryTradeHistoryStore::new()),
            Arc::new(LifecycleManager::new(StateStore::ephemeral(), StrategyState::idle())),
            Arc::new(RiskBreaker::new(10_000.0, 3.0, 5, 6.0, 50)),
            Box::new(TripleEmaAtr::new()),
            DaemonConfig::default(),
        );
        handle.stop(true);
        assert_eq!(executor.stop_mode(), StopMode::StopAndFlatten);

        handle.stop(false);
        assert_eq!(executor.stop_mode(), StopMode::Stop);
    }
}
