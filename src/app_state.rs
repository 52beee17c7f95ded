// =============================================================================
// Central Application State
// =============================================================================
//
// The single source of truth tying together the orchestrator, per-user
// lifecycle managers, the trade history store, risk breakers, and process
// metrics. Kept as a thin composition root — subsystems own their own
// interior mutability, `AppState` just makes them reachable from the API
// layer, generalizing the teacher's single-process `AppState` into a
// per-user-keyed structure.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::broker::Broker;
use crate::config::DaemonConfig;
use crate::error::CoreError;
use crate::executor::Executor;
use crate::health::Metrics;
use crate::history::TradeHistoryStore;
use crate::lifecycle::{store::StateStore, LifecycleManager, StrategyState};
use crate::orchestrator::{ExecutorFactory, Orchestrator, OrchestratorLimits, WorkerJob};
use crate::risk::breaker::RiskBreaker;
use crate::strategy::TripleEmaAtr;

pub struct AppState {
    pub config: Arc<RwLock<DaemonConfig>>,
    pub orchestrator: Orchestrator,
    pub broker: Arc<dyn Broker>,
    pub history: Arc<dyn TradeHistoryStore>,
    pub metrics: Metrics,
    /// One lifecycle manager per (user_id, strategy_name, instrument) key, so
    /// the API layer can answer `GET /strategy/status/:id` without routing
    /// through a running executor. Shared with the orchestrator's executor
    /// factory, which looks a job's lifecycle up by the same key once it is
    /// dispatched off the queue.
    pub lifecycles: Arc<RwLock<HashMap<String, Arc<LifecycleManager>>>>,
    /// One risk breaker per user — circuit-breaker state is per-account, not
    /// per-strategy. Also shared with the executor factory.
    pub risk_breakers: Arc<RwLock<HashMap<String, Arc<RiskBreaker>>>>,
    /// Maps the stable lifecycle key (the public "strategy_id") to the
    /// orchestrator's internal worker id, so `POST /strategy/stop` can find
    /// the running task by the id the client was handed on start.
    workers: RwLock<HashMap<String, String>>,
}

impl AppState {
    pub fn new(config: DaemonConfig, broker: Arc<dyn Broker>, history: Arc<dyn TradeHistoryStore>) -> Self {
        let config = Arc::new(RwLock::new(config));
        let lifecycles: Arc<RwLock<HashMap<String, Arc<LifecycleManager>>>> = Arc::new(RwLock::new(HashMap::new()));
        let risk_breakers: Arc<RwLock<HashMap<String, Arc<RiskBreaker>>>> = Arc::new(RwLock::new(HashMap::new()));
        let factory = build_executor_factory(broker.clone(), history.clone(), config.clone(), lifecycles.clone(), risk_breakers.clone());

        Self {
            orchestrator: Orchestrator::new(OrchestratorLimits { max_workers_per_user: 3 }, factory),
            config,
            broker,
            history,
            metrics: Metrics::new(),
            lifecycles,
            risk_breakers,
            workers: RwLock::new(HashMap::new()),
        }
    }

    pub fn lifecycle_key(user_id: &str, strategy_name: &str, instrument: &str) -> String {
        format!("{user_id}:{strategy_name}:{instrument}")
    }

    pub fn lifecycle_for(&self, key: &str) -> Option<Arc<LifecycleManager>> {
        self.lifecycles.read().get(key).cloned()
    }

    pub fn risk_breaker_for(&self, user_id: &str) -> Arc<RiskBreaker> {
        if let Some(existing) = self.risk_breakers.read().get(user_id) {
            return existing.clone();
        }
        let cfg = self.config.read();
        let breaker = Arc::new(RiskBreaker::new(10_000.0, cfg.max_daily_loss_pct, cfg.max_consecutive_losses, cfg.max_drawdown_pct, cfg.max_trades_per_day));
        self.risk_breakers.write().insert(user_id.to_string(), breaker.clone());
        breaker
    }

    /// Registers the lifecycle and risk breaker for one (user, strategy,
    /// instrument) and enqueues it with the orchestrator (§4.9: "check
    /// entitlement, enqueue; a worker pulls from the queue, creates an
    /// executor"). Returns the stable lifecycle key as the public
    /// strategy_id. The sole shipped strategy plug-in is `TripleEmaAtr`
    /// (§11.4) — a real deployment would resolve `strategy_name` against a
    /// plug-in registry instead.
    pub fn start_strategy(&self, user_id: &str, strategy_name: &str, instrument: &str) -> Result<String, CoreError> {
        let key = Self::lifecycle_key(user_id, strategy_name, instrument);
        let lifecycle = {
            let mut lifecycles = self.lifecycles.write();
            lifecycles.entry(key.clone()).or_insert_with(|| Arc::new(LifecycleManager::new(StateStore::ephemeral(), StrategyState::idle()))).clone()
        };
        lifecycle.start_strategy(strategy_name, instrument)?;

        // The executor factory looks this breaker up by user_id once the
        // queued job is dispatched, so it must already exist here.
        self.risk_breaker_for(user_id);

        let job = WorkerJob { user_id: user_id.to_string(), strategy_name: strategy_name.to_string(), instrument: instrument.to_string() };
        let worker_id = match self.orchestrator.start_runner(job) {
            Ok(id) => id,
            Err(e) => {
                let _ = lifecycle.stop_strategy();
                return Err(e);
            }
        };
        self.workers.write().insert(key.clone(), worker_id);
        Ok(key)
    }

    /// Stops the worker behind `strategy_id` (the lifecycle key), if any is
    /// running. Idempotent: stopping an id with no live worker just returns.
    /// `flatten` mirrors `POST /strategy/stop`'s `force` flag — the executor
    /// emergency-closes any open position before the task exits.
    pub async fn stop_strategy(&self, strategy_id: &str, flatten: bool) -> Result<(), CoreError> {
        let worker_id = self.workers.write().remove(strategy_id);
        if let Some(worker_id) = worker_id {
            self.orchestrator.stop_runner(&worker_id, flatten).await?;
        }
        if let Some(lifecycle) = self.lifecycle_for(strategy_id) {
            lifecycle.stop_strategy()?;
        }
        Ok(())
    }

    /// Reaps executors whose task already exited on its own (§4.10 health
    /// sweep). Runs `may_cull` per affected strategy before touching
    /// anything — a protected lifecycle (entering/open/closing position)
    /// stays untouched even though its task has ended, since a crash mid-trade
    /// must surface as unhealthy for an operator to investigate, not be
    /// silently cleaned up. Returns the strategy ids it reaped.
    pub async fn cull_finished_workers(&self) -> Vec<String> {
        let finished = self.orchestrator.finished_workers();
        if finished.is_empty() {
            return Vec::new();
        }

        let mut reaped = Vec::new();
        for worker_id in finished {
            let strategy_id = { self.workers.read().iter().find(|(_, w)| **w == worker_id).map(|(k, _)| k.clone()) };
            let Some(strategy_id) = strategy_id else { continue };
            let Some(lifecycle) = self.lifecycle_for(&strategy_id) else { continue };
            if crate::health::may_cull(&lifecycle, true) {
                if let Err(e) = self.stop_strategy(&strategy_id, false).await {
                    tracing::warn!(strategy_id, error = %e, "failed to reap finished worker");
                    continue;
                }
                reaped.push(strategy_id);
            }
        }
        reaped
    }
}

/// Builds the closure the orchestrator calls to turn a dequeued `WorkerJob`
/// into a runnable `Executor`, capturing only the Arc-shared pieces it needs
/// rather than all of `AppState` (the orchestrator must not depend on its own
/// owner).
fn build_executor_factory(
    broker: Arc<dyn Broker>,
    history: Arc<dyn TradeHistoryStore>,
    config: Arc<RwLock<DaemonConfig>>,
    lifecycles: Arc<RwLock<HashMap<String, Arc<LifecycleManager>>>>,
    risk_breakers: Arc<RwLock<HashMap<String, Arc<RiskBreaker>>>>,
) -> ExecutorFactory {
    Arc::new(move |job: &WorkerJob| {
        let key = AppState::lifecycle_key(&job.user_id, &job.strategy_name, &job.instrument);
        let lifecycle = lifecycles.read().get(&key).cloned().expect("lifecycle must be registered before a worker job is enqueued");
        let breaker = risk_breakers.read().get(&job.user_id).cloned().expect("risk breaker must be registered before a worker job is enqueued");
        let cfg = config.read().clone();
        Executor::new(job.strategy_name.clone(), job.instrument.clone(), broker.clone(), history.clone(), lifecycle, breaker, Box::new(TripleEmaAtr::new()), cfg)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::history::memory::MemoryTradeHistoryStore;

    #[test]
    fn risk_breaker_for_is_cached_per_user() {
        let state = AppState::new(DaemonConfig::default(), Arc::new(MemoryBroker::new()), Arc::new(MemoryTradeHistoryStore::new()));
        let a = state.risk_breaker_for("alice");
        let b = state.risk_breaker_for("alice");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn lifecycle_key_is_stable_and_distinct_per_instrument() {
        let a = AppState::lifecycle_key("u1", "razor", "BTC-USD-PERP");
        let b = AppState::lifecycle_key("u1", "razor", "ETH-USD-PERP");
        assert_ne!(a, b);
    }

    #[test]
    fn start_strategy_dispatches_a_running_worker() {
        let state = AppState::new(DaemonConfig::default(), Arc::new(MemoryBroker::new()), Arc::new(MemoryTradeHistoryStore::new()));
        let strategy_id = state.start_strategy("alice", "razor", "BTC-USD-PERP").unwrap();
        assert_eq!(state.orchestrator.status(Some("alice")), vec![state.workers.read().get(&strategy_id).cloned().unwrap()]);
    }
}
