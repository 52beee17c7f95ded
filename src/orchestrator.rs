// =============================================================================
// Worker Orchestrator (C8)
// =============================================================================
//
// Owns the mapping user_id -> running executors. Generalizes the teacher's
// single-process, single-user assumption into a per-user entitlement-gated
// FIFO queue: jobs from different users may interleave, but one user's jobs
// are served in submission order (§4.9).
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::error::CoreError;
use crate::executor::{Executor, ExecutorHandle};

/// A queued request to start one executor.
pub struct WorkerJob {
    pub user_id: String,
    pub strategy_name: String,
    pub instrument: String,
}

/// Builds a ready-to-run `Executor` for a queued job, supplied by the
/// caller (`AppState` owns the broker, history store, and strategy
/// registry the orchestrator itself has no business knowing about).
pub type ExecutorFactory = Arc<dyn Fn(&WorkerJob) -> (Executor, ExecutorHandle) + Send + Sync>;

struct QueuedJob {
    worker_id: String,
    job: WorkerJob,
}

struct RunningWorker {
    user_id: String,
    handle: ExecutorHandle,
    join: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorLimits {
    pub max_workers_per_user: u32,
}

/// Per-user FIFO job queue plus entitlement gating.
pub struct Orchestrator {
    workers: RwLock<HashMap<String, RunningWorker>>,
    queues: RwLock<HashMap<String, VecDeque<QueuedJob>>>,
    limits: OrchestratorLimits,
    factory: ExecutorFactory,
}

impl Orchestrator {
    pub fn new(limits: OrchestratorLimits, factory: ExecutorFactory) -> Self {
        Self { workers: RwLock::new(HashMap::new()), queues: RwLock::new(HashMap::new()), limits, factory }
    }

    fn active_worker_count(&self, user_id: &str) -> u32 {
        self.workers.read().values().filter(|w| w.user_id == user_id).count() as u32
    }

    /// `start_runner(job)`: entitlement-checked enqueue (§4.9). Rejects
    /// immediately with `EntitlementExceeded` if the user is already at the
    /// active-worker limit; otherwise the job joins the back of that user's
    /// FIFO queue and `dispatch` pulls it the moment a slot is free — which,
    /// since the entitlement check already passed, happens synchronously
    /// here unless other jobs are ahead of it. Returns the worker id the job
    /// will run under once dispatched.
    pub fn start_runner(&self, job: WorkerJob) -> Result<String, CoreError> {
        if self.active_worker_count(&job.user_id) >= self.limits.max_workers_per_user {
            return Err(CoreError::EntitlementExceeded { max_workers: self.limits.max_workers_per_user });
        }

        let worker_id = Uuid::new_v4().to_string();
        let user_id = job.user_id.clone();
        self.queues.write().entry(user_id.clone()).or_default().push_back(QueuedJob { worker_id: worker_id.clone(), job });
        self.dispatch(&user_id);
        Ok(worker_id)
    }

    /// Pulls queued jobs for `user_id` into running workers while the
    /// entitlement limit allows it, preserving submission order.
    fn dispatch(&self, user_id: &str) {
        loop {
            if self.active_worker_count(user_id) >= self.limits.max_workers_per_user {
                return;
            }
            let queued = {
                let mut queues = self.queues.write();
                let Some(queue) = queues.get_mut(user_id) else { return };
                let Some(queued) = queue.pop_front() else { return };
                queued
            };

            let QueuedJob { worker_id, job } = queued;
            info!(worker_id, user_id = %job.user_id, strategy = %job.strategy_name, instrument = %job.instrument, "starting worker");
            let (mut executor, handle) = (self.factory)(&job);
            let join = tokio::spawn(async move {
                if let Err(e) = executor.run().await {
                    tracing::error!(error = %e, "executor exited with error");
                }
            });
            self.workers.write().insert(worker_id, RunningWorker { user_id: job.user_id, handle, join });
        }
    }

    /// `stop_runner(worker_id, flatten)`: issues the cooperative stop
    /// (asking the executor to emergency-close first when `flatten` is set),
    /// reaps the task handle, then dispatches the next queued job for that
    /// user, if any.
    pub async fn stop_runner(&self, worker_id: &str, flatten: bool) -> Result<(), CoreError> {
        let worker = self.workers.write().remove(worker_id);
        let Some(worker) = worker else {
            return Ok(());
        };
        worker.handle.stop(flatten);
        let _ = worker.join.await;
        self.dispatch(&worker.user_id);
        Ok(())
    }

    /// `stop_all(user_id, flatten)` is equivalent to `stop_runner` for every
    /// worker belonging to `user_id` (§4.9).
    pub async fn stop_all(&self, user_id: &str, flatten: bool) -> Result<(), CoreError> {
        let ids: Vec<String> = self.workers.read().iter().filter(|(_, w)| w.user_id == user_id).map(|(id, _)| id.clone()).collect();
        for id in ids {
            self.stop_runner(&id, flatten).await?;
        }
        Ok(())
    }

    /// `status(user_id?)`: worker ids currently running, optionally filtered.
    pub fn status(&self, user_id: Option<&str>) -> Vec<String> {
        self.workers
            .read()
            .iter()
            .filter(|(_, w)| user_id.map(|u| w.user_id == u).unwrap_or(true))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Worker ids whose executor task has already exited on its own (crash,
    /// stream end, or the consecutive-error cutoff) without going through
    /// `stop_runner`. The health sweep reaps these (§4.10).
    pub fn finished_workers(&self) -> Vec<String> {
        self.workers.read().iter().filter(|(_, w)| w.join.is_finished()).map(|(id, _)| id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::config::DaemonConfig;
    use crate::history::memory::MemoryTradeHistoryStore;
    use crate::lifecycle::store::StateStore;
    use crate::lifecycle::{LifecycleManager, StrategyState};
    use crate::risk::breaker::RiskBreaker;
    use crate::strategy::TripleEmaAtr;
    use std::sync::Arc;

    fn test_factory() -> ExecutorFactory {
        Arc::new(|job: &WorkerJob| {
            let broker = Arc::new(MemoryBroker::new());
            let history = Arc::new(MemoryTradeHistoryStore::new());
            let lifecycle = Arc::new(LifecycleManager::new(StateStore::ephemeral(), StrategyState::idle()));
            let breaker = Arc::new(RiskBreaker::new(10_000.0, 3.0, 5, 6.0, 50));
            Executor::new(job.strategy_name.clone(), job.instrument.clone(), broker, history, lifecycle, breaker, Box::new(TripleEmaAtr::new()), DaemonConfig::default())
        })
    }

    fn job(user: &str) -> WorkerJob {
        WorkerJob { user_id: user.to_string(), strategy_name: "razor".to_string(), instrument: "BTC-USD-PERP".to_string() }
    }

    #[tokio::test]
    async fn entitlement_limit_rejects_excess_workers() {
        let orch = Orchestrator::new(OrchestratorLimits { max_workers_per_user: 1 }, test_factory());
        orch.start_runner(job("alice")).unwrap();

        let err = orch.start_runner(job("alice")).unwrap_err();
        assert!(matches!(err, CoreError::EntitlementExceeded { .. }));
    }

    #[tokio::test]
    async fn start_runner_dispatches_immediately_when_under_limit() {
        let orch = Orchestrator::new(OrchestratorLimits { max_workers_per_user: 2 }, test_factory());
        let worker_id = orch.start_runner(job("alice")).unwrap();
        assert_eq!(orch.status(Some("alice")), vec![worker_id]);
    }

    #[tokio::test]
    async fn stopping_a_worker_dispatches_the_next_queued_job_for_that_user() {
        let orch = Orchestrator::new(OrchestratorLimits { max_workers_per_user: 1 }, test_factory());
        let first = orch.start_runner(job("alice")).unwrap();
        assert_eq!(orch.status(Some("alice")), vec![first.clone()]);

        orch.stop_runner(&first, false).await.unwrap();
        assert!(orch.status(Some("alice")).is_empty());

        let second = orch.start_runner(job("alice")).unwrap();
        assert_eq!(orch.status(Some("alice")), vec![second]);
    }

    #[tokio::test]
    async fn stop_all_removes_every_worker_for_user() {
        let orch = Orchestrator::new(OrchestratorLimits { max_workers_per_user: 3 }, test_factory());
        orch.start_runner(job("alice")).unwrap();
        orch.stop_all("alice", false).await.unwrap();
        assert!(orch.status(Some("alice")).is_empty());
    }
}
