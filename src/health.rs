// =============================================================================
// Health & Recovery (C9)
// =============================================================================
//
// A periodic liveness check. The one rule that matters: never cull an
// executor whose lifecycle is ENTERING_POSITION, POSITION_OPEN, or CLOSING,
// or that is within a cooldown window — this is the mitigation for the known
// incident class where an aggressive health check deleted an in-trade
// executor (§4.10). Culling is permitted only when the persisted status
// explicitly says `stopped`.
//
// Also hosts the hand-rolled text `/metrics` surface (§11.6): no metrics
// crate appears anywhere in this corpus, so counters are tracked with
// `AtomicU64`/`AtomicI64` and rendered as Prometheus-style text lines by
// hand, the way this daemon already favours explicit code over a dependency
// for small, stable surfaces.
// =============================================================================

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use tracing::warn;

use crate::lifecycle::{Lifecycle, LifecycleManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle states a health sweep must never cull, regardless of how long
/// it has been since the last heartbeat.
fn is_protected(lifecycle: Lifecycle) -> bool {
    matches!(lifecycle, Lifecycle::EnteringPosition | Lifecycle::PositionOpen | Lifecycle::Closing)
}

/// Decides whether a given user's executor may be culled by this sweep.
/// `explicitly_stopped` mirrors the persisted `status == stopped` signal
/// from §4.10; everything else defers to the lifecycle-state safety rule.
pub fn may_cull(lifecycle: &LifecycleManager, explicitly_stopped: bool) -> bool {
    if explicitly_stopped {
        return true;
    }
    !is_protected(lifecycle.snapshot().lifecycle)
}

/// Process-wide counters backing `GET /metrics`.
#[derive(Default)]
pub struct Metrics {
    trades_total: AtomicU64,
    positions_open: AtomicI64,
    crashes_total: AtomicU64,
    last_recovery_time_seconds: AtomicI64,
    started_at: Option<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self { started_at: Some(Instant::now()), ..Default::default() }
    }

    pub fn record_trade_closed(&self) {
        self.trades_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn position_opened(&self) {
        self.positions_open.fetch_add(1, Ordering::Relaxed);
    }

    pub fn position_closed(&self) {
        self.positions_open.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_crash(&self) {
        self.crashes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recovery_seconds(&self, seconds: i64) {
        self.last_recovery_time_seconds.store(seconds, Ordering::Relaxed);
    }

    fn uptime_seconds(&self) -> u64 {
        self.started_at.map(|s| s.elapsed().as_secs()).unwrap_or(0)
    }

    /// Renders the Prometheus text-exposition format by hand.
    pub fn render_text(&self) -> String {
        format!(
            "# TYPE uptime_seconds gauge\nuptime_seconds {}\n\
             # TYPE trades_total counter\ntrades_total {}\n\
             # TYPE positions_open gauge\npositions_open {}\n\
             # TYPE crashes_total counter\ncrashes_total {}\n\
             # TYPE last_recovery_time_seconds gauge\nlast_recovery_time_seconds {}\n",
            self.uptime_seconds(),
            self.trades_total.load(Ordering::Relaxed),
            self.positions_open.load(Ordering::Relaxed),
            self.crashes_total.load(Ordering::Relaxed),
            self.last_recovery_time_seconds.load(Ordering::Relaxed),
        )
    }
}

/// Aggregates per-user lifecycle snapshots into the top-level `/health`
/// payload's status field. Any degraded user downgrades the whole response
/// to `degraded`; any executor past the recovery timeout (`RecoveryTimeout`,
/// surfaced via repeated `error_count`) downgrades it to `unhealthy`.
pub fn aggregate_status(snapshots: &[crate::lifecycle::StrategyState]) -> HealthStatus {
    let mut worst = HealthStatus::Healthy;
    for s in snapshots {
        if s.error_count >= 5 {
            warn!(strategy = ?s.strategy_name, error_count = s.error_count, "executor unhealthy: too many consecutive errors");
            return HealthStatus::Unhealthy;
        }
        if s.error_count > 0 {
            worst = HealthStatus::Degraded;
        }
    }
    worst
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::store::StateStore;
    use crate::lifecycle::StrategyState;

    #[test]
    fn may_cull_refuses_while_position_is_open() {
        let mgr = LifecycleManager::new(StateStore::ephemeral(), StrategyState::idle());
        mgr.start_strategy("razor", "BTC-USD-PERP").unwrap();
        mgr.on_signal_detected().unwrap();
        mgr.on_entering_position().unwrap();
        mgr.on_position_opened(60000.0, 1000.0, crate::types::PositionSide::Long).unwrap();
        assert!(!may_cull(&mgr, false));
    }

    #[test]
    fn may_cull_allows_when_idle() {
        let mgr = LifecycleManager::new(StateStore::ephemeral(), StrategyState::idle());
        assert!(may_cull(&mgr, false));
    }

    #[test]
    fn may_cull_allows_protected_state_if_explicitly_stopped() {
        let mgr = LifecycleManager::new(StateStore::ephemeral(), StrategyState::idle());
        mgr.start_strategy("razor", "BTC-USD-PERP").unwrap();
        mgr.on_signal_detected().unwrap();
        mgr.on_entering_position().unwrap();
        assert!(may_cull(&mgr, true));
    }

    #[test]
    fn aggregate_status_escalates_on_repeated_errors() {
        let mut s = StrategyState::idle();
        s.error_count = 5;
        assert_eq!(aggregate_status(&[s]), HealthStatus::Unhealthy);
    }

    #[test]
    fn metrics_render_text_contains_expected_lines() {
        let m = Metrics::new();
        m.record_trade_closed();
        m.position_opened();
        let text = m.render_text();
        assert!(text.contains("trades_total 1"));
        assert!(text.contains("positions_open 1"));
    }
}
