// =============================================================================
// Strategy Lifecycle Manager (C4)
// =============================================================================

pub mod store;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::CoreError;
use crate::types::PositionSide;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Idle,
    Analyzing,
    SignalDetected,
    EnteringPosition,
    PositionOpen,
    Closing,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Lifecycle::Idle => "idle",
            Lifecycle::Analyzing => "analyzing",
            Lifecycle::SignalDetected => "signal_detected",
            Lifecycle::EnteringPosition => "entering_position",
            Lifecycle::PositionOpen => "position_open",
            Lifecycle::Closing => "closing",
        };
        write!(f, "{s}")
    }
}

/// Persisted per-user strategy state (§3 StrategyState).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyState {
    #[serde(default = "default_schema_version")]
    pub version: u32,
    pub strategy_name: Option<String>,
    pub instrument: Option<String>,
    pub lifecycle: Lifecycle,
    pub started_at: Option<String>,
    pub last_transition: String,
    pub position_entry_price: Option<f64>,
    pub position_size: Option<f64>,
    pub position_side: Option<PositionSide>,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    pub last_action: Option<String>,
    #[serde(default)]
    pub error_count: u32,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}
fn default_true() -> bool {
    true
}

impl StrategyState {
    pub fn idle() -> Self {
        Self {
            version: SCHEMA_VERSION,
            strategy_name: None,
            instrument: None,
            lifecycle: Lifecycle::Idle,
            started_at: None,
            last_transition: Utc::now().to_rfc3339(),
            position_entry_price: None,
            position_size: None,
            position_side: None,
            auto_reconnect: true,
            last_action: None,
            error_count: 0,
        }
    }

    fn touch(&mut self, action: &str) {
        self.last_transition = Utc::now().to_rfc3339();
        self.last_action = Some(action.to_string());
    }
}

/// Valid target states from a given lifecycle state, excluding `stopStrategy`
/// (which is valid from every state and handled separately).
fn valid_transition(from: Lifecycle, to: Lifecycle) -> bool {
    use Lifecycle::*;
    matches!(
        (from, to),
        (Idle, Analyzing)
            | (Analyzing, SignalDetected)
            | (SignalDetected, EnteringPosition)
            | (EnteringPosition, PositionOpen)
            | (PositionOpen, Closing)
            | (Closing, Analyzing)
    )
}

/// Owns one user's `StrategyState` with atomic, versioned persistence. The
/// lock is the sole synchronization point for the single-strategy guard and
/// the state machine: both are evaluated atomically with respect to writes.
pub struct LifecycleManager {
    state: RwLock<StrategyState>,
    store: store::StateStore,
}

impl LifecycleManager {
    pub fn new(store: store::StateStore, initial: StrategyState) -> Self {
        Self { state: RwLock::new(initial), store }
    }

    /// Load from durable storage, falling back to `Idle` if nothing is
    /// persisted yet. Refuses to start if a persisted schema version is
    /// newer than this binary understands.
    pub fn load_or_default(store: store::StateStore) -> Result<Self, CoreError> {
        match store.load() {
            Ok(Some(state)) => {
                if state.version > SCHEMA_VERSION {
                    return Err(CoreError::UnsupportedSchemaVersion { found: state.version, supported: SCHEMA_VERSION });
                }
                Ok(Self::new(store, state))
            }
            Ok(None) => Ok(Self::new(store, StrategyState::idle())),
            Err(e) => {
                error!(error = %e, "failed to load persisted strategy state, starting idle");
                Ok(Self::new(store, StrategyState::idle()))
            }
        }
    }

    pub fn snapshot(&self) -> StrategyState {
        self.state.read().clone()
    }

    pub fn should_analyze(&self) -> bool {
        self.state.read().lifecycle == Lifecycle::Analyzing
    }

    pub fn can_open_position(&self) -> bool {
        matches!(self.state.read().lifecycle, Lifecycle::Analyzing | Lifecycle::SignalDetected)
    }

    /// `startStrategy`: IDLE -> ANALYZING. Enforces the single-strategy guard.
    pub fn start_strategy(&self, strategy_name: &str, instrument: &str) -> Result<(), CoreError> {
        let mut s = self.state.write();
        if s.lifecycle != Lifecycle::Idle {
            return Err(CoreError::SingleStrategyViolation { current_state: s.lifecycle.to_string() });
        }
        s.strategy_name = Some(strategy_name.to_string());
        s.instrument = Some(instrument.to_string());
        s.started_at = Some(Utc::now().to_rfc3339());
        s.lifecycle = Lifecycle::Analyzing;
        s.error_count = 0;
        s.touch("start_strategy");
        self.persist(&s)
    }

    /// `stopStrategy`: any state -> IDLE.
    pub fn stop_strategy(&self) -> Result<(), CoreError> {
        let mut s = self.state.write();
        *s = StrategyState::idle();
        s.touch("stop_strategy");
        self.persist(&s)
    }

    pub fn on_signal_detected(&self) -> Result<(), CoreError> {
        self.transition(Lifecycle::SignalDetected, "on_signal_detected")
    }

    pub fn on_entering_position(&self) -> Result<(), CoreError> {
        self.transition(Lifecycle::EnteringPosition, "on_entering_position")
    }

    pub fn on_position_opened(&self, entry_price: f64, size: f64, side: PositionSide) -> Result<(), CoreError> {
        let mut s = self.state.write();
        if !valid_transition(s.lifecycle, Lifecycle::PositionOpen) {
            return Err(CoreError::InvalidStateTransition {
                from: s.lifecycle.to_string(),
                attempted: Lifecycle::PositionOpen.to_string(),
            });
        }
        s.lifecycle = Lifecycle::PositionOpen;
        s.position_entry_price = Some(entry_price);
        s.position_size = Some(size);
        s.position_side = Some(side);
        s.touch("on_position_opened");
        self.persist(&s)
    }

    pub fn on_position_closing(&self) -> Result<(), CoreError> {
        self.transition(Lifecycle::Closing, "on_position_closing")
    }

    pub fn on_position_closed(&self) -> Result<(), CoreError> {
        let mut s = self.state.write();
        if !valid_transition(s.lifecycle, Lifecycle::Analyzing) {
            return Err(CoreError::InvalidStateTransition {
                from: s.lifecycle.to_string(),
                attempted: Lifecycle::Analyzing.to_string(),
            });
        }
        s.lifecycle = Lifecycle::Analyzing;
        s.position_entry_price = None;
        s.position_size = None;
        s.position_side = None;
        s.touch("on_position_closed");
        self.persist(&s)
    }

    /// Used only by reconciliation (C6), which may force a transition that
    /// bypasses the normal guard (e.g. forcing POSITION_OPEN for an adopted
    /// orphan, or ANALYZING/IDLE for a clean/ghost result) because it is
    /// reconciling against venue truth rather than driving the state machine
    /// forward in the ordinary sense.
    pub fn force_lifecycle(&self, lifecycle: Lifecycle, reason: &str) -> Result<(), CoreError> {
        let mut s = self.state.write();
        s.lifecycle = lifecycle;
        s.touch(reason);
        self.persist(&s)
    }

    pub fn record_error(&self) -> u32 {
        let mut s = self.state.write();
        s.error_count += 1;
        let count = s.error_count;
        let _ = self.persist(&s);
        count
    }

    fn transition(&self, to: Lifecycle, action: &str) -> Result<(), CoreError> {
        let mut s = self.state.write();
        if !valid_transition(s.lifecycle, to) {
            return Err(CoreError::InvalidStateTransition { from: s.lifecycle.to_string(), attempted: to.to_string() });
        }
        s.lifecycle = to;
        s.touch(action);
        self.persist(&s)
    }

    fn persist(&self, state: &StrategyState) -> Result<(), CoreError> {
        if let Err(e) = self.store.save(state) {
            error!(error = %e, "failed to persist strategy state");
            return Err(CoreError::PersistenceFailed(e.to_string()));
        }
        info!(lifecycle = %state.lifecycle, action = ?state.last_action, "lifecycle transition persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> LifecycleManager {
        LifecycleManager::new(store::StateStore::ephemeral(), StrategyState::idle())
    }

    #[test]
    fn single_strategy_guard_rejects_second_start() {
        let mgr = manager();
        mgr.start_strategy("razor", "BTC-USD-PERP").unwrap();
        let err = mgr.start_strategy("razor", "ETH-USD-PERP").unwrap_err();
        assert!(matches!(err, CoreError::SingleStrategyViolation { .. }));
    }

    #[test]
    fn full_happy_path_cycle() {
        let mgr = manager();
        mgr.start_strategy("razor", "BTC-USD-PERP").unwrap();
        assert!(mgr.should_analyze());
        mgr.on_signal_detected().unwrap();
        assert!(mgr.can_open_position());
        mgr.on_entering_position().unwrap();
        mgr.on_position_opened(60000.0, 5000.0, PositionSide::Long).unwrap();
        assert_eq!(mgr.snapshot().lifecycle, Lifecycle::PositionOpen);
        mgr.on_position_closing().unwrap();
        mgr.on_position_closed().unwrap();
        assert!(mgr.should_analyze());
        assert!(mgr.snapshot().position_entry_price.is_none());
    }

    #[test]
    fn invalid_transition_is_rejected_without_mutation() {
        let mgr = manager();
        let before = mgr.snapshot().lifecycle;
        let err = mgr.on_position_opened(1.0, 1.0, PositionSide::Long).unwrap_err();
        assert!(matches!(err, CoreError::InvalidStateTransition { .. }));
        assert_eq!(mgr.snapshot().lifecycle, before);
    }

    #[test]
    fn stop_strategy_works_from_any_state() {
        let mgr = manager();
        mgr.start_strategy("razor", "BTC-USD-PERP").unwrap();
        mgr.on_signal_detected().unwrap();
        mgr.stop_strategy().unwrap();
        assert_eq!(mgr.snapshot().lifecycle, Lifecycle::Idle);
        assert!(mgr.snapshot().strategy_name.is_none());
    }
}
