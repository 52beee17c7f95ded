// =============================================================================
// Core error taxonomy
// =============================================================================
//
// Domain failures are a closed, matchable enum rather than strings: callers
// branch on `CoreError` variants, never on message content. Unexpected I/O or
// transport failures are not part of this enum — they propagate as
// `anyhow::Error` through `?` at the boundary where they occur.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoreError {
    #[error("strategy already running for this user (state={current_state})")]
    SingleStrategyViolation { current_state: String },

    #[error("invalid lifecycle transition: {from} -> {attempted}")]
    InvalidStateTransition { from: String, attempted: String },

    #[error("stop distance too small relative to entry price: {stop_distance} / {entry}")]
    InvalidStopLoss { entry: f64, stop_distance: f64 },

    #[error("computed quantity {quantity} below instrument minimum {min_trade_amount}")]
    BelowMinimumSize { quantity: f64, min_trade_amount: f64 },

    #[error("required leverage {leverage:.2}x exceeds cap {max_leverage:.2}x")]
    LeverageExceeded { leverage: f64, max_leverage: f64 },

    #[error("margin required {margin_required} exceeds available balance {available}")]
    InsufficientBalance { margin_required: f64, available: f64 },

    #[error("transient broker error: {0}")]
    BrokerTransient(String),

    #[error("broker authentication failed")]
    BrokerAuth,

    #[error("order rejected by venue: {0}")]
    OrderRejected(String),

    #[error("failed to place protective brackets after retries: {0}")]
    BracketPlacementFailed(String),

    #[error("emergency close failed: {0}")]
    EmergencyCloseFailed(String),

    #[error("reconciliation did not complete within the recovery window")]
    RecoveryTimeout,

    #[error("user has reached their entitlement limit of {max_workers} concurrent workers")]
    EntitlementExceeded { max_workers: u32 },

    #[error("unknown persisted schema version {found}, expected <= {supported}")]
    UnsupportedSchemaVersion { found: u32, supported: u32 },

    #[error("order fill was not confirmed before timeout")]
    OrderFillTimeout,

    #[error("failed to persist strategy state: {0}")]
    PersistenceFailed(String),
}

impl CoreError {
    /// Whether this failure should return the strategy to ANALYZING with a
    /// cooldown rather than stopping it outright.
    pub fn is_sizing_rejection(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidStopLoss { .. }
                | CoreError::BelowMinimumSize { .. }
                | CoreError::LeverageExceeded { .. }
                | CoreError::InsufficientBalance { .. }
        )
    }

    /// Whether this failure is fatal for the owning user and must surface via
    /// health as degraded, requiring operator attention.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::EmergencyCloseFailed(_) | CoreError::RecoveryTimeout | CoreError::PersistenceFailed(_))
    }
}
