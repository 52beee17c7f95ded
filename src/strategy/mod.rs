// =============================================================================
// Strategy plug-in contract (C2, §4.2) and reference implementation
// =============================================================================
//
// A `Strategy` is venue- and executor-agnostic: it only ever sees candles and
// ticks for the instrument it was configured against, and answers with a
// `Signal`. This generalizes the teacher's single hard-coded `StrategyEngine`
// pipeline (`strategy.rs`) into a pluggable trait so new strategies never
// touch the executor, lifecycle, or broker plumbing.
// =============================================================================

pub mod reference;

use crate::types::{Candle, Signal, Tick};

/// Per-instrument configuration handed to a strategy before warmup.
#[derive(Debug, Clone)]
pub struct StrategyConfig {
    pub instrument: String,
    pub timeframe: String,
}

/// The plug-in contract every strategy implements.
pub trait Strategy: Send + Sync {
    /// How many closed candles of warmup this strategy needs before its
    /// signals can be trusted.
    fn required_warmup(&self) -> usize;

    fn configure(&mut self, config: StrategyConfig);

    /// Called once per closed candle. Returning `Signal::none()` means no
    /// action this bar.
    fn on_candle(&mut self, candle: Candle) -> Signal;

    /// Called on every tick. Most strategies only act on candle closes and
    /// return `Signal::none()` here; a strategy may use ticks to manage an
    /// already-open position's exit (not covered by this contract — that is
    /// the executor's job via the lifecycle and broker state).
    fn on_tick(&mut self, tick: Tick) -> Signal;
}

pub use reference::TripleEmaAtr;
