// =============================================================================
// Risk — sizing and circuit breaking
// =============================================================================
//
// Two distinct concerns live here, deliberately not merged into one type
// (see SPEC_FULL.md §10):
//
// - `sizer` is a pure, stateless function: balance + risk budget + entry/stop
//   + instrument metadata -> quantity/leverage/margin. No history, no I/O.
// - `breaker` is a stateful, process-lifetime circuit breaker (daily loss,
//   consecutive losses, drawdown, trade count) that the executor consults as
//   an *additional* pre-trade gate alongside the sizer, never instead of it.
// =============================================================================

pub mod breaker;
pub mod sizer;

pub use breaker::RiskBreaker;
pub use sizer::{size_position, SizingInput, SizingOutput};
