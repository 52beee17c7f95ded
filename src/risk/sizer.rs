// =============================================================================
// Risk Engine — pure position sizing (C2)
// =============================================================================
//
// Deterministic function of its inputs. No shared state, no I/O, no clock.
// Grounded in the sizing arithmetic the predecessor ran inline inside its
// strategy pipeline (strategy.rs step 9), generalized to the closed
// percent|fixed risk-mode contract and leverage/margin checks this system's
// multi-venue, multi-user scope requires.
// =============================================================================

use crate::config::RiskMode;
use crate::error::CoreError;
use crate::types::InstrumentMeta;

/// All inputs the sizer needs for one sizing decision.
#[derive(Debug, Clone, Copy)]
pub struct SizingInput {
    pub equity: f64,
    pub available: f64,
    pub risk_mode: RiskMode,
    pub risk_value: f64,
    pub entry: f64,
    pub stop: f64,
    pub max_leverage_cap: f64,
    pub leverage_warn_threshold: f64,
}

/// Result of a successful sizing computation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizingOutput {
    pub quantity: f64,
    pub notional: f64,
    pub leverage: f64,
    pub margin_required: f64,
    pub warning: Option<LeverageWarning>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeverageWarning {
    pub leverage: f64,
    pub threshold: f64,
}

/// Size a position per §4.7. Pure and deterministic: equal inputs always
/// produce equal outputs.
pub fn size_position(input: &SizingInput, instrument: &InstrumentMeta) -> Result<SizingOutput, CoreError> {
    let risk_amount = match input.risk_mode {
        RiskMode::Percent => input.equity * (input.risk_value / 100.0),
        RiskMode::Fixed => input.risk_value,
    }
    .min(input.equity);

    let stop_distance = (input.entry - input.stop).abs();
    if input.entry <= 0.0 || stop_distance / input.entry < 1e-4 {
        return Err(CoreError::InvalidStopLoss {
            entry: input.entry,
            stop_distance,
        });
    }

    let raw_qty = risk_amount * input.entry / stop_distance;
    let qty = floor_to_lot(raw_qty, instrument.lot_size);

    let notional = if instrument.quantity_is_notional {
        qty
    } else {
        qty * input.entry
    };

    let leverage = if input.equity > 0.0 { notional / input.equity } else { f64::INFINITY };

    if leverage > input.max_leverage_cap {
        return Err(CoreError::LeverageExceeded {
            leverage,
            max_leverage: input.max_leverage_cap,
        });
    }

    if qty < instrument.min_trade_amount {
        return Err(CoreError::BelowMinimumSize {
            quantity: qty,
            min_trade_amount: instrument.min_trade_amount,
        });
    }

    let margin_required = notional / input.max_leverage_cap.max(1.0);
    if margin_required > input.available {
        return Err(CoreError::InsufficientBalance {
            margin_required,
            available: input.available,
        });
    }

    let warning = if leverage > input.leverage_warn_threshold {
        Some(LeverageWarning {
            leverage,
            threshold: input.leverage_warn_threshold,
        })
    } else {
        None
    };

    Ok(SizingOutput {
        quantity: qty,
        notional,
        leverage,
        margin_required,
        warning,
    })
}

fn floor_to_lot(qty: f64, lot_size: f64) -> f64 {
    if lot_size <= 0.0 {
        return qty;
    }
    (qty / lot_size).floor() * lot_size
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instrument() -> InstrumentMeta {
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
    fn happy_long_worked_example() {
        // §8 "Happy long": equity=1000, risk=5%, entry=60000, stop=59400.
        let input = SizingInput {
            equity: 1000.0,
            available: 1000.0,
            risk_mode: RiskMode::Percent,
            risk_value: 5.0,
            entry: 60000.0,
            stop: 59400.0,
            max_leverage_cap: 20.0,
            leverage_warn_threshold: 10.0,
        };
        let out = size_position(&input, &instrument()).unwrap();
        assert!((out.quantity - 5000.0).abs() < 1e-6);
        assert!((out.leverage - 5.0).abs() < 1e-6);
        assert!(out.warning.is_none());
    }

    #[test]
    fn stop_too_close_is_rejected() {
        let input = SizingInput {
            equity: 1000.0,
            available: 1000.0,
            risk_mode: RiskMode::Percent,
            risk_value: 5.0,
            entry: 60000.0,
            stop: 59999.0,
            max_leverage_cap: 20.0,
            leverage_warn_threshold: 10.0,
        };
        let err = size_position(&input, &instrument()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidStopLoss { .. }));
    }

    #[test]
    fn leverage_exceeded_is_rejected() {
        let input = SizingInput {
            equity: 100.0,
            available: 100.0,
            risk_mode: RiskMode::Percent,
            risk_value: 80.0,
            entry: 60000.0,
            stop: 59000.0, // wide stop forces a large quantity relative to equity
            max_leverage_cap: 5.0,
            leverage_warn_threshold: 3.0,
        };
        let err = size_position(&input, &instrument()).unwrap_err();
        assert!(matches!(err, CoreError::LeverageExceeded { .. }));
    }

    #[test]
    fn leverage_between_warn_and_cap_succeeds_with_warning() {
        let input = SizingInput {
            equity: 1000.0,
            available: 1000.0,
            risk_mode: RiskMode::Percent,
            risk_value: 30.0,
            entry: 60000.0,
            stop: 59400.0,
            max_leverage_cap: 20.0,
            leverage_warn_threshold: 10.0,
        };
        let out = size_position(&input, &instrument()).unwrap();
        assert!(out.leverage > 10.0 && out.leverage <= 20.0);
        assert!(out.warning.is_some());
    }

    #[test]
    fn below_minimum_size_is_rejected() {
        let mut meta = instrument();
        meta.min_trade_amount = 100_000.0;
        let input = SizingInput {
            equity: 1000.0,
            available: 1000.0,
            risk_mode: RiskMode::Percent,
            risk_value: 5.0,
            entry: 60000.0,
            stop: 59400.0,
            max_leverage_cap: 20.0,
            leverage_warn_threshold: 10.0,
        };
        let err = size_position(&input, &meta).unwrap_err();
        assert!(matches!(err, CoreError::BelowMinimumSize { .. }));
    }

    #[test]
    fn insufficient_balance_checks_available_not_equity() {
        // Equity is high (includes unrealized PnL tied up elsewhere) but
        // available margin is low -- the check must use `available`.
        let input = SizingInput {
            equity: 1_000_000.0,
            available: 10.0,
            risk_mode: RiskMode::Fixed,
            risk_value: 500.0,
            entry: 60000.0,
            stop: 59400.0,
            max_leverage_cap: 20.0,
            leverage_warn_threshold: 10.0,
        };
        let err = size_position(&input, &instrument()).unwrap_err();
        assert!(matches!(err, CoreError::InsufficientBalance { .. }));
    }

    #[test]
    fn deterministic_given_same_inputs() {
        let input = SizingInput {
            equity: 2500.0,
            available: 2500.0,
            risk_mode: RiskMode::Percent,
            risk_value: 2.0,
            entry: 3000.0,
            stop: 2940.0,
            max_leverage_cap: 10.0,
            leverage_warn_threshold: 8.0,
        };
        let a = size_position(&input, &instrument()).unwrap();
        let b = size_position(&input, &instrument()).unwrap();
        assert_eq!(a, b);
    }
}
