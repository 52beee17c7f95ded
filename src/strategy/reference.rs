// =============================================================================
// TripleEmaAtr — reference strategy plug-in
// =============================================================================
//
// Generalizes the teacher's EMA-9/21/55 alignment check and ATR-based
// stop/take-profit sizing (`strategy.rs`, `indicators::ema`, `indicators::atr`)
// into a self-contained `Strategy` implementation that only depends on the
// candle stream it is fed, not on `AppState` or the multi-timeframe buffer.
// =============================================================================

use crate::indicators::atr::calculate_atr;
use crate::indicators::ema::calculate_ema;
use crate::types::{Candle, Signal, SignalKind, Tick};

use super::{Strategy, StrategyConfig};

const EMA_FAST: usize = 9;
const EMA_MID: usize = 21;
const EMA_SLOW: usize = 55;
const ATR_PERIOD: usize = 14;
const ATR_STOP_MULTIPLE: f64 = 1.5;
const ATR_TAKE_PROFIT_MULTIPLE: f64 = 3.0;
const MIN_STOP_PCT: f64 = 0.004;

pub struct TripleEmaAtr {
    instrument: String,
    candles: Vec<Candle>,
    max_history: usize,
}

impl Default for TripleEmaAtr {
    fn default() -> Self {
        Self { instrument: String::new(), candles: Vec::new(), max_history: 200 }
    }
}

impl TripleEmaAtr {
    pub fn new() -> Self {
        Self::default()
    }

    fn evaluate(&self) -> Signal {
        let closes: Vec<f64> = self.candles.iter().map(|c| c.close).collect();
        if closes.len() < EMA_SLOW {
            return Signal::none();
        }

        let ema_fast = calculate_ema(&closes, EMA_FAST);
        let ema_mid = calculate_ema(&closes, EMA_MID);
        let ema_slow = calculate_ema(&closes, EMA_SLOW);
        let (Some(&fast), Some(&mid), Some(&slow)) = (ema_fast.last(), ema_mid.last(), ema_slow.last()) else {
            return Signal::none();
        };

        let atr = match calculate_atr(&self.candles, ATR_PERIOD) {
            Some(a) if a.is_finite() && a > 0.0 => a,
            _ => return Signal::none(),
        };

        let entry = closes[closes.len() - 1];
        let bullish = fast > mid && mid > slow;
        let bearish = fast < mid && mid < slow;

        if bullish {
            let stop_distance = (atr * ATR_STOP_MULTIPLE).max(entry * MIN_STOP_PCT);
            Signal {
                kind: SignalKind::EnterLong,
                entry,
                stop: entry - stop_distance,
                take_profit: entry + atr * ATR_TAKE_PROFIT_MULTIPLE,
                reasons: vec!["ema_fast>mid>slow".to_string(), format!("atr={atr:.4}")],
            }
        } else if bearish {
            let stop_distance = (atr * ATR_STOP_MULTIPLE).max(entry * MIN_STOP_PCT);
            Signal {
                kind: SignalKind::EnterShort,
                entry,
                stop: entry + stop_distance,
                take_profit: entry - atr * ATR_TAKE_PROFIT_MULTIPLE,
                reasons: vec!["ema_fast<mid<slow".to_string(), format!("atr={atr:.4}")],
            }
        } else {
            Signal::none()
        }
    }
}

impl Strategy for TripleEmaAtr {
    fn required_warmup(&self) -> usize {
        EMA_SLOW.max(ATR_PERIOD + 1)
    }

    fn configure(&mut self, config: StrategyConfig) {
        self.instrument = config.instrument;
        self.candles.clear();
    }

    fn on_candle(&mut self, candle: Candle) -> Signal {
        self.candles.push(candle);
        if self.candles.len() > self.max_history {
            self.candles.remove(0);
        }
        self.evaluate()
    }

    fn on_tick(&mut self, _tick: Tick) -> Signal {
        Signal::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(close: f64) -> Candle {
        Candle { open_time: 0, close_time: 0, open: close, high: close * 1.002, low: close * 0.998, close, volume: 100.0 }
    }

    #[test]
    fn required_warmup_covers_slowest_indicator() {
        let s = TripleEmaAtr::new();
        assert!(s.required_warmup() >= EMA_SLOW);
    }

    #[test]
    fn insufficient_history_yields_no_signal() {
        let mut s = TripleEmaAtr::new();
        s.configure(StrategyConfig { instrument: "BTC-USD-PERP".to_string(), timeframe: "5m".to_string() });
        let signal = s.on_candle(candle(100.0));
        assert_eq!(signal.kind, SignalKind::None);
    }

    #[test]
    fn sustained_uptrend_eventually_emits_enter_long() {
        let mut s = TripleEmaAtr::new();
        s.configure(StrategyConfig { instrument: "BTC-USD-PERP".to_string(), timeframe: "5m".to_string() });
        let mut price = 100.0;
        let mut last_signal = Signal::none();
        for _ in 0..120 {
            price += 1.0;
            last_signal = s.on_candle(candle(price));
        }
        assert_eq!(last_signal.kind, SignalKind::EnterLong);
        assert!(last_signal.stop < last_signal.entry);
        assert!(last_signal.take_profit > last_signal.entry);
    }

    #[test]
    fn sustained_downtrend_eventually_emits_enter_short() {
        let mut s = TripleEmaAtr::new();
        s.configure(StrategyConfig { instrument: "BTC-USD-PERP".to_string(), timeframe: "5m".to_string() });
        let mut price = 500.0;
        let mut last_signal = Signal::none();
        for _ in 0..120 {
            price -= 1.0;
            last_signal = s.on_candle(candle(price));
        }
        assert_eq!(last_signal.kind, SignalKind::EnterShort);
        assert!(last_signal.stop > last_signal.entry);
        assert!(last_signal.take_profit < last_signal.entry);
    }
}
