// =============================================================================
// Risk Breaker — stateful circuit breaker, ambient pre-trade safety net
// =============================================================================
//
// Four breakers: Daily Loss, Consecutive Losses, Max Drawdown, Trade Count.
// Adapted from this daemon's single-venue predecessor's risk engine, which
// combined sizing and breaking in one type; here the breaker is purely a
// stateful gate the executor consults in addition to the pure sizer in
// `risk::sizer`, never a replacement for it (SPEC_FULL.md §10).
//
// All percentage fields are expressed as whole percentages (3.0 == 3%), to
// match `DaemonConfig`, rather than the fractional (0.03) convention the
// predecessor used internally.
// =============================================================================

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerInfo {
    pub name: String,
    pub current: f64,
    pub limit: f64,
    pub tripped: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskBreakerState {
    pub risk_mode: String,
    pub daily_pnl: f64,
    pub daily_pnl_pct: f64,
    pub consecutive_losses: u32,
    pub daily_trades_count: u32,
    pub daily_wins: u32,
    pub daily_losses: u32,
    pub max_drawdown_today_pct: f64,
    pub peak_equity_today: f64,
    pub circuit_breakers: Vec<CircuitBreakerInfo>,
    pub current_date: String,
}

struct Inner {
    daily_pnl: f64,
    consecutive_losses: u32,
    daily_trades_count: u32,
    daily_wins: u32,
    daily_losses: u32,
    max_drawdown_today_pct: f64,
    peak_equity_today: f64,
    current_date: String,
    killed: bool,
}

/// Per-user stateful breaker. One instance per active strategy executor.
pub struct RiskBreaker {
    state: RwLock<Inner>,
    capital: f64,
    max_daily_loss_pct: f64,
    max_consecutive_losses: u32,
    max_drawdown_pct: f64,
    max_daily_trades: u32,
}

impl RiskBreaker {
    pub fn new(
        capital: f64,
        max_daily_loss_pct: f64,
        max_consecutive_losses: u32,
        max_drawdown_pct: f64,
        max_daily_trades: u32,
    ) -> Self {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        info!(
            capital,
            max_daily_loss_pct, max_consecutive_losses, max_drawdown_pct, max_daily_trades,
            "risk breaker initialised"
        );
        Self {
            state: RwLock::new(Inner {
                daily_pnl: 0.0,
                consecutive_losses: 0,
                daily_trades_count: 0,
                daily_wins: 0,
                daily_losses: 0,
                max_drawdown_today_pct: 0.0,
                peak_equity_today: capital,
                current_date: today,
                killed: false,
            }),
            capital,
            max_daily_loss_pct,
            max_consecutive_losses,
            max_drawdown_pct,
            max_daily_trades,
        }
    }

    pub fn record_trade_result(&self, pnl: f64) {
        self.maybe_reset_daily();
        let mut s = self.state.write();

        s.daily_pnl += pnl;
        s.daily_trades_count += 1;

        if pnl >= 0.0 {
            s.daily_wins += 1;
            s.consecutive_losses = 0;
        } else {
            s.daily_losses += 1;
            s.consecutive_losses += 1;
        }

        let current_equity = self.capital + s.daily_pnl;
        if current_equity > s.peak_equity_today {
            s.peak_equity_today = current_equity;
        }
        let drawdown_pct = if s.peak_equity_today > 0.0 {
            (s.peak_equity_today - current_equity) / s.peak_equity_today * 100.0
        } else {
            0.0
        };
        if drawdown_pct > s.max_drawdown_today_pct {
            s.max_drawdown_today_pct = drawdown_pct;
        }

        debug!(
            pnl,
            daily_pnl = s.daily_pnl,
            consecutive_losses = s.consecutive_losses,
            daily_trades = s.daily_trades_count,
            drawdown_pct = s.max_drawdown_today_pct,
            "trade result recorded"
        );
    }

    /// Pre-trade gate. Returns `(true, None)` when clear, `(false,
    /// Some(reason))` when a breaker has tripped.
    pub fn can_trade(&self) -> (bool, Option<String>) {
        self.maybe_reset_daily();
        let s = self.state.read();

        if s.killed {
            return (false, Some("kill switch activated".to_string()));
        }

        let daily_loss_pct = if self.capital > 0.0 { (-s.daily_pnl) / self.capital * 100.0 } else { 0.0 };
        if daily_loss_pct >= self.max_daily_loss_pct {
            let msg = format!(
                "daily loss breaker tripped: {:.2}% lost (limit {:.2}%)",
                daily_loss_pct, self.max_daily_loss_pct
            );
            warn!("{}", msg);
            return (false, Some(msg));
        }

        if s.consecutive_losses >= self.max_consecutive_losses {
            let msg = format!(
                "consecutive losses breaker tripped: {} (limit {})",
                s.consecutive_losses, self.max_consecutive_losses
            );
            warn!("{}", msg);
            return (false, Some(msg));
        }

        if s.max_drawdown_today_pct >= self.max_drawdown_pct {
            let msg = format!(
                "max drawdown breaker tripped: {:.2}% (limit {:.2}%)",
                s.max_drawdown_today_pct, self.max_drawdown_pct
            );
            warn!("{}", msg);
            return (false, Some(msg));
        }

        if s.daily_trades_count >= self.max_daily_trades {
            let msg = format!(
                "trade limit breaker tripped: {} trades today (limit {})",
                s.daily_trades_count, self.max_daily_trades
            );
            warn!("{}", msg);
            return (false, Some(msg));
        }

        (true, None)
    }

    pub fn get_state(&self) -> RiskBreakerState {
        self.maybe_reset_daily();
        let s = self.state.read();

        let daily_pnl_pct = if self.capital > 0.0 { s.daily_pnl / self.capital * 100.0 } else { 0.0 };
        let breakers = self.build_circuit_breaker_info(&s);

        RiskBreakerState {
            risk_mode: self.risk_mode_label(&s),
            daily_pnl: s.daily_pnl,
            daily_pnl_pct,
            consecutive_losses: s.consecutive_losses,
            daily_trades_count: s.daily_trades_count,
            daily_wins: s.daily_wins,
            daily_losses: s.daily_losses,
            max_drawdown_today_pct: s.max_drawdown_today_pct,
            peak_equity_today: s.peak_equity_today,
            circuit_breakers: breakers,
            current_date: s.current_date.clone(),
        }
    }

    pub fn reset_daily(&self) {
        let mut s = self.state.write();
        let today = Utc::now().format("%Y-%m-%d").to_string();
        Self::do_reset(&mut s, &today, self.capital);
        info!(date = %today, "daily risk counters reset (manual)");
    }

    pub fn kill(&self) {
        let mut s = self.state.write();
        s.killed = true;
        warn!("kill switch activated — all trading halted for this user");
    }

    fn maybe_reset_daily(&self) {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        {
            let s = self.state.read();
            if s.current_date == today {
                return;
            }
        }
        let mut s = self.state.write();
        if s.current_date != today {
            info!(old_date = %s.current_date, new_date = %today, "date rolled — resetting daily risk counters");
            Self::do_reset(&mut s, &today, self.capital);
        }
    }

    fn do_reset(s: &mut Inner, date: &str, capital: f64) {
        s.daily_pnl = 0.0;
        s.consecutive_losses = 0;
        s.daily_trades_count = 0;
        s.daily_wins = 0;
        s.daily_losses = 0;
        s.max_drawdown_today_pct = 0.0;
        s.peak_equity_today = capital;
        s.current_date = date.to_string();
    }

    fn risk_mode_label(&self, s: &Inner) -> String {
        if s.killed {
            return "killed".to_string();
        }
        let daily_loss_pct = if self.capital > 0.0 { (-s.daily_pnl) / self.capital * 100.0 } else { 0.0 };
        if daily_loss_pct >= self.max_daily_loss_pct
            || s.consecutive_losses >= self.max_consecutive_losses
            || s.max_drawdown_today_pct >= self.max_drawdown_pct
            || s.daily_trades_count >= self.max_daily_trades
        {
            "breaker_tripped".to_string()
        } else if daily_loss_pct >= self.max_daily_loss_pct * 0.75
            || s.consecutive_losses as f64 >= self.max_consecutive_losses as f64 * 0.75
        {
            "cautious".to_string()
        } else {
            "normal".to_string()
        }
    }

    fn build_circuit_breaker_info(&self, s: &Inner) -> Vec<CircuitBreakerInfo> {
        let daily_loss_pct = if self.capital > 0.0 { (-s.daily_pnl) / self.capital * 100.0 } else { 0.0 };
        vec![
            CircuitBreakerInfo {
                name: "daily_loss".to_string(),
                current: daily_loss_pct.max(0.0),
                limit: self.max_daily_loss_pct,
                tripped: daily_loss_pct >= self.max_daily_loss_pct,
            },
            CircuitBreakerInfo {
                name: "consecutive_losses".to_string(),
                current: s.consecutive_losses as f64,
                limit: self.max_consecutive_losses as f64,
                tripped: s.consecutive_losses >= self.max_consecutive_losses,
            },
            CircuitBreakerInfo {
                name: "max_drawdown".to_string(),
                current: s.max_drawdown_today_pct,
                limit: self.max_drawdown_pct,
                tripped: s.max_drawdown_today_pct >= self.max_drawdown_pct,
            },
            CircuitBreakerInfo {
                name: "trade_limit".to_string(),
                current: s.daily_trades_count as f64,
                limit: self.max_daily_trades as f64,
                tripped: s.daily_trades_count >= self.max_daily_trades,
            },
        ]
    }
}

impl std::fmt::Debug for RiskBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskBreaker")
            .field("capital", &self.capital)
            .field("max_daily_loss_pct", &self.max_daily_loss_pct)
            .field("max_consecutive_losses", &self.max_consecutive_losses)
            .field("max_drawdown_pct", &self.max_drawdown_pct)
            .field("max_daily_trades", &self.max_daily_trades)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_on_consecutive_losses() {
        let b = RiskBreaker::new(1000.0, 50.0, 3, 50.0, 100);
        b.record_trade_result(-1.0);
        b.record_trade_result(-1.0);
        b.record_trade_result(-1.0);
        let (ok, reason) = b.can_trade();
        assert!(!ok);
        assert!(reason.unwrap().contains("consecutive"));
    }

    #[test]
    fn trips_on_daily_loss_pct() {
        let b = RiskBreaker::new(1000.0, 3.0, 100, 100.0, 1000);
        b.record_trade_result(-40.0);
        let (ok, _) = b.can_trade();
        assert!(!ok);
    }

    #[test]
    fn kill_switch_blocks_trading() {
        let b = RiskBreaker::new(1000.0, 50.0, 50, 50.0, 50);
        b.kill();
        let (ok, reason) = b.can_trade();
        assert!(!ok);
        assert!(reason.unwrap().contains("kill"));
    }

    #[test]
    fn wins_reset_consecutive_loss_counter() {
        let b = RiskBreaker::new(1000.0, 50.0, 3, 50.0, 100);
        b.record_trade_result(-1.0);
        b.record_trade_result(-1.0);
        b.record_trade_result(5.0);
        let state = b.get_state();
        assert_eq!(state.consecutive_losses, 0);
    }
}
