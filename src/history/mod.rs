// =============================================================================
// Trade History Store (C3)
// =============================================================================
//
// A pluggable, backend-agnostic ledger of `TradeRecord`s. Two implementations
// ship: `memory` (ephemeral, tests only) and `file` (durable, atomic tmp +
// rename per record, mirroring the teacher's config-save pattern). Backend
// selection is a configuration concern, never a core one — callers depend
// only on the `TradeHistoryStore` trait.
// =============================================================================

pub mod file;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::PositionSide;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    SlHit,
    TpHit,
    Manual,
    StrategyStop,
    Error,
    AutoClosedOrphan,
}

/// One trade, open or closed (§3 TradeRecord).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: String,
    pub strategy_name: String,
    pub instrument: String,
    pub side: PositionSide,
    pub entry_order_id: String,
    pub sl_order_id: Option<String>,
    pub tp_order_id: Option<String>,
    pub entry_price: f64,
    pub amount: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub entry_time: String,
    pub exit_price: Option<f64>,
    pub exit_time: Option<String>,
    pub exit_reason: Option<ExitReason>,
    pub pnl: Option<f64>,
    pub pnl_percent: Option<f64>,
    pub status: TradeStatus,
}

impl TradeRecord {
    pub fn open(
        id: impl Into<String>,
        strategy_name: impl Into<String>,
        instrument: impl Into<String>,
        side: PositionSide,
        entry_order_id: impl Into<String>,
        entry_price: f64,
        amount: f64,
        stop_loss: f64,
        take_profit: f64,
    ) -> Self {
        Self {
            id: id.into(),
            strategy_name: strategy_name.into(),
            instrument: instrument.into(),
            side,
            entry_order_id: entry_order_id.into(),
            sl_order_id: None,
            tp_order_id: None,
            entry_price,
            amount,
            stop_loss,
            take_profit,
            entry_time: chrono::Utc::now().to_rfc3339(),
            exit_price: None,
            exit_time: None,
            exit_reason: None,
            pnl: None,
            pnl_percent: None,
            status: TradeStatus::Open,
        }
    }

    /// Mutates this record in place to a closed trade, computing directional
    /// PnL the way `position_engine::PositionManager::close_position` does.
    pub fn close(&mut self, exit_price: f64, reason: ExitReason) {
        let direction = match self.side {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
        };
        let pnl = direction * (exit_price - self.entry_price) / self.entry_price * self.amount;
        let pnl_percent = if self.entry_price > 0.0 { direction * (exit_price - self.entry_price) / self.entry_price * 100.0 } else { 0.0 };
        self.exit_price = Some(exit_price);
        self.exit_time = Some(chrono::Utc::now().to_rfc3339());
        self.exit_reason = Some(reason);
        self.pnl = Some(pnl);
        self.pnl_percent = Some(pnl_percent);
        self.status = TradeStatus::Closed;
    }
}

/// A patch applied via `update` — only `Some` fields are written.
#[derive(Debug, Clone, Default)]
pub struct TradeRecordPatch {
    pub sl_order_id: Option<Option<String>>,
    pub tp_order_id: Option<Option<String>>,
}

/// Filters for `query`, all optional.
#[derive(Debug, Clone, Default)]
pub struct TradeQuery {
    pub strategy_name: Option<String>,
    pub instrument: Option<String>,
    pub status: Option<TradeStatus>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Aggregate statistics, computed only over `closed` records (§4.8).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct TradeStats {
    pub total: u32,
    pub winning: u32,
    pub losing: u32,
    pub win_rate: f64,
    pub sum_pnl: f64,
    pub mean_pnl: f64,
    pub best: f64,
    pub worst: f64,
    pub sl_hits: u32,
    pub tp_hits: u32,
}

#[async_trait]
pub trait TradeHistoryStore: Send + Sync {
    async fn add(&self, record: TradeRecord) -> anyhow::Result<()>;
    async fn update(&self, id: &str, patch: TradeRecordPatch) -> anyhow::Result<()>;
    async fn close_trade(&self, id: &str, exit_price: f64, reason: ExitReason) -> anyhow::Result<()>;
    async fn get(&self, id: &str) -> anyhow::Result<Option<TradeRecord>>;
    async fn query(&self, query: &TradeQuery) -> anyhow::Result<Vec<TradeRecord>>;
    async fn stats(&self, query: &TradeQuery) -> anyhow::Result<TradeStats>;
    async fn delete(&self, id: &str) -> anyhow::Result<()>;
    /// Flush and release any resources held by the backend.
    async fn close(&self) -> anyhow::Result<()>;
}

/// Shared stats computation over an already-filtered slice of records, used by
/// both backends so the aggregation logic lives in one place.
pub(crate) fn compute_stats(records: &[TradeRecord]) -> TradeStats {
    let closed: Vec<&TradeRecord> = records.iter().filter(|r| r.status == TradeStatus::Closed).collect();
    let total = closed.len() as u32;
    if total == 0 {
        return TradeStats::default();
    }
    let mut winning = 0u32;
    let mut losing = 0u32;
    let mut sum_pnl = 0.0;
    let mut best = f64::MIN;
    let mut worst = f64::MAX;
    let mut sl_hits = 0u32;
    let mut tp_hits = 0u32;
    for r in &closed {
        let pnl = r.pnl.unwrap_or(0.0);
        sum_pnl += pnl;
        if pnl > 0.0 {
            winning += 1;
        } else if pnl < 0.0 {
            losing += 1;
        }
        best = best.max(pnl);
        worst = worst.min(pnl);
        match r.exit_reason {
            Some(ExitReason::SlHit) => sl_hits += 1,
            Some(ExitReason::TpHit) => tp_hits += 1,
            _ => {}
        }
    }
    TradeStats {
        total,
        winning,
        losing,
        win_rate: winning as f64 / total as f64 * 100.0,
        sum_pnl,
        mean_pnl: sum_pnl / total as f64,
        best,
        worst,
        sl_hits,
        tp_hits,
    }
}

/// Applies a `TradeQuery`'s filters (not limit/offset) to one record.
pub(crate) fn matches_query(record: &TradeRecord, query: &TradeQuery) -> bool {
    if let Some(name) = &query.strategy_name {
        if &record.strategy_name != name {
            return false;
        }
    }
    if let Some(instrument) = &query.instrument {
        if &record.instrument != instrument {
            return false;
        }
    }
    if let Some(status) = query.status {
        if record.status != status {
            return false;
        }
    }
    if let Some(from) = &query.from {
        if &record.entry_time < from {
            return false;
        }
    }
    if let Some(to) = &query.to {
        if &record.entry_time > to {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_computes_directional_pnl_for_long() {
        let mut r = TradeRecord::open("1", "razor", "BTC-USD-PERP", PositionSide::Long, "e1", 60000.0, 5000.0, 59400.0, 61200.0);
        r.close(61200.0, ExitReason::TpHit);
        assert_eq!(r.status, TradeStatus::Closed);
        assert!((r.pnl.unwrap() - 100.0).abs() < 1e-6);
    }

    #[test]
    fn close_computes_directional_pnl_for_short() {
        let mut r = TradeRecord::open("1", "razor", "BTC-USD-PERP", PositionSide::Short, "e1", 60000.0, 5000.0, 60600.0, 58800.0);
        r.close(58800.0, ExitReason::TpHit);
        assert!(r.pnl.unwrap() > 0.0);
    }

    #[test]
    fn compute_stats_only_considers_closed_records() {
        let mut open = TradeRecord::open("1", "razor", "BTC-USD-PERP", PositionSide::Long, "e1", 60000.0, 1000.0, 59400.0, 61200.0);
        let mut closed_win = TradeRecord::open("2", "razor", "BTC-USD-PERP", PositionSide::Long, "e2", 60000.0, 1000.0, 59400.0, 61200.0);
        closed_win.close(61200.0, ExitReason::TpHit);
        let mut closed_loss = TradeRecord::open("3", "razor", "BTC-USD-PERP", PositionSide::Long, "e3", 60000.0, 1000.0, 59400.0, 61200.0);
        closed_loss.close(59400.0, ExitReason::SlHit);
        open.status = TradeStatus::Open;

        let stats = compute_stats(&[open, closed_win, closed_loss]);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.winning, 1);
        assert_eq!(stats.losing, 1);
        assert_eq!(stats.sl_hits, 1);
        assert_eq!(stats.tp_hits, 1);
    }
}
