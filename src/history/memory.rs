// =============================================================================
// In-memory TradeHistoryStore — ephemeral, tests only (§9, §4.8)
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{compute_stats, matches_query, ExitReason, TradeHistoryStore, TradeQuery, TradeRecord, TradeRecordPatch, TradeStats};

#[derive(Default)]
pub struct MemoryTradeHistoryStore {
    records: RwLock<HashMap<String, TradeRecord>>,
}

impl MemoryTradeHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TradeHistoryStore for MemoryTradeHistoryStore {
    async fn add(&self, record: TradeRecord) -> anyhow::Result<()> {
        self.records.write().insert(record.id.clone(), record);
        Ok(())
    }

    async fn update(&self, id: &str, patch: TradeRecordPatch) -> anyhow::Result<()> {
        let mut records = self.records.write();
        let record = records.get_mut(id).ok_or_else(|| anyhow::anyhow!("no trade record with id {id}"))?;
        if let Some(sl) = patch.sl_order_id {
            record.sl_order_id = sl;
        }
        if let Some(tp) = patch.tp_order_id {
            record.tp_order_id = tp;
        }
        Ok(())
    }

    async fn close_trade(&self, id: &str, exit_price: f64, reason: ExitReason) -> anyhow::Result<()> {
        let mut records = self.records.write();
        let record = records.get_mut(id).ok_or_else(|| anyhow::anyhow!("no trade record with id {id}"))?;
        record.close(exit_price, reason);
        Ok(())
    }

    async fn get(&self, id: &str) -> anyhow::Result<Option<TradeRecord>> {
        Ok(self.records.read().get(id).cloned())
    }

    async fn query(&self, query: &TradeQuery) -> anyhow::Result<Vec<TradeRecord>> {
        let records = self.records.read();
        let mut matched: Vec<TradeRecord> = records.values().filter(|r| matches_query(r, query)).cloned().collect();
        matched.sort_by(|a, b| b.entry_time.cmp(&a.entry_time));
        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(matched.len());
        Ok(matched.into_iter().skip(offset).take(limit).collect())
    }

    async fn stats(&self, query: &TradeQuery) -> anyhow::Result<TradeStats> {
        let records = self.records.read();
        let matched: Vec<TradeRecord> = records.values().filter(|r| matches_query(r, query)).cloned().collect();
        Ok(compute_stats(&matched))
    }

    async fn delete(&self, id: &str) -> anyhow::Result<()> {
        self.records.write().remove(id);
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PositionSide;

    #[tokio::test]
    async fn add_then_get_roundtrips() {
        let store = MemoryTradeHistoryStore::new();
        let record = TradeRecord::open("1", "razor", "BTC-USD-PERP", PositionSide::Long, "e1", 60000.0, 5000.0, 59400.0, 61200.0);
        store.add(record.clone()).await.unwrap();
        let fetched = store.get("1").await.unwrap().unwrap();
        assert_eq!(fetched.id, record.id);
    }

    #[tokio::test]
    async fn query_filters_by_status_and_orders_newest_first() {
        let store = MemoryTradeHistoryStore::new();
        let mut r1 = TradeRecord::open("1", "razor", "BTC-USD-PERP", PositionSide::Long, "e1", 60000.0, 1000.0, 59400.0, 61200.0);
        r1.entry_time = "2026-01-01T00:00:00Z".to_string();
        let mut r2 = TradeRecord::open("2", "razor", "BTC-USD-PERP", PositionSide::Long, "e2", 60000.0, 1000.0, 59400.0, 61200.0);
        r2.entry_time = "2026-01-02T00:00:00Z".to_string();
        store.add(r1).await.unwrap();
        store.add(r2).await.unwrap();

        let results = store.query(&TradeQuery { status: Some(super::super::TradeStatus::Open), ..Default::default() }).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "2");
    }

    #[tokio::test]
    async fn close_trade_updates_status_and_pnl() {
        let store = MemoryTradeHistoryStore::new();
        let record = TradeRecord::open("1", "razor", "BTC-USD-PERP", PositionSide::Long, "e1", 60000.0, 5000.0, 59400.0, 61200.0);
        store.add(record).await.unwrap();
        store.close_trade("1", 61200.0, ExitReason::TpHit).await.unwrap();
        let fetched = store.get("1").await.unwrap().unwrap();
        assert_eq!(fetched.status, super::super::TradeStatus::Closed);
        assert!(fetched.pnl.unwrap() > 0.0);
    }
}
