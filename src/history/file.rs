// =============================================================================
// File-backed TradeHistoryStore — durable, atomic tmp + rename per record
// =============================================================================
//
// No SQL crate appears anywhere in this corpus; durable persistence follows
// the same atomic tmp-file + rename pattern used for configuration and
// lifecycle state. One JSON file per record id under `dir/`, loaded eagerly
// into memory on construction and kept in sync on every write — acceptable
// for the per-user trade volumes this daemon handles.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{compute_stats, matches_query, ExitReason, TradeHistoryStore, TradeQuery, TradeRecord, TradeRecordPatch, TradeStats};

pub struct FileTradeHistoryStore {
    dir: PathBuf,
    records: RwLock<HashMap<String, TradeRecord>>,
}

impl FileTradeHistoryStore {
    pub fn open(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let mut records = HashMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = std::fs::read_to_string(&path)?;
            let record: TradeRecord = serde_json::from_str(&content)?;
            records.insert(record.id.clone(), record);
        }
        Ok(Self { dir, records: RwLock::new(records) })
    }

    fn persist(&self, record: &TradeRecord) -> anyhow::Result<()> {
        let path = self.dir.join(format!("{}.json", record.id));
        let tmp_path = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(record)?;
        std::fs::write(&tmp_path, content)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}

#[async_trait]
impl TradeHistoryStore for FileTradeHistoryStore {
    async fn add(&self, record: TradeRecord) -> anyhow::Result<()> {
        self.persist(&record)?;
        self.records.write().insert(record.id.clone(), record);
        Ok(())
    }

    async fn update(&self, id: &str, patch: TradeRecordPatch) -> anyhow::Result<()> {
        let updated = {
            let mut records = self.records.write();
            let record = records.get_mut(id).ok_or_else(|| anyhow::anyhow!("no trade record with id {id}"))?;
            if let Some(sl) = patch.sl_order_id {
                record.sl_order_id = sl;
            }
            if let Some(tp) = patch.tp_order_id {
                record.tp_order_id = tp;
            }
            record.clone()
        };
        self.persist(&updated)
    }

    async fn close_trade(&self, id: &str, exit_price: f64, reason: ExitReason) -> anyhow::Result<()> {
        let updated = {
            let mut records = self.records.write();
            let record = records.get_mut(id).ok_or_else(|| anyhow::anyhow!("no trade record with id {id}"))?;
            record.close(exit_price, reason);
            record.clone()
        };
        self.persist(&updated)
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
        let path = self.dir.join(format!("{id}.json"));
        if path.exists() {
            std::fs::remove_file(path)?;
        }
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

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("perp-daemon-history-test-{:?}", std::thread::current().id()))
    }

    #[tokio::test]
    async fn add_persists_to_disk_and_survives_reopen() {
        let dir = temp_dir();
        std::fs::remove_dir_all(&dir).ok();
        let store = FileTradeHistoryStore::open(&dir).unwrap();
        let record = TradeRecord::open("1", "razor", "BTC-USD-PERP", PositionSide::Long, "e1", 60000.0, 5000.0, 59400.0, 61200.0);
        store.add(record).await.unwrap();

        let reopened = FileTradeHistoryStore::open(&dir).unwrap();
        let fetched = reopened.get("1").await.unwrap().unwrap();
        assert_eq!(fetched.entry_price, 60000.0);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn delete_removes_file() {
        let dir = temp_dir();
        std::fs::remove_dir_all(&dir).ok();
        let store = FileTradeHistoryStore::open(&dir).unwrap();
        let record = TradeRecord::open("1", "razor", "BTC-USD-PERP", PositionSide::Long, "e1", 60000.0, 5000.0, 59400.0, 61200.0);
        store.add(record).await.unwrap();
        store.delete("1").await.unwrap();
        assert!(store.get("1").await.unwrap().is_none());
        assert!(!dir.join("1.json").exists());
        std::fs::remove_dir_all(&dir).ok();
    }
}
