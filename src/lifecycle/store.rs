// =============================================================================
// Lifecycle state persistence — atomic tmp + rename, hourly snapshots
// =============================================================================
//
// Grounded in this daemon's configuration-save pattern (write `.json.tmp`,
// then rename) applied to per-user strategy state instead of global config.
// In addition to the live state file, a snapshot is copied into a retained
// ring of the newest `backup_retention` hourly backups (§4.3).
// =============================================================================

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::RwLock;

use super::StrategyState;

enum Backend {
    File { dir: PathBuf, retention: u32, last_snapshot_hour: Mutex<Option<i64>> },
    Ephemeral(RwLock<Option<StrategyState>>),
}

pub struct StateStore {
    backend: Backend,
}

impl StateStore {
    /// Durable file backend: `dir/state.json` is the live file; hourly
    /// snapshots land in `dir/snapshots/state-<rfc3339>.json`, retaining only
    /// the newest `retention`.
    pub fn file(dir: impl Into<PathBuf>, retention: u32) -> Self {
        Self { backend: Backend::File { dir: dir.into(), retention, last_snapshot_hour: Mutex::new(None) } }
    }

    /// In-memory backend for tests — never touches the filesystem.
    pub fn ephemeral() -> Self {
        Self { backend: Backend::Ephemeral(RwLock::new(None)) }
    }

    pub fn load(&self) -> Result<Option<StrategyState>> {
        match &self.backend {
            Backend::Ephemeral(slot) => Ok(slot.read().clone()),
            Backend::File { dir, .. } => {
                let path = dir.join("state.json");
                if !path.exists() {
                    return Ok(None);
                }
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read lifecycle state from {}", path.display()))?;
                let state: StrategyState = serde_json::from_str(&content)
                    .with_context(|| format!("failed to parse lifecycle state from {}", path.display()))?;
                Ok(Some(state))
            }
        }
    }

    pub fn save(&self, state: &StrategyState) -> Result<()> {
        match &self.backend {
            Backend::Ephemeral(slot) => {
                *slot.write() = Some(state.clone());
                Ok(())
            }
            Backend::File { dir, retention, last_snapshot_hour } => {
                std::fs::create_dir_all(dir).with_context(|| format!("failed to create state dir {}", dir.display()))?;
                let path = dir.join("state.json");
                let tmp_path = path.with_extension("json.tmp");
                let content = serde_json::to_string_pretty(state).context("failed to serialise lifecycle state")?;
                std::fs::write(&tmp_path, &content)
                    .with_context(|| format!("failed to write tmp state to {}", tmp_path.display()))?;
                std::fs::rename(&tmp_path, &path)
                    .with_context(|| format!("failed to rename tmp state to {}", path.display()))?;

                self.maybe_snapshot(dir, *retention, last_snapshot_hour, &content)?;
                Ok(())
            }
        }
    }

    fn maybe_snapshot(&self, dir: &Path, retention: u32, last_snapshot_hour: &Mutex<Option<i64>>, content: &str) -> Result<()> {
        let now = Utc::now();
        let hour_bucket = now.timestamp() / 3600;
        let mut last = last_snapshot_hour.lock().unwrap();
        if *last == Some(hour_bucket) {
            return Ok(());
        }
        *last = Some(hour_bucket);
        drop(last);

        let snap_dir = dir.join("snapshots");
        std::fs::create_dir_all(&snap_dir).with_context(|| format!("failed to create snapshot dir {}", snap_dir.display()))?;
        let snap_path = snap_dir.join(format!("state-{}.json", now.to_rfc3339()));
        std::fs::write(&snap_path, content).with_context(|| format!("failed to write snapshot {}", snap_path.display()))?;

        self.prune_snapshots(&snap_dir, retention)
    }

    fn prune_snapshots(&self, snap_dir: &Path, retention: u32) -> Result<()> {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(snap_dir)
            .with_context(|| format!("failed to list snapshot dir {}", snap_dir.display()))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .collect();
        entries.sort();
        let keep_from = entries.len().saturating_sub(retention as usize);
        for old in &entries[..keep_from] {
            std::fs::remove_file(old).ok();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_persistence_yields_same_object() {
        let dir = std::env::temp_dir().join(format!("perp-daemon-lifecycle-test-{:?}", std::thread::current().id()));
        std::fs::remove_dir_all(&dir).ok();
        let store = StateStore::file(&dir, 24);
        let state = StrategyState::idle();
        store.save(&state).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.lifecycle, state.lifecycle);
        assert_eq!(loaded.version, state.version);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn unknown_schema_version_is_rejected_by_manager() {
        use super::super::{LifecycleManager, SCHEMA_VERSION};
        use crate::error::CoreError;

        let dir = std::env::temp_dir().join(format!("perp-daemon-lifecycle-test2-{:?}", std::thread::current().id()));
        std::fs::remove_dir_all(&dir).ok();
        let store = StateStore::file(&dir, 24);
        let mut future_state = StrategyState::idle();
        future_state.version = SCHEMA_VERSION + 1;
        store.save(&future_state).unwrap();

        let store2 = StateStore::file(&dir, 24);
        let err = LifecycleManager::load_or_default(store2).unwrap_err();
        assert!(matches!(err, CoreError::UnsupportedSchemaVersion { .. }));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn ephemeral_backend_never_touches_disk() {
        let store = StateStore::ephemeral();
        assert!(store.load().unwrap().is_none());
        store.save(&StrategyState::idle()).unwrap();
        assert!(store.load().unwrap().is_some());
    }
}
