// =============================================================================
// Daemon Configuration — hot-loadable settings with atomic save
// =============================================================================
//
// Every tunable lives in one closed record, parsed once at the process
// boundary. All fields carry `#[serde(default = "...")]` so that adding a
// field never breaks loading an older config file. Persistence uses the same
// atomic tmp + rename pattern used for lifecycle state (see lifecycle::store).
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

fn default_risk_mode() -> RiskMode {
    RiskMode::Percent
}
fn default_risk_value() -> f64 {
    2.0
}
fn default_max_leverage_cap() -> f64 {
    20.0
}
fn default_leverage_warn_threshold() -> f64 {
    10.0
}
fn default_min_trade_amount() -> f64 {
    5.0
}
fn default_order_fill_timeout_ms() -> u64 {
    30_000
}
fn default_reconcile_interval_ms() -> u64 {
    60_000
}
fn default_health_check_interval_ms() -> u64 {
    10_000
}
fn default_backup_interval_ms() -> u64 {
    3_600_000
}
fn default_backup_retention() -> u32 {
    24
}
fn default_trigger_budget() -> u32 {
    10
}
fn default_signal_cooldown_ms() -> u64 {
    30_000
}
fn default_bracket_max_retries() -> u32 {
    2
}
fn default_bracket_backoff_base_ms() -> u64 {
    500
}
fn default_true() -> bool {
    true
}
fn default_max_daily_loss_pct() -> f64 {
    3.0
}
fn default_max_consecutive_losses() -> u32 {
    5
}
fn default_max_trades_per_day() -> u32 {
    50
}
fn default_max_drawdown_pct() -> f64 {
    6.0
}

/// Whether risk is sized as a percentage of balance or a fixed quote amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskMode {
    Percent,
    Fixed,
}

/// Which broker environment to connect sessions against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerEnv {
    Live,
    Testnet,
}

impl Default for BrokerEnv {
    fn default() -> Self {
        Self::Testnet
    }
}

/// Top-level daemon configuration (§6 Configuration record), expanded with
/// the ambient circuit-breaker thresholds carried from the predecessor's risk
/// module (§10 redesign flags).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub broker_env: BrokerEnv,

    #[serde(default = "default_risk_mode")]
    pub risk_mode: RiskMode,

    #[serde(default = "default_risk_value")]
    pub risk_value: f64,

    #[serde(default = "default_max_leverage_cap")]
    pub max_leverage_cap: f64,

    #[serde(default = "default_leverage_warn_threshold")]
    pub leverage_warn_threshold: f64,

    #[serde(default = "default_min_trade_amount")]
    pub min_trade_amount: f64,

    #[serde(default = "default_order_fill_timeout_ms")]
    pub order_fill_timeout_ms: u64,

    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,

    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    #[serde(default = "default_backup_interval_ms")]
    pub backup_interval_ms: u64,

    #[serde(default = "default_backup_retention")]
    pub backup_retention: u32,

    #[serde(default = "default_trigger_budget")]
    pub trigger_budget: u32,

    #[serde(default = "default_signal_cooldown_ms")]
    pub signal_cooldown_ms: u64,

    #[serde(default = "default_bracket_max_retries")]
    pub bracket_max_retries: u32,

    #[serde(default = "default_bracket_backoff_base_ms")]
    pub bracket_backoff_base_ms: u64,

    /// Whether the reconciliation engine actively closes ghosts / adopts
    /// orphans, or only logs drift for an operator to resolve (§10 escape
    /// hatch; defaults to the redesigned, automatic behavior).
    #[serde(default = "default_true")]
    pub reconcile_auto_action: bool,

    // --- ambient circuit-breaker thresholds (§11.2 / §10) ------------------
    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: f64,

    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,

    #[serde(default = "default_max_trades_per_day")]
    pub max_trades_per_day: u32,

    #[serde(default = "default_max_drawdown_pct")]
    pub max_drawdown_pct: f64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            broker_env: BrokerEnv::default(),
            risk_mode: default_risk_mode(),
            risk_value: default_risk_value(),
            max_leverage_cap: default_max_leverage_cap(),
            leverage_warn_threshold: default_leverage_warn_threshold(),
            min_trade_amount: default_min_trade_amount(),
            order_fill_timeout_ms: default_order_fill_timeout_ms(),
            reconcile_interval_ms: default_reconcile_interval_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            backup_interval_ms: default_backup_interval_ms(),
            backup_retention: default_backup_retention(),
            trigger_budget: default_trigger_budget(),
            signal_cooldown_ms: default_signal_cooldown_ms(),
            bracket_max_retries: default_bracket_max_retries(),
            bracket_backoff_base_ms: default_bracket_backoff_base_ms(),
            reconcile_auto_action: true,
            max_daily_loss_pct: default_max_daily_loss_pct(),
            max_consecutive_losses: default_max_consecutive_losses(),
            max_trades_per_day: default_max_trades_per_day(),
            max_drawdown_pct: default_max_drawdown_pct(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a JSON file, falling back to defaults with a
    /// warning if the file is missing (mirrors the caller-side fallback used
    /// throughout this daemon's startup path).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read daemon config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse daemon config from {}", path.display()))?;
        info!(path = %path.display(), broker_env = ?config.broker_env, "daemon config loaded");
        Ok(config)
    }

    /// Persist via atomic tmp-file + rename.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self).context("failed to serialise daemon config")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;
        info!(path = %path.display(), "daemon config saved (atomic)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = DaemonConfig::default();
        assert_eq!(cfg.broker_env, BrokerEnv::Testnet);
        assert_eq!(cfg.risk_mode, RiskMode::Percent);
        assert!((cfg.risk_value - 2.0).abs() < f64::EPSILON);
        assert!(cfg.reconcile_auto_action);
        assert_eq!(cfg.bracket_max_retries, 2);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: DaemonConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.max_leverage_cap, 20.0);
        assert_eq!(cfg.trigger_budget, 10);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "risk_mode": "fixed", "risk_value": 50.0 }"#;
        let cfg: DaemonConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.risk_mode, RiskMode::Fixed);
        assert_eq!(cfg.risk_value, 50.0);
        assert_eq!(cfg.max_consecutive_losses, 5);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = DaemonConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: DaemonConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.risk_value, cfg2.risk_value);
        assert_eq!(cfg.broker_env, cfg2.broker_env);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = std::env::temp_dir().join(format!("perp-daemon-cfg-test-{:?}", std::thread::current().id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("daemon_config.json");
        let cfg = DaemonConfig::default();
        cfg.save(&path).unwrap();
        let loaded = DaemonConfig::load(&path).unwrap();
        assert_eq!(loaded.risk_value, cfg.risk_value);
        std::fs::remove_dir_all(&dir).ok();
    }
}
