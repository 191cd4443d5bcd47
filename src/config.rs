// =============================================================================
// Engine Configuration — JSON-backed settings with atomic save
// =============================================================================
//
// Every tunable parameter of the engine lives here. Persistence uses an
// atomic tmp + rename pattern to prevent corruption on crash. All fields
// carry `#[serde(default)]` so that adding new fields never breaks loading
// an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::market_data::Timeframe;
use crate::trailing::TrailingDefaults;
use crate::types::TrailingType;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec![
        "AAPL".to_string(),
        "MSFT".to_string(),
        "NVDA".to_string(),
        "TSLA".to_string(),
        "SPY".to_string(),
    ]
}

fn default_source_timeframe() -> Timeframe {
    Timeframe::Sec5
}

fn default_target_timeframes() -> Vec<Timeframe> {
    vec![
        Timeframe::Min1,
        Timeframe::Min5,
        Timeframe::Min15,
        Timeframe::Hour1,
        Timeframe::Hour4,
        Timeframe::Day1,
    ]
}

fn default_max_risk_per_trade_pct() -> f64 {
    1.0
}

fn default_max_total_risk_pct() -> f64 {
    3.0
}

fn default_max_concurrent_positions() -> u32 {
    5
}

fn default_trail_distance_pct() -> f64 {
    2.0
}

fn default_activation_profit_pct() -> f64 {
    1.5
}

fn default_min_trail_pct() -> f64 {
    0.005
}

fn default_trailing_type() -> TrailingType {
    TrailingType::Percentage
}

fn default_atr_timeframe() -> Timeframe {
    Timeframe::Min15
}

fn default_db_path() -> String {
    "data/trades.db".to_string()
}

fn default_starting_equity() -> f64 {
    100_000.0
}

fn default_bar_store_dir() -> String {
    "data/bars".to_string()
}

fn default_base_url() -> String {
    "https://api.broker.example".to_string()
}

fn default_feed_url() -> String {
    "wss://feed.broker.example".to_string()
}

// =============================================================================
// Sections
// =============================================================================

/// Aggregation settings: source timeframe and reconstruction targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    #[serde(default = "default_source_timeframe")]
    pub source_timeframe: Timeframe,
    #[serde(default = "default_target_timeframes")]
    pub target_timeframes: Vec<Timeframe>,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            source_timeframe: default_source_timeframe(),
            target_timeframes: default_target_timeframes(),
        }
    }
}

/// Advisory risk limits consumed by whoever originates `open_position`;
/// the core does not enforce account-level limits itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_max_risk_per_trade_pct")]
    pub max_risk_per_trade_pct: f64,
    #[serde(default = "default_max_total_risk_pct")]
    pub max_total_risk_pct: f64,
    #[serde(default = "default_max_concurrent_positions")]
    pub max_concurrent_positions: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_risk_per_trade_pct: default_max_risk_per_trade_pct(),
            max_total_risk_pct: default_max_total_risk_pct(),
            max_concurrent_positions: default_max_concurrent_positions(),
        }
    }
}

/// Trailing-stop defaults applied when a symbol is armed without an explicit
/// per-symbol configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingConfigSection {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_trailing_type")]
    pub trailing_type: TrailingType,
    #[serde(default = "default_trail_distance_pct")]
    pub trail_distance_pct: f64,
    #[serde(default = "default_activation_profit_pct")]
    pub activation_profit_pct: f64,
    #[serde(default = "default_min_trail_pct")]
    pub min_trail_pct: f64,
    /// Timeframe the ATR trail reads its volatility from.
    #[serde(default = "default_atr_timeframe")]
    pub atr_timeframe: Timeframe,
}

impl Default for TrailingConfigSection {
    fn default() -> Self {
        Self {
            enable: false,
            trailing_type: default_trailing_type(),
            trail_distance_pct: default_trail_distance_pct(),
            activation_profit_pct: default_activation_profit_pct(),
            min_trail_pct: default_min_trail_pct(),
            atr_timeframe: default_atr_timeframe(),
        }
    }
}

impl TrailingConfigSection {
    pub fn defaults(&self) -> TrailingDefaults {
        TrailingDefaults {
            enabled: self.enable,
            trailing_type: self.trailing_type,
            trail_distance_pct: self.trail_distance_pct,
            activation_profit_pct: self.activation_profit_pct,
            min_trail_pct: self.min_trail_pct,
        }
    }
}

/// Journal storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_starting_equity")]
    pub starting_equity: f64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            starting_equity: default_starting_equity(),
        }
    }
}

/// Broker endpoints. Credentials come from the environment, never from the
/// config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_feed_url")]
    pub feed_url: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            feed_url: default_feed_url(),
        }
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the Kestrel engine.
///
/// Every field has a serde default so older JSON files missing new fields
/// still deserialize correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Symbols the engine is ingesting and tracking.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    #[serde(default)]
    pub aggregator: AggregatorConfig,

    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub trailing: TrailingConfigSection,

    #[serde(default)]
    pub journal: JournalConfig,

    #[serde(default)]
    pub broker: BrokerConfig,

    /// Directory for the on-disk bar warehouse.
    #[serde(default = "default_bar_store_dir")]
    pub bar_store_dir: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            aggregator: AggregatorConfig::default(),
            risk: RiskConfig::default(),
            trailing: TrailingConfigSection::default(),
            journal: JournalConfig::default(),
            broker: BrokerConfig::default(),
            bar_store_dir: default_bar_store_dir(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// A missing file is an error so the caller can fall back to defaults
    /// with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            source = %config.aggregator.source_timeframe,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration to `path` using an atomic write (write to
    /// `.tmp`, then rename). Prevents corruption if the process crashes
    /// mid-write.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialize engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.aggregator.source_timeframe, Timeframe::Sec5);
        assert_eq!(cfg.aggregator.target_timeframes.len(), 6);
        assert_eq!(cfg.aggregator.target_timeframes[0], Timeframe::Min1);
        assert!((cfg.risk.max_risk_per_trade_pct - 1.0).abs() < f64::EPSILON);
        assert!((cfg.risk.max_total_risk_pct - 3.0).abs() < f64::EPSILON);
        assert_eq!(cfg.risk.max_concurrent_positions, 5);
        assert!(!cfg.trailing.enable);
        assert!((cfg.trailing.trail_distance_pct - 2.0).abs() < f64::EPSILON);
        assert!((cfg.trailing.activation_profit_pct - 1.5).abs() < f64::EPSILON);
        assert_eq!(cfg.journal.db_path, "data/trades.db");
        assert!((cfg.journal.starting_equity - 100_000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn deserialize_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.aggregator.source_timeframe, Timeframe::Sec5);
        assert_eq!(cfg.trailing.atr_timeframe, Timeframe::Min15);
        assert_eq!(cfg.bar_store_dir, "data/bars");
    }

    #[test]
    fn deserialize_partial_json_fills_defaults() {
        let json = r#"{
            "symbols": ["AAPL"],
            "trailing": { "enable": true, "trail_distance_pct": 3.0 }
        }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbols, vec!["AAPL"]);
        assert!(cfg.trailing.enable);
        assert!((cfg.trailing.trail_distance_pct - 3.0).abs() < f64::EPSILON);
        // Untouched sections keep their defaults.
        assert!((cfg.trailing.activation_profit_pct - 1.5).abs() < f64::EPSILON);
        assert_eq!(cfg.journal.db_path, "data/trades.db");
    }

    #[test]
    fn timeframes_serialize_as_short_names() {
        let cfg = EngineConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("\"5s\""));
        assert!(json.contains("\"1m\""));
        assert!(json.contains("\"1d\""));
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine_config.json");

        let mut cfg = EngineConfig::default();
        cfg.symbols = vec!["NVDA".to_string()];
        cfg.trailing.enable = true;
        cfg.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.symbols, vec!["NVDA"]);
        assert!(loaded.trailing.enable);
        assert_eq!(
            loaded.aggregator.target_timeframes,
            cfg.aggregator.target_timeframes
        );
    }

    #[test]
    fn trailing_section_maps_to_defaults() {
        let section = TrailingConfigSection {
            enable: true,
            trailing_type: TrailingType::Atr,
            trail_distance_pct: 3.0,
            activation_profit_pct: 2.0,
            min_trail_pct: 0.01,
            atr_timeframe: Timeframe::Hour1,
        };
        let defaults = section.defaults();
        assert!(defaults.enabled);
        assert_eq!(defaults.trailing_type, TrailingType::Atr);
        assert!((defaults.trail_distance_pct - 3.0).abs() < f64::EPSILON);
    }
}
