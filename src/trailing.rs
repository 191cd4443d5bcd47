// =============================================================================
// Trailing Stop Controller — per-symbol ratcheting stop state machine
// =============================================================================
//
// States per symbol:
//   Disabled -> enable() -> Armed -> profit threshold -> Trailing
//   Trailing -> position closed / disable() -> Retired -> enable() -> Armed
//
// Once Trailing, the controller never falls back to Armed: activation is
// sticky. Stops ratchet only in the favorable direction, and a candidate is
// proposed only when it improves on the current stop by at least one basis
// point. `PositionBook::modify_stop` remains the authoritative rail; the
// controller's own gate exists to keep the audit history clean.
//
// Trail distance is a fixed percentage or an ATR multiple converted to a
// percentage of the current price. When ATR is unavailable the controller
// falls back to percentage trailing with the same amount, logged once per
// symbol.
//
// Lock discipline: the config lock is never held across calls into the
// position book, the indicator engine, or the journal.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::indicators::{atr, IndicatorEngine};
use crate::journal::TradeJournal;
use crate::market_data::Timeframe;
use crate::position_book::PositionBook;
use crate::types::{Side, TrailingType};

/// Minimum relative improvement for a new stop: 1 basis point (0.01%).
const MIN_IMPROVEMENT_PCT: f64 = 0.01;

// ---------------------------------------------------------------------------
// Config & audit types
// ---------------------------------------------------------------------------

/// Conceptual state of a symbol's trailing machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrailingState {
    Disabled,
    Armed,
    Trailing,
    Retired,
}

/// Per-symbol trailing configuration and runtime state.
#[derive(Debug, Clone, Serialize)]
pub struct TrailingConfig {
    pub symbol: String,
    pub trailing_type: TrailingType,
    /// Percentage (e.g. 2.0 = 2%) or ATR multiplier, depending on the type.
    pub trailing_amount: f64,
    /// Profit percentage required before trailing activates.
    pub activation_profit_pct: f64,
    /// Floor on the trail distance, as a fraction (0.005 = 0.5%).
    pub min_trail_pct: f64,
    pub enabled: bool,
    /// Sticky once set.
    pub activated: bool,
    pub activation_price: Option<f64>,
    pub activation_time: Option<DateTime<Utc>>,
    pub adjustment_count: u32,
    pub last_adjustment_time: Option<DateTime<Utc>>,
    /// Highest price since activation (longs).
    pub high_water: f64,
    /// Lowest price since activation (shorts).
    pub low_water: f64,
}

/// Audit row for one accepted stop adjustment.
#[derive(Debug, Clone, Serialize)]
pub struct StopAdjustment {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub old_stop: Option<f64>,
    pub new_stop: f64,
    pub trigger_price: f64,
    pub trailing_type: TrailingType,
    pub trailing_amount: f64,
    pub profit_pct_at_adjustment: f64,
}

/// Engine-level trailing defaults, from the runtime config.
#[derive(Debug, Clone)]
pub struct TrailingDefaults {
    pub enabled: bool,
    pub trailing_type: TrailingType,
    pub trail_distance_pct: f64,
    pub activation_profit_pct: f64,
    pub min_trail_pct: f64,
}

impl Default for TrailingDefaults {
    fn default() -> Self {
        Self {
            enabled: false,
            trailing_type: TrailingType::Percentage,
            trail_distance_pct: 2.0,
            activation_profit_pct: 1.5,
            min_trail_pct: 0.005,
        }
    }
}

/// Status snapshot for one symbol.
#[derive(Debug, Clone, Serialize)]
pub struct TrailingStatus {
    pub state: TrailingState,
    pub enabled: bool,
    pub activated: bool,
    pub activation_threshold: Option<f64>,
    pub current_profit_pct: Option<f64>,
    pub adjustment_count: u32,
    pub last_adjustment_time: Option<DateTime<Utc>>,
    pub high_water: Option<f64>,
    pub low_water: Option<f64>,
}

// ---------------------------------------------------------------------------
// TrailingController
// ---------------------------------------------------------------------------

pub struct TrailingController {
    configs: RwLock<HashMap<String, TrailingConfig>>,
    /// Symbols whose config was removed; distinguishes Retired from Disabled.
    retired: RwLock<HashSet<String>>,
    history: RwLock<Vec<StopAdjustment>>,
    /// Symbols already warned about the ATR-to-percentage fallback.
    atr_fallback_warned: Mutex<HashSet<String>>,
    book: Arc<PositionBook>,
    indicators: Arc<IndicatorEngine>,
    journal: Arc<TradeJournal>,
    /// Timeframe the ATR trail operates on.
    atr_timeframe: Timeframe,
    defaults: TrailingDefaults,
}

impl TrailingController {
    pub fn new(
        book: Arc<PositionBook>,
        indicators: Arc<IndicatorEngine>,
        journal: Arc<TradeJournal>,
        atr_timeframe: Timeframe,
        defaults: TrailingDefaults,
    ) -> Self {
        Self {
            configs: RwLock::new(HashMap::new()),
            retired: RwLock::new(HashSet::new()),
            history: RwLock::new(Vec::new()),
            atr_fallback_warned: Mutex::new(HashSet::new()),
            book,
            indicators,
            journal,
            atr_timeframe,
            defaults,
        }
    }

    // -------------------------------------------------------------------------
    // Enable / disable
    // -------------------------------------------------------------------------

    /// Arm trailing for a symbol. An invalid configuration is logged and
    /// refused — nothing is enabled, nothing panics; a bad config must not
    /// take down a running session. Returns whether trailing was armed.
    pub fn enable(
        &self,
        symbol: &str,
        trailing_type: TrailingType,
        trailing_amount: f64,
        activation_profit_pct: f64,
        min_trail_pct: f64,
    ) -> bool {
        if trailing_amount <= 0.0 || !trailing_amount.is_finite() {
            warn!(
                symbol,
                trailing_amount, "refusing trailing config: amount must be > 0"
            );
            return false;
        }
        if activation_profit_pct < 0.0 || min_trail_pct < 0.0 {
            warn!(
                symbol,
                activation_profit_pct,
                min_trail_pct,
                "refusing trailing config: negative threshold"
            );
            return false;
        }

        let config = TrailingConfig {
            symbol: symbol.to_string(),
            trailing_type,
            trailing_amount,
            activation_profit_pct,
            min_trail_pct,
            enabled: true,
            activated: false,
            activation_price: None,
            activation_time: None,
            adjustment_count: 0,
            last_adjustment_time: None,
            high_water: 0.0,
            low_water: f64::INFINITY,
        };

        self.configs.write().insert(symbol.to_string(), config);
        self.retired.write().remove(symbol);

        info!(
            symbol,
            %trailing_type,
            trailing_amount,
            activation_profit_pct,
            "trailing stop enabled"
        );
        true
    }

    /// Arm trailing using the engine-level defaults.
    pub fn enable_with_defaults(&self, symbol: &str) -> bool {
        self.enable(
            symbol,
            self.defaults.trailing_type,
            self.defaults.trail_distance_pct,
            self.defaults.activation_profit_pct,
            self.defaults.min_trail_pct,
        )
    }

    /// Whether the engine defaults say new positions should trail.
    pub fn defaults_enabled(&self) -> bool {
        self.defaults.enabled
    }

    /// Remove a symbol's config. The current stop and the audit history are
    /// untouched; the symbol moves to Retired.
    pub fn disable(&self, symbol: &str) {
        self.retire(symbol);
        info!(symbol, "trailing stop disabled");
    }

    fn retire(&self, symbol: &str) {
        if self.configs.write().remove(symbol).is_some() {
            self.retired.write().insert(symbol.to_string());
        }
    }

    // -------------------------------------------------------------------------
    // Evaluation
    // -------------------------------------------------------------------------

    /// Evaluate one symbol at `current_price`. Returns the accepted
    /// adjustment as `(old_stop, new_stop)`, or `None` when nothing moved.
    pub fn evaluate(&self, symbol: &str, current_price: f64) -> Option<(Option<f64>, f64)> {
        self.evaluate_inner(symbol, current_price)
            .map(|adj| (adj.old_stop, adj.new_stop))
    }

    fn evaluate_inner(&self, symbol: &str, current_price: f64) -> Option<StopAdjustment> {
        if current_price <= 0.0 || !current_price.is_finite() {
            return None;
        }

        // Position lookup happens before any controller lock is taken.
        let Some(position) = self.book.position(symbol) else {
            self.retire(symbol);
            debug!(symbol, "position gone; trailing retired");
            return None;
        };

        let profit_pct = match position.side {
            Side::Long => (current_price - position.entry_price) / position.entry_price * 100.0,
            Side::Short => (position.entry_price - current_price) / position.entry_price * 100.0,
        };

        // Phase 1 (config lock): activation + water marks, then snapshot what
        // the trail computation needs. The lock is dropped before ATR I/O.
        let (trailing_type, trailing_amount, min_trail_pct, water_mark) = {
            let mut configs = self.configs.write();
            let config = configs.get_mut(symbol)?;
            if !config.enabled {
                return None;
            }

            if !config.activated {
                if profit_pct < config.activation_profit_pct {
                    return None;
                }
                config.activated = true;
                config.activation_price = Some(current_price);
                config.activation_time = Some(Utc::now());
                config.high_water = current_price;
                config.low_water = current_price;
                info!(
                    symbol,
                    price = current_price,
                    profit_pct,
                    "trailing stop activated"
                );
            }

            match position.side {
                Side::Long => config.high_water = config.high_water.max(current_price),
                Side::Short => config.low_water = config.low_water.min(current_price),
            }

            let water_mark = match position.side {
                Side::Long => config.high_water,
                Side::Short => config.low_water,
            };
            (
                config.trailing_type,
                config.trailing_amount,
                config.min_trail_pct,
                water_mark,
            )
        };

        // Phase 2 (no locks): trail distance, possibly via ATR.
        let trail_pct = match trailing_type {
            TrailingType::Percentage => trailing_amount / 100.0,
            TrailingType::Atr => {
                match self
                    .indicators
                    .atr(symbol, atr::DEFAULT_PERIOD, self.atr_timeframe)
                {
                    Some(atr) if atr > 0.0 => (atr * trailing_amount) / current_price,
                    _ => {
                        if self.atr_fallback_warned.lock().insert(symbol.to_string()) {
                            warn!(
                                symbol,
                                trailing_amount,
                                "ATR unavailable; falling back to percentage trail"
                            );
                        }
                        trailing_amount / 100.0
                    }
                }
            }
        };
        let trail_pct = trail_pct.max(min_trail_pct);

        let candidate = match position.side {
            Side::Long => water_mark * (1.0 - trail_pct),
            Side::Short => water_mark * (1.0 + trail_pct),
        };

        // The controller's own gate: only propose a stop that is at least
        // one basis point better than the current one.
        if let Some(current_stop) = position.stop_price {
            let improvement_pct = match position.side {
                Side::Long => (candidate - current_stop) / current_stop * 100.0,
                Side::Short => (current_stop - candidate) / current_stop * 100.0,
            };
            if improvement_pct < MIN_IMPROVEMENT_PCT {
                return None;
            }
        }

        // The book enforces monotonicity as the last line of defense.
        if !self.book.modify_stop(symbol, candidate) {
            debug!(symbol, candidate, "book rejected trailing candidate");
            return None;
        }

        let adjustment = StopAdjustment {
            symbol: symbol.to_string(),
            timestamp: Utc::now(),
            old_stop: position.stop_price,
            new_stop: candidate,
            trigger_price: current_price,
            trailing_type,
            trailing_amount,
            profit_pct_at_adjustment: profit_pct,
        };

        {
            let mut configs = self.configs.write();
            if let Some(config) = configs.get_mut(symbol) {
                config.adjustment_count += 1;
                config.last_adjustment_time = Some(adjustment.timestamp);
            }
        }
        self.history.write().push(adjustment.clone());

        if let Err(e) = self.journal.update_stop(position.trade_id, candidate) {
            warn!(symbol, trade_id = position.trade_id, error = %e, "journal stop update failed");
        }

        debug!(
            symbol,
            old_stop = ?position.stop_price,
            new_stop = candidate,
            trigger_price = current_price,
            profit_pct,
            "trailing stop adjusted"
        );

        Some(adjustment)
    }

    /// Sweep every enabled symbol using its position's last seen price.
    /// Symbols whose position vanished are retired. This is the scheduled
    /// entry point for the periodic trailing tick.
    pub fn check_and_update_all(&self) -> Vec<StopAdjustment> {
        let symbols: Vec<String> = self.configs.read().keys().cloned().collect();
        let mut adjustments = Vec::new();

        for symbol in symbols {
            let Some(position) = self.book.position(&symbol) else {
                self.retire(&symbol);
                debug!(symbol = %symbol, "position no longer open; trailing retired");
                continue;
            };
            let Some(price) = position.current_price else {
                debug!(symbol = %symbol, "no price yet; skipping trailing check");
                continue;
            };

            if let Some(adjustment) = self.evaluate_inner(&symbol, price) {
                adjustments.push(adjustment);
            }
        }

        adjustments
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    /// Conceptual state of the symbol's trailing machine.
    pub fn state(&self, symbol: &str) -> TrailingState {
        if let Some(config) = self.configs.read().get(symbol) {
            if config.activated {
                TrailingState::Trailing
            } else {
                TrailingState::Armed
            }
        } else if self.retired.read().contains(symbol) {
            TrailingState::Retired
        } else {
            TrailingState::Disabled
        }
    }

    /// Status snapshot for one symbol. Only the side-relevant water mark is
    /// reported: high for longs, low for shorts.
    pub fn trailing_status(&self, symbol: &str) -> TrailingStatus {
        let state = self.state(symbol);
        let position = self.book.position(symbol);
        let side = position.as_ref().map(|p| p.side);
        let current_profit_pct = position
            .as_ref()
            .and_then(|p| p.current_price.is_some().then(|| p.unrealized_pnl_pct()));

        let configs = self.configs.read();
        let config = configs.get(symbol);

        TrailingStatus {
            state,
            enabled: config.map_or(false, |c| c.enabled),
            activated: config.map_or(false, |c| c.activated),
            activation_threshold: config.map(|c| c.activation_profit_pct),
            current_profit_pct,
            adjustment_count: config.map_or(0, |c| c.adjustment_count),
            last_adjustment_time: config.and_then(|c| c.last_adjustment_time),
            high_water: config.and_then(|c| {
                (c.activated && side == Some(Side::Long)).then_some(c.high_water)
            }),
            low_water: config.and_then(|c| {
                (c.activated && side == Some(Side::Short)).then_some(c.low_water)
            }),
        }
    }

    /// Copy of the per-symbol config, if present.
    pub fn config(&self, symbol: &str) -> Option<TrailingConfig> {
        self.configs.read().get(symbol).cloned()
    }

    /// Audit history, optionally filtered, newest first.
    pub fn adjustment_history(
        &self,
        symbol: Option<&str>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Vec<StopAdjustment> {
        let history = self.history.read();
        let mut rows: Vec<StopAdjustment> = history
            .iter()
            .filter(|adj| symbol.map_or(true, |s| adj.symbol == s))
            .filter(|adj| start.map_or(true, |t| adj.timestamp >= t))
            .filter(|adj| end.map_or(true, |t| adj.timestamp <= t))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        rows
    }
}

impl std::fmt::Debug for TrailingController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrailingController")
            .field("configs", &self.configs.read().len())
            .field("retired", &self.retired.read().len())
            .field("adjustments", &self.history.read().len())
            .finish()
    }
}
