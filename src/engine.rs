// =============================================================================
// Central Engine State — Kestrel trade engine
// =============================================================================
//
// The single assembly point for the engine. Subsystems are owned handles
// threaded through constructor injection; nothing here is a process-wide
// singleton. All cross-task sharing goes through `Arc<EngineState>`.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::indicators::IndicatorEngine;
use crate::journal::TradeJournal;
use crate::market_data::{Aggregator, BarStore, SaveMode};
use crate::position_book::{PortfolioStats, PositionBook};
use crate::trailing::TrailingController;

/// Maximum number of recent soft-failure records to retain.
const MAX_RECENT_ERRORS: usize = 50;

/// A recorded soft-failure event (rejected candidates, dropped bars,
/// callback errors). These are counted and kept for inspection, never
/// propagated.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Engine state shared across all async tasks via `Arc<EngineState>`.
pub struct EngineState {
    pub config: RwLock<EngineConfig>,
    pub aggregator: Arc<Aggregator>,
    pub bar_store: Arc<BarStore>,
    pub journal: Arc<TradeJournal>,
    pub book: Arc<PositionBook>,
    pub indicators: Arc<IndicatorEngine>,
    pub trailing: Arc<TrailingController>,
    recent_errors: RwLock<Vec<ErrorRecord>>,
    pub start_time: std::time::Instant,
}

impl EngineState {
    /// Build every subsystem from the configuration.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let aggregator = Arc::new(
            Aggregator::new(
                config.aggregator.source_timeframe,
                &config.aggregator.target_timeframes,
            )
            .context("invalid aggregator configuration")?,
        );

        let bar_store =
            Arc::new(BarStore::open(&config.bar_store_dir).context("failed to open bar store")?);

        let journal = Arc::new(
            TradeJournal::open(&config.journal.db_path).context("failed to open trade journal")?,
        );

        let book = Arc::new(PositionBook::new(journal.clone()));

        let indicators = Arc::new(IndicatorEngine::new(
            aggregator.clone(),
            Some(bar_store.clone()),
        ));

        let trailing = Arc::new(TrailingController::new(
            book.clone(),
            indicators.clone(),
            journal.clone(),
            config.trailing.atr_timeframe,
            config.trailing.defaults(),
        ));

        Ok(Self {
            config: RwLock::new(config),
            aggregator,
            bar_store,
            journal,
            book,
            indicators,
            trailing,
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        })
    }

    /// Record a soft failure. The ring buffer is capped at
    /// [`MAX_RECENT_ERRORS`]; oldest entries are evicted at the limit.
    pub fn push_error(&self, message: String) {
        let record = ErrorRecord {
            message,
            at: Utc::now().to_rfc3339(),
        };
        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
    }

    pub fn recent_errors(&self) -> Vec<ErrorRecord> {
        self.recent_errors.read().clone()
    }

    /// Portfolio rollup passthrough, for status logging.
    pub fn portfolio(&self) -> PortfolioStats {
        self.book.portfolio_rollup()
    }

    /// Persist every symbol's completed real-time aggregates to the bar
    /// store. Called on shutdown; merge mode keeps earlier sessions intact.
    pub fn flush_aggregates_to_store(&self) {
        let symbols = self.config.read().symbols.clone();
        for symbol in &symbols {
            for tf in self.aggregator.target_timeframes() {
                let bars = self.aggregator.completed_bars(symbol, *tf, usize::MAX);
                if bars.is_empty() {
                    continue;
                }
                if let Err(e) = self.bar_store.save(symbol, *tf, &bars, SaveMode::Merge) {
                    warn!(symbol, timeframe = %tf, error = %e, "failed to flush aggregates");
                } else {
                    info!(symbol, timeframe = %tf, count = bars.len(), "aggregates flushed");
                }
            }
        }
    }
}

impl std::fmt::Debug for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineState")
            .field("open_positions", &self.book.open_count())
            .field("recent_errors", &self.recent_errors.read().len())
            .field("uptime_secs", &self.start_time.elapsed().as_secs())
            .finish()
    }
}
