// =============================================================================
// Timeframe Aggregator — lossless OHLCV reconstruction to larger timeframes
// =============================================================================
//
// Consumes a monotonic stream of source bars per symbol (e.g. 5-second) and
// maintains one in-progress bar plus an append-only list of completed bars
// for every (symbol, target timeframe).
//
// Boundary rule: the bar containing timestamp t starts at
// floor(epoch(t) / S) * S for a timeframe of S seconds. A source bar whose
// boundary differs from the in-progress bar's finalizes the old bar and
// starts a new one.
//
// Thread-safety: a per-symbol parking_lot::Mutex serializes all mutations to
// that symbol's state; the outer registry is an RwLock. The completion
// callback fires only after the symbol mutex has been released, so a slow or
// failing callback can never corrupt aggregation state.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::market_data::bars::{AggregatedBar, SourceBar, Timeframe};

/// Invoked for every completed bar: `(symbol, timeframe, bar)`.
///
/// Errors are logged and never propagated back into the aggregator.
pub type BarCompleteCallback =
    Box<dyn Fn(&str, Timeframe, &AggregatedBar) -> anyhow::Result<()> + Send + Sync>;

// ---------------------------------------------------------------------------
// Per-symbol state
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SymbolState {
    /// At most one in-progress bar per target timeframe.
    in_progress: HashMap<Timeframe, AggregatedBar>,
    /// Append-only within a run; eviction is the caller's concern.
    completed: HashMap<Timeframe, Vec<AggregatedBar>>,
    /// Timestamp of the last accepted source bar, for ordering enforcement.
    last_source_ts: Option<DateTime<Utc>>,
}

/// One row of the tabular snapshot produced by [`Aggregator::to_table`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct BarRow {
    pub bar_start: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub complete: bool,
}

/// Aggregation statistics for a symbol, per target timeframe.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AggregationStats {
    pub symbol: String,
    pub source_timeframe: Timeframe,
    pub complete_bars: BTreeMap<Timeframe, usize>,
    pub has_in_progress: BTreeMap<Timeframe, bool>,
    pub source_bar_counts: BTreeMap<Timeframe, u32>,
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

/// Multi-timeframe bar aggregator.
pub struct Aggregator {
    source_tf: Timeframe,
    /// Sorted ascending; the first entry is the price-bus driver.
    target_tfs: Vec<Timeframe>,
    symbols: RwLock<HashMap<String, Arc<Mutex<SymbolState>>>>,
    on_bar_complete: RwLock<Option<BarCompleteCallback>>,
}

impl Aggregator {
    /// Create an aggregator from a source timeframe into one or more strictly
    /// larger target timeframes.
    pub fn new(source_tf: Timeframe, target_tfs: &[Timeframe]) -> Result<Self, EngineError> {
        if target_tfs.is_empty() {
            return Err(EngineError::Config {
                reason: "at least one target timeframe is required".to_string(),
            });
        }
        for tf in target_tfs {
            if tf.seconds() <= source_tf.seconds() {
                return Err(EngineError::Config {
                    reason: format!(
                        "target timeframe {tf} must be larger than source {source_tf}"
                    ),
                });
            }
        }

        let mut sorted: Vec<Timeframe> = target_tfs.to_vec();
        sorted.sort();
        sorted.dedup();

        info!(
            source = %source_tf,
            targets = ?sorted.iter().map(|tf| tf.as_str()).collect::<Vec<_>>(),
            "aggregator initialised"
        );

        Ok(Self {
            source_tf,
            target_tfs: sorted,
            symbols: RwLock::new(HashMap::new()),
            on_bar_complete: RwLock::new(None),
        })
    }

    /// Install the completion callback.
    pub fn set_on_bar_complete(&self, callback: BarCompleteCallback) {
        *self.on_bar_complete.write() = Some(callback);
    }

    pub fn source_timeframe(&self) -> Timeframe {
        self.source_tf
    }

    pub fn target_timeframes(&self) -> &[Timeframe] {
        &self.target_tfs
    }

    /// The smallest configured target timeframe (drives the price bus).
    pub fn smallest_target(&self) -> Timeframe {
        self.target_tfs[0]
    }

    fn symbol_state(&self, symbol: &str) -> Arc<Mutex<SymbolState>> {
        if let Some(state) = self.symbols.read().get(symbol) {
            return state.clone();
        }
        self.symbols
            .write()
            .entry(symbol.to_string())
            .or_default()
            .clone()
    }

    // -------------------------------------------------------------------------
    // Ingestion
    // -------------------------------------------------------------------------

    /// Add a source bar and fold it into every target timeframe.
    ///
    /// Returns the map of bars that completed on this tick, keyed by
    /// timeframe. Only final source bars are folded: the feed re-delivers
    /// an interval until it closes, so an in-progress delivery is ignored
    /// rather than double-counted. Final bars must arrive in strictly
    /// increasing timestamp order per symbol; a duplicate or older bar
    /// yields [`EngineError::OutOfOrderBar`] and leaves state untouched.
    pub fn add_bar(
        &self,
        symbol: &str,
        source: &SourceBar,
    ) -> Result<BTreeMap<Timeframe, AggregatedBar>, EngineError> {
        if !source.complete {
            debug!(
                symbol,
                timestamp = %source.timestamp,
                "ignoring in-progress source bar"
            );
            return Ok(BTreeMap::new());
        }

        let state = self.symbol_state(symbol);
        let completed = {
            let mut guard = state.lock();

            if let Some(last) = guard.last_source_ts {
                if source.timestamp <= last {
                    return Err(EngineError::OutOfOrderBar {
                        symbol: symbol.to_string(),
                        timestamp: source.timestamp,
                        last_seen: last,
                    });
                }
            }
            guard.last_source_ts = Some(source.timestamp);

            let mut completed = BTreeMap::new();
            for tf in &self.target_tfs {
                if let Some(done) = Self::fold_into(&mut guard, symbol, source, *tf) {
                    completed.insert(*tf, done);
                }
            }
            completed
        };
        // Symbol mutex released; state is committed before any callback fires.

        if !completed.is_empty() {
            if let Some(cb) = self.on_bar_complete.read().as_ref() {
                for (tf, bar) in &completed {
                    if let Err(e) = cb(symbol, *tf, bar) {
                        warn!(
                            symbol,
                            timeframe = %tf,
                            error = %e,
                            "bar-complete callback failed"
                        );
                    }
                }
            }
        }

        Ok(completed)
    }

    /// Fold one source bar into one target timeframe. Returns the completed
    /// bar when the source bar crosses a boundary.
    fn fold_into(
        state: &mut SymbolState,
        symbol: &str,
        source: &SourceBar,
        tf: Timeframe,
    ) -> Option<AggregatedBar> {
        let same_bar = state
            .in_progress
            .get(&tf)
            .map(|current| tf.same_bar(source.timestamp, current.timestamp));

        match same_bar {
            None => {
                let bar_start = tf.bar_start(source.timestamp);
                state
                    .in_progress
                    .insert(tf, AggregatedBar::begin(bar_start, source));
                debug!(symbol, timeframe = %tf, %bar_start, "started new bar");
                None
            }
            Some(true) => {
                state
                    .in_progress
                    .get_mut(&tf)
                    .expect("in-progress bar present in this branch")
                    .absorb(source);
                None
            }
            Some(false) => {
                // Boundary crossed: finalize, store, then start fresh.
                let mut done = state
                    .in_progress
                    .remove(&tf)
                    .expect("in-progress bar present in this branch");
                done.complete = true;
                state.completed.entry(tf).or_default().push(done.clone());

                debug!(
                    symbol,
                    timeframe = %tf,
                    bar_start = %done.timestamp,
                    source_bars = done.source_bar_count,
                    "completed bar"
                );

                let bar_start = tf.bar_start(source.timestamp);
                state
                    .in_progress
                    .insert(tf, AggregatedBar::begin(bar_start, source));
                Some(done)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// The current in-progress (non-complete) bar, if any.
    pub fn current_bar(&self, symbol: &str, tf: Timeframe) -> Option<AggregatedBar> {
        let state = self.symbols.read().get(symbol)?.clone();
        let guard = state.lock();
        guard.in_progress.get(&tf).cloned()
    }

    /// A copy of the last `limit` completed bars, oldest first.
    pub fn completed_bars(&self, symbol: &str, tf: Timeframe, limit: usize) -> Vec<AggregatedBar> {
        let Some(state) = self.symbols.read().get(symbol).cloned() else {
            return Vec::new();
        };
        let guard = state.lock();
        match guard.completed.get(&tf) {
            Some(bars) => {
                let start = bars.len().saturating_sub(limit);
                bars[start..].to_vec()
            }
            None => Vec::new(),
        }
    }

    /// Tabular snapshot keyed by bar start, oldest first, optionally with the
    /// trailing in-progress bar.
    pub fn to_table(&self, symbol: &str, tf: Timeframe, include_open: bool) -> Vec<BarRow> {
        let Some(state) = self.symbols.read().get(symbol).cloned() else {
            return Vec::new();
        };
        let guard = state.lock();

        let mut rows: Vec<BarRow> = guard
            .completed
            .get(&tf)
            .map(|bars| bars.iter().map(Self::row).collect())
            .unwrap_or_default();

        if include_open {
            if let Some(open) = guard.in_progress.get(&tf) {
                rows.push(Self::row(open));
            }
        }
        rows
    }

    fn row(bar: &AggregatedBar) -> BarRow {
        BarRow {
            bar_start: bar.timestamp,
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
            complete: bar.complete,
        }
    }

    /// Aggregation statistics for a symbol.
    pub fn stats(&self, symbol: &str) -> AggregationStats {
        let mut stats = AggregationStats {
            symbol: symbol.to_string(),
            source_timeframe: self.source_tf,
            complete_bars: BTreeMap::new(),
            has_in_progress: BTreeMap::new(),
            source_bar_counts: BTreeMap::new(),
        };

        let Some(state) = self.symbols.read().get(symbol).cloned() else {
            for tf in &self.target_tfs {
                stats.complete_bars.insert(*tf, 0);
                stats.has_in_progress.insert(*tf, false);
                stats.source_bar_counts.insert(*tf, 0);
            }
            return stats;
        };

        let guard = state.lock();
        for tf in &self.target_tfs {
            stats
                .complete_bars
                .insert(*tf, guard.completed.get(tf).map_or(0, Vec::len));
            stats
                .has_in_progress
                .insert(*tf, guard.in_progress.contains_key(tf));
            stats.source_bar_counts.insert(
                *tf,
                guard
                    .in_progress
                    .get(tf)
                    .map_or(0, |bar| bar.source_bar_count),
            );
        }
        stats
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    /// Preload completed bars (e.g. from a historical fetch) for a symbol and
    /// timeframe. Does not touch the in-progress bar.
    pub fn seed_history(&self, symbol: &str, tf: Timeframe, bars: Vec<AggregatedBar>) {
        let state = self.symbol_state(symbol);
        let mut guard = state.lock();
        let count = bars.len();
        guard.completed.entry(tf).or_default().extend(bars);
        info!(symbol, timeframe = %tf, count, "seeded completed bar history");
    }

    /// Clear completed bar history for a symbol; `tf = None` clears every
    /// timeframe. In-progress bars are untouched.
    pub fn clear_history(&self, symbol: &str, tf: Option<Timeframe>) {
        let Some(state) = self.symbols.read().get(symbol).cloned() else {
            return;
        };
        let mut guard = state.lock();
        match tf {
            Some(tf) => {
                guard.completed.remove(&tf);
                info!(symbol, timeframe = %tf, "cleared bar history");
            }
            None => {
                guard.completed.clear();
                info!(symbol, "cleared all bar history");
            }
        }
    }

    /// Drop all aggregation state (in-progress and completed) for a symbol.
    pub fn reset(&self, symbol: &str) {
        if self.symbols.write().remove(symbol).is_some() {
            info!(symbol, "aggregator state reset");
        }
    }
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("source", &self.source_tf)
            .field("targets", &self.target_tfs)
            .field("symbols", &self.symbols.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ts(s: &str) -> DateTime<Utc> {
        chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .unwrap()
            .and_utc()
    }

    fn bar(time: &str, open: f64, high: f64, low: f64, close: f64, volume: u64) -> SourceBar {
        SourceBar::new(ts(time), open, high, low, close, volume).unwrap()
    }

    fn min1_aggregator() -> Aggregator {
        Aggregator::new(Timeframe::Sec5, &[Timeframe::Min1]).unwrap()
    }

    #[test]
    fn rejects_target_not_larger_than_source() {
        assert!(Aggregator::new(Timeframe::Min1, &[Timeframe::Min1]).is_err());
        assert!(Aggregator::new(Timeframe::Min5, &[Timeframe::Min1]).is_err());
        assert!(Aggregator::new(Timeframe::Sec5, &[]).is_err());
    }

    #[test]
    fn smallest_target_is_sorted_front() {
        let agg = Aggregator::new(
            Timeframe::Sec5,
            &[Timeframe::Hour1, Timeframe::Min1, Timeframe::Min15],
        )
        .unwrap();
        assert_eq!(agg.smallest_target(), Timeframe::Min1);
        assert_eq!(
            agg.target_timeframes(),
            &[Timeframe::Min1, Timeframe::Min15, Timeframe::Hour1]
        );
    }

    #[test]
    fn twelve_5s_bars_complete_one_minute_bar() {
        // Bars at 09:30:05 .. 09:31:00, each open=100.0+i*0.1 etc.
        let agg = min1_aggregator();
        let mut completions = Vec::new();

        for i in 0..12u32 {
            let secs = 5 * (i + 1);
            let time = format!("2025-11-17 09:30:{:02}", secs % 60);
            let time = if secs == 60 {
                "2025-11-17 09:31:00".to_string()
            } else {
                time
            };
            let off = i as f64 * 0.1;
            let source = bar(
                &time,
                100.0 + off,
                100.5 + off,
                99.5 + off,
                100.2 + off,
                1000,
            );
            let done = agg.add_bar("AAPL", &source).unwrap();
            completions.extend(done.into_iter());
        }

        // The bar at 09:31:00 crosses the boundary and finalizes 09:30.
        assert_eq!(completions.len(), 1);
        let (tf, done) = &completions[0];
        assert_eq!(*tf, Timeframe::Min1);
        assert_eq!(done.timestamp, ts("2025-11-17 09:30:00"));
        assert_eq!(done.open, 100.0);
        assert!((done.close - 101.2).abs() < 1e-9); // close of the 11th bar (i=10)
        assert!((done.high - 101.5).abs() < 1e-9);
        assert_eq!(done.low, 99.5);
        assert_eq!(done.volume, 11_000);
        assert_eq!(done.source_bar_count, 11);
        assert!(done.complete);

        // The 09:31 bar is now in progress with one source bar.
        let open = agg.current_bar("AAPL", Timeframe::Min1).unwrap();
        assert_eq!(open.timestamp, ts("2025-11-17 09:31:00"));
        assert_eq!(open.source_bar_count, 1);
        assert!(!open.complete);
    }

    #[test]
    fn ohlcv_invariants_on_completed_bar() {
        let agg = min1_aggregator();
        let bars = [
            bar("2025-11-17 09:30:05", 100.0, 100.8, 99.7, 100.3, 400),
            bar("2025-11-17 09:30:25", 100.3, 101.6, 100.1, 101.4, 600),
            bar("2025-11-17 09:30:45", 101.4, 101.5, 99.5, 99.9, 300),
        ];
        for b in &bars {
            agg.add_bar("MSFT", b).unwrap();
        }
        let done = agg
            .add_bar("MSFT", &bar("2025-11-17 09:31:00", 99.9, 100.0, 99.8, 99.9, 100))
            .unwrap();

        let completed = &done[&Timeframe::Min1];
        assert_eq!(completed.open, bars[0].open);
        assert_eq!(completed.close, bars[2].close);
        assert_eq!(completed.high, 101.6);
        assert_eq!(completed.low, 99.5);
        assert_eq!(completed.volume, 1300);
        assert!(completed.low <= completed.open && completed.open <= completed.high);
        assert!(completed.low <= completed.close && completed.close <= completed.high);
    }

    #[test]
    fn full_minute_of_5s_bars_aggregates_losslessly() {
        let agg = min1_aggregator();
        // Full minute of 5s bars (09:30:00 .. 09:30:55) with a rising price
        // ladder, then the bar that crosses the boundary.
        for i in 0..12u32 {
            let time = format!("2025-11-17 09:30:{:02}", i * 5);
            let off = i as f64 * 0.1;
            agg.add_bar(
                "SPY",
                &bar(&time, 100.0 + off, 100.5 + off, 99.5 + off, 100.2 + off, 1000),
            )
            .unwrap();
        }
        let done = agg
            .add_bar("SPY", &bar("2025-11-17 09:31:00", 101.3, 101.3, 101.3, 101.3, 10))
            .unwrap();

        let completed = &done[&Timeframe::Min1];
        assert_eq!(completed.timestamp, ts("2025-11-17 09:30:00"));
        assert_eq!(
            completed.source_bar_count as i64,
            Timeframe::Min1.seconds() / Timeframe::Sec5.seconds()
        );
        assert_eq!(completed.source_bar_count, 12);
        assert_eq!(completed.volume, 12_000);
        assert_eq!(completed.open, 100.0);
        assert!((completed.high - 101.6).abs() < 1e-9);
        assert_eq!(completed.low, 99.5);
        assert!((completed.close - 101.3).abs() < 1e-9);
    }

    #[test]
    fn multiple_timeframes_complete_independently() {
        let agg = Aggregator::new(Timeframe::Min1, &[Timeframe::Min5, Timeframe::Min15]).unwrap();

        // 16 one-minute bars: 09:30 .. 09:45.
        let mut five_min_completions = 0;
        let mut fifteen_min_completions = 0;
        for i in 0..16 {
            let time = format!("2025-11-17 09:{}:00", 30 + i);
            let done = agg
                .add_bar("QQQ", &bar(&time, 100.0, 100.5, 99.5, 100.0, 100))
                .unwrap();
            five_min_completions += usize::from(done.contains_key(&Timeframe::Min5));
            fifteen_min_completions += usize::from(done.contains_key(&Timeframe::Min15));
        }

        // Boundaries at 09:35, 09:40, 09:45 for 5m; 09:45 for 15m.
        assert_eq!(five_min_completions, 3);
        assert_eq!(fifteen_min_completions, 1);
    }

    #[test]
    fn out_of_order_and_duplicate_bars_rejected() {
        let agg = min1_aggregator();
        let first = bar("2025-11-17 09:30:10", 100.0, 100.5, 99.5, 100.2, 100);
        agg.add_bar("AAPL", &first).unwrap();

        // Duplicate timestamp.
        let err = agg.add_bar("AAPL", &first).unwrap_err();
        assert!(matches!(err, EngineError::OutOfOrderBar { .. }));

        // Older timestamp.
        let older = bar("2025-11-17 09:30:05", 100.0, 100.5, 99.5, 100.2, 100);
        assert!(agg.add_bar("AAPL", &older).is_err());

        // State unchanged: in-progress still reflects only the first bar.
        let open = agg.current_bar("AAPL", Timeframe::Min1).unwrap();
        assert_eq!(open.source_bar_count, 1);
    }

    #[test]
    fn in_progress_source_bars_are_ignored() {
        let agg = min1_aggregator();
        let mut live = bar("2025-11-17 09:30:05", 100.0, 100.5, 99.5, 100.2, 500);
        live.complete = false;

        assert!(agg.add_bar("AAPL", &live).unwrap().is_empty());
        assert!(agg.current_bar("AAPL", Timeframe::Min1).is_none());

        // The finalized delivery of the same interval is folded normally,
        // without tripping the ordering check.
        let finalized = bar("2025-11-17 09:30:05", 100.0, 100.6, 99.5, 100.3, 650);
        agg.add_bar("AAPL", &finalized).unwrap();
        let open = agg.current_bar("AAPL", Timeframe::Min1).unwrap();
        assert_eq!(open.volume, 650);
        assert_eq!(open.source_bar_count, 1);
    }

    #[test]
    fn ordering_is_per_symbol() {
        let agg = min1_aggregator();
        agg.add_bar("AAPL", &bar("2025-11-17 09:30:10", 100.0, 100.0, 100.0, 100.0, 1))
            .unwrap();
        // A different symbol may be behind AAPL's clock.
        agg.add_bar("TSLA", &bar("2025-11-17 09:30:05", 200.0, 200.0, 200.0, 200.0, 1))
            .unwrap();
    }

    #[test]
    fn callback_fires_after_commit_and_errors_are_swallowed() {
        let agg = min1_aggregator();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        agg.set_on_bar_complete(Box::new(move |symbol, tf, bar| {
            assert_eq!(symbol, "AAPL");
            assert_eq!(tf, Timeframe::Min1);
            assert!(bar.complete);
            seen.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("callback exploded")
        }));

        agg.add_bar("AAPL", &bar("2025-11-17 09:30:30", 100.0, 100.0, 100.0, 100.0, 1))
            .unwrap();
        let done = agg
            .add_bar("AAPL", &bar("2025-11-17 09:31:00", 100.0, 100.0, 100.0, 100.0, 1))
            .unwrap();

        // Completion was stored despite the callback failure.
        assert_eq!(done.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(agg.completed_bars("AAPL", Timeframe::Min1, 10).len(), 1);
    }

    #[test]
    fn completed_bars_respects_limit() {
        let agg = min1_aggregator();
        for i in 0..5 {
            let time = format!("2025-11-17 09:{}:00", 30 + i);
            agg.add_bar("AAPL", &bar(&time, 100.0, 100.0, 100.0, 100.0, 1))
                .unwrap();
        }
        // 4 completed minutes (09:30..09:33), one in progress (09:34).
        assert_eq!(agg.completed_bars("AAPL", Timeframe::Min1, 10).len(), 4);
        let last_two = agg.completed_bars("AAPL", Timeframe::Min1, 2);
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[1].timestamp, ts("2025-11-17 09:33:00"));
    }

    #[test]
    fn to_table_includes_open_bar_when_asked() {
        let agg = min1_aggregator();
        agg.add_bar("AAPL", &bar("2025-11-17 09:30:00", 100.0, 100.0, 100.0, 100.0, 1))
            .unwrap();
        agg.add_bar("AAPL", &bar("2025-11-17 09:31:00", 101.0, 101.0, 101.0, 101.0, 1))
            .unwrap();

        let closed_only = agg.to_table("AAPL", Timeframe::Min1, false);
        assert_eq!(closed_only.len(), 1);
        assert!(closed_only[0].complete);

        let with_open = agg.to_table("AAPL", Timeframe::Min1, true);
        assert_eq!(with_open.len(), 2);
        assert!(!with_open[1].complete);
        assert_eq!(with_open[1].bar_start, ts("2025-11-17 09:31:00"));
    }

    #[test]
    fn reset_clears_only_that_symbol() {
        let agg = min1_aggregator();
        agg.add_bar("AAPL", &bar("2025-11-17 09:30:00", 100.0, 100.0, 100.0, 100.0, 1))
            .unwrap();
        agg.add_bar("TSLA", &bar("2025-11-17 09:30:00", 200.0, 200.0, 200.0, 200.0, 1))
            .unwrap();

        agg.reset("AAPL");
        assert!(agg.current_bar("AAPL", Timeframe::Min1).is_none());
        assert!(agg.current_bar("TSLA", Timeframe::Min1).is_some());

        // After a reset the symbol accepts bars from any timestamp again.
        agg.add_bar("AAPL", &bar("2025-11-17 09:00:00", 100.0, 100.0, 100.0, 100.0, 1))
            .unwrap();
    }

    #[test]
    fn stats_reports_counts() {
        let agg = min1_aggregator();
        for i in 0..3 {
            let time = format!("2025-11-17 09:30:{:02}", i * 5);
            agg.add_bar("AAPL", &bar(&time, 100.0, 100.0, 100.0, 100.0, 1))
                .unwrap();
        }
        let stats = agg.stats("AAPL");
        assert_eq!(stats.complete_bars[&Timeframe::Min1], 0);
        assert!(stats.has_in_progress[&Timeframe::Min1]);
        assert_eq!(stats.source_bar_counts[&Timeframe::Min1], 3);

        let empty = agg.stats("NOPE");
        assert_eq!(empty.complete_bars[&Timeframe::Min1], 0);
        assert!(!empty.has_in_progress[&Timeframe::Min1]);
    }

    #[test]
    fn seed_and_clear_history() {
        let agg = min1_aggregator();
        let seeded = vec![AggregatedBar {
            timestamp: ts("2025-11-17 09:00:00"),
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10,
            source_bar_count: 12,
            complete: true,
        }];
        agg.seed_history("AAPL", Timeframe::Min1, seeded);
        assert_eq!(agg.completed_bars("AAPL", Timeframe::Min1, 10).len(), 1);

        agg.clear_history("AAPL", Some(Timeframe::Min1));
        assert!(agg.completed_bars("AAPL", Timeframe::Min1, 10).is_empty());
    }
}
