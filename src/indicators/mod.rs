// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free indicator math plus the `IndicatorEngine`, which
// binds the math to live aggregation buffers with an on-disk history
// fallback.  Every public computation returns `Option<T>` so callers are
// forced to handle insufficient-data and numerical-edge-case scenarios.

pub mod atr;

use std::sync::Arc;

use tracing::debug;

use crate::market_data::{Aggregator, BarStore, Timeframe};

/// How many bars to pull when computing an indicator. Enough for a 14-period
/// ATR with plenty of smoothing runway.
const LOOKBACK_BARS: usize = 100;

/// Indicator source bound to the engine's live aggregation buffers, with the
/// bar store as a history fallback for symbols that have not accumulated
/// enough real-time bars yet.
pub struct IndicatorEngine {
    aggregator: Arc<Aggregator>,
    bar_store: Option<Arc<BarStore>>,
}

impl IndicatorEngine {
    pub fn new(aggregator: Arc<Aggregator>, bar_store: Option<Arc<BarStore>>) -> Self {
        Self {
            aggregator,
            bar_store,
        }
    }

    /// Most recent ATR for `symbol` on `timeframe`, or `None` when neither
    /// the live buffers nor the store hold enough bars.
    pub fn atr(&self, symbol: &str, period: usize, timeframe: Timeframe) -> Option<f64> {
        let mut bars = self.aggregator.completed_bars(symbol, timeframe, LOOKBACK_BARS);

        if bars.len() < period + 1 {
            if let Some(store) = &self.bar_store {
                match store.load(symbol, timeframe, None, None) {
                    Ok(stored) if stored.len() > bars.len() => {
                        debug!(
                            symbol,
                            timeframe = %timeframe,
                            live = bars.len(),
                            stored = stored.len(),
                            "using stored bars for ATR"
                        );
                        bars = stored;
                        let start = bars.len().saturating_sub(LOOKBACK_BARS);
                        bars.drain(..start);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(symbol, error = %e, "bar store load failed for ATR");
                    }
                }
            }
        }

        atr::calculate_atr(&bars, period)
    }
}
