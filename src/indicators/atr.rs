// =============================================================================
// Average True Range (ATR) — Wilder's Smoothing Method
// =============================================================================
//
// True Range (TR) for each bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR is the smoothed average of TR using Wilder's method:
//   ATR_0   = SMA of first `period` TR values
//   ATR_t   = (ATR_{t-1} * (period - 1) + TR_t) / period
// =============================================================================

use crate::market_data::AggregatedBar;

/// Look-back window used when callers do not specify one.
pub const DEFAULT_PERIOD: usize = 14;

/// True range of a bar against the previous close.
fn true_range(bar: &AggregatedBar, prev_close: f64) -> f64 {
    (bar.high - bar.low)
        .max((bar.high - prev_close).abs())
        .max((bar.low - prev_close).abs())
}

/// Most recent ATR over `bars` (oldest first) using Wilder's smoothing.
///
/// Returns `None` when `period` is zero, when fewer than `period + 1` bars
/// are available (each true range needs a previous close), or when the
/// result is non-finite.
pub fn calculate_atr(bars: &[AggregatedBar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let true_ranges: Vec<f64> = bars
        .windows(2)
        .map(|pair| true_range(&pair[1], pair[0].close))
        .collect();

    // Seed with the SMA of the first `period` true ranges, then fold the
    // remainder through Wilder's smoothing.
    let seed = true_ranges[..period].iter().sum::<f64>() / period as f64;
    let period_f = period as f64;
    let atr = true_ranges[period..]
        .iter()
        .fold(seed, |atr, tr| (atr * (period_f - 1.0) + tr) / period_f);

    atr.is_finite().then_some(atr)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::IndicatorEngine;
    use crate::market_data::{Aggregator, SourceBar, Timeframe};
    use chrono::{DateTime, Duration, Utc};
    use std::sync::Arc;

    fn ts(s: &str) -> DateTime<Utc> {
        chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .unwrap()
            .and_utc()
    }

    /// Feed one source bar per minute so each spec becomes a 1m aggregated
    /// bar: `(base, half_range)` -> high = base + half, low = base - half,
    /// open = close = base. Completes `specs.len() - 1` bars.
    fn feed_minutes(agg: &Aggregator, symbol: &str, specs: &[(f64, f64)]) {
        let start = ts("2025-11-17 09:30:00");
        for (i, (base, half)) in specs.iter().enumerate() {
            let t = start + Duration::minutes(i as i64);
            let bar = SourceBar::new(t, *base, base + half, base - half, *base, 100).unwrap();
            agg.add_bar(symbol, &bar).unwrap();
        }
    }

    fn engine() -> (Arc<Aggregator>, IndicatorEngine) {
        let agg = Arc::new(Aggregator::new(Timeframe::Sec5, &[Timeframe::Min1]).unwrap());
        let engine = IndicatorEngine::new(agg.clone(), None);
        (agg, engine)
    }

    #[test]
    fn steady_range_converges_to_bar_range() {
        // Flat closes at 50 with a constant 0.8 total range per minute:
        // every true range is 0.8, so the smoothed ATR is exactly 0.8.
        let (agg, engine) = engine();
        let specs = vec![(50.0, 0.4); DEFAULT_PERIOD + 3];
        feed_minutes(&agg, "XLF", &specs);

        let atr = engine.atr("XLF", DEFAULT_PERIOD, Timeframe::Min1).unwrap();
        assert!((atr - 0.8).abs() < 1e-9, "expected ATR 0.8, got {atr}");
    }

    #[test]
    fn gap_between_minutes_widens_atr() {
        // Twenty quiet minutes around 100 with a 1.0 range, then a jump to
        // 110. The gap bar's true range is |high - prevClose| ~ 10.5, so the
        // smoothed ATR must exceed the plain bar range.
        let (agg, engine) = engine();
        let mut specs = vec![(100.0, 0.5); 20];
        specs.push((110.0, 0.5));
        specs.push((110.0, 0.5));
        feed_minutes(&agg, "NVDA", &specs);

        let atr = engine.atr("NVDA", DEFAULT_PERIOD, Timeframe::Min1).unwrap();
        assert!(atr > 1.0, "gap should inflate ATR above the bar range, got {atr}");
        assert!(atr < 10.5, "one gap bar must not dominate the smoothing, got {atr}");
    }

    #[test]
    fn wider_ranges_produce_larger_atr() {
        let (agg, engine) = engine();
        feed_minutes(&agg, "WIDE", &vec![(50.0, 1.0); 20]);
        feed_minutes(&agg, "TIGHT", &vec![(50.0, 0.2); 20]);

        let wide = engine.atr("WIDE", DEFAULT_PERIOD, Timeframe::Min1).unwrap();
        let tight = engine.atr("TIGHT", DEFAULT_PERIOD, Timeframe::Min1).unwrap();
        assert!(
            wide > tight,
            "wide-range ATR {wide} should exceed tight-range ATR {tight}"
        );
        assert!((wide - 2.0).abs() < 1e-9);
        assert!((tight - 0.4).abs() < 1e-9);
    }

    #[test]
    fn zero_period_is_rejected() {
        let (agg, _engine) = engine();
        feed_minutes(&agg, "SPY", &vec![(430.0, 0.9); 10]);
        let bars = agg.completed_bars("SPY", Timeframe::Min1, 100);
        assert!(calculate_atr(&bars, 0).is_none());
    }
}
