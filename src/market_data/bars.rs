// =============================================================================
// OHLCV bar types and the timeframe enumeration
// =============================================================================

use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

// ---------------------------------------------------------------------------
// Timeframe
// ---------------------------------------------------------------------------

/// Supported bar durations, 5 seconds through 1 day.
///
/// Ordering is by duration, so `Timeframe::Sec5 < Timeframe::Day1`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Timeframe {
    #[serde(rename = "5s")]
    Sec5,
    #[serde(rename = "1m")]
    Min1,
    #[serde(rename = "5m")]
    Min5,
    #[serde(rename = "15m")]
    Min15,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "4h")]
    Hour4,
    #[serde(rename = "1d")]
    Day1,
}

impl Timeframe {
    /// Duration of one bar in seconds.
    pub fn seconds(&self) -> i64 {
        match self {
            Self::Sec5 => 5,
            Self::Min1 => 60,
            Self::Min5 => 300,
            Self::Min15 => 900,
            Self::Hour1 => 3_600,
            Self::Hour4 => 14_400,
            Self::Day1 => 86_400,
        }
    }

    /// Canonical short name, used in file names and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sec5 => "5s",
            Self::Min1 => "1m",
            Self::Min5 => "5m",
            Self::Min15 => "15m",
            Self::Hour1 => "1h",
            Self::Hour4 => "4h",
            Self::Day1 => "1d",
        }
    }

    /// All variants, shortest first.
    pub fn all() -> [Timeframe; 7] {
        [
            Self::Sec5,
            Self::Min1,
            Self::Min5,
            Self::Min15,
            Self::Hour1,
            Self::Hour4,
            Self::Day1,
        ]
    }

    /// Start of the bar containing `ts`: `floor(epoch / seconds) * seconds`.
    pub fn bar_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let secs = self.seconds();
        let floored = ts.timestamp().div_euclid(secs) * secs;
        Utc.timestamp_opt(floored, 0).single().unwrap_or(ts)
    }

    /// Whether two timestamps fall inside the same bar.
    pub fn same_bar(&self, a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
        self.bar_start(a) == self.bar_start(b)
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = EngineError;

    /// Accepts the canonical names plus the spellings brokers commonly use
    /// ("5 secs", "1 min", "15 mins", "1 hour", "1 day", ...).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .to_lowercase()
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '_')
            .collect();

        let tf = match normalized.as_str() {
            "5s" | "5sec" | "5secs" | "5second" | "5seconds" => Self::Sec5,
            "1m" | "1min" | "1mins" | "1minute" => Self::Min1,
            "5m" | "5min" | "5mins" | "5minute" => Self::Min5,
            "15m" | "15min" | "15mins" | "15minute" => Self::Min15,
            "1h" | "1hour" | "60min" => Self::Hour1,
            "4h" | "4hour" | "4hours" => Self::Hour4,
            "1d" | "1day" | "daily" => Self::Day1,
            _ => {
                return Err(EngineError::Config {
                    reason: format!("unknown timeframe: {s}"),
                })
            }
        };
        Ok(tf)
    }
}

// ---------------------------------------------------------------------------
// SourceBar
// ---------------------------------------------------------------------------

/// A single OHLCV bar as delivered by the broker feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceBar {
    /// Wall-clock bar timestamp, UTC.
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    /// Whether the feed marked this bar as final. The aggregator folds only
    /// final bars; an in-progress delivery is ignored until the feed
    /// re-sends it closed.
    pub complete: bool,
}

impl SourceBar {
    /// Build a validated bar. The OHLC envelope must hold:
    /// `low <= min(open, close)` and `max(open, close) <= high`.
    pub fn new(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: u64,
    ) -> Result<Self, EngineError> {
        if high < low {
            return Err(EngineError::InvalidBar {
                reason: format!("high ({high}) < low ({low})"),
            });
        }
        if high < open || high < close {
            return Err(EngineError::InvalidBar {
                reason: format!("high ({high}) < open/close"),
            });
        }
        if low > open || low > close {
            return Err(EngineError::InvalidBar {
                reason: format!("low ({low}) > open/close"),
            });
        }
        if !(open.is_finite() && high.is_finite() && low.is_finite() && close.is_finite()) {
            return Err(EngineError::InvalidBar {
                reason: "non-finite price field".to_string(),
            });
        }

        Ok(Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            complete: true,
        })
    }
}

// ---------------------------------------------------------------------------
// AggregatedBar
// ---------------------------------------------------------------------------

/// A bar reconstructed from one or more source bars at a larger timeframe.
///
/// Identified by (symbol, timeframe, `timestamp`) where `timestamp` is the
/// bar-boundary start. `complete` is monotonic: once true it never reverts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedBar {
    /// Bar-boundary start timestamp.
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    /// How many source bars composed this bar so far.
    pub source_bar_count: u32,
    pub complete: bool,
}

impl AggregatedBar {
    /// Start a fresh in-progress bar from the first source bar of a period.
    pub fn begin(bar_start: DateTime<Utc>, source: &SourceBar) -> Self {
        Self {
            timestamp: bar_start,
            open: source.open,
            high: source.high,
            low: source.low,
            close: source.close,
            volume: source.volume,
            source_bar_count: 1,
            complete: false,
        }
    }

    /// Fold another source bar from the same period into this bar.
    pub fn absorb(&mut self, source: &SourceBar) {
        self.high = self.high.max(source.high);
        self.low = self.low.min(source.low);
        self.close = source.close;
        self.volume += source.volume;
        self.source_bar_count += 1;
    }
}
