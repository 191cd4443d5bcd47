// =============================================================================
// BarStore — file-backed OHLCV warehouse
// =============================================================================
//
// One JSON-lines file per (symbol, timeframe) under a data directory, e.g.
// data/bars/AAPL_1m.jsonl. Each line is one serialized bar row. Writes go
// through a tmp + rename so a crash mid-write cannot truncate a series.
//
// This is a narrow external collaborator: the core touches it only through
// the indicator engine's history fallback and the post-session flush of
// real-time aggregates.
// =============================================================================

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::market_data::bars::{AggregatedBar, Timeframe};

/// How [`BarStore::save`] combines new rows with an existing series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveMode {
    /// Drop any existing series and write the new rows.
    Replace,
    /// Append the new rows after the existing ones.
    Append,
    /// Union by bar timestamp; an incoming row wins over a stored row with
    /// the same timestamp.
    Merge,
}

/// Summary of one stored series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesMetadata {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub bar_count: usize,
    pub first_bar: Option<DateTime<Utc>>,
    pub last_bar: Option<DateTime<Utc>>,
}

/// File-backed bar warehouse.
pub struct BarStore {
    root: PathBuf,
}

impl BarStore {
    /// Open (creating if necessary) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create bar store dir {}", root.display()))?;
        info!(root = %root.display(), "bar store opened");
        Ok(Self { root })
    }

    fn series_path(&self, symbol: &str, tf: Timeframe) -> PathBuf {
        self.root.join(format!("{}_{}.jsonl", symbol, tf.as_str()))
    }

    /// Persist `bars` for (symbol, timeframe) under the given mode.
    pub fn save(
        &self,
        symbol: &str,
        tf: Timeframe,
        bars: &[AggregatedBar],
        mode: SaveMode,
    ) -> Result<()> {
        let path = self.series_path(symbol, tf);

        let rows: Vec<AggregatedBar> = match mode {
            SaveMode::Replace => bars.to_vec(),
            SaveMode::Append => {
                let mut existing = self.load(symbol, tf, None, None)?;
                existing.extend_from_slice(bars);
                existing
            }
            SaveMode::Merge => {
                let mut by_ts: BTreeMap<DateTime<Utc>, AggregatedBar> = self
                    .load(symbol, tf, None, None)?
                    .into_iter()
                    .map(|b| (b.timestamp, b))
                    .collect();
                for bar in bars {
                    by_ts.insert(bar.timestamp, bar.clone());
                }
                by_ts.into_values().collect()
            }
        };

        // Atomic write: serialize everything to a tmp sibling, then rename.
        let tmp = path.with_extension("jsonl.tmp");
        {
            let mut file = fs::File::create(&tmp)
                .with_context(|| format!("failed to create {}", tmp.display()))?;
            for row in &rows {
                let line = serde_json::to_string(row).context("failed to serialize bar row")?;
                writeln!(file, "{line}")
                    .with_context(|| format!("failed to write {}", tmp.display()))?;
            }
        }
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to rename {} into place", tmp.display()))?;

        debug!(symbol, timeframe = %tf, rows = rows.len(), mode = ?mode, "series saved");
        Ok(())
    }

    /// Load bars for (symbol, timeframe), optionally bounded by bar start.
    /// Returns an empty vector when the series does not exist.
    pub fn load(
        &self,
        symbol: &str,
        tf: Timeframe,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<AggregatedBar>> {
        let path = self.series_path(symbol, tf);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = fs::File::open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let mut bars = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.with_context(|| format!("failed to read {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let bar: AggregatedBar = serde_json::from_str(&line)
                .with_context(|| format!("corrupt bar row in {}", path.display()))?;
            if let Some(start) = start {
                if bar.timestamp < start {
                    continue;
                }
            }
            if let Some(end) = end {
                if bar.timestamp > end {
                    continue;
                }
            }
            bars.push(bar);
        }
        Ok(bars)
    }

    /// Metadata for one stored series.
    pub fn metadata(&self, symbol: &str, tf: Timeframe) -> Result<SeriesMetadata> {
        let bars = self.load(symbol, tf, None, None)?;
        Ok(SeriesMetadata {
            symbol: symbol.to_string(),
            timeframe: tf,
            bar_count: bars.len(),
            first_bar: bars.first().map(|b| b.timestamp),
            last_bar: bars.last().map(|b| b.timestamp),
        })
    }

    /// Symbols present in the store, optionally filtered to one timeframe.
    pub fn list_symbols(&self, tf: Option<Timeframe>) -> Result<Vec<String>> {
        let mut symbols: Vec<String> = self
            .list_series()?
            .into_iter()
            .filter(|(_, series_tf)| tf.map_or(true, |want| *series_tf == want))
            .map(|(symbol, _)| symbol)
            .collect();
        symbols.sort();
        symbols.dedup();
        Ok(symbols)
    }

    /// Timeframes present in the store, optionally filtered to one symbol.
    pub fn list_timeframes(&self, symbol: Option<&str>) -> Result<Vec<Timeframe>> {
        let mut tfs: Vec<Timeframe> = self
            .list_series()?
            .into_iter()
            .filter(|(series_symbol, _)| symbol.map_or(true, |want| series_symbol == want))
            .map(|(_, tf)| tf)
            .collect();
        tfs.sort();
        tfs.dedup();
        Ok(tfs)
    }

    /// All (symbol, timeframe) pairs derived from file names.
    fn list_series(&self) -> Result<Vec<(String, Timeframe)>> {
        let mut series = Vec::new();
        for entry in fs::read_dir(&self.root)
            .with_context(|| format!("failed to read {}", self.root.display()))?
        {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(".jsonl") else {
                continue;
            };
            // SYMBOL_TF; the timeframe token never contains an underscore.
            let Some((symbol, tf_str)) = stem.rsplit_once('_') else {
                continue;
            };
            if let Ok(tf) = tf_str.parse::<Timeframe>() {
                series.push((symbol.to_string(), tf));
            }
        }
        Ok(series)
    }
}
