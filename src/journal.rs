// =============================================================================
// Trade Journal — durable SQLite-backed trade records with analytics
// =============================================================================
//
// Every entry and exit flows through here. The table survives process
// restart; rows with no exit_time reappear as open trades. Derived exit
// fields (realized_pnl, pnl_pct, risk_reward_ratio, hold_time_minutes) are
// computed deterministically at exit-recording time and never re-derived.
//
// Concurrency: a single parking_lot::Mutex around the connection is the
// journal's single-writer serialization point. WAL mode keeps concurrent
// readers cheap. Each logical operation is one transaction.
// =============================================================================

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::EngineError;
use crate::types::{ExitReason, Side};

/// Default starting balance for equity-curve generation, in quote currency.
pub const DEFAULT_STARTING_EQUITY: f64 = 100_000.0;

/// Schema is idempotent; re-running it against an existing file is a no-op.
const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS trades (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    entry_time TIMESTAMP NOT NULL,
    exit_time TIMESTAMP,
    entry_price REAL NOT NULL,
    exit_price REAL,
    quantity INTEGER NOT NULL,
    stop_price REAL,
    target_price REAL,
    actual_stop REAL,
    actual_target REAL,
    commission REAL DEFAULT 0.0,
    realized_pnl REAL,
    pnl_pct REAL,
    risk_amount REAL NOT NULL,
    risk_reward_ratio REAL,
    mae REAL,
    mfe REAL,
    hold_time_minutes INTEGER,
    exit_reason TEXT,
    sabr20_score REAL,
    regime TEXT,
    notes TEXT
);

CREATE INDEX IF NOT EXISTS idx_symbol ON trades(symbol);
CREATE INDEX IF NOT EXISTS idx_entry_time ON trades(entry_time);
CREATE INDEX IF NOT EXISTS idx_exit_time ON trades(exit_time);
CREATE INDEX IF NOT EXISTS idx_realized_pnl ON trades(realized_pnl);
"#;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One journal row. Exit fields are `None` until the trade closes.
#[derive(Debug, Clone, Serialize)]
pub struct TradeRecord {
    pub id: i64,
    pub symbol: String,
    pub side: Side,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    pub quantity: i64,
    pub stop_price: Option<f64>,
    pub target_price: Option<f64>,
    pub actual_stop: Option<f64>,
    pub actual_target: Option<f64>,
    pub commission: f64,
    pub realized_pnl: Option<f64>,
    pub pnl_pct: Option<f64>,
    pub risk_amount: f64,
    pub risk_reward_ratio: Option<f64>,
    pub mae: Option<f64>,
    pub mfe: Option<f64>,
    pub hold_time_minutes: Option<i64>,
    pub exit_reason: Option<ExitReason>,
    pub sabr20_score: Option<f64>,
    pub regime: Option<String>,
    pub notes: Option<String>,
}

impl TradeRecord {
    pub fn is_open(&self) -> bool {
        self.exit_time.is_none()
    }
}

/// Entry-side fields for [`TradeJournal::record_entry`].
#[derive(Debug, Clone)]
pub struct EntryRecord {
    pub symbol: String,
    pub side: Side,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub quantity: i64,
    pub stop_price: Option<f64>,
    pub target_price: Option<f64>,
    pub risk_amount: f64,
    pub sabr20_score: Option<f64>,
    pub regime: Option<String>,
}

/// Optional exit-side details for [`TradeJournal::record_exit`].
#[derive(Debug, Clone, Default)]
pub struct ExitDetails {
    pub actual_stop: Option<f64>,
    pub actual_target: Option<f64>,
    pub mae: Option<f64>,
    pub mfe: Option<f64>,
    pub notes: Option<String>,
}

/// Aggregate performance metrics over a set of closed trades.
///
/// All fields are zero when the set is empty; no metric ever divides by zero.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceStats {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub avg_risk_reward: f64,
    pub profit_factor: f64,
    pub sharpe_ratio: f64,
    pub max_drawdown: f64,
    pub avg_hold_time_minutes: f64,
    pub total_commission: f64,
}

/// One point of the equity curve, ordered by exit time.
#[derive(Debug, Clone, Serialize)]
pub struct EquityPoint {
    pub exit_time: DateTime<Utc>,
    pub realized_pnl: f64,
    pub cumulative_pnl: f64,
    pub equity: f64,
}

/// Per-symbol performance subset.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SymbolStats {
    pub symbol: String,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub avg_risk_reward: f64,
    pub profit_factor: f64,
}

// ---------------------------------------------------------------------------
// TradeJournal
// ---------------------------------------------------------------------------

/// SQLite-backed trade journal. The sole writer of trade rows.
pub struct TradeJournal {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl TradeJournal {
    /// Open (creating if necessary) the journal at `db_path`.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| EngineError::Config {
                    reason: format!("failed to create journal dir {}: {e}", parent.display()),
                })?;
            }
        }

        let conn = Connection::open(&db_path)?;
        conn.execute_batch(SCHEMA_SQL)?;

        info!(path = %db_path.display(), "trade journal opened");
        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    /// In-memory journal, for tests and dry runs.
    pub fn open_in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Insert an entry row and return its assigned trade id.
    ///
    /// Sequential trades for the same symbol are allowed here; open-set
    /// uniqueness is the position book's invariant, not the journal's.
    pub fn record_entry(&self, entry: &EntryRecord) -> Result<i64, EngineError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO trades (
                symbol, side, entry_time, entry_price, quantity,
                stop_price, target_price, risk_amount,
                sabr20_score, regime, mae, mfe
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0.0, 0.0)",
            params![
                entry.symbol,
                entry.side.as_str(),
                entry.entry_time,
                entry.entry_price,
                entry.quantity,
                entry.stop_price,
                entry.target_price,
                entry.risk_amount,
                entry.sabr20_score,
                entry.regime,
            ],
        )?;
        let trade_id = conn.last_insert_rowid();

        info!(
            trade_id,
            symbol = %entry.symbol,
            side = %entry.side,
            quantity = entry.quantity,
            entry_price = entry.entry_price,
            risk_amount = entry.risk_amount,
            "trade entry recorded"
        );
        Ok(trade_id)
    }

    /// Fill in the exit side of a trade and compute its derived fields:
    ///
    /// - Long: `realized_pnl = (exit - entry) * qty - commission`
    /// - Short: `realized_pnl = (entry - exit) * qty - commission`
    /// - `pnl_pct = realized_pnl / (entry * qty) * 100`
    /// - `risk_reward_ratio = realized_pnl / risk_amount` (0 when risk is 0)
    /// - `hold_time_minutes = floor((exit_time - entry_time) / 60s)`
    pub fn record_exit(
        &self,
        trade_id: i64,
        exit_time: DateTime<Utc>,
        exit_price: f64,
        exit_reason: ExitReason,
        commission: f64,
        details: ExitDetails,
    ) -> Result<TradeRecord, EngineError> {
        let trade = self
            .get(trade_id)?
            .ok_or(EngineError::UnknownTrade { trade_id })?;
        if trade.exit_time.is_some() {
            return Err(EngineError::AlreadyExited { trade_id });
        }

        let qty = trade.quantity as f64;
        let gross = trade.side.direction() * (exit_price - trade.entry_price) * qty;
        let realized_pnl = gross - commission;

        let position_value = trade.entry_price * qty;
        let pnl_pct = if position_value != 0.0 {
            realized_pnl / position_value * 100.0
        } else {
            0.0
        };

        let risk_reward_ratio = if trade.risk_amount > 0.0 {
            realized_pnl / trade.risk_amount
        } else {
            0.0
        };

        let hold_time_minutes = (exit_time - trade.entry_time).num_seconds() / 60;

        let final_mae = details.mae.or(trade.mae);
        let final_mfe = details.mfe.or(trade.mfe);
        let notes = details.notes.or(trade.notes);

        {
            let conn = self.conn.lock();
            conn.execute(
                "UPDATE trades
                 SET exit_time = ?1, exit_price = ?2, exit_reason = ?3,
                     commission = ?4, actual_stop = ?5, actual_target = ?6,
                     realized_pnl = ?7, pnl_pct = ?8, risk_reward_ratio = ?9,
                     hold_time_minutes = ?10, mae = ?11, mfe = ?12, notes = ?13
                 WHERE id = ?14",
                params![
                    exit_time,
                    exit_price,
                    exit_reason.as_str(),
                    commission,
                    details.actual_stop,
                    details.actual_target,
                    realized_pnl,
                    pnl_pct,
                    risk_reward_ratio,
                    hold_time_minutes,
                    final_mae,
                    final_mfe,
                    notes,
                    trade_id,
                ],
            )?;
        }

        info!(
            trade_id,
            symbol = %trade.symbol,
            exit_price,
            realized_pnl,
            pnl_pct,
            reason = %exit_reason,
            "trade exit recorded"
        );

        self.get(trade_id)?
            .ok_or(EngineError::UnknownTrade { trade_id })
    }

    /// Update MAE/MFE for an open trade from the current price.
    ///
    /// Writes only when a new extreme is reached. Closed or unknown trades
    /// are a silent no-op; this runs on the price tick path.
    pub fn update_mae_mfe(&self, trade_id: i64, current_price: f64) -> Result<(), EngineError> {
        let Some(trade) = self.get(trade_id)? else {
            return Ok(());
        };
        if trade.exit_time.is_some() {
            return Ok(());
        }

        let unrealized =
            trade.side.direction() * (current_price - trade.entry_price) * trade.quantity as f64;

        let mut mae = trade.mae.unwrap_or(0.0);
        let mut mfe = trade.mfe.unwrap_or(0.0);
        let mut updated = false;

        if unrealized < mae {
            mae = unrealized;
            updated = true;
        }
        if unrealized > mfe {
            mfe = unrealized;
            updated = true;
        }

        if updated {
            let conn = self.conn.lock();
            conn.execute(
                "UPDATE trades SET mae = ?1, mfe = ?2 WHERE id = ?3",
                params![mae, mfe, trade_id],
            )?;
            debug!(trade_id, mae, mfe, "MAE/MFE updated");
        }
        Ok(())
    }

    /// Rewrite the planned stop price of an open trade. Closed trades are
    /// silently ignored (the trailing controller may race a close).
    pub fn update_stop(&self, trade_id: i64, new_stop: f64) -> Result<(), EngineError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE trades SET stop_price = ?1 WHERE id = ?2 AND exit_time IS NULL",
            params![new_stop, trade_id],
        )?;
        if changed > 0 {
            debug!(trade_id, new_stop, "journal stop updated");
        }
        Ok(())
    }

    /// Append a timestamped line to a trade's notes.
    pub fn append_note(&self, trade_id: i64, note: &str) -> Result<(), EngineError> {
        let trade = self
            .get(trade_id)?
            .ok_or(EngineError::UnknownTrade { trade_id })?;

        let stamp = Utc::now().format("%Y-%m-%d %H:%M:%S");
        let line = format!("[{stamp}] {note}");
        let combined = match trade.notes {
            Some(existing) if !existing.is_empty() => format!("{existing}\n{line}"),
            _ => line,
        };

        let conn = self.conn.lock();
        conn.execute(
            "UPDATE trades SET notes = ?1 WHERE id = ?2",
            params![combined, trade_id],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Fetch a single trade by id.
    pub fn get(&self, trade_id: i64) -> Result<Option<TradeRecord>, EngineError> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT * FROM trades WHERE id = ?1",
                params![trade_id],
                Self::map_row,
            )
            .optional()?;
        Ok(record)
    }

    /// All trades with no exit row, newest entry first.
    pub fn open_trades(&self) -> Result<Vec<TradeRecord>, EngineError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT * FROM trades WHERE exit_time IS NULL ORDER BY entry_time DESC")?;
        let rows = stmt.query_map([], Self::map_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Closed trades with optional exit-time range and symbol filters,
    /// newest exit first.
    pub fn closed_trades(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        symbol: Option<&str>,
    ) -> Result<Vec<TradeRecord>, EngineError> {
        let mut sql = String::from("SELECT * FROM trades WHERE exit_time IS NOT NULL");
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(start) = start {
            sql.push_str(&format!(" AND exit_time >= ?{}", args.len() + 1));
            args.push(Box::new(start));
        }
        if let Some(end) = end {
            sql.push_str(&format!(" AND exit_time <= ?{}", args.len() + 1));
            args.push(Box::new(end));
        }
        if let Some(symbol) = symbol {
            sql.push_str(&format!(" AND symbol = ?{}", args.len() + 1));
            args.push(Box::new(symbol.to_string()));
        }
        sql.push_str(" ORDER BY exit_time DESC");

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            Self::map_row,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Every trade (open and closed) for a symbol, newest entry first.
    pub fn by_symbol(&self, symbol: &str) -> Result<Vec<TradeRecord>, EngineError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT * FROM trades WHERE symbol = ?1 ORDER BY entry_time DESC")?;
        let rows = stmt.query_map(params![symbol], Self::map_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // -------------------------------------------------------------------------
    // Analytics
    // -------------------------------------------------------------------------

    /// Aggregate performance metrics over closed trades in the given
    /// exit-time window. A fully-zeroed record comes back when nothing
    /// matches.
    pub fn performance_stats(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<PerformanceStats, EngineError> {
        let trades = self.closed_trades(start, end, None)?;
        if trades.is_empty() {
            return Ok(PerformanceStats::default());
        }

        let pnls: Vec<f64> = trades.iter().filter_map(|t| t.realized_pnl).collect();
        let wins: Vec<f64> = pnls.iter().copied().filter(|p| *p > 0.0).collect();
        let losses: Vec<f64> = pnls.iter().copied().filter(|p| *p < 0.0).collect();

        let total_trades = trades.len();
        let win_rate = if total_trades > 0 {
            wins.len() as f64 / total_trades as f64 * 100.0
        } else {
            0.0
        };

        let gross_profit: f64 = wins.iter().sum();
        let gross_loss: f64 = losses.iter().sum::<f64>().abs();
        let profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else {
            0.0
        };

        // Annualized per-trade Sharpe over 252 trading days; needs a sample
        // standard deviation, so at least two pnl observations.
        let sharpe_ratio = if pnls.len() > 1 {
            let n = pnls.len() as f64;
            let pnl_mean = pnls.iter().sum::<f64>() / n;
            let variance =
                pnls.iter().map(|p| (p - pnl_mean).powi(2)).sum::<f64>() / (n - 1.0);
            let stdev = variance.sqrt();
            if stdev > 0.0 {
                pnl_mean / stdev * 252.0_f64.sqrt()
            } else {
                0.0
            }
        } else {
            0.0
        };

        let curve = self.equity_curve(start, end, DEFAULT_STARTING_EQUITY)?;
        let max_drawdown = max_drawdown_pct(&curve);

        let hold_times: Vec<f64> = trades
            .iter()
            .filter_map(|t| t.hold_time_minutes)
            .map(|m| m as f64)
            .collect();
        let rr: Vec<f64> = trades.iter().filter_map(|t| t.risk_reward_ratio).collect();

        Ok(PerformanceStats {
            total_trades,
            winning_trades: wins.len(),
            losing_trades: losses.len(),
            win_rate,
            total_pnl: pnls.iter().sum(),
            avg_win: mean(&wins),
            avg_loss: mean(&losses),
            largest_win: wins.iter().copied().fold(0.0, f64::max),
            largest_loss: losses.iter().copied().fold(0.0, f64::min),
            avg_risk_reward: mean(&rr),
            profit_factor,
            sharpe_ratio,
            max_drawdown,
            avg_hold_time_minutes: mean(&hold_times),
            total_commission: trades.iter().map(|t| t.commission).sum(),
        })
    }

    /// Equity curve for closed trades ordered by exit time:
    /// `equity_i = starting_equity + cumulative_pnl_i`.
    pub fn equity_curve(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        starting_equity: f64,
    ) -> Result<Vec<EquityPoint>, EngineError> {
        let mut trades = self.closed_trades(start, end, None)?;
        trades.sort_by_key(|t| t.exit_time);

        let mut cumulative = 0.0;
        let mut curve = Vec::with_capacity(trades.len());
        for trade in trades {
            let (Some(exit_time), Some(pnl)) = (trade.exit_time, trade.realized_pnl) else {
                continue;
            };
            cumulative += pnl;
            curve.push(EquityPoint {
                exit_time,
                realized_pnl: pnl,
                cumulative_pnl: cumulative,
                equity: starting_equity + cumulative,
            });
        }
        Ok(curve)
    }

    /// Performance subset restricted to one symbol's closed trades.
    pub fn symbol_stats(&self, symbol: &str) -> Result<SymbolStats, EngineError> {
        let trades = self.closed_trades(None, None, Some(symbol))?;
        let mut stats = SymbolStats {
            symbol: symbol.to_string(),
            ..SymbolStats::default()
        };
        if trades.is_empty() {
            return Ok(stats);
        }

        let pnls: Vec<f64> = trades.iter().filter_map(|t| t.realized_pnl).collect();
        let wins: Vec<f64> = pnls.iter().copied().filter(|p| *p > 0.0).collect();
        let losses: Vec<f64> = pnls.iter().copied().filter(|p| *p < 0.0).collect();
        let rr: Vec<f64> = trades.iter().filter_map(|t| t.risk_reward_ratio).collect();

        let gross_profit: f64 = wins.iter().sum();
        let gross_loss: f64 = losses.iter().sum::<f64>().abs();

        stats.total_trades = trades.len();
        stats.winning_trades = wins.len();
        stats.losing_trades = losses.len();
        stats.win_rate = wins.len() as f64 / trades.len() as f64 * 100.0;
        stats.total_pnl = pnls.iter().sum();
        stats.avg_win = mean(&wins);
        stats.avg_loss = mean(&losses);
        stats.largest_win = wins.iter().copied().fold(0.0, f64::max);
        stats.largest_loss = losses.iter().copied().fold(0.0, f64::min);
        stats.avg_risk_reward = mean(&rr);
        stats.profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else {
            0.0
        };
        Ok(stats)
    }

    // -------------------------------------------------------------------------
    // Row mapping
    // -------------------------------------------------------------------------

    fn map_row(row: &Row<'_>) -> rusqlite::Result<TradeRecord> {
        let side_str: String = row.get("side")?;
        let side = side_str.parse::<Side>().unwrap_or(Side::Long);
        let exit_reason: Option<String> = row.get("exit_reason")?;

        Ok(TradeRecord {
            id: row.get("id")?,
            symbol: row.get("symbol")?,
            side,
            entry_time: row.get("entry_time")?,
            exit_time: row.get("exit_time")?,
            entry_price: row.get("entry_price")?,
            exit_price: row.get("exit_price")?,
            quantity: row.get("quantity")?,
            stop_price: row.get("stop_price")?,
            target_price: row.get("target_price")?,
            actual_stop: row.get("actual_stop")?,
            actual_target: row.get("actual_target")?,
            commission: row.get::<_, Option<f64>>("commission")?.unwrap_or(0.0),
            realized_pnl: row.get("realized_pnl")?,
            pnl_pct: row.get("pnl_pct")?,
            risk_amount: row.get("risk_amount")?,
            risk_reward_ratio: row.get("risk_reward_ratio")?,
            mae: row.get("mae")?,
            mfe: row.get("mfe")?,
            hold_time_minutes: row.get("hold_time_minutes")?,
            exit_reason: exit_reason.as_deref().map(ExitReason::from_db),
            sabr20_score: row.get("sabr20_score")?,
            regime: row.get("regime")?,
            notes: row.get("notes")?,
        })
    }
}

impl std::fmt::Debug for TradeJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeJournal")
            .field("db_path", &self.db_path)
            .finish()
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// `min((equity - running_max) / running_max) * 100` over the curve, 0 when
/// the curve is empty.
fn max_drawdown_pct(curve: &[EquityPoint]) -> f64 {
    let mut running_max = f64::MIN;
    let mut worst = 0.0_f64;
    for point in curve {
        running_max = running_max.max(point.equity);
        let drawdown = (point.equity - running_max) / running_max * 100.0;
        worst = worst.min(drawdown);
    }
    worst
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ts(s: &str) -> DateTime<Utc> {
        chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .unwrap()
            .and_utc()
    }

    fn entry(symbol: &str, side: Side, price: f64, qty: i64, risk: f64) -> EntryRecord {
        EntryRecord {
            symbol: symbol.to_string(),
            side,
            entry_time: ts("2025-11-17 09:30:00"),
            entry_price: price,
            quantity: qty,
            stop_price: Some(price - 2.0),
            target_price: Some(price + 4.0),
            risk_amount: risk,
            sabr20_score: Some(85.5),
            regime: Some("TRENDING_UP".to_string()),
        }
    }

    /// Close a trade `minutes` after entry with the given exit price/pnl.
    fn close_at(
        journal: &TradeJournal,
        trade_id: i64,
        minutes: i64,
        exit_price: f64,
        commission: f64,
    ) -> TradeRecord {
        journal
            .record_exit(
                trade_id,
                ts("2025-11-17 09:30:00") + Duration::minutes(minutes),
                exit_price,
                ExitReason::Manual,
                commission,
                ExitDetails::default(),
            )
            .unwrap()
    }

    #[test]
    fn entry_then_exit_roundtrip_computes_derived_fields() {
        let journal = TradeJournal::open_in_memory().unwrap();
        let id = journal
            .record_entry(&entry("AAPL", Side::Long, 150.0, 100, 200.0))
            .unwrap();

        let open = journal.get(id).unwrap().unwrap();
        assert!(open.is_open());
        assert_eq!(open.symbol, "AAPL");
        assert_eq!(open.quantity, 100);
        assert_eq!(open.mae, Some(0.0));
        assert_eq!(open.sabr20_score, Some(85.5));

        let closed = journal
            .record_exit(
                id,
                ts("2025-11-17 11:00:30"),
                153.5,
                ExitReason::Target,
                2.0,
                ExitDetails {
                    mae: Some(-150.0),
                    mfe: Some(400.0),
                    ..ExitDetails::default()
                },
            )
            .unwrap();

        // (153.5 - 150.0) * 100 - 2.0 = 348.0
        assert_eq!(closed.realized_pnl, Some(348.0));
        // 348 / 15000 * 100 = 2.32
        assert!((closed.pnl_pct.unwrap() - 2.32).abs() < 1e-9);
        // 348 / 200 = 1.74
        assert!((closed.risk_reward_ratio.unwrap() - 1.74).abs() < 1e-9);
        // 90m 30s rounds down to 90.
        assert_eq!(closed.hold_time_minutes, Some(90));
        assert_eq!(closed.exit_reason, Some(ExitReason::Target));
        assert_eq!(closed.mae, Some(-150.0));
        assert_eq!(closed.mfe, Some(400.0));
    }

    #[test]
    fn short_exit_pnl_sign_flips() {
        let journal = TradeJournal::open_in_memory().unwrap();
        let id = journal
            .record_entry(&entry("TSLA", Side::Short, 200.0, 50, 100.0))
            .unwrap();
        let closed = close_at(&journal, id, 10, 196.0, 1.0);
        // (200 - 196) * 50 - 1 = 199
        assert_eq!(closed.realized_pnl, Some(199.0));
    }

    #[test]
    fn exit_twice_is_a_conflict() {
        let journal = TradeJournal::open_in_memory().unwrap();
        let id = journal
            .record_entry(&entry("AAPL", Side::Long, 150.0, 100, 200.0))
            .unwrap();
        close_at(&journal, id, 5, 151.0, 0.0);

        let err = journal
            .record_exit(
                id,
                ts("2025-11-17 10:00:00"),
                152.0,
                ExitReason::Manual,
                0.0,
                ExitDetails::default(),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyExited { .. }));
    }

    #[test]
    fn exit_unknown_trade() {
        let journal = TradeJournal::open_in_memory().unwrap();
        let err = journal
            .record_exit(
                999,
                Utc::now(),
                1.0,
                ExitReason::Manual,
                0.0,
                ExitDetails::default(),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownTrade { trade_id: 999 }));
    }

    #[test]
    fn mae_mfe_only_move_outward() {
        let journal = TradeJournal::open_in_memory().unwrap();
        let id = journal
            .record_entry(&entry("AAPL", Side::Long, 150.0, 100, 200.0))
            .unwrap();

        journal.update_mae_mfe(id, 153.0).unwrap(); // +300
        journal.update_mae_mfe(id, 148.0).unwrap(); // -200
        journal.update_mae_mfe(id, 151.0).unwrap(); // +100, inside the envelope

        let trade = journal.get(id).unwrap().unwrap();
        assert_eq!(trade.mae, Some(-200.0));
        assert_eq!(trade.mfe, Some(300.0));

        // Closed trades are untouched.
        close_at(&journal, id, 5, 151.0, 0.0);
        journal.update_mae_mfe(id, 100.0).unwrap();
        let trade = journal.get(id).unwrap().unwrap();
        assert_eq!(trade.mae, Some(-200.0));
    }

    #[test]
    fn update_stop_ignores_closed_trades() {
        let journal = TradeJournal::open_in_memory().unwrap();
        let id = journal
            .record_entry(&entry("AAPL", Side::Long, 150.0, 100, 200.0))
            .unwrap();

        journal.update_stop(id, 149.0).unwrap();
        assert_eq!(journal.get(id).unwrap().unwrap().stop_price, Some(149.0));

        close_at(&journal, id, 5, 151.0, 0.0);
        journal.update_stop(id, 150.5).unwrap();
        assert_eq!(journal.get(id).unwrap().unwrap().stop_price, Some(149.0));
    }

    #[test]
    fn append_note_accumulates_lines() {
        let journal = TradeJournal::open_in_memory().unwrap();
        let id = journal
            .record_entry(&entry("AAPL", Side::Long, 150.0, 100, 200.0))
            .unwrap();

        journal.append_note(id, "tightened stop after gap up").unwrap();
        journal.append_note(id, "second note").unwrap();

        let notes = journal.get(id).unwrap().unwrap().notes.unwrap();
        assert!(notes.contains("tightened stop after gap up"));
        assert!(notes.contains("second note"));
        assert_eq!(notes.lines().count(), 2);

        assert!(matches!(
            journal.append_note(999, "nope").unwrap_err(),
            EngineError::UnknownTrade { .. }
        ));
    }

    #[test]
    fn open_and_closed_queries() {
        let journal = TradeJournal::open_in_memory().unwrap();
        let a = journal
            .record_entry(&entry("AAPL", Side::Long, 150.0, 100, 200.0))
            .unwrap();
        let b = journal
            .record_entry(&entry("TSLA", Side::Long, 200.0, 50, 100.0))
            .unwrap();

        assert_eq!(journal.open_trades().unwrap().len(), 2);

        close_at(&journal, a, 5, 151.0, 0.0);
        let open = journal.open_trades().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, b);

        let closed = journal.closed_trades(None, None, None).unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].id, a);

        let by_symbol = journal.by_symbol("AAPL").unwrap();
        assert_eq!(by_symbol.len(), 1);

        // Symbol filter on closed trades.
        assert!(journal
            .closed_trades(None, None, Some("TSLA"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn closed_trades_time_window() {
        let journal = TradeJournal::open_in_memory().unwrap();
        for minutes in [10, 20, 30] {
            let id = journal
                .record_entry(&entry("AAPL", Side::Long, 150.0, 100, 200.0))
                .unwrap();
            close_at(&journal, id, minutes, 151.0, 0.0);
        }

        let window = journal
            .closed_trades(
                Some(ts("2025-11-17 09:45:00")),
                Some(ts("2025-11-17 09:55:00")),
                None,
            )
            .unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].exit_time, Some(ts("2025-11-17 09:50:00")));
    }

    #[test]
    fn performance_stats_scenario() {
        // realized pnls: +100, +150, -50, +200, -30
        let journal = TradeJournal::open_in_memory().unwrap();
        let pnls = [100.0, 150.0, -50.0, 200.0, -30.0];
        for (i, pnl) in pnls.iter().enumerate() {
            let id = journal
                .record_entry(&entry("AAPL", Side::Long, 100.0, 100, 100.0))
                .unwrap();
            // exit = entry + pnl/qty so realized pnl (commission 0) is exact
            close_at(&journal, id, (i as i64 + 1) * 10, 100.0 + pnl / 100.0, 0.0);
        }

        let stats = journal.performance_stats(None, None).unwrap();
        assert_eq!(stats.total_trades, 5);
        assert_eq!(stats.winning_trades, 3);
        assert_eq!(stats.losing_trades, 2);
        assert!((stats.win_rate - 60.0).abs() < 1e-9);
        assert!((stats.total_pnl - 370.0).abs() < 1e-9);
        assert!((stats.profit_factor - 5.625).abs() < 1e-9);
        assert!((stats.avg_win - 150.0).abs() < 1e-9);
        assert!((stats.avg_loss - (-40.0)).abs() < 1e-9);
        assert!((stats.largest_win - 200.0).abs() < 1e-9);
        assert!((stats.largest_loss - (-50.0)).abs() < 1e-9);
        assert!(stats.sharpe_ratio != 0.0);
    }

    #[test]
    fn performance_stats_empty_is_all_zero() {
        let journal = TradeJournal::open_in_memory().unwrap();
        let stats = journal.performance_stats(None, None).unwrap();
        assert_eq!(stats.total_trades, 0);
        assert_eq!(stats.win_rate, 0.0);
        assert_eq!(stats.profit_factor, 0.0);
        assert_eq!(stats.sharpe_ratio, 0.0);
        assert_eq!(stats.max_drawdown, 0.0);
    }

    #[test]
    fn equity_curve_and_drawdown() {
        // pnls +100, -200, +150 from 100_000:
        // curve = (100100, 99900, 100050); max drawdown ~ -0.1998%.
        let journal = TradeJournal::open_in_memory().unwrap();
        let pnls = [100.0, -200.0, 150.0];
        for (i, pnl) in pnls.iter().enumerate() {
            let id = journal
                .record_entry(&entry("AAPL", Side::Long, 100.0, 100, 100.0))
                .unwrap();
            close_at(&journal, id, (i as i64 + 1) * 10, 100.0 + pnl / 100.0, 0.0);
        }

        let curve = journal.equity_curve(None, None, 100_000.0).unwrap();
        assert_eq!(curve.len(), 3);
        assert!((curve[0].equity - 100_100.0).abs() < 1e-9);
        assert!((curve[1].equity - 99_900.0).abs() < 1e-9);
        assert!((curve[2].equity - 100_050.0).abs() < 1e-9);
        // Curve is ordered oldest exit first.
        assert!(curve[0].exit_time < curve[2].exit_time);

        let stats = journal.performance_stats(None, None).unwrap();
        let expected_dd = (99_900.0 - 100_100.0) / 100_100.0 * 100.0;
        assert!((stats.max_drawdown - expected_dd).abs() < 1e-9);
    }

    #[test]
    fn symbol_stats_restricts_to_symbol() {
        let journal = TradeJournal::open_in_memory().unwrap();
        let a = journal
            .record_entry(&entry("AAPL", Side::Long, 100.0, 100, 100.0))
            .unwrap();
        close_at(&journal, a, 10, 101.0, 0.0); // +100
        let b = journal
            .record_entry(&entry("TSLA", Side::Long, 100.0, 100, 100.0))
            .unwrap();
        close_at(&journal, b, 20, 99.0, 0.0); // -100

        let stats = journal.symbol_stats("AAPL").unwrap();
        assert_eq!(stats.total_trades, 1);
        assert_eq!(stats.winning_trades, 1);
        assert!((stats.total_pnl - 100.0).abs() < 1e-9);

        let none = journal.symbol_stats("MSFT").unwrap();
        assert_eq!(none.total_trades, 0);
    }

    #[test]
    fn journal_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trades.db");

        let id = {
            let journal = TradeJournal::open(&path).unwrap();
            journal
                .record_entry(&entry("AAPL", Side::Long, 150.0, 100, 200.0))
                .unwrap()
        };

        // Re-open: schema creation is idempotent, the open trade reappears.
        let journal = TradeJournal::open(&path).unwrap();
        let open = journal.open_trades().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, id);
        assert!(open[0].is_open());
    }
}
