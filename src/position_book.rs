// =============================================================================
// Position Book — open positions with live mark-to-market and MAE/MFE
// =============================================================================
//
// Life-cycle:
//   open_position  -> journal entry row + in-memory position (atomic pair)
//   update_price   -> unrealized P&L, MAE/MFE extremes, stale ticks dropped
//   modify_stop    -> accepted only in the favorable direction
//   close_position -> journal exit row + removal from the open set
//
// The open set is keyed by symbol; one open position per symbol. The book is
// the only caller of the journal's entry/exit writes, and `update_price` is
// the hot path: its critical section touches exactly one position, and all
// journal I/O happens after the lock is released.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::journal::{EntryRecord, ExitDetails, TradeJournal, TradeRecord};
use crate::types::{ExitReason, Side};

/// How many recently closed trades the in-memory rollup cache retains.
/// Authoritative history lives in the journal.
const RECENT_CLOSED_CAP: usize = 512;

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// A single open trade.
#[derive(Debug, Clone, Serialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub quantity: i64,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub stop_price: Option<f64>,
    pub target_price: Option<f64>,
    /// Last price seen from the bus; `None` until the first tick.
    pub current_price: Option<f64>,
    pub last_update: Option<DateTime<Utc>>,
    /// Journal row backing this position.
    pub trade_id: i64,
    /// Worst unrealized P&L seen so far (non-increasing).
    pub mae: f64,
    /// Best unrealized P&L seen so far (non-decreasing).
    pub mfe: f64,
}

impl Position {
    /// Mark-to-market P&L; zero until a price tick arrives.
    pub fn unrealized_pnl(&self) -> f64 {
        match self.current_price {
            Some(current) => {
                self.side.direction() * (current - self.entry_price) * self.quantity as f64
            }
            None => 0.0,
        }
    }

    /// Unrealized P&L as a percentage of entry value; zero when entry is zero.
    pub fn unrealized_pnl_pct(&self) -> f64 {
        let entry_value = self.entry_price * self.quantity as f64;
        if entry_value == 0.0 {
            0.0
        } else {
            self.unrealized_pnl() / entry_value * 100.0
        }
    }

    /// Distance to the stop in currency terms; zero without a stop or price.
    pub fn current_risk(&self) -> f64 {
        let (Some(current), Some(stop)) = (self.current_price, self.stop_price) else {
            return 0.0;
        };
        match self.side {
            Side::Long => (current - stop) * self.quantity as f64,
            Side::Short => (stop - current) * self.quantity as f64,
        }
    }
}

// ---------------------------------------------------------------------------
// Portfolio rollup
// ---------------------------------------------------------------------------

/// Portfolio-level aggregate across open positions and the recent-closed
/// cache.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PortfolioStats {
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub total_pnl: f64,
    pub positions_count: usize,
    pub winning_positions: usize,
    pub losing_positions: usize,
    pub closed_trades_count: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
}

// ---------------------------------------------------------------------------
// PositionBook
// ---------------------------------------------------------------------------

/// Thread-safe registry of open positions, backed by the trade journal.
pub struct PositionBook {
    positions: RwLock<HashMap<String, Position>>,
    recent_closed: RwLock<Vec<TradeRecord>>,
    journal: Arc<TradeJournal>,
}

/// Arguments for [`PositionBook::open_position`].
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub symbol: String,
    pub side: Side,
    pub quantity: i64,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub stop_price: Option<f64>,
    pub target_price: Option<f64>,
    pub risk_amount: f64,
    pub sabr20_score: Option<f64>,
    pub regime: Option<String>,
}

impl PositionBook {
    pub fn new(journal: Arc<TradeJournal>) -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
            recent_closed: RwLock::new(Vec::new()),
            journal,
        }
    }

    // -------------------------------------------------------------------------
    // Open / close
    // -------------------------------------------------------------------------

    /// Open a position and record its entry row. Returns the trade id.
    ///
    /// Atomicity: if the journal write fails the open set is unchanged; if it
    /// succeeds the position is inserted before the lock is released, so
    /// either both the book and the journal reflect the open, or neither.
    pub fn open_position(&self, request: OpenRequest) -> Result<i64, EngineError> {
        if request.quantity <= 0 {
            return Err(EngineError::InvalidQuantity {
                symbol: request.symbol,
                quantity: request.quantity,
            });
        }
        if request.entry_price <= 0.0 || !request.entry_price.is_finite() {
            return Err(EngineError::InvalidPrice {
                symbol: request.symbol,
                price: request.entry_price,
            });
        }

        let mut positions = self.positions.write();
        if positions.contains_key(&request.symbol) {
            return Err(EngineError::DuplicatePosition {
                symbol: request.symbol,
            });
        }

        // Journal write while holding the open-set lock: the cold path pays
        // for atomicity so the hot path never has to.
        let trade_id = self.journal.record_entry(&EntryRecord {
            symbol: request.symbol.clone(),
            side: request.side,
            entry_time: request.entry_time,
            entry_price: request.entry_price,
            quantity: request.quantity,
            stop_price: request.stop_price,
            target_price: request.target_price,
            risk_amount: request.risk_amount,
            sabr20_score: request.sabr20_score,
            regime: request.regime,
        })?;

        info!(
            symbol = %request.symbol,
            side = %request.side,
            quantity = request.quantity,
            entry_price = request.entry_price,
            stop_price = ?request.stop_price,
            trade_id,
            "position opened"
        );

        positions.insert(
            request.symbol.clone(),
            Position {
                symbol: request.symbol,
                side: request.side,
                quantity: request.quantity,
                entry_price: request.entry_price,
                entry_time: request.entry_time,
                stop_price: request.stop_price,
                target_price: request.target_price,
                current_price: None,
                last_update: None,
                trade_id,
                mae: 0.0,
                mfe: 0.0,
            },
        );

        Ok(trade_id)
    }

    /// Close a position, record its exit row, and return the closed record.
    ///
    /// If the journal write fails the position is re-inserted unchanged and
    /// the error propagates.
    pub fn close_position(
        &self,
        symbol: &str,
        exit_price: f64,
        exit_time: DateTime<Utc>,
        exit_reason: ExitReason,
        commission: f64,
        notes: Option<String>,
    ) -> Result<TradeRecord, EngineError> {
        if exit_price <= 0.0 || !exit_price.is_finite() {
            return Err(EngineError::InvalidPrice {
                symbol: symbol.to_string(),
                price: exit_price,
            });
        }

        let mut positions = self.positions.write();
        let position = positions
            .remove(symbol)
            .ok_or_else(|| EngineError::UnknownPosition {
                symbol: symbol.to_string(),
            })?;

        let details = ExitDetails {
            actual_stop: position.stop_price,
            actual_target: position.target_price,
            mae: Some(position.mae),
            mfe: Some(position.mfe),
            notes,
        };

        let record = match self.journal.record_exit(
            position.trade_id,
            exit_time,
            exit_price,
            exit_reason,
            commission,
            details,
        ) {
            Ok(record) => record,
            Err(e) => {
                // Roll back the in-memory removal.
                positions.insert(symbol.to_string(), position);
                return Err(e);
            }
        };
        drop(positions);

        info!(
            symbol,
            exit_price,
            realized_pnl = record.realized_pnl.unwrap_or(0.0),
            reason = %exit_reason,
            trade_id = record.id,
            "position closed"
        );

        let mut closed = self.recent_closed.write();
        closed.push(record.clone());
        if closed.len() > RECENT_CLOSED_CAP {
            let drop_count = closed.len() - RECENT_CLOSED_CAP;
            closed.drain(..drop_count);
        }

        Ok(record)
    }

    // -------------------------------------------------------------------------
    // Price updates
    // -------------------------------------------------------------------------

    /// Apply a price tick. Unknown symbols and stale ticks are silent no-ops.
    ///
    /// MAE/MFE move only outward; the journal is updated only when a new
    /// extreme is reached, after the book lock is released.
    pub fn update_price(&self, symbol: &str, price: f64, ts: DateTime<Utc>) {
        if price <= 0.0 || !price.is_finite() {
            warn!(symbol, price, "ignoring invalid price tick");
            return;
        }

        let journal_update = {
            let mut positions = self.positions.write();
            let Some(position) = positions.get_mut(symbol) else {
                return;
            };

            if let Some(last) = position.last_update {
                if ts < last {
                    debug!(symbol, %ts, %last, "dropping stale price tick");
                    return;
                }
            }

            position.current_price = Some(price);
            position.last_update = Some(ts);

            let unrealized = position.unrealized_pnl();
            let mut extreme_reached = false;
            if unrealized < position.mae {
                position.mae = unrealized;
                extreme_reached = true;
            }
            if unrealized > position.mfe {
                position.mfe = unrealized;
                extreme_reached = true;
            }

            extreme_reached.then_some((position.trade_id, price))
        };

        if let Some((trade_id, price)) = journal_update {
            if let Err(e) = self.journal.update_mae_mfe(trade_id, price) {
                warn!(symbol, trade_id, error = %e, "journal MAE/MFE update failed");
            }
        }
    }

    /// Move the protective stop, but only in the safe direction: up for
    /// longs, down for shorts. A rejected candidate returns `false` and is
    /// not an error — it is the guarantee callers rely on.
    pub fn modify_stop(&self, symbol: &str, new_stop: f64) -> bool {
        if new_stop <= 0.0 || !new_stop.is_finite() {
            warn!(symbol, new_stop, "rejecting invalid stop price");
            return false;
        }

        let mut positions = self.positions.write();
        let Some(position) = positions.get_mut(symbol) else {
            return false;
        };

        let accept = match (position.side, position.stop_price) {
            (_, None) => true,
            (Side::Long, Some(current)) => new_stop > current,
            (Side::Short, Some(current)) => new_stop < current,
        };

        if accept {
            debug!(
                symbol,
                old_stop = ?position.stop_price,
                new_stop,
                "stop modified"
            );
            position.stop_price = Some(new_stop);
        } else {
            debug!(
                symbol,
                current_stop = ?position.stop_price,
                rejected = new_stop,
                "stop modification rejected (not favorable)"
            );
        }
        accept
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Snapshot copy of one open position.
    pub fn position(&self, symbol: &str) -> Option<Position> {
        self.positions.read().get(symbol).cloned()
    }

    /// Snapshot of every open position.
    pub fn open_positions(&self) -> Vec<Position> {
        self.positions.read().values().cloned().collect()
    }

    /// Symbols with an open position.
    pub fn open_symbols(&self) -> Vec<String> {
        self.positions.read().keys().cloned().collect()
    }

    pub fn open_count(&self) -> usize {
        self.positions.read().len()
    }

    /// Total currency risk across the open set (sum of per-position
    /// stop-distance exposure).
    pub fn total_open_risk(&self) -> f64 {
        self.positions
            .read()
            .values()
            .map(Position::current_risk)
            .sum()
    }

    /// Portfolio aggregate over the open set and the recent-closed cache.
    pub fn portfolio_rollup(&self) -> PortfolioStats {
        let mut stats = PortfolioStats::default();

        {
            let positions = self.positions.read();
            stats.positions_count = positions.len();
            for position in positions.values() {
                let pnl = position.unrealized_pnl();
                stats.unrealized_pnl += pnl;
                if pnl > 0.0 {
                    stats.winning_positions += 1;
                } else if pnl < 0.0 {
                    stats.losing_positions += 1;
                }
            }
        }

        {
            let closed = self.recent_closed.read();
            stats.closed_trades_count = closed.len();
            for record in closed.iter() {
                let pnl = record.realized_pnl.unwrap_or(0.0);
                stats.realized_pnl += pnl;
                if pnl > 0.0 {
                    stats.winning_trades += 1;
                } else if pnl < 0.0 {
                    stats.losing_trades += 1;
                }
            }
        }

        stats.total_pnl = stats.realized_pnl + stats.unrealized_pnl;
        stats
    }

    // -------------------------------------------------------------------------
    // Restart
    // -------------------------------------------------------------------------

    /// Rebuild the open set from journal rows with no exit. Called once at
    /// startup; returns how many positions were restored.
    pub fn restore_from_journal(&self) -> Result<usize, EngineError> {
        let open_trades = self.journal.open_trades()?;
        let mut positions = self.positions.write();
        let mut restored = 0;

        for trade in open_trades {
            if positions.contains_key(&trade.symbol) {
                warn!(
                    symbol = %trade.symbol,
                    trade_id = trade.id,
                    "duplicate open journal row for symbol; keeping the newer entry"
                );
                continue;
            }
            positions.insert(
                trade.symbol.clone(),
                Position {
                    symbol: trade.symbol.clone(),
                    side: trade.side,
                    quantity: trade.quantity,
                    entry_price: trade.entry_price,
                    entry_time: trade.entry_time,
                    stop_price: trade.stop_price,
                    target_price: trade.target_price,
                    current_price: None,
                    last_update: None,
                    trade_id: trade.id,
                    mae: trade.mae.unwrap_or(0.0),
                    mfe: trade.mfe.unwrap_or(0.0),
                },
            );
            restored += 1;
        }

        if restored > 0 {
            info!(restored, "open positions restored from journal");
        }
        Ok(restored)
    }
}

impl std::fmt::Debug for PositionBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionBook")
            .field("open_positions", &self.positions.read().len())
            .field("recent_closed", &self.recent_closed.read().len())
            .finish()
    }
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

    fn book() -> PositionBook {
        PositionBook::new(Arc::new(TradeJournal::open_in_memory().unwrap()))
    }

    fn long_aapl(book: &PositionBook) -> i64 {
        book.open_position(OpenRequest {
            symbol: "AAPL".into(),
            side: Side::Long,
            quantity: 100,
            entry_price: 150.0,
            entry_time: ts("2025-11-17 09:30:00"),
            stop_price: Some(148.0),
            target_price: Some(154.0),
            risk_amount: 200.0,
            sabr20_score: None,
            regime: None,
        })
        .unwrap()
    }

    #[test]
    fn open_rejects_duplicates_and_bad_input() {
        let book = book();
        long_aapl(&book);

        let dup = book.open_position(OpenRequest {
            symbol: "AAPL".into(),
            side: Side::Short,
            quantity: 10,
            entry_price: 150.0,
            entry_time: Utc::now(),
            stop_price: None,
            target_price: None,
            risk_amount: 0.0,
            sabr20_score: None,
            regime: None,
        });
        assert!(matches!(dup, Err(EngineError::DuplicatePosition { .. })));

        let bad_qty = book.open_position(OpenRequest {
            symbol: "TSLA".into(),
            side: Side::Long,
            quantity: 0,
            entry_price: 100.0,
            entry_time: Utc::now(),
            stop_price: None,
            target_price: None,
            risk_amount: 0.0,
            sabr20_score: None,
            regime: None,
        });
        assert!(matches!(bad_qty, Err(EngineError::InvalidQuantity { .. })));

        let bad_price = book.open_position(OpenRequest {
            symbol: "TSLA".into(),
            side: Side::Long,
            quantity: 10,
            entry_price: -1.0,
            entry_time: Utc::now(),
            stop_price: None,
            target_price: None,
            risk_amount: 0.0,
            sabr20_score: None,
            regime: None,
        });
        assert!(matches!(bad_price, Err(EngineError::InvalidPrice { .. })));
    }

    #[test]
    fn pnl_and_excursion_tracking() {
        let book = book();
        long_aapl(&book);
        let t0 = ts("2025-11-17 09:31:00");

        book.update_price("AAPL", 153.0, t0);
        let pos = book.position("AAPL").unwrap();
        assert!((pos.unrealized_pnl() - 300.0).abs() < 1e-9);
        assert!((pos.unrealized_pnl_pct() - 2.0).abs() < 1e-9);
        assert!((pos.mfe - 300.0).abs() < 1e-9);

        book.update_price("AAPL", 148.0, t0 + Duration::minutes(1));
        let pos = book.position("AAPL").unwrap();
        assert!((pos.unrealized_pnl() - (-200.0)).abs() < 1e-9);
        assert!((pos.mae - (-200.0)).abs() < 1e-9);
        // MFE keeps the earlier extreme.
        assert!((pos.mfe - 300.0).abs() < 1e-9);
    }

    #[test]
    fn pnl_zero_before_first_tick() {
        let book = book();
        long_aapl(&book);
        let pos = book.position("AAPL").unwrap();
        assert_eq!(pos.unrealized_pnl(), 0.0);
        assert_eq!(pos.unrealized_pnl_pct(), 0.0);
        assert_eq!(pos.current_risk(), 0.0);
    }

    #[test]
    fn short_pnl_sign_flips() {
        let book = book();
        book.open_position(OpenRequest {
            symbol: "TSLA".into(),
            side: Side::Short,
            quantity: 50,
            entry_price: 200.0,
            entry_time: Utc::now(),
            stop_price: Some(204.0),
            target_price: None,
            risk_amount: 200.0,
            sabr20_score: None,
            regime: None,
        })
        .unwrap();

        book.update_price("TSLA", 196.0, Utc::now());
        let pos = book.position("TSLA").unwrap();
        assert!((pos.unrealized_pnl() - 200.0).abs() < 1e-9);
        // Risk for a short: (stop - current) * qty = (204 - 196) * 50 = 400.
        assert!((pos.current_risk() - 400.0).abs() < 1e-9);
    }

    #[test]
    fn stale_ticks_are_dropped() {
        let book = book();
        long_aapl(&book);
        let t0 = ts("2025-11-17 09:31:00");

        book.update_price("AAPL", 153.0, t0);
        // An older tick must not rewind the mark.
        book.update_price("AAPL", 100.0, t0 - Duration::seconds(30));

        let pos = book.position("AAPL").unwrap();
        assert_eq!(pos.current_price, Some(153.0));
        assert!((pos.mae - 0.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_symbol_tick_is_noop() {
        let book = book();
        book.update_price("NOPE", 100.0, Utc::now());
        assert_eq!(book.open_count(), 0);
    }

    #[test]
    fn modify_stop_monotonic_rail() {
        let book = book();
        long_aapl(&book);

        // Worse stop for a long: rejected, state unchanged.
        assert!(!book.modify_stop("AAPL", 147.0));
        assert_eq!(book.position("AAPL").unwrap().stop_price, Some(148.0));

        // Better stop: accepted.
        assert!(book.modify_stop("AAPL", 149.0));
        assert_eq!(book.position("AAPL").unwrap().stop_price, Some(149.0));

        // Equal stop is not an improvement.
        assert!(!book.modify_stop("AAPL", 149.0));

        // Unknown symbol.
        assert!(!book.modify_stop("NOPE", 1.0));
    }

    #[test]
    fn modify_stop_short_direction() {
        let book = book();
        book.open_position(OpenRequest {
            symbol: "TSLA".into(),
            side: Side::Short,
            quantity: 10,
            entry_price: 200.0,
            entry_time: Utc::now(),
            stop_price: Some(204.0),
            target_price: None,
            risk_amount: 40.0,
            sabr20_score: None,
            regime: None,
        })
        .unwrap();

        assert!(!book.modify_stop("TSLA", 205.0));
        assert!(book.modify_stop("TSLA", 203.0));
        assert_eq!(book.position("TSLA").unwrap().stop_price, Some(203.0));
    }

    #[test]
    fn modify_stop_accepts_first_stop_when_none() {
        let book = book();
        book.open_position(OpenRequest {
            symbol: "MSFT".into(),
            side: Side::Long,
            quantity: 10,
            entry_price: 400.0,
            entry_time: Utc::now(),
            stop_price: None,
            target_price: None,
            risk_amount: 0.0,
            sabr20_score: None,
            regime: None,
        })
        .unwrap();

        assert!(book.modify_stop("MSFT", 395.0));
        assert_eq!(book.position("MSFT").unwrap().stop_price, Some(395.0));
    }

    #[test]
    fn close_writes_exit_and_feeds_rollup() {
        let book = book();
        long_aapl(&book);
        book.update_price("AAPL", 153.0, ts("2025-11-17 10:00:00"));

        let record = book
            .close_position(
                "AAPL",
                153.0,
                ts("2025-11-17 10:30:00"),
                ExitReason::Target,
                1.0,
                None,
            )
            .unwrap();

        assert_eq!(record.realized_pnl, Some(299.0));
        assert_eq!(record.exit_reason, Some(ExitReason::Target));
        assert_eq!(record.mfe, Some(300.0));
        assert!(book.position("AAPL").is_none());

        let rollup = book.portfolio_rollup();
        assert_eq!(rollup.positions_count, 0);
        assert_eq!(rollup.closed_trades_count, 1);
        assert_eq!(rollup.winning_trades, 1);
        assert!((rollup.realized_pnl - 299.0).abs() < 1e-9);
        assert!((rollup.total_pnl - 299.0).abs() < 1e-9);
    }

    #[test]
    fn close_unknown_position() {
        let book = book();
        let err = book
            .close_position("NOPE", 1.0, Utc::now(), ExitReason::Manual, 0.0, None)
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownPosition { .. }));
    }

    #[test]
    fn rollup_classifies_open_positions() {
        let book = book();
        long_aapl(&book);
        book.open_position(OpenRequest {
            symbol: "TSLA".into(),
            side: Side::Long,
            quantity: 10,
            entry_price: 200.0,
            entry_time: Utc::now(),
            stop_price: None,
            target_price: None,
            risk_amount: 0.0,
            sabr20_score: None,
            regime: None,
        })
        .unwrap();

        let now = Utc::now();
        book.update_price("AAPL", 151.0, now); // +100
        book.update_price("TSLA", 199.0, now); // -10

        let rollup = book.portfolio_rollup();
        assert_eq!(rollup.positions_count, 2);
        assert_eq!(rollup.winning_positions, 1);
        assert_eq!(rollup.losing_positions, 1);
        assert!((rollup.unrealized_pnl - 90.0).abs() < 1e-9);
    }

    #[test]
    fn restore_from_journal_rebuilds_open_set() {
        let journal = Arc::new(TradeJournal::open_in_memory().unwrap());
        {
            let book = PositionBook::new(journal.clone());
            book.open_position(OpenRequest {
                symbol: "AAPL".into(),
                side: Side::Long,
                quantity: 100,
                entry_price: 150.0,
                entry_time: ts("2025-11-17 09:30:00"),
                stop_price: Some(148.0),
                target_price: Some(154.0),
                risk_amount: 200.0,
                sabr20_score: None,
                regime: None,
            })
            .unwrap();
        }

        // A fresh book over the same journal: the open trade reappears.
        let book = PositionBook::new(journal);
        assert_eq!(book.restore_from_journal().unwrap(), 1);
        let pos = book.position("AAPL").unwrap();
        assert_eq!(pos.quantity, 100);
        assert_eq!(pos.stop_price, Some(148.0));
        assert!(pos.current_price.is_none());
    }

    #[test]
    fn total_open_risk_sums_positions() {
        let book = book();
        long_aapl(&book);
        book.update_price("AAPL", 150.0, Utc::now());
        // (150 - 148) * 100 = 200
        assert!((book.total_open_risk() - 200.0).abs() < 1e-9);
    }
}
