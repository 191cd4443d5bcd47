// =============================================================================
// Error taxonomy for the Kestrel trade engine
// =============================================================================
//
// Classification:
//   Validation (InvalidBar, InvalidSide, InvalidQuantity, InvalidPrice,
//               Config)                     -> caller bug, state unchanged
//   Lookup     (UnknownPosition, UnknownTrade)
//   Conflict   (DuplicatePosition, AlreadyExited)
//   Ordering   (OutOfOrderBar)
//   Storage    (Journal)                    -> caller decides retry/abort
//
// Soft failures (rejected stop candidates, callback errors, stale ticks) are
// never surfaced through this enum; they are logged and counted instead.
// =============================================================================

use thiserror::Error;

/// Structured error returned by the core engine components.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A source bar violated the OHLCV invariants.
    #[error("invalid bar: {reason}")]
    InvalidBar { reason: String },

    /// A side string could not be parsed as BUY or SELL.
    #[error("invalid side: {side}")]
    InvalidSide { side: String },

    /// A quantity was zero or negative.
    #[error("invalid quantity for {symbol}: {quantity}")]
    InvalidQuantity { symbol: String, quantity: i64 },

    /// A price was zero, negative, or non-finite.
    #[error("invalid price for {symbol}: {price}")]
    InvalidPrice { symbol: String, price: f64 },

    /// A construction-time configuration constraint was violated.
    #[error("config error: {reason}")]
    Config { reason: String },

    /// No open position exists for the symbol.
    #[error("no open position for {symbol}")]
    UnknownPosition { symbol: String },

    /// No journal row exists with the given trade id.
    #[error("no trade with id {trade_id}")]
    UnknownTrade { trade_id: i64 },

    /// An open position already exists for the symbol.
    #[error("position already open for {symbol}")]
    DuplicatePosition { symbol: String },

    /// The journal row already carries an exit.
    #[error("trade {trade_id} already exited")]
    AlreadyExited { trade_id: i64 },

    /// A source bar arrived out of order or duplicated for the symbol.
    #[error("out-of-order bar for {symbol}: {timestamp} <= {last_seen}")]
    OutOfOrderBar {
        symbol: String,
        timestamp: chrono::DateTime<chrono::Utc>,
        last_seen: chrono::DateTime<chrono::Utc>,
    },

    /// The journal's backing store failed.
    #[error("journal storage error: {0}")]
    Journal(#[from] rusqlite::Error),
}

impl EngineError {
    /// The symbol this error concerns, when one applies.
    pub fn symbol(&self) -> Option<&str> {
        match self {
            Self::InvalidQuantity { symbol, .. }
            | Self::InvalidPrice { symbol, .. }
            | Self::UnknownPosition { symbol }
            | Self::DuplicatePosition { symbol }
            | Self::OutOfOrderBar { symbol, .. } => Some(symbol),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_human_readable() {
        let err = EngineError::DuplicatePosition {
            symbol: "AAPL".into(),
        };
        assert_eq!(err.to_string(), "position already open for AAPL");
        assert_eq!(err.symbol(), Some("AAPL"));
    }

    #[test]
    fn symbol_absent_for_trade_errors() {
        let err = EngineError::AlreadyExited { trade_id: 7 };
        assert!(err.symbol().is_none());
        assert!(err.to_string().contains('7'));
    }
}
