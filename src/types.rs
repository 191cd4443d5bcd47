// =============================================================================
// Shared types used across the Kestrel trade engine
// =============================================================================

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Direction of a trade.
///
/// Serialized as `BUY` / `SELL` to match the journal schema and broker wire
/// conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY")]
    Long,
    #[serde(rename = "SELL")]
    Short,
}

impl Side {
    /// Wire/database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Long => "BUY",
            Self::Short => "SELL",
        }
    }

    /// +1.0 for longs, -1.0 for shorts. Multiplying a price move by this
    /// gives the signed P&L contribution.
    pub fn direction(&self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BUY" | "LONG" => Ok(Self::Long),
            "SELL" | "SHORT" => Ok(Self::Short),
            other => Err(EngineError::InvalidSide {
                side: other.to_string(),
            }),
        }
    }
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    #[serde(rename = "STOP")]
    Stop,
    #[serde(rename = "TARGET")]
    Target,
    #[serde(rename = "MANUAL")]
    Manual,
    #[serde(rename = "TRAILING_STOP")]
    TrailingStop,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "STOP",
            Self::Target => "TARGET",
            Self::Manual => "MANUAL",
            Self::TrailingStop => "TRAILING_STOP",
        }
    }

    /// Parse the database representation. Unknown strings map to `Manual`
    /// so that a hand-edited journal row cannot poison queries.
    pub fn from_db(s: &str) -> Self {
        match s {
            "STOP" => Self::Stop,
            "TARGET" => Self::Target,
            "TRAILING_STOP" => Self::TrailingStop,
            _ => Self::Manual,
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the trailing stop distance is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrailingType {
    /// Fixed percentage below the high-water mark (above the low-water mark
    /// for shorts).
    Percentage,
    /// ATR multiple converted to a percentage of the current price.
    Atr,
}

impl std::fmt::Display for TrailingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Percentage => write!(f, "percentage"),
            Self::Atr => write!(f, "atr"),
        }
    }
}
