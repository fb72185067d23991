//! Primitive trading types shared across the workspace.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A normalized trading pair symbol (e.g. "BTCUSDT").
///
/// Always stored uppercase so map lookups and dedup keys are
/// case-insensitive by construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    /// Create a symbol, normalizing to uppercase.
    pub fn new(s: impl AsRef<str>) -> Self {
        Self(s.as_ref().trim().to_uppercase())
    }

    /// The symbol as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if the symbol is empty after normalization.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Order side: which way the order moves inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The opposite side.
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Directional exposure of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Order side that opens or adds to this position.
    pub fn entry_side(&self) -> Side {
        match self {
            PositionSide::Long => Side::Buy,
            PositionSide::Short => Side::Sell,
        }
    }

    /// Order side that reduces or closes this position.
    pub fn close_side(&self) -> Side {
        self.entry_side().opposite()
    }

    /// The opposite direction.
    pub fn opposite(&self) -> PositionSide {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }

    /// Signed unit multiplier: +1 for long, -1 for short.
    pub fn sign(&self) -> i8 {
        match self {
            PositionSide::Long => 1,
            PositionSide::Short => -1,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

/// Rolling-aggregate timeframes supported by the context aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "2h")]
    H2,
    #[serde(rename = "4h")]
    H4,
}

impl Timeframe {
    /// Window length in seconds.
    pub fn seconds(&self) -> u64 {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M3 => 3 * 60,
            Timeframe::M5 => 5 * 60,
            Timeframe::M15 => 15 * 60,
            Timeframe::M30 => 30 * 60,
            Timeframe::H1 => 60 * 60,
            Timeframe::H2 => 2 * 60 * 60,
            Timeframe::H4 => 4 * 60 * 60,
        }
    }

    /// Canonical lowercase label ("15m", "1h", ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M3 => "3m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H2 => "2h",
            Timeframe::H4 => "4h",
        }
    }

    /// All supported timeframes, shortest first.
    pub fn all() -> &'static [Timeframe] {
        &[
            Timeframe::M1,
            Timeframe::M3,
            Timeframe::M5,
            Timeframe::M15,
            Timeframe::M30,
            Timeframe::H1,
            Timeframe::H2,
            Timeframe::H4,
        ]
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error returned when parsing an unknown timeframe label.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown timeframe: {0}")]
pub struct TimeframeParseError(pub String);

impl FromStr for Timeframe {
    type Err = TimeframeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "1m" => Ok(Timeframe::M1),
            "3m" => Ok(Timeframe::M3),
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            "30m" => Ok(Timeframe::M30),
            "1h" => Ok(Timeframe::H1),
            "2h" => Ok(Timeframe::H2),
            "4h" => Ok(Timeframe::H4),
            other => Err(TimeframeParseError(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_normalizes_case() {
        let s = Symbol::new(" btcusdt ");
        assert_eq!(s.as_str(), "BTCUSDT");
        assert_eq!(Symbol::new("BTCUSDT"), s);
    }

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
    }

    #[test]
    fn test_position_side_order_sides() {
        assert_eq!(PositionSide::Long.entry_side(), Side::Buy);
        assert_eq!(PositionSide::Long.close_side(), Side::Sell);
        assert_eq!(PositionSide::Short.entry_side(), Side::Sell);
        assert_eq!(PositionSide::Short.close_side(), Side::Buy);
    }

    #[test]
    fn test_position_side_sign() {
        assert_eq!(PositionSide::Long.sign(), 1);
        assert_eq!(PositionSide::Short.sign(), -1);
    }

    #[test]
    fn test_timeframe_roundtrip() {
        for tf in Timeframe::all() {
            assert_eq!(tf.as_str().parse::<Timeframe>().unwrap(), *tf);
        }
        assert!("7m".parse::<Timeframe>().is_err());
    }

    #[test]
    fn test_timeframe_seconds_ordering() {
        let secs: Vec<u64> = Timeframe::all().iter().map(|t| t.seconds()).collect();
        let mut sorted = secs.clone();
        sorted.sort_unstable();
        assert_eq!(secs, sorted);
    }

    #[test]
    fn test_timeframe_serde_labels() {
        let json = serde_json::to_string(&Timeframe::M15).unwrap();
        assert_eq!(json, "\"15m\"");
        let parsed: Timeframe = serde_json::from_str("\"4h\"").unwrap();
        assert_eq!(parsed, Timeframe::H4);
    }
}
