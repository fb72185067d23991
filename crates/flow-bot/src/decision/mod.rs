//! Decision engine: regime classification plus directional scoring.
//!
//! A decision is a tagged intent carrying only action-relevant fields, never
//! one struct with a pile of optionals. The regime selects which weight table
//! scores the market; the mapping from scores to intents lives in
//! [`scoring::ScoringEngine::decide`].

pub mod regime;
pub mod scoring;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use flow_common::PositionSide;

pub use regime::{Regime, RegimeClassifier, RegimeState};
pub use scoring::{ScoreResult, ScoringEngine};

/// What the pipeline intends to do with one symbol this cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TradeIntent {
    /// Open a fresh position.
    Open {
        side: PositionSide,
        /// Fraction of available balance to commit.
        fraction: Decimal,
        leverage: u32,
        take_profit: Option<Decimal>,
        stop_loss: Option<Decimal>,
        /// Directional score that produced this entry; used for candidate
        /// ranking under slot scarcity.
        score: f64,
        reason: String,
    },

    /// Scale into an existing protected position (DCA stage).
    Add {
        stage: usize,
        quantity: Decimal,
        reason: String,
    },

    /// Close the current position.
    Close { reason: String },

    /// (Re)place protective orders on the current position.
    SetProtection {
        take_profit: Option<Decimal>,
        stop_loss: Option<Decimal>,
        reason: String,
    },

    /// Do nothing this cycle.
    Hold { reason: String },
}

impl TradeIntent {
    /// Short action tag for logs and audit records.
    pub fn action(&self) -> &'static str {
        match self {
            TradeIntent::Open { .. } => "OPEN",
            TradeIntent::Add { .. } => "ADD",
            TradeIntent::Close { .. } => "CLOSE",
            TradeIntent::SetProtection { .. } => "SET_PROTECTION",
            TradeIntent::Hold { .. } => "HOLD",
        }
    }

    /// Entries (open/add) are subject to trigger and account gating;
    /// closes never are.
    pub fn is_entry(&self) -> bool {
        matches!(self, TradeIntent::Open { .. } | TradeIntent::Add { .. })
    }

    /// The human-readable rationale attached to the intent.
    pub fn reason(&self) -> &str {
        match self {
            TradeIntent::Open { reason, .. }
            | TradeIntent::Add { reason, .. }
            | TradeIntent::Close { reason }
            | TradeIntent::SetProtection { reason, .. }
            | TradeIntent::Hold { reason } => reason,
        }
    }

    /// The side an `Open` intent targets.
    pub fn open_side(&self) -> Option<PositionSide> {
        match self {
            TradeIntent::Open { side, .. } => Some(*side),
            _ => None,
        }
    }

    /// The ranking score of an `Open` intent, 0.0 otherwise.
    pub fn open_score(&self) -> f64 {
        match self {
            TradeIntent::Open { score, .. } => *score,
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_intent_action_tags() {
        let hold = TradeIntent::Hold {
            reason: "x".into(),
        };
        assert_eq!(hold.action(), "HOLD");
        assert!(!hold.is_entry());

        let open = TradeIntent::Open {
            side: PositionSide::Long,
            fraction: dec!(0.2),
            leverage: 3,
            take_profit: None,
            stop_loss: None,
            score: 0.4,
            reason: "entry".into(),
        };
        assert_eq!(open.action(), "OPEN");
        assert!(open.is_entry());
        assert_eq!(open.open_side(), Some(PositionSide::Long));
        assert_eq!(open.open_score(), 0.4);

        let close = TradeIntent::Close {
            reason: "flip".into(),
        };
        assert!(!close.is_entry());
        assert_eq!(close.open_score(), 0.0);
    }
}
