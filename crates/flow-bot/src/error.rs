//! Error taxonomy for the trading pipeline.
//!
//! Local errors (missing data) are absorbed at their source as HOLD/skip
//! outcomes; cross-cutting errors propagate as a decision's terminal status
//! without side effects. `ProtectionIncomplete` is the only class permitted
//! to trigger a compensating action (the rollback flatten).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classified pipeline failures.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum PipelineError {
    /// Missing or stale upstream metric. Local: the symbol holds this cycle.
    #[error("market data unavailable: {0}")]
    DataUnavailable(String),

    /// A pre-trade check failed. Never retried.
    #[error("validation rejected: {0}")]
    ValidationRejected(String),

    /// The fallback chain exhausted without a fill. Terminal for the cycle;
    /// the next cycle re-evaluates naturally.
    #[error("liquidity insufficient after {attempts} attempts")]
    LiquidityInsufficient { attempts: u32 },

    /// TP/SL placement came back partial. Always alerts; the report states
    /// whether the fill was rolled back or stands unprotected.
    #[error("protection incomplete: {reason} (rolled_back={rolled_back})")]
    ProtectionIncomplete { reason: String, rolled_back: bool },

    /// The requested action would break a position invariant. Always
    /// rejected, never coerced into a different action.
    #[error("state invariant violation: {0}")]
    StateInvariantViolation(String),

    /// An account-level cooldown is active. Blocks entries only.
    #[error("account circuit open: {0}")]
    AccountCircuitOpen(String),

    /// The venue itself failed.
    #[error("venue error: {0}")]
    Venue(String),
}

impl PipelineError {
    /// Short classification code for audit records.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::DataUnavailable(_) => "DATA_UNAVAILABLE",
            PipelineError::ValidationRejected(_) => "VALIDATION_REJECTED",
            PipelineError::LiquidityInsufficient { .. } => "LIQUIDITY_INSUFFICIENT",
            PipelineError::ProtectionIncomplete { .. } => "PROTECTION_INCOMPLETE",
            PipelineError::StateInvariantViolation(_) => "STATE_INVARIANT",
            PipelineError::AccountCircuitOpen(_) => "CIRCUIT_OPEN",
            PipelineError::Venue(_) => "VENUE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_and_display() {
        let err = PipelineError::LiquidityInsufficient { attempts: 3 };
        assert_eq!(err.code(), "LIQUIDITY_INSUFFICIENT");
        assert!(err.to_string().contains("3 attempts"));

        let err = PipelineError::ProtectionIncomplete {
            reason: "missing take-profit".into(),
            rolled_back: true,
        };
        assert!(err.to_string().contains("rolled_back=true"));
    }
}
