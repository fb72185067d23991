//! Order execution: bounded retry-and-fallback chains with protective-order
//! placement.
//!
//! A degrade chain is data, not control flow: an ordered list of tagged
//! strategies (`limit-ioc`, `limit-ioc-slip`, `gtc-fallback`,
//! `market-fallback`) evaluated by a small interpreter in
//! [`router::ExecutionRouter`]. Every call returns one of five terminal
//! statuses (success is never inferred from the absence of an error) and
//! every attempt is recorded for the audit trail.

pub mod router;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::LegConfig;
use crate::error::PipelineError;

pub use router::ExecutionRouter;

/// One tagged step of a degrade chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptStrategy {
    /// Aggressive limit-IOC at the base price.
    LimitIoc,
    /// Limit-IOC with the price slid by `attempt` steps.
    LimitIocSlip { attempt: u32 },
    /// Resting GTC at the base price.
    GtcFallback,
    /// Market order, last resort.
    MarketFallback,
}

impl AttemptStrategy {
    pub fn tag(&self) -> &'static str {
        match self {
            AttemptStrategy::LimitIoc => "limit-ioc",
            AttemptStrategy::LimitIocSlip { .. } => "limit-ioc-slip",
            AttemptStrategy::GtcFallback => "gtc-fallback",
            AttemptStrategy::MarketFallback => "market-fallback",
        }
    }

    /// IOC strategies retry on no-liquidity; fallbacks run at most once.
    pub fn is_ioc(&self) -> bool {
        matches!(
            self,
            AttemptStrategy::LimitIoc | AttemptStrategy::LimitIocSlip { .. }
        )
    }
}

/// Build the ordered chain for one leg.
pub fn build_chain(leg: &LegConfig) -> Vec<AttemptStrategy> {
    let mut chain = Vec::new();
    chain.push(AttemptStrategy::LimitIoc);
    for attempt in 1..leg.ioc_retries.max(1) {
        chain.push(AttemptStrategy::LimitIocSlip { attempt });
    }
    if leg.gtc_fallback {
        chain.push(AttemptStrategy::GtcFallback);
    }
    if leg.market_fallback {
        chain.push(AttemptStrategy::MarketFallback);
    }
    chain
}

/// Terminal status of one router call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecStatus {
    Success,
    Partial,
    Pending,
    Noop,
    Error,
}

impl ExecStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecStatus::Success => "success",
            ExecStatus::Partial => "partial",
            ExecStatus::Pending => "pending",
            ExecStatus::Noop => "noop",
            ExecStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Protective-order outcome attached to an execution report. The caller
/// always learns explicitly whether an incomplete placement was rolled back
/// or stands as open risk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProtectionStatus {
    /// Every requested leg is resting with an order id.
    Complete {
        tp_order_id: Option<String>,
        sl_order_id: Option<String>,
    },
    /// At least one requested leg failed to place.
    Incomplete {
        missing: Vec<String>,
        /// True when the fill was force-flattened in compensation.
        rolled_back: bool,
    },
    /// No protective legs were requested.
    NotRequired,
    /// Entry has not filled yet; protection follows the fill.
    Deferred,
}

impl ProtectionStatus {
    pub fn is_complete(&self) -> bool {
        matches!(
            self,
            ProtectionStatus::Complete { .. } | ProtectionStatus::NotRequired
        )
    }
}

/// One recorded attempt in a degrade chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub strategy: AttemptStrategy,
    pub price: Option<Decimal>,
    pub filled_quantity: Decimal,
    pub outcome: String,
}

/// Uniform result of any router call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub status: ExecStatus,
    pub filled_quantity: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub protection: ProtectionStatus,
    pub attempts: Vec<AttemptRecord>,
    pub error: Option<PipelineError>,
    /// Whether a full close triggered the unconditional cancel-all sweep.
    pub cancel_all_issued: bool,
    /// Free-form annotation (noop reasons, reconciliations).
    pub note: Option<String>,
}

impl ExecutionReport {
    pub fn noop(reason: &str) -> Self {
        Self {
            status: ExecStatus::Noop,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
            protection: ProtectionStatus::NotRequired,
            attempts: Vec::new(),
            error: None,
            cancel_all_issued: false,
            note: Some(reason.to_string()),
        }
    }

    pub fn failed(error: PipelineError) -> Self {
        Self {
            status: ExecStatus::Error,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
            protection: ProtectionStatus::NotRequired,
            attempts: Vec::new(),
            error: Some(error),
            cancel_all_issued: false,
            note: None,
        }
    }

    pub fn is_terminal_success(&self) -> bool {
        matches!(self.status, ExecStatus::Success | ExecStatus::Noop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_shape_default_open() {
        let leg = LegConfig {
            ioc_retries: 1,
            ioc_step_bps: 10.0,
            gtc_fallback: true,
            market_fallback: false,
        };
        let chain = build_chain(&leg);
        assert_eq!(
            chain,
            vec![AttemptStrategy::LimitIoc, AttemptStrategy::GtcFallback]
        );
    }

    #[test]
    fn test_chain_shape_with_retries_and_market() {
        let leg = LegConfig {
            ioc_retries: 3,
            ioc_step_bps: 10.0,
            gtc_fallback: false,
            market_fallback: true,
        };
        let chain = build_chain(&leg);
        assert_eq!(
            chain,
            vec![
                AttemptStrategy::LimitIoc,
                AttemptStrategy::LimitIocSlip { attempt: 1 },
                AttemptStrategy::LimitIocSlip { attempt: 2 },
                AttemptStrategy::MarketFallback,
            ]
        );
    }

    #[test]
    fn test_chain_is_bounded() {
        let leg = LegConfig {
            ioc_retries: 0, // coerced to one attempt
            ioc_step_bps: 10.0,
            gtc_fallback: false,
            market_fallback: false,
        };
        assert_eq!(build_chain(&leg).len(), 1);
    }

    #[test]
    fn test_strategy_tags() {
        assert_eq!(AttemptStrategy::LimitIoc.tag(), "limit-ioc");
        assert_eq!(
            AttemptStrategy::LimitIocSlip { attempt: 2 }.tag(),
            "limit-ioc-slip"
        );
        assert!(AttemptStrategy::LimitIoc.is_ioc());
        assert!(!AttemptStrategy::GtcFallback.is_ioc());
    }

    #[test]
    fn test_report_constructors() {
        let noop = ExecutionReport::noop("nothing to close");
        assert_eq!(noop.status, ExecStatus::Noop);
        assert!(noop.is_terminal_success());

        let failed = ExecutionReport::failed(PipelineError::LiquidityInsufficient { attempts: 2 });
        assert_eq!(failed.status, ExecStatus::Error);
        assert!(!failed.is_terminal_success());
    }
}
