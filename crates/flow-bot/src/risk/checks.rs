//! Stateless pre-trade validation.
//!
//! Leverage and position fraction are clamped into their configured bounds;
//! a quote deviating too far from the trusted mark is a hard reject, never a
//! clamp.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use flow_common::Symbol;

use crate::config::RiskConfig;

/// Why a proposal was rejected outright.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RejectReason {
    SymbolNotAllowed {
        symbol: Symbol,
    },
    /// Quote strayed beyond the deviation limit from the mark price.
    PriceDeviation {
        quote: Decimal,
        mark: Decimal,
        deviation_pct: f64,
        limit_pct: f64,
    },
    /// Quote or mark was non-positive.
    InvalidPrice {
        quote: Decimal,
        mark: Decimal,
    },
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::SymbolNotAllowed { .. } => "SYMBOL_NOT_ALLOWED",
            RejectReason::PriceDeviation { .. } => "PRICE_DEVIATION",
            RejectReason::InvalidPrice { .. } => "INVALID_PRICE",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::SymbolNotAllowed { symbol } => {
                write!(f, "symbol not in allow-list: {symbol}")
            }
            RejectReason::PriceDeviation {
                quote,
                mark,
                deviation_pct,
                limit_pct,
            } => write!(
                f,
                "quote {quote} deviates {deviation_pct:.3}% from mark {mark} (limit {limit_pct}%)"
            ),
            RejectReason::InvalidPrice { quote, mark } => {
                write!(f, "non-positive price: quote={quote} mark={mark}")
            }
        }
    }
}

/// An entry proposal after clamping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidatedEntry {
    pub leverage: u32,
    pub fraction: Decimal,
}

/// Runs the stateless pre-trade checks.
#[derive(Debug, Clone)]
pub struct PreTradeChecker {
    config: RiskConfig,
    allowlist: HashSet<Symbol>,
}

impl PreTradeChecker {
    pub fn new(config: RiskConfig, allowlist: impl IntoIterator<Item = Symbol>) -> Self {
        Self {
            config,
            allowlist: allowlist.into_iter().collect(),
        }
    }

    /// Allow-list membership. An empty allow-list admits nothing: trading an
    /// unlisted symbol is never implicit.
    pub fn check_symbol(&self, symbol: &Symbol) -> Result<(), RejectReason> {
        if self.allowlist.contains(symbol) {
            Ok(())
        } else {
            Err(RejectReason::SymbolNotAllowed {
                symbol: symbol.clone(),
            })
        }
    }

    /// Clamp leverage into the configured bounds.
    pub fn clamp_leverage(&self, leverage: u32) -> u32 {
        leverage.clamp(self.config.min_leverage, self.config.max_leverage)
    }

    /// Clamp the balance fraction into the configured bounds.
    pub fn clamp_fraction(&self, fraction: Decimal) -> Decimal {
        fraction.clamp(
            self.config.min_position_fraction,
            self.config.max_position_fraction,
        )
    }

    /// Hard reject when the quote deviates beyond the limit from the mark.
    pub fn check_price_deviation(
        &self,
        quote: Decimal,
        mark: Decimal,
    ) -> Result<(), RejectReason> {
        if quote <= Decimal::ZERO || mark <= Decimal::ZERO {
            return Err(RejectReason::InvalidPrice { quote, mark });
        }
        let limit = Decimal::from_f64(self.config.price_deviation_limit_pct / 100.0)
            .unwrap_or_default();
        let deviation = ((quote - mark) / mark).abs();
        if deviation > limit {
            use rust_decimal::prelude::ToPrimitive;
            return Err(RejectReason::PriceDeviation {
                quote,
                mark,
                deviation_pct: (deviation * Decimal::ONE_HUNDRED).to_f64().unwrap_or(f64::NAN),
                limit_pct: self.config.price_deviation_limit_pct,
            });
        }
        Ok(())
    }

    /// Full entry validation: allow-list, price deviation, clamps.
    pub fn validate_entry(
        &self,
        symbol: &Symbol,
        leverage: u32,
        fraction: Decimal,
        quote: Decimal,
        mark: Decimal,
    ) -> Result<ValidatedEntry, RejectReason> {
        self.check_symbol(symbol)?;
        self.check_price_deviation(quote, mark)?;
        Ok(ValidatedEntry {
            leverage: self.clamp_leverage(leverage),
            fraction: self.clamp_fraction(fraction),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn checker() -> PreTradeChecker {
        PreTradeChecker::new(
            RiskConfig::default(),
            vec![Symbol::new("BTCUSDT"), Symbol::new("ETHUSDT")],
        )
    }

    #[test]
    fn test_allowlist_membership() {
        let c = checker();
        assert!(c.check_symbol(&Symbol::new("BTCUSDT")).is_ok());
        let err = c.check_symbol(&Symbol::new("DOGEUSDT")).unwrap_err();
        assert_eq!(err.code(), "SYMBOL_NOT_ALLOWED");
    }

    #[test]
    fn test_leverage_clamped_not_rejected() {
        let c = checker();
        assert_eq!(c.clamp_leverage(1), 2);
        assert_eq!(c.clamp_leverage(50), 20);
        assert_eq!(c.clamp_leverage(5), 5);
    }

    #[test]
    fn test_fraction_clamped() {
        let c = checker();
        assert_eq!(c.clamp_fraction(dec!(0.01)), dec!(0.08));
        assert_eq!(c.clamp_fraction(dec!(2.0)), dec!(1.00));
        assert_eq!(c.clamp_fraction(dec!(0.25)), dec!(0.25));
    }

    #[test]
    fn test_price_deviation_hard_reject() {
        let c = checker();
        // 1% limit: 50_000 vs 50_400 is a 0.8% deviation, fine.
        assert!(c.check_price_deviation(dec!(50400), dec!(50000)).is_ok());
        // 50_000 vs 51_000 is 2%: rejected, not clamped.
        let err = c.check_price_deviation(dec!(51000), dec!(50000)).unwrap_err();
        assert_eq!(err.code(), "PRICE_DEVIATION");
    }

    #[test]
    fn test_invalid_prices_rejected() {
        let c = checker();
        let err = c.check_price_deviation(dec!(0), dec!(50000)).unwrap_err();
        assert_eq!(err.code(), "INVALID_PRICE");
    }

    #[test]
    fn test_validate_entry_applies_all() {
        let c = checker();
        let v = c
            .validate_entry(&Symbol::new("BTCUSDT"), 100, dec!(0.02), dec!(50100), dec!(50000))
            .unwrap();
        assert_eq!(v.leverage, 20);
        assert_eq!(v.fraction, dec!(0.08));

        assert!(c
            .validate_entry(&Symbol::new("BTCUSDT"), 5, dec!(0.2), dec!(60000), dec!(50000))
            .is_err());
    }
}
