//! Market regime classification.
//!
//! Pure function of the current ADX / ATR% / EMA pair, plus the previous
//! classification which is consulted only for hysteresis in "soft" direction
//! lock mode.
//!
//! | Condition | Regime |
//! |------------------------------------------|-----------|
//! | indicators missing or non-positive | NoTrade |
//! | ATR% outside [atr_pct_min, atr_pct_max] | NoTrade |
//! | ADX >= adx_trend_on | TrendLong / TrendShort |
//! | ADX <= adx_range_on | Range |
//! | between the two thresholds (dead zone) | NoTrade |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use flow_common::{PositionSide, Symbol};

use crate::config::{DirectionLockMode, RegimeConfig};
use crate::market::TrendFilter;

/// Market regime classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Regime {
    TrendLong,
    TrendShort,
    Range,
    NoTrade,
}

impl Regime {
    pub fn is_trend(&self) -> bool {
        matches!(self, Regime::TrendLong | Regime::TrendShort)
    }

    /// Trend direction, when this is a trend regime.
    pub fn trend_side(&self) -> Option<PositionSide> {
        match self {
            Regime::TrendLong => Some(PositionSide::Long),
            Regime::TrendShort => Some(PositionSide::Short),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Regime::TrendLong => "TREND_LONG",
            Regime::TrendShort => "TREND_SHORT",
            Regime::Range => "RANGE",
            Regime::NoTrade => "NO_TRADE",
        }
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Cached classification for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeState {
    pub symbol: Symbol,
    pub regime: Regime,
    /// Whether scoring must suppress the counter-trend side.
    pub direction_locked: bool,
    pub adx: f64,
    pub atr_pct: f64,
    pub reason: String,
    pub computed_at: DateTime<Utc>,
}

/// Classifies market regime from trend-filter indicators.
#[derive(Debug, Clone)]
pub struct RegimeClassifier {
    config: RegimeConfig,
}

impl RegimeClassifier {
    pub fn new(config: RegimeConfig) -> Self {
        Self { config }
    }

    /// Classify one symbol.
    ///
    /// `prev` is the previous classification; it only matters in soft lock
    /// mode, where a marginally failed lock gate keeps an established trend
    /// direction instead of flapping to no-trade.
    pub fn classify(
        &self,
        symbol: &Symbol,
        filter: Option<&TrendFilter>,
        prev: Option<Regime>,
        now: DateTime<Utc>,
    ) -> RegimeState {
        let cfg = &self.config;

        let Some(f) = filter else {
            return self.state(symbol, Regime::NoTrade, false, 0.0, 0.0, "missing_regime_metrics", now);
        };
        if f.ema_fast <= 0.0 || f.ema_slow <= 0.0 || f.adx <= 0.0 || f.atr_pct <= 0.0 {
            return self.state(
                symbol,
                Regime::NoTrade,
                false,
                f.adx,
                f.atr_pct,
                "missing_regime_metrics",
                now,
            );
        }

        let atr_pct = f.atr_pct.abs();
        if atr_pct < cfg.atr_pct_min {
            let reason = format!("atr_pct_low({atr_pct:.4}<{:.4})", cfg.atr_pct_min);
            return self.state(symbol, Regime::NoTrade, false, f.adx, atr_pct, &reason, now);
        }
        if atr_pct > cfg.atr_pct_max {
            let reason = format!("atr_pct_high({atr_pct:.4}>{:.4})", cfg.atr_pct_max);
            return self.state(symbol, Regime::NoTrade, false, f.adx, atr_pct, &reason, now);
        }

        if f.adx >= cfg.adx_trend_on {
            return self.classify_trend(symbol, f, prev, atr_pct, now);
        }
        if f.adx <= cfg.adx_range_on {
            let reason = format!("adx_range({:.1})", f.adx);
            return self.state(symbol, Regime::Range, false, f.adx, atr_pct, &reason, now);
        }

        // Dead zone between range-on and trend-on.
        let reason = format!(
            "adx_dead_zone({:.1} in ({:.1},{:.1}))",
            f.adx, cfg.adx_range_on, cfg.adx_trend_on
        );
        self.state(symbol, Regime::NoTrade, false, f.adx, atr_pct, &reason, now)
    }

    fn classify_trend(
        &self,
        symbol: &Symbol,
        f: &TrendFilter,
        prev: Option<Regime>,
        atr_pct: f64,
        now: DateTime<Utc>,
    ) -> RegimeState {
        let cfg = &self.config;
        let ema_direction = if f.ema_fast >= f.ema_slow {
            Regime::TrendLong
        } else {
            Regime::TrendShort
        };

        match cfg.direction_lock_mode {
            DirectionLockMode::Hard => {
                let reason = format!("adx_trend({:.1}) lock=hard", f.adx);
                self.state(symbol, ema_direction, true, f.adx, atr_pct, &reason, now)
            }
            DirectionLockMode::Off => {
                let reason = format!("adx_trend({:.1}) lock=off", f.adx);
                self.state(symbol, ema_direction, false, f.adx, atr_pct, &reason, now)
            }
            DirectionLockMode::Soft => {
                let denom = f.ema_slow.abs().max(1e-12);
                let ema_gap_pct = (f.ema_fast - f.ema_slow).abs() / denom;
                let adx_strong = f.adx >= cfg.adx_trend_on + cfg.soft_adx_buffer;
                let ema_clear = ema_gap_pct >= cfg.soft_ema_band_pct;
                if adx_strong && ema_clear {
                    let reason = format!(
                        "adx_trend({:.1}) lock=soft gap={ema_gap_pct:.5}",
                        f.adx
                    );
                    return self.state(symbol, ema_direction, true, f.adx, atr_pct, &reason, now);
                }
                // Hysteresis: an established trend direction survives a
                // marginal soft-gate failure.
                if let Some(prev_regime) = prev.filter(|r| r.is_trend()) {
                    let reason = format!(
                        "soft_lock_hysteresis(adx={:.1} gap={ema_gap_pct:.5})",
                        f.adx
                    );
                    return self.state(symbol, prev_regime, true, f.adx, atr_pct, &reason, now);
                }
                let reason = format!(
                    "soft_lock_unmet(adx={:.1} gap={ema_gap_pct:.5})",
                    f.adx
                );
                self.state(symbol, Regime::NoTrade, false, f.adx, atr_pct, &reason, now)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn state(
        &self,
        symbol: &Symbol,
        regime: Regime,
        direction_locked: bool,
        adx: f64,
        atr_pct: f64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> RegimeState {
        RegimeState {
            symbol: symbol.clone(),
            regime,
            direction_locked,
            adx,
            atr_pct,
            reason: reason.to_string(),
            computed_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(adx: f64, atr_pct: f64, ema_fast: f64, ema_slow: f64) -> TrendFilter {
        TrendFilter {
            ema_fast,
            ema_slow,
            adx,
            atr_pct,
        }
    }

    fn classifier(mode: DirectionLockMode) -> RegimeClassifier {
        RegimeClassifier::new(RegimeConfig {
            direction_lock_mode: mode,
            ..RegimeConfig::default()
        })
    }

    fn sym() -> Symbol {
        Symbol::new("BTCUSDT")
    }

    #[test]
    fn test_missing_metrics_is_no_trade() {
        let c = classifier(DirectionLockMode::Hard);
        let state = c.classify(&sym(), None, None, Utc::now());
        assert_eq!(state.regime, Regime::NoTrade);
        assert!(state.reason.contains("missing"));

        let zeroed = filter(0.0, 0.005, 101.0, 100.0);
        let state = c.classify(&sym(), Some(&zeroed), None, Utc::now());
        assert_eq!(state.regime, Regime::NoTrade);
    }

    #[test]
    fn test_atr_band_gates() {
        let c = classifier(DirectionLockMode::Hard);
        let quiet = filter(30.0, 0.0001, 101.0, 100.0);
        assert_eq!(c.classify(&sym(), Some(&quiet), None, Utc::now()).regime, Regime::NoTrade);

        let wild = filter(30.0, 0.08, 101.0, 100.0);
        assert_eq!(c.classify(&sym(), Some(&wild), None, Utc::now()).regime, Regime::NoTrade);
    }

    #[test]
    fn test_trend_direction_from_ema_order() {
        let c = classifier(DirectionLockMode::Hard);
        let up = filter(30.0, 0.005, 101.0, 100.0);
        let state = c.classify(&sym(), Some(&up), None, Utc::now());
        assert_eq!(state.regime, Regime::TrendLong);
        assert!(state.direction_locked);

        let down = filter(30.0, 0.005, 99.0, 100.0);
        let state = c.classify(&sym(), Some(&down), None, Utc::now());
        assert_eq!(state.regime, Regime::TrendShort);
    }

    #[test]
    fn test_range_below_threshold() {
        let c = classifier(DirectionLockMode::Hard);
        let f = filter(15.0, 0.005, 101.0, 100.0);
        let state = c.classify(&sym(), Some(&f), None, Utc::now());
        assert_eq!(state.regime, Regime::Range);
        assert!(!state.direction_locked);
    }

    #[test]
    fn test_dead_zone_is_no_trade_regardless_of_ema() {
        let c = classifier(DirectionLockMode::Hard);
        // ADX 20 sits between range-on (18) and trend-on (25).
        let f = filter(20.0, 0.005, 150.0, 100.0);
        let state = c.classify(&sym(), Some(&f), None, Utc::now());
        assert_eq!(state.regime, Regime::NoTrade);
        assert!(state.reason.contains("dead_zone"));
    }

    #[test]
    fn test_soft_lock_requires_buffer_and_gap() {
        let c = classifier(DirectionLockMode::Soft);
        // ADX above trend-on but inside the soft buffer (25 + 4).
        let weak = filter(27.0, 0.005, 101.0, 100.0);
        let state = c.classify(&sym(), Some(&weak), None, Utc::now());
        assert_eq!(state.regime, Regime::NoTrade);

        // Decisive ADX and clear EMA gap.
        let strong = filter(31.0, 0.005, 101.0, 100.0);
        let state = c.classify(&sym(), Some(&strong), None, Utc::now());
        assert_eq!(state.regime, Regime::TrendLong);
        assert!(state.direction_locked);
    }

    #[test]
    fn test_soft_lock_hysteresis_keeps_prior_direction() {
        let c = classifier(DirectionLockMode::Soft);
        let weak = filter(27.0, 0.005, 101.0, 100.0);
        let state = c.classify(&sym(), Some(&weak), Some(Regime::TrendLong), Utc::now());
        assert_eq!(state.regime, Regime::TrendLong);
        assert!(state.reason.contains("hysteresis"));

        // No prior trend: falls through to no-trade.
        let state = c.classify(&sym(), Some(&weak), Some(Regime::Range), Utc::now());
        assert_eq!(state.regime, Regime::NoTrade);
    }

    #[test]
    fn test_off_mode_does_not_lock() {
        let c = classifier(DirectionLockMode::Off);
        let f = filter(30.0, 0.005, 99.0, 100.0);
        let state = c.classify(&sym(), Some(&f), None, Utc::now());
        assert_eq!(state.regime, Regime::TrendShort);
        assert!(!state.direction_locked);
    }
}
