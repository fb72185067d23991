//! Directional scoring and the score → intent mapping.
//!
//! Scores are `clip(Σ w_i · max(±factor_i, 0), 0, 1)` over the flow metrics,
//! with the weight table selected by regime. Weight tables are immutable
//! snapshots: a config reload swaps the whole `Arc`, never mutates in place.

use std::sync::Arc;

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use flow_common::PositionSide;

use crate::config::{ThresholdConfig, WeightTable, WeightsConfig};
use crate::decision::regime::{Regime, RegimeState};
use crate::decision::TradeIntent;
use crate::market::{MarketSnapshot, TimeframeAggregate};

/// Normalized directional scores for one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub long: f64,
    pub short: f64,
}

impl ScoreResult {
    /// Score for one side.
    pub fn side(&self, side: PositionSide) -> f64 {
        match side {
            PositionSide::Long => self.long,
            PositionSide::Short => self.short,
        }
    }
}

/// Entry sizing parameters the score → intent mapping needs.
#[derive(Debug, Clone)]
pub struct EntryParams {
    /// Fraction of available balance committed per fresh entry.
    pub fraction: Decimal,
    pub min_leverage: u32,
    pub max_leverage: u32,
    /// Protective distances as fractions of entry price; zero disables.
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    pub score_timeframe: flow_common::Timeframe,
}

/// Computes scores and maps them to trade intents.
#[derive(Debug, Clone)]
pub struct ScoringEngine {
    weights: Arc<WeightsConfig>,
    thresholds: ThresholdConfig,
    params: EntryParams,
}

impl ScoringEngine {
    pub fn new(weights: Arc<WeightsConfig>, thresholds: ThresholdConfig, params: EntryParams) -> Self {
        Self {
            weights,
            thresholds,
            params,
        }
    }

    /// Swap in a fresh weight-table snapshot (config reload).
    pub fn swap_weights(&mut self, weights: Arc<WeightsConfig>) {
        self.weights = weights;
    }

    /// Score a context with the regime-selected weight table.
    ///
    /// NoTrade scores with the trend table so close checks still see a
    /// meaningful opposing score.
    pub fn score(&self, regime: Regime, ctx: &TimeframeAggregate) -> ScoreResult {
        let table = match regime {
            Regime::Range => &self.weights.range,
            _ => &self.weights.trend,
        };
        score_with(table, ctx)
    }

    /// Map regime + scores + current exposure to an intent.
    ///
    /// Ordering is deliberate: an opposing-score close fires before the
    /// no-trade gate, so a regime flip can still unwind an open position.
    pub fn decide(
        &self,
        state: &RegimeState,
        snapshot: &MarketSnapshot,
        position_side: Option<PositionSide>,
    ) -> (TradeIntent, Option<ScoreResult>) {
        // Scoring context: configured timeframe, falling back to the
        // un-aggregated latest bucket; without either the symbol is skipped.
        let ctx = snapshot
            .timeframe(self.params.score_timeframe)
            .or(snapshot.latest.as_ref());
        let Some(ctx) = ctx else {
            let intent = TradeIntent::Hold {
                reason: format!(
                    "insufficient context for {} scoring",
                    self.params.score_timeframe
                ),
            };
            return (intent, None);
        };

        let mut scores = self.score(state.regime, ctx);

        if let Some(held) = position_side {
            let opposing = scores.side(held.opposite());
            if opposing >= self.thresholds.close {
                let intent = TradeIntent::Close {
                    reason: format!(
                        "{} reversal: {} score {:.3} >= close {:.3}",
                        state.regime,
                        held.opposite(),
                        opposing,
                        self.thresholds.close
                    ),
                };
                return (intent, Some(scores));
            }
            // Held position, no reversal signal: nothing to do here. DCA
            // adds are evaluated by the position lifecycle, not by scoring.
            let intent = TradeIntent::Hold {
                reason: format!("holding {held}, no reversal"),
            };
            return (intent, Some(scores));
        }

        if state.regime == Regime::NoTrade {
            let intent = TradeIntent::Hold {
                reason: format!("no-trade regime: {}", state.reason),
            };
            return (intent, Some(scores));
        }

        if state.direction_locked {
            match state.regime.trend_side() {
                Some(PositionSide::Long) => scores.short = 0.0,
                Some(PositionSide::Short) => scores.long = 0.0,
                None => {}
            }
        }

        if scores.long >= self.thresholds.long_open && scores.long > scores.short {
            let intent = self.open_intent(PositionSide::Long, scores.long, snapshot.price, state);
            return (intent, Some(scores));
        }
        if scores.short >= self.thresholds.short_open && scores.short > scores.long {
            let intent = self.open_intent(PositionSide::Short, scores.short, snapshot.price, state);
            return (intent, Some(scores));
        }

        let intent = TradeIntent::Hold {
            reason: format!(
                "{} signal below threshold: long={:.3} short={:.3}",
                state.regime, scores.long, scores.short
            ),
        };
        (intent, Some(scores))
    }

    fn open_intent(
        &self,
        side: PositionSide,
        score: f64,
        price: Decimal,
        state: &RegimeState,
    ) -> TradeIntent {
        let threshold = match side {
            PositionSide::Long => self.thresholds.long_open,
            PositionSide::Short => self.thresholds.short_open,
        };
        let leverage = pick_leverage(
            score,
            threshold,
            self.params.min_leverage,
            self.params.max_leverage,
        );
        let (take_profit, stop_loss) = protective_prices(
            price,
            side,
            self.params.take_profit_pct,
            self.params.stop_loss_pct,
        );
        TradeIntent::Open {
            side,
            fraction: self.params.fraction,
            leverage,
            take_profit,
            stop_loss,
            score,
            reason: format!("{} open {side}: score={score:.3} >= {threshold:.3}", state.regime),
        }
    }
}

fn score_with(table: &WeightTable, ctx: &TimeframeAggregate) -> ScoreResult {
    let depth = ctx.depth_ratio - 1.0;
    let long = table.cvd * ctx.cvd_ratio.max(0.0)
        + table.cvd_momentum * ctx.cvd_momentum.max(0.0)
        + table.oi_delta * ctx.oi_delta_ratio.max(0.0)
        + table.funding * (-ctx.funding_rate).max(0.0)
        + table.depth * depth.max(0.0)
        + table.imbalance * ctx.imbalance.max(0.0)
        + table.liquidity * ctx.liquidity_delta_norm.max(0.0);
    let short = table.cvd * (-ctx.cvd_ratio).max(0.0)
        + table.cvd_momentum * (-ctx.cvd_momentum).max(0.0)
        + table.oi_delta * (-ctx.oi_delta_ratio).max(0.0)
        + table.funding * ctx.funding_rate.max(0.0)
        + table.depth * (-depth).max(0.0)
        + table.imbalance * (-ctx.imbalance).max(0.0)
        + table.liquidity * (-ctx.liquidity_delta_norm).max(0.0);
    ScoreResult {
        long: long.clamp(0.0, 1.0),
        short: short.clamp(0.0, 1.0),
    }
}

/// Interpolate leverage between the bounds by score strength above the
/// open threshold.
fn pick_leverage(score: f64, threshold: f64, min: u32, max: u32) -> u32 {
    let min = min.max(1);
    let max = max.max(min);
    if max == min {
        return min;
    }
    let s = score.clamp(0.0, 1.0);
    let th = threshold.clamp(0.0, 0.99);
    let strength = ((s - th) / (1.0 - th).max(1e-6)).clamp(0.0, 1.0);
    let lev = (min as f64 + strength * (max - min) as f64).round() as u32;
    lev.clamp(min, max)
}

/// TP/SL prices around an entry. A non-positive pct disables that leg.
pub fn protective_prices(
    price: Decimal,
    side: PositionSide,
    take_profit_pct: f64,
    stop_loss_pct: f64,
) -> (Option<Decimal>, Option<Decimal>) {
    let pct = |p: f64| Decimal::from_f64(p).unwrap_or_default();
    let take_profit = (take_profit_pct > 0.0).then(|| match side {
        PositionSide::Long => price * (Decimal::ONE + pct(take_profit_pct)),
        PositionSide::Short => price * (Decimal::ONE - pct(take_profit_pct)),
    });
    let stop_loss = (stop_loss_pct > 0.0).then(|| match side {
        PositionSide::Long => price * (Decimal::ONE - pct(stop_loss_pct)),
        PositionSide::Short => price * (Decimal::ONE + pct(stop_loss_pct)),
    });
    (take_profit, stop_loss)
}
