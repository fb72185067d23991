//! Trigger gate: event deduplication and signal-pool filtering.
//!
//! Two sequential guards run before any entry proceeds (closes bypass the
//! signal pool entirely):
//!
//! 1. **Dedup**: a repeated (symbol, trigger kind) inside the configured
//!    window is suppressed, and a repeated trigger id is suppressed
//!    regardless of elapsed time (idempotent replay).
//! 2. **Signal pool**: a minimum side score, then a rule set evaluated
//!    under AND / OR / min-pass-count semantics, then an optional
//!    edge-trigger stage that passes only on false→true transitions with a
//!    cooldown against rapid re-fires.
//!
//! Every verdict carries a typed reason so the audit trail can explain why
//! an entry did or did not fire.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use flow_common::{PositionSide, Symbol};

use crate::config::{PoolLogic, PoolRule, RuleOp, TriggerConfig};
use crate::decision::ScoreResult;
use crate::market::MarketSnapshot;

/// What caused this evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    /// Heartbeat cadence: the scheduler asked for a routine evaluation.
    Scheduled,
    /// A non-zero signal strength flagged the poll as signal-driven.
    Signal,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Scheduled => "scheduled",
            TriggerKind::Signal => "signal",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Dedup bookkeeping per (symbol, trigger kind).
#[derive(Debug, Clone)]
struct TriggerRecord {
    last_fired_at: DateTime<Utc>,
    last_trigger_id: Option<String>,
    seen_count: u32,
}

/// Edge phase of a signal-pool condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgePhase {
    /// Condition just flipped false→true.
    Rising,
    /// Condition just flipped true→false.
    Falling,
    /// Condition unchanged since the last evaluation.
    Steady,
}

#[derive(Debug, Clone)]
struct EdgeState {
    active: bool,
    last_changed_at: DateTime<Utc>,
    last_passed_at: Option<DateTime<Utc>>,
}

/// Why the gate passed or refused an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GateReason {
    Passed,
    PoolDisabled,
    ScheduledBypass,
    /// Score gate only: no rules were applicable to this side.
    ScoreGateOnly,
    ScoreGate {
        score: f64,
        required: f64,
    },
    RuleFail {
        passed: usize,
        required: usize,
        total: usize,
    },
    /// Condition true but no fresh false→true transition.
    EdgeSuppressed,
    /// A rising edge landed inside the cooldown window.
    CooldownActive {
        remaining_secs: i64,
    },
}

impl GateReason {
    /// Short code for logs.
    pub fn code(&self) -> &'static str {
        match self {
            GateReason::Passed => "PASS",
            GateReason::PoolDisabled => "POOL_OFF",
            GateReason::ScheduledBypass => "SCHED_BYPASS",
            GateReason::ScoreGateOnly => "SCORE_ONLY",
            GateReason::ScoreGate { .. } => "SCORE_GATE",
            GateReason::RuleFail { .. } => "RULE_FAIL",
            GateReason::EdgeSuppressed => "EDGE_SUPPRESSED",
            GateReason::CooldownActive { .. } => "COOLDOWN",
        }
    }
}

impl fmt::Display for GateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateReason::Passed => write!(f, "passed"),
            GateReason::PoolDisabled => write!(f, "signal pool disabled"),
            GateReason::ScheduledBypass => write!(f, "scheduled trigger bypass"),
            GateReason::ScoreGateOnly => write!(f, "score gate only, no applicable rules"),
            GateReason::ScoreGate { score, required } => {
                write!(f, "score gate: {score:.3} < required {required:.3}")
            }
            GateReason::RuleFail {
                passed,
                required,
                total,
            } => write!(f, "rules: {passed}/{required} required passed (of {total})"),
            GateReason::EdgeSuppressed => write!(f, "edge suppressed: condition not newly true"),
            GateReason::CooldownActive { remaining_secs } => {
                write!(f, "edge cooldown active: {remaining_secs}s remaining")
            }
        }
    }
}

/// One evaluated rule, for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleEvaluation {
    pub name: String,
    pub metric: String,
    /// Resolved metric value; `None` when the metric was unavailable.
    pub value: Option<f64>,
    pub passed: bool,
}

/// Structured verdict from the signal pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateDecision {
    pub passed: bool,
    pub reason: GateReason,
    pub side: PositionSide,
    pub score: f64,
    pub evaluations: Vec<RuleEvaluation>,
    pub edge_phase: Option<EdgePhase>,
}

/// Deduplicates trigger events and filters entries through the signal pool.
///
/// All state is keyed explicitly (edge phases by symbol, pool and side),
/// never inferred from the absence of prior calls.
#[derive(Debug)]
pub struct TriggerGate {
    config: TriggerConfig,
    dedup: HashMap<(Symbol, TriggerKind), TriggerRecord>,
    edges: HashMap<(Symbol, String, PositionSide), EdgeState>,
}

impl TriggerGate {
    pub fn new(config: TriggerConfig) -> Self {
        Self {
            config,
            dedup: HashMap::new(),
            edges: HashMap::new(),
        }
    }

    /// Replace the pool configuration. Edge state is reset so stale
    /// conditions cannot leak into the new rule set.
    pub fn set_config(&mut self, config: TriggerConfig) {
        self.config = config;
        self.edges.clear();
    }

    /// Dedup guard: should this (symbol, kind, id) be processed at all?
    pub fn should_fire(
        &mut self,
        symbol: &Symbol,
        kind: TriggerKind,
        trigger_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> bool {
        let window = Duration::seconds(self.config.dedup_window_secs.max(1) as i64);
        let key = (symbol.clone(), kind);

        let Some(record) = self.dedup.get_mut(&key) else {
            self.dedup.insert(
                key,
                TriggerRecord {
                    last_fired_at: now,
                    last_trigger_id: trigger_id.map(str::to_string),
                    seen_count: 1,
                },
            );
            return true;
        };

        record.seen_count += 1;
        let elapsed = now - record.last_fired_at;

        // Identical trigger id: idempotent replay, never re-fires.
        if let (Some(id), Some(last)) = (trigger_id, record.last_trigger_id.as_deref()) {
            if id == last {
                record.last_fired_at = now;
                return false;
            }
        }

        if elapsed < window {
            record.last_fired_at = now;
            record.last_trigger_id = trigger_id.map(str::to_string);
            return false;
        }

        record.last_fired_at = now;
        record.last_trigger_id = trigger_id.map(str::to_string);
        true
    }

    /// Signal-pool guard for a proposed entry.
    pub fn evaluate_pool(
        &mut self,
        symbol: &Symbol,
        kind: TriggerKind,
        side: PositionSide,
        scores: &ScoreResult,
        snapshot: &MarketSnapshot,
        now: DateTime<Utc>,
    ) -> GateDecision {
        let side_score = scores.side(side);
        let verdict = |passed, reason, evaluations, edge_phase| GateDecision {
            passed,
            reason,
            side,
            score: side_score,
            evaluations,
            edge_phase,
        };

        if !self.config.pool_enabled {
            return verdict(true, GateReason::PoolDisabled, Vec::new(), None);
        }
        if kind == TriggerKind::Scheduled && self.config.scheduled_bypass {
            return verdict(true, GateReason::ScheduledBypass, Vec::new(), None);
        }

        let required = match side {
            PositionSide::Long => self.config.min_long_score,
            PositionSide::Short => self.config.min_short_score,
        };
        if side_score < required {
            return verdict(
                false,
                GateReason::ScoreGate {
                    score: side_score,
                    required,
                },
                Vec::new(),
                None,
            );
        }

        let active_rules: Vec<&PoolRule> = self
            .config
            .rules
            .iter()
            .filter(|r| r.side.is_none() || r.side == Some(side))
            .collect();
        if active_rules.is_empty() {
            return verdict(true, GateReason::ScoreGateOnly, Vec::new(), None);
        }

        let mut evaluations = Vec::with_capacity(active_rules.len());
        let mut pass_count = 0usize;
        for (idx, rule) in active_rules.iter().enumerate() {
            let value = resolve_metric(rule, scores, snapshot);
            let passed = value.is_some_and(|v| compare(v, rule));
            if passed {
                pass_count += 1;
            }
            evaluations.push(RuleEvaluation {
                name: if rule.name.is_empty() {
                    format!("rule_{}", idx + 1)
                } else {
                    rule.name.clone()
                },
                metric: rule.metric.clone(),
                value,
                passed,
            });
        }

        let total = evaluations.len();
        let required_passes = if self.config.min_pass_count > 0 {
            self.config.min_pass_count.min(total)
        } else {
            match self.config.logic {
                PoolLogic::And => total,
                PoolLogic::Or => 1,
            }
        };
        let condition_met = pass_count >= required_passes;

        if !self.config.edge_trigger_enabled {
            let reason = if condition_met {
                GateReason::Passed
            } else {
                GateReason::RuleFail {
                    passed: pass_count,
                    required: required_passes,
                    total,
                }
            };
            return verdict(condition_met, reason, evaluations, None);
        }

        let (phase, edge_reason) = self.step_edge(symbol, side, condition_met, now);
        let passed = matches!(edge_reason, GateReason::Passed);
        let reason = if !condition_met {
            GateReason::RuleFail {
                passed: pass_count,
                required: required_passes,
                total,
            }
        } else {
            edge_reason
        };
        verdict(passed, reason, evaluations, Some(phase))
    }

    /// Advance the per-(symbol, pool, side) edge machine.
    fn step_edge(
        &mut self,
        symbol: &Symbol,
        side: PositionSide,
        condition_met: bool,
        now: DateTime<Utc>,
    ) -> (EdgePhase, GateReason) {
        let cooldown = Duration::seconds(self.config.edge_cooldown_secs as i64);
        let key = (symbol.clone(), self.config.pool_id.clone(), side);

        let Some(state) = self.edges.get_mut(&key) else {
            let mut state = EdgeState {
                active: condition_met,
                last_changed_at: now,
                last_passed_at: None,
            };
            let out = if condition_met {
                state.last_passed_at = Some(now);
                (EdgePhase::Rising, GateReason::Passed)
            } else {
                (EdgePhase::Steady, GateReason::EdgeSuppressed)
            };
            self.edges.insert(key, state);
            return out;
        };

        if condition_met == state.active {
            return (EdgePhase::Steady, GateReason::EdgeSuppressed);
        }

        state.active = condition_met;
        state.last_changed_at = now;
        if !condition_met {
            return (EdgePhase::Falling, GateReason::EdgeSuppressed);
        }

        // Rising edge: honor the cooldown from the last accepted pass.
        if self.config.edge_cooldown_secs > 0 {
            if let Some(last_pass) = state.last_passed_at {
                let since = now - last_pass;
                if since < cooldown {
                    let remaining = (cooldown - since).num_seconds().max(0);
                    return (
                        EdgePhase::Rising,
                        GateReason::CooldownActive {
                            remaining_secs: remaining,
                        },
                    );
                }
            }
        }
        state.last_passed_at = Some(now);
        (EdgePhase::Rising, GateReason::Passed)
    }
}

fn resolve_metric(rule: &PoolRule, scores: &ScoreResult, snapshot: &MarketSnapshot) -> Option<f64> {
    match rule.metric.as_str() {
        "long_score" => return Some(scores.long),
        "short_score" => return Some(scores.short),
        _ => {}
    }
    let agg = match rule.timeframe {
        Some(tf) => snapshot.timeframe(tf),
        None => snapshot.latest.as_ref(),
    }?;
    agg.metric(&rule.metric)
}

fn compare(value: f64, rule: &PoolRule) -> bool {
    let th = rule.threshold;
    match rule.operator {
        RuleOp::Gt => value > th,
        RuleOp::Ge => value >= th,
        RuleOp::Lt => value < th,
        RuleOp::Le => value <= th,
        RuleOp::Eq => value == th,
        RuleOp::Ne => value != th,
        RuleOp::Between => {
            let hi = rule.threshold_max.unwrap_or(th);
            let (lo, hi) = if th <= hi { (th, hi) } else { (hi, th) };
            (lo..=hi).contains(&value)
        }
    }
}
