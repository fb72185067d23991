//! Cycle orchestration.
//!
//! One cycle refreshes the account risk guard, walks every tracked symbol
//! through the pipeline (state fetch → protection check → decision → trigger
//! gate → risk gate → execution), defers fresh entries into a candidate
//! queue, executes the queue by descending score under the concurrency cap,
//! and finishes with an orphan-order sweep.
//!
//! All mutable cross-cycle state (the risk guard, EMA baselines, edge
//! machines and the position book) is owned here and passed explicitly.
//! Per-symbol failures are absorbed at the symbol boundary: one bad symbol
//! never aborts the cycle.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use flow_common::{PositionSide, Symbol};

use crate::audit::{DecisionAudit, DecisionRecord, ExecutionRecord};
use crate::config::BotConfig;
use crate::decision::scoring::EntryParams;
use crate::decision::{
    scoring::protective_prices, RegimeClassifier, RegimeState, ScoreResult, ScoringEngine,
    TradeIntent,
};
use crate::error::PipelineError;
use crate::execution::{ExecStatus, ExecutionReport, ExecutionRouter, ProtectionStatus};
use crate::market::{MarketContextAggregator, MarketSnapshot};
use crate::position::{Coverage, LifecycleState, PositionBook};
use crate::risk::{PreTradeChecker, RiskGuard};
use crate::trigger::{TriggerGate, TriggerKind};
use crate::venue::{AccountProvider, ExecutionVenue, MarketDataProvider, OpenOrder};

/// Structured outcome for one symbol in one cycle.
#[derive(Debug, Clone, Serialize)]
pub enum SymbolOutcome {
    Held { reason: String },
    DataUnavailable,
    CircuitBlocked { reason: String },
    GateBlocked { code: String },
    Rejected { reason: String },
    OpenQueued { side: PositionSide, score: f64 },
    Opened { status: ExecStatus },
    Added { status: ExecStatus },
    Closed { status: ExecStatus },
    Flattened { status: ExecStatus },
    ProtectionRepaired,
    BudgetSkipped,
    Error { detail: String },
}

impl SymbolOutcome {
    pub fn tag(&self) -> &'static str {
        match self {
            SymbolOutcome::Held { .. } => "held",
            SymbolOutcome::DataUnavailable => "data_unavailable",
            SymbolOutcome::CircuitBlocked { .. } => "circuit_blocked",
            SymbolOutcome::GateBlocked { .. } => "gate_blocked",
            SymbolOutcome::Rejected { .. } => "rejected",
            SymbolOutcome::OpenQueued { .. } => "open_queued",
            SymbolOutcome::Opened { .. } => "opened",
            SymbolOutcome::Added { .. } => "added",
            SymbolOutcome::Closed { .. } => "closed",
            SymbolOutcome::Flattened { .. } => "flattened",
            SymbolOutcome::ProtectionRepaired => "protection_repaired",
            SymbolOutcome::BudgetSkipped => "budget_skipped",
            SymbolOutcome::Error { .. } => "error",
        }
    }
}

/// A deferred entry waiting for the ranking pass.
#[derive(Debug, Clone)]
struct EntryCandidate {
    symbol: Symbol,
    side: PositionSide,
    fraction: Decimal,
    leverage: u32,
    take_profit: Option<Decimal>,
    stop_loss: Option<Decimal>,
    score: f64,
    mark: Decimal,
}

/// Summary of one full cycle.
#[derive(Debug, Default, Serialize)]
pub struct CycleReport {
    pub outcomes: Vec<(Symbol, SymbolOutcome)>,
    pub candidates_queued: usize,
    pub candidates_executed: usize,
    pub orphans_swept: usize,
    pub budget_exceeded: bool,
    pub account_error: Option<String>,
}

impl CycleReport {
    /// The outcome recorded for a symbol, if any.
    pub fn outcome_for(&self, symbol: &Symbol) -> Option<&SymbolOutcome> {
        self.outcomes
            .iter()
            .find(|(s, _)| s == symbol)
            .map(|(_, o)| o)
    }
}

/// Sequences the pipeline across all tracked symbols, once per cycle.
pub struct CycleOrchestrator<M, A, V> {
    config: BotConfig,
    symbols: Vec<Symbol>,
    market_data: Arc<M>,
    account: Arc<A>,
    venue: Arc<V>,
    router: ExecutionRouter<V, A>,
    aggregator: MarketContextAggregator,
    classifier: RegimeClassifier,
    scoring: ScoringEngine,
    gate: TriggerGate,
    checker: PreTradeChecker,
    guard: RiskGuard,
    book: PositionBook,
    audit: Arc<dyn DecisionAudit>,
    regimes: HashMap<Symbol, RegimeState>,
    cycle_index: u64,
}

impl<M, A, V> CycleOrchestrator<M, A, V>
where
    M: MarketDataProvider,
    A: AccountProvider,
    V: ExecutionVenue,
{
    pub fn new(
        config: BotConfig,
        market_data: Arc<M>,
        account: Arc<A>,
        venue: Arc<V>,
        audit: Arc<dyn DecisionAudit>,
        now: DateTime<Utc>,
    ) -> Self {
        let symbols: Vec<Symbol> = config.symbols.iter().map(Symbol::new).collect();
        let router = ExecutionRouter::new(
            venue.clone(),
            account.clone(),
            config.execution.clone(),
            config.protection.clone(),
        );
        let scoring = ScoringEngine::new(
            Arc::new(config.weights),
            config.thresholds,
            EntryParams {
                fraction: config.cycle.position_fraction,
                min_leverage: config.risk.min_leverage,
                max_leverage: config.risk.max_leverage,
                take_profit_pct: config.protection.take_profit_pct,
                stop_loss_pct: config.protection.stop_loss_pct,
                score_timeframe: config.regime.score_timeframe,
            },
        );
        Self {
            aggregator: MarketContextAggregator::new(config.market.clone()),
            classifier: RegimeClassifier::new(config.regime.clone()),
            scoring,
            gate: TriggerGate::new(config.trigger.clone()),
            checker: PreTradeChecker::new(config.risk.clone(), symbols.iter().cloned()),
            guard: RiskGuard::new(config.risk.clone(), now, Decimal::ZERO),
            book: PositionBook::new(),
            audit,
            regimes: HashMap::new(),
            cycle_index: 0,
            router,
            symbols,
            market_data,
            account,
            venue,
            config,
        }
    }

    /// Read access to the position book, mainly for embedding processes and
    /// tests.
    pub fn book(&self) -> &PositionBook {
        &self.book
    }

    pub fn guard(&self) -> &RiskGuard {
        &self.guard
    }

    /// Swap in a fresh weight-table snapshot (configuration reload). The
    /// old tables are never mutated in place.
    pub fn swap_weights(&mut self, weights: crate::config::WeightsConfig) {
        self.scoring.swap_weights(Arc::new(weights));
    }

    /// Replace the trigger/pool configuration; edge state resets so stale
    /// conditions cannot leak into the new rule set.
    pub fn swap_trigger_config(&mut self, trigger: crate::config::TriggerConfig) {
        self.gate.set_config(trigger);
    }

    /// Run one full cycle at `now`.
    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> CycleReport {
        self.cycle_index += 1;
        let started = std::time::Instant::now();
        let mut report = CycleReport::default();

        // Account risk state is refreshed once and fixed for the cycle.
        let account = match self.account.account().await {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "account refresh failed, skipping cycle");
                report.account_error = Some(e.to_string());
                return report;
            }
        };
        self.guard.refresh(account.equity, now);
        let circuit = self.guard.entries_blocked(now);

        let mut candidates: Vec<EntryCandidate> = Vec::new();
        let budget = std::time::Duration::from_secs(self.config.cycle.soft_budget_secs);

        let symbols = self.symbols.clone();
        for symbol in &symbols {
            if started.elapsed() > budget {
                warn!(%symbol, "cycle budget exceeded, skipping remaining symbols");
                report.budget_exceeded = true;
                report
                    .outcomes
                    .push((symbol.clone(), SymbolOutcome::BudgetSkipped));
                continue;
            }
            let outcome = match self
                .process_symbol(symbol, now, circuit.as_ref(), &mut candidates)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(%symbol, error = %e, "symbol processing failed");
                    SymbolOutcome::Error {
                        detail: e.to_string(),
                    }
                }
            };
            report.outcomes.push((symbol.clone(), outcome));
        }

        // Deferred entries: strongest signals first, bounded by free slots.
        report.candidates_queued = candidates.len();
        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let capacity = self
            .config
            .cycle
            .max_active_symbols
            .saturating_sub(self.book.committed_count());
        for candidate in candidates.into_iter().take(capacity) {
            let outcome = self.execute_candidate(&candidate, now).await;
            report.candidates_executed += 1;
            // Replace the queued marker with the execution outcome.
            if let Some(slot) = report
                .outcomes
                .iter_mut()
                .find(|(s, _)| s == &candidate.symbol)
            {
                slot.1 = outcome;
            }
        }

        report.orphans_swept = self.sweep_orphans().await;
        info!(
            cycle = self.cycle_index,
            outcomes = report.outcomes.len(),
            executed = report.candidates_executed,
            swept = report.orphans_swept,
            "cycle complete"
        );
        report
    }

    // ------------------------------------------------------------------
    // Per-symbol pipeline
    // ------------------------------------------------------------------

    async fn process_symbol(
        &mut self,
        symbol: &Symbol,
        now: DateTime<Utc>,
        circuit: Option<&crate::risk::CircuitOpen>,
        candidates: &mut Vec<EntryCandidate>,
    ) -> Result<SymbolOutcome, PipelineError> {
        // 1. Market sample; no sample means the symbol sits out this cycle.
        let Some(sample) = self.market_data.poll(symbol).await else {
            debug!(%symbol, "no market sample this cycle");
            return Ok(SymbolOutcome::DataUnavailable);
        };
        self.aggregator.ingest(&sample);
        let snapshot = self
            .aggregator
            .snapshot(symbol, now)
            .ok_or_else(|| PipelineError::DataUnavailable("no snapshot after ingest".into()))?;
        let trigger_kind = if snapshot.signal_strength > 0.0 {
            TriggerKind::Signal
        } else {
            TriggerKind::Scheduled
        };

        // 2. Authoritative state fetch and protection coverage check.
        let venue_position = self
            .account
            .position(symbol)
            .await
            .map_err(|e| PipelineError::Venue(e.to_string()))?;
        let open_orders = self
            .account
            .open_orders(symbol)
            .await
            .map_err(|e| PipelineError::Venue(e.to_string()))?;
        let coverage =
            self.book
                .sync_with_venue(symbol, venue_position.as_ref(), &open_orders, now);

        if let Coverage::Unprotected { ref missing } = coverage {
            if let Some(outcome) = self
                .handle_unprotected(symbol, &snapshot, missing.clone(), now)
                .await?
            {
                return Ok(outcome);
            }
        }

        // 3. Regime (cached between recomputations) and scoring.
        let state = self.classify_cached(symbol, &snapshot, now);
        let held_side = self
            .book
            .get(symbol)
            .filter(|p| p.state.is_open())
            .map(|p| p.side);
        let (mut intent, scores) = self.scoring.decide(&state, &snapshot, held_side);

        // 4. DCA ladder: only meaningful while protected and holding.
        if matches!(intent, TradeIntent::Hold { .. }) {
            if let Some(trigger) = self.book.dca_trigger(symbol, snapshot.price, &self.config.dca)
            {
                let quantity = self.book.dca_quantity(symbol, &trigger);
                intent = TradeIntent::Add {
                    stage: trigger.stage,
                    quantity,
                    reason: format!(
                        "dca stage {} at drawdown >= {:.4}",
                        trigger.stage, trigger.threshold
                    ),
                };
            }
        }

        self.audit_decision(symbol, &state, &intent, scores, trigger_kind, None, now);

        match intent {
            TradeIntent::Hold { reason } => Ok(SymbolOutcome::Held { reason }),
            TradeIntent::Close { .. } => Ok(self.execute_close(symbol, &snapshot, now).await),
            TradeIntent::SetProtection { .. } => {
                // Scoring never emits this; repairs run in
                // handle_unprotected. Reject rather than guess.
                Err(PipelineError::StateInvariantViolation(
                    "unexpected set-protection intent from scoring".into(),
                ))
            }
            TradeIntent::Open {
                side,
                fraction,
                leverage,
                take_profit,
                stop_loss,
                score,
                ..
            } => {
                if let Some(open) = circuit {
                    return Ok(SymbolOutcome::CircuitBlocked {
                        reason: open.to_string(),
                    });
                }
                if !self.gate.should_fire(symbol, trigger_kind, None, now) {
                    return Ok(SymbolOutcome::GateBlocked {
                        code: "DEDUP".into(),
                    });
                }
                let scores = scores.unwrap_or(ScoreResult {
                    long: 0.0,
                    short: 0.0,
                });
                let gate = self
                    .gate
                    .evaluate_pool(symbol, trigger_kind, side, &scores, &snapshot, now);
                if !gate.passed {
                    debug!(%symbol, gate = %gate.reason, "entry blocked by signal pool");
                    return Ok(SymbolOutcome::GateBlocked {
                        code: gate.reason.code().into(),
                    });
                }
                let quote = entry_quote(snapshot.price, side, self.config.execution.entry_slippage_pct);
                let validated = match self.checker.validate_entry(
                    symbol,
                    leverage,
                    fraction,
                    quote,
                    snapshot.price,
                ) {
                    Ok(v) => v,
                    Err(reject) => {
                        return Ok(SymbolOutcome::Rejected {
                            reason: reject.to_string(),
                        })
                    }
                };
                // Fresh entries are queued, not executed, so slot scarcity
                // favors the strongest signal instead of iteration order.
                candidates.push(EntryCandidate {
                    symbol: symbol.clone(),
                    side,
                    fraction: validated.fraction,
                    leverage: validated.leverage,
                    take_profit,
                    stop_loss,
                    score,
                    mark: snapshot.price,
                });
                Ok(SymbolOutcome::OpenQueued { side, score })
            }
            TradeIntent::Add {
                quantity, reason, ..
            } => {
                if let Some(open) = circuit {
                    return Ok(SymbolOutcome::CircuitBlocked {
                        reason: open.to_string(),
                    });
                }
                if !self.gate.should_fire(symbol, trigger_kind, None, now) {
                    return Ok(SymbolOutcome::GateBlocked {
                        code: "DEDUP".into(),
                    });
                }
                let side = held_side.ok_or_else(|| {
                    PipelineError::StateInvariantViolation("add intent with no position".into())
                })?;
                let scores = scores.unwrap_or(ScoreResult {
                    long: 0.0,
                    short: 0.0,
                });
                let gate = self
                    .gate
                    .evaluate_pool(symbol, trigger_kind, side, &scores, &snapshot, now);
                if !gate.passed {
                    return Ok(SymbolOutcome::GateBlocked {
                        code: gate.reason.code().into(),
                    });
                }
                debug!(%symbol, %quantity, %reason, "executing DCA add");
                Ok(self
                    .execute_add(symbol, side, quantity, &snapshot, now)
                    .await)
            }
        }
    }

    /// Unprotected-position handling: SLA enforcement first, then an
    /// immediate repair attempt. Returns an outcome when the symbol is done
    /// for this cycle.
    async fn handle_unprotected(
        &mut self,
        symbol: &Symbol,
        snapshot: &MarketSnapshot,
        missing: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<SymbolOutcome>, PipelineError> {
        let Some(position) = self.book.get(symbol).cloned() else {
            return Ok(None);
        };

        // SLA expiry makes the flatten mandatory, configuration
        // notwithstanding.
        if self.book.sla_expired(symbol, &self.config.protection, now) {
            if self
                .book
                .should_alert_unprotected(symbol, &self.config.protection, now)
            {
                warn!(%symbol, ?missing, "protective SLA expired, forcing flatten");
            }
            let flatten = self.router.force_flatten(symbol).await;
            self.audit.record_execution(&ExecutionRecord::from_report(
                symbol,
                "FORCE_FLATTEN",
                &flatten,
                now,
            ));
            let closed = flatten.is_terminal_success();
            self.book.finish_closing(
                symbol,
                closed,
                LifecycleState::OpenUnprotected,
            );
            if closed && flatten.filled_quantity > Decimal::ZERO {
                if let Some(price) = flatten.avg_fill_price {
                    let pnl = position.realized_pnl(flatten.filled_quantity, price);
                    self.guard.record_close(pnl);
                }
            }
            return Ok(Some(SymbolOutcome::Flattened {
                status: flatten.status,
            }));
        }

        // Immediate repair: re-place both legs sized to the live quantity.
        let (take_profit, stop_loss) = protective_prices(
            position.entry_price,
            position.side,
            self.config.protection.take_profit_pct,
            self.config.protection.stop_loss_pct,
        );
        let intent = TradeIntent::SetProtection {
            take_profit,
            stop_loss,
            reason: format!("repair missing {}", missing.join("+")),
        };
        let state = self.classify_cached(symbol, snapshot, now);
        self.audit_decision(symbol, &state, &intent, None, TriggerKind::Scheduled, None, now);

        if let Err(e) = self.router.cancel_protective_orders(symbol).await {
            warn!(%symbol, error = %e, "failed clearing residual protective legs");
        }
        let repair = self
            .router
            .place_protection_checked(
                symbol,
                position.side,
                position.quantity,
                take_profit,
                stop_loss,
            )
            .await;

        match repair {
            Ok((ack, missing_after)) if missing_after.is_empty() => {
                self.book
                    .apply_protection(symbol, ack.tp_order_id, ack.sl_order_id)?;
                info!(%symbol, "protection repaired");
                Ok(Some(SymbolOutcome::ProtectionRepaired))
            }
            outcome => {
                let detail = match outcome {
                    Ok((_, missing_after)) => missing_after.join(", "),
                    Err(e) => e.to_string(),
                };
                if self
                    .book
                    .should_alert_unprotected(symbol, &self.config.protection, now)
                {
                    warn!(%symbol, %detail, "protection repair failed, position at risk");
                }
                if self.config.protection.close_on_repair_fail {
                    return Ok(Some(self.execute_close(symbol, snapshot, now).await));
                }
                // Stay unprotected; the SLA clock keeps running and the
                // next cycle re-checks.
                Ok(None)
            }
        }
    }

    async fn execute_close(
        &mut self,
        symbol: &Symbol,
        snapshot: &MarketSnapshot,
        now: DateTime<Utc>,
    ) -> SymbolOutcome {
        let position = self.book.get(symbol).cloned();
        let prior = self
            .book
            .begin_closing(symbol)
            .unwrap_or(LifecycleState::Flat);
        let report = self.router.execute_close(symbol, snapshot.price).await;
        self.audit
            .record_execution(&ExecutionRecord::from_report(symbol, "CLOSE", &report, now));

        let closed = report.is_terminal_success();
        self.book.finish_closing(symbol, closed, prior);
        if let (Some(position), Some(price)) = (position, report.avg_fill_price) {
            if report.filled_quantity > Decimal::ZERO {
                let pnl = position.realized_pnl(report.filled_quantity, price);
                self.guard.record_close(pnl);
            }
        }
        SymbolOutcome::Closed {
            status: report.status,
        }
    }

    async fn execute_add(
        &mut self,
        symbol: &Symbol,
        side: PositionSide,
        quantity: Decimal,
        snapshot: &MarketSnapshot,
        now: DateTime<Utc>,
    ) -> SymbolOutcome {
        let position = self.book.get(symbol).cloned();
        let (take_profit, stop_loss) = position
            .map(|p| {
                protective_prices(
                    p.entry_price,
                    p.side,
                    self.config.protection.take_profit_pct,
                    self.config.protection.stop_loss_pct,
                )
            })
            .unwrap_or((None, None));
        let report = self
            .router
            .execute_add(symbol, side, quantity, take_profit, stop_loss, snapshot.price)
            .await;
        self.audit
            .record_execution(&ExecutionRecord::from_report(symbol, "ADD", &report, now));

        if report.filled_quantity > Decimal::ZERO {
            let (tp_id, sl_id) = match &report.protection {
                ProtectionStatus::Complete {
                    tp_order_id,
                    sl_order_id,
                } => (tp_order_id.clone(), sl_order_id.clone()),
                _ => (None, None),
            };
            if let Err(e) = self.book.apply_add_fill(
                symbol,
                report.filled_quantity,
                report.avg_fill_price.unwrap_or(snapshot.price),
                tp_id,
                sl_id,
                now,
            ) {
                warn!(%symbol, error = %e, "add fill could not be applied to book");
            }
        }
        SymbolOutcome::Added {
            status: report.status,
        }
    }

    async fn execute_candidate(
        &mut self,
        candidate: &EntryCandidate,
        now: DateTime<Utc>,
    ) -> SymbolOutcome {
        let report = self
            .router
            .execute_open(
                &candidate.symbol,
                candidate.side,
                candidate.fraction,
                candidate.leverage,
                candidate.take_profit,
                candidate.stop_loss,
                candidate.mark,
            )
            .await;
        self.audit.record_execution(&ExecutionRecord::from_report(
            &candidate.symbol,
            "OPEN",
            &report,
            now,
        ));
        self.apply_open_report(candidate, &report, now);
        SymbolOutcome::Opened {
            status: report.status,
        }
    }

    fn apply_open_report(
        &mut self,
        candidate: &EntryCandidate,
        report: &ExecutionReport,
        now: DateTime<Utc>,
    ) {
        match report.status {
            ExecStatus::Success | ExecStatus::Partial => {
                let (tp_id, sl_id) = match &report.protection {
                    ProtectionStatus::Complete {
                        tp_order_id,
                        sl_order_id,
                    } => (tp_order_id.clone(), sl_order_id.clone()),
                    _ => (None, None),
                };
                let price = report.avg_fill_price.unwrap_or(candidate.mark);
                if let Err(e) = self.book.apply_open_fill(
                    &candidate.symbol,
                    candidate.side,
                    report.filled_quantity,
                    price,
                    tp_id,
                    sl_id,
                    now,
                ) {
                    warn!(symbol = %candidate.symbol, error = %e, "open fill rejected by book");
                }
            }
            ExecStatus::Pending => {
                self.book
                    .mark_opening(&candidate.symbol, candidate.side, now);
            }
            ExecStatus::Error => {
                // A rolled-back protection failure leaves the venue flat; a
                // standing-risk failure is adopted by the next cycle's sync.
                if matches!(
                    &report.error,
                    Some(PipelineError::ProtectionIncomplete {
                        rolled_back: false,
                        ..
                    })
                ) {
                    let _ = self.book.apply_open_fill(
                        &candidate.symbol,
                        candidate.side,
                        report.filled_quantity,
                        report.avg_fill_price.unwrap_or(candidate.mark),
                        None,
                        None,
                        now,
                    );
                }
            }
            ExecStatus::Noop => {}
        }
    }

    // ------------------------------------------------------------------
    // End-of-cycle sweep
    // ------------------------------------------------------------------

    /// Cancel resting orders for symbols with neither a position nor a
    /// pending entry order. A flat symbol must end the cycle with zero
    /// protective orders.
    async fn sweep_orphans(&mut self) -> usize {
        let mut swept = 0;
        let symbols = self.symbols.clone();
        for symbol in &symbols {
            let position = match self.account.position(symbol).await {
                Ok(p) => p,
                Err(e) => {
                    debug!(%symbol, error = %e, "orphan sweep skipped symbol");
                    continue;
                }
            };
            if position.is_some_and(|p| p.quantity > Decimal::ZERO) {
                continue;
            }
            let orders = match self.account.open_orders(symbol).await {
                Ok(o) => o,
                Err(_) => continue,
            };
            if orders.is_empty() {
                // Nothing resting; clear any stale opening marker.
                self.book.clear_if_opening(symbol);
                continue;
            }
            if has_pending_entry(&orders) {
                continue;
            }
            if self.venue.cancel_all(symbol).await.is_ok() {
                info!(%symbol, count = orders.len(), "cancelled orphan orders");
                self.book.clear_if_opening(symbol);
                swept += 1;
            }
        }
        swept
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// Regime with recompute cadence: between recomputations the cached
    /// classification stands.
    fn classify_cached(
        &mut self,
        symbol: &Symbol,
        snapshot: &MarketSnapshot,
        now: DateTime<Utc>,
    ) -> RegimeState {
        let cadence = self.config.cycle.regime_cadence_cycles.max(1) as u64;
        if let Some(cached) = self.regimes.get(symbol) {
            if self.cycle_index % cadence != 0 {
                return cached.clone();
            }
        }
        let prev = self.regimes.get(symbol).map(|s| s.regime);
        let state =
            self.classifier
                .classify(symbol, snapshot.trend_filter.as_ref(), prev, now);
        self.regimes.insert(symbol.clone(), state.clone());
        state
    }

    #[allow(clippy::too_many_arguments)]
    fn audit_decision(
        &self,
        symbol: &Symbol,
        state: &RegimeState,
        intent: &TradeIntent,
        scores: Option<ScoreResult>,
        trigger_kind: TriggerKind,
        gate: Option<&str>,
        now: DateTime<Utc>,
    ) {
        self.audit.record_decision(&DecisionRecord {
            timestamp: now,
            symbol: symbol.clone(),
            trigger_kind: trigger_kind.as_str().to_string(),
            regime: state.regime.as_str().to_string(),
            regime_reason: state.reason.clone(),
            long_score: scores.map(|s| s.long),
            short_score: scores.map(|s| s.short),
            action: intent.action().to_string(),
            reason: intent.reason().to_string(),
            gate: gate.map(str::to_string),
        });
    }
}

/// A non-reduce-only, non-protective resting order is a pending entry.
fn has_pending_entry(orders: &[OpenOrder]) -> bool {
    orders
        .iter()
        .any(|o| !o.reduce_only && o.protective.is_none())
}

fn entry_quote(mark: Decimal, side: PositionSide, slippage_pct: f64) -> Decimal {
    use rust_decimal::prelude::FromPrimitive;
    let slip = Decimal::from_f64(slippage_pct / 100.0).unwrap_or_default();
    match side {
        PositionSide::Long => mark * (Decimal::ONE + slip),
        PositionSide::Short => mark * (Decimal::ONE - slip),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    use crate::venue::ProtectiveKind;

    #[test]
    fn test_has_pending_entry_ignores_protective_legs() {
        let protective = OpenOrder {
            order_id: "1".into(),
            symbol: Symbol::new("BTCUSDT"),
            side: flow_common::Side::Sell,
            quantity: dec!(1),
            price: Some(dec!(110)),
            reduce_only: true,
            protective: Some(ProtectiveKind::TakeProfit),
            created_at: Utc::now(),
        };
        assert!(!has_pending_entry(&[protective.clone()]));

        let entry = OpenOrder {
            order_id: "2".into(),
            reduce_only: false,
            protective: None,
            side: flow_common::Side::Buy,
            ..protective
        };
        assert!(has_pending_entry(&[entry]));
    }

    #[test]
    fn test_entry_quote_direction() {
        let quote = entry_quote(dec!(100), PositionSide::Long, 1.0);
        assert_eq!(quote, dec!(101.00));
        let quote = entry_quote(dec!(100), PositionSide::Short, 1.0);
        assert_eq!(quote, dec!(99.00));
    }
}
