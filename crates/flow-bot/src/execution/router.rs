//! The execution router: open, add, close and force-flatten paths.
//!
//! Every path drives a bounded degrade chain against the venue and returns a
//! uniform [`ExecutionReport`]. Retries are synchronous and bounded within
//! one call; when a chain exhausts, the error is terminal for this cycle and
//! re-evaluation happens naturally on the next one.
//!
//! Closeable quantity always comes from the venue's authoritative position,
//! never a cached snapshot.

use std::sync::Arc;

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use flow_common::{PositionSide, Side, Symbol};

use crate::config::{ExecutionConfig, LegConfig, ProtectionConfig};
use crate::error::PipelineError;
use crate::venue::{
    AccountProvider, ExecutionVenue, OrderAck, OrderForm, OrderRejectReason, ProtectionAck,
    SymbolMeta, VenueError,
};

use super::{
    build_chain, AttemptRecord, AttemptStrategy, ExecStatus, ExecutionReport, ProtectionStatus,
};

/// Outcome of interpreting one degrade chain.
#[derive(Debug)]
struct ChainOutcome {
    filled: Decimal,
    fill_notional: Decimal,
    resting_order_id: Option<String>,
    attempts: Vec<AttemptRecord>,
    last_reject: Option<OrderRejectReason>,
    venue_error: Option<VenueError>,
}

impl ChainOutcome {
    fn avg_price(&self) -> Option<Decimal> {
        if self.filled > Decimal::ZERO {
            Some(self.fill_notional / self.filled)
        } else {
            None
        }
    }
}

/// Places and manages orders through bounded retry/fallback chains.
pub struct ExecutionRouter<V, A> {
    venue: Arc<V>,
    account: Arc<A>,
    config: ExecutionConfig,
    protection: ProtectionConfig,
}

impl<V: ExecutionVenue, A: AccountProvider> ExecutionRouter<V, A> {
    pub fn new(
        venue: Arc<V>,
        account: Arc<A>,
        config: ExecutionConfig,
        protection: ProtectionConfig,
    ) -> Self {
        Self {
            venue,
            account,
            config,
            protection,
        }
    }

    // ------------------------------------------------------------------
    // Open path
    // ------------------------------------------------------------------

    /// Open a fresh position.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute_open(
        &self,
        symbol: &Symbol,
        side: PositionSide,
        fraction: Decimal,
        leverage: u32,
        take_profit: Option<Decimal>,
        stop_loss: Option<Decimal>,
        mark: Decimal,
    ) -> ExecutionReport {
        // 1. Leverage sync; fail closed under strict sync.
        let leverage = match self.venue.set_leverage(symbol, leverage).await {
            Ok(applied) => applied,
            Err(e) if self.config.strict_leverage_sync => {
                return ExecutionReport::failed(PipelineError::ValidationRejected(format!(
                    "leverage sync failed: {e}"
                )));
            }
            Err(e) => {
                warn!(%symbol, error = %e, "leverage sync failed, proceeding non-strict");
                leverage
            }
        };

        // 2. Size the order from target notional.
        let account = match self.account.account().await {
            Ok(a) => a,
            Err(e) => return ExecutionReport::failed(PipelineError::Venue(e.to_string())),
        };
        if account.available_margin <= Decimal::ZERO {
            return ExecutionReport::failed(PipelineError::ValidationRejected(
                "no available margin".into(),
            ));
        }
        let meta = match self.venue.symbol_meta(symbol).await {
            Ok(m) => m,
            Err(e) => return ExecutionReport::failed(PipelineError::Venue(e.to_string())),
        };

        let entry_price = aggressive_price(mark, side.entry_side(), self.config.entry_slippage_pct);
        let quantity = match size_entry(
            account.available_margin,
            fraction,
            leverage,
            entry_price,
            &meta,
        ) {
            Ok(q) => q,
            Err(reason) => {
                return ExecutionReport::failed(PipelineError::ValidationRejected(reason));
            }
        };

        // 3-7. Degrade chain; stops on the first fill.
        let chain = build_chain(&self.config.open);
        let outcome = self
            .run_chain(
                &chain,
                &self.config.open,
                symbol,
                side.entry_side(),
                side,
                quantity,
                entry_price,
                entry_price,
                false,
                true,
            )
            .await;

        if let Some(e) = &outcome.venue_error {
            let mut report = ExecutionReport::failed(PipelineError::Venue(e.to_string()));
            report.attempts = outcome.attempts;
            return report;
        }

        if outcome.filled > Decimal::ZERO {
            // 8. Protection sized to the fill.
            return self
                .finish_open_with_protection(symbol, side, quantity, outcome, take_profit, stop_loss)
                .await;
        }

        if let Some(order_id) = &outcome.resting_order_id {
            debug!(%symbol, order_id, "entry resting on the book");
            return ExecutionReport {
                status: ExecStatus::Pending,
                filled_quantity: Decimal::ZERO,
                avg_fill_price: None,
                protection: ProtectionStatus::Deferred,
                attempts: outcome.attempts,
                error: None,
                cancel_all_issued: false,
                note: None,
            };
        }

        // A hard venue rejection is a validation failure, not liquidity.
        if let Some(reason) = outcome
            .last_reject
            .as_ref()
            .filter(|r| !r.is_no_liquidity())
        {
            let mut report = ExecutionReport::failed(PipelineError::ValidationRejected(format!(
                "venue rejected entry: {reason:?}"
            )));
            report.attempts = outcome.attempts;
            return report;
        }

        let attempts = outcome.attempts.len() as u32;
        ExecutionReport {
            status: ExecStatus::Error,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
            protection: ProtectionStatus::NotRequired,
            attempts: outcome.attempts,
            error: Some(PipelineError::LiquidityInsufficient { attempts }),
            cancel_all_issued: false,
            note: None,
        }
    }

    async fn finish_open_with_protection(
        &self,
        symbol: &Symbol,
        side: PositionSide,
        requested_quantity: Decimal,
        outcome: ChainOutcome,
        take_profit: Option<Decimal>,
        stop_loss: Option<Decimal>,
    ) -> ExecutionReport {
        let fill_status = if outcome.filled >= requested_quantity {
            ExecStatus::Success
        } else {
            ExecStatus::Partial
        };
        let avg_price = outcome.avg_price();

        if take_profit.is_none() && stop_loss.is_none() {
            return ExecutionReport {
                status: fill_status,
                filled_quantity: outcome.filled,
                avg_fill_price: avg_price,
                protection: ProtectionStatus::NotRequired,
                attempts: outcome.attempts,
                error: None,
                cancel_all_issued: false,
                note: None,
            };
        }

        let (ack, missing) = match self
            .place_protection_checked(symbol, side, outcome.filled, take_profit, stop_loss)
            .await
        {
            Ok(pair) => pair,
            Err(e) => (ProtectionAck::default(), vec![format!("venue error: {e}")]),
        };

        if missing.is_empty() {
            return ExecutionReport {
                status: fill_status,
                filled_quantity: outcome.filled,
                avg_fill_price: avg_price,
                protection: ProtectionStatus::Complete {
                    tp_order_id: ack.tp_order_id,
                    sl_order_id: ack.sl_order_id,
                },
                attempts: outcome.attempts,
                error: None,
                cancel_all_issued: false,
                note: None,
            };
        }

        // 9. Incomplete protection: rollback-flatten or standing-risk error.
        let reason = missing.join(", ");
        let mut cancel_all_issued = false;
        let rolled_back = if self.protection.rollback_on_incomplete {
            let flatten = self.force_flatten(symbol).await;
            cancel_all_issued = flatten.cancel_all_issued;
            flatten.is_terminal_success()
        } else {
            false
        };
        warn!(
            %symbol,
            %reason,
            rolled_back,
            "protection incomplete after entry fill"
        );
        ExecutionReport {
            status: ExecStatus::Error,
            filled_quantity: outcome.filled,
            avg_fill_price: avg_price,
            protection: ProtectionStatus::Incomplete {
                missing,
                rolled_back,
            },
            attempts: outcome.attempts,
            error: Some(PipelineError::ProtectionIncomplete {
                reason,
                rolled_back,
            }),
            cancel_all_issued,
            note: None,
        }
    }

    // ------------------------------------------------------------------
    // Add path (DCA stage)
    // ------------------------------------------------------------------

    /// Scale into an existing position and resize its protection.
    pub async fn execute_add(
        &self,
        symbol: &Symbol,
        side: PositionSide,
        quantity: Decimal,
        take_profit: Option<Decimal>,
        stop_loss: Option<Decimal>,
        mark: Decimal,
    ) -> ExecutionReport {
        let meta = match self.venue.symbol_meta(symbol).await {
            Ok(m) => m,
            Err(e) => return ExecutionReport::failed(PipelineError::Venue(e.to_string())),
        };
        let quantity = meta.round_qty(quantity);
        if quantity <= Decimal::ZERO {
            return ExecutionReport::noop("add quantity rounds to zero");
        }

        let entry_price = aggressive_price(mark, side.entry_side(), self.config.entry_slippage_pct);
        let chain = build_chain(&self.config.open);
        let outcome = self
            .run_chain(
                &chain,
                &self.config.open,
                symbol,
                side.entry_side(),
                side,
                quantity,
                entry_price,
                entry_price,
                false,
                true,
            )
            .await;

        if outcome.filled <= Decimal::ZERO {
            let attempts = outcome.attempts.len() as u32;
            return ExecutionReport {
                status: ExecStatus::Error,
                filled_quantity: Decimal::ZERO,
                avg_fill_price: None,
                protection: ProtectionStatus::NotRequired,
                attempts: outcome.attempts,
                error: Some(PipelineError::LiquidityInsufficient { attempts }),
                cancel_all_issued: false,
                note: None,
            };
        }

        // Protection must cover the whole position after the add; replace
        // the old legs with ones sized to the authoritative quantity.
        let total = match self.account.position(symbol).await {
            Ok(Some(p)) => p.quantity,
            _ => outcome.filled,
        };
        if let Err(e) = self.cancel_protective_orders(symbol).await {
            warn!(%symbol, error = %e, "failed cancelling stale protection before resize");
        }
        let (ack, missing) = match self
            .place_protection_checked(symbol, side, total, take_profit, stop_loss)
            .await
        {
            Ok(pair) => pair,
            Err(e) => (ProtectionAck::default(), vec![format!("venue error: {e}")]),
        };

        let avg_price = outcome.avg_price();
        if missing.is_empty() {
            ExecutionReport {
                status: ExecStatus::Success,
                filled_quantity: outcome.filled,
                avg_fill_price: avg_price,
                protection: ProtectionStatus::Complete {
                    tp_order_id: ack.tp_order_id,
                    sl_order_id: ack.sl_order_id,
                },
                attempts: outcome.attempts,
                error: None,
                cancel_all_issued: false,
                note: None,
            }
        } else {
            let reason = missing.join(", ");
            ExecutionReport {
                status: ExecStatus::Error,
                filled_quantity: outcome.filled,
                avg_fill_price: avg_price,
                protection: ProtectionStatus::Incomplete {
                    missing,
                    rolled_back: false,
                },
                attempts: outcome.attempts,
                error: Some(PipelineError::ProtectionIncomplete {
                    reason,
                    rolled_back: false,
                }),
                cancel_all_issued: false,
                note: None,
            }
        }
    }

    // ------------------------------------------------------------------
    // Close path
    // ------------------------------------------------------------------

    /// Close the current position. Quantity comes from the venue's
    /// authoritative position; zero closeable is a noop, not an error.
    pub async fn execute_close(&self, symbol: &Symbol, mark: Decimal) -> ExecutionReport {
        let position = match self.account.position(symbol).await {
            Ok(p) => p,
            Err(e) => return ExecutionReport::failed(PipelineError::Venue(e.to_string())),
        };
        let Some(position) = position else {
            return ExecutionReport::noop("no position to close");
        };
        if position.quantity <= Decimal::ZERO {
            return ExecutionReport::noop("position quantity is zero");
        }

        let meta = match self.venue.symbol_meta(symbol).await {
            Ok(m) => m,
            Err(e) => return ExecutionReport::failed(PipelineError::Venue(e.to_string())),
        };
        let mut quantity = meta.round_qty(position.quantity);
        if quantity <= Decimal::ZERO {
            // A dust position below one step still closes in full.
            quantity = position.quantity;
        }

        let close_side = position.side.close_side();
        let base_price = aggressive_price(mark, close_side, self.config.entry_slippage_pct);
        // Resting fallback sits 1% through the mark so it cannot lift away.
        let boundary_price = aggressive_price(mark, close_side, 1.0);

        let chain = build_chain(&self.config.close);
        let outcome = self
            .run_chain(
                &chain,
                &self.config.close,
                symbol,
                close_side,
                position.side,
                quantity,
                base_price,
                boundary_price,
                true,
                false,
            )
            .await;

        if let Some(e) = &outcome.venue_error {
            let mut report = ExecutionReport::failed(PipelineError::Venue(e.to_string()));
            report.attempts = outcome.attempts;
            return report;
        }

        // Reduce-only rejected but the venue shows flat: reconcile rather
        // than report a phantom failure.
        if outcome.filled <= Decimal::ZERO
            && matches!(
                outcome.last_reject,
                Some(OrderRejectReason::ReduceOnlyRejected)
            )
        {
            if let Ok(None) = self.account.position(symbol).await {
                let mut report = ExecutionReport::noop("reduce-only rejected, venue already flat");
                report.attempts = outcome.attempts;
                return report;
            }
        }

        let remaining = quantity - outcome.filled;
        let avg_price = outcome.avg_price();
        let attempts_count = outcome.attempts.len() as u32;

        if remaining <= Decimal::ZERO {
            // 5. A full, filled close always sweeps the symbol's orders.
            let cancel_all_issued = match self.venue.cancel_all(symbol).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(%symbol, error = %e, "cancel-all after full close failed");
                    false
                }
            };
            return ExecutionReport {
                status: ExecStatus::Success,
                filled_quantity: outcome.filled,
                avg_fill_price: avg_price,
                protection: ProtectionStatus::NotRequired,
                attempts: outcome.attempts,
                error: None,
                cancel_all_issued,
                note: None,
            };
        }

        if outcome.resting_order_id.is_some() {
            return ExecutionReport {
                status: ExecStatus::Pending,
                filled_quantity: outcome.filled,
                avg_fill_price: avg_price,
                protection: ProtectionStatus::NotRequired,
                attempts: outcome.attempts,
                error: None,
                cancel_all_issued: false,
                note: None,
            };
        }

        if outcome.filled > Decimal::ZERO {
            return ExecutionReport {
                status: ExecStatus::Partial,
                filled_quantity: outcome.filled,
                avg_fill_price: avg_price,
                protection: ProtectionStatus::NotRequired,
                attempts: outcome.attempts,
                error: None,
                cancel_all_issued: false,
                note: None,
            };
        }

        ExecutionReport {
            status: ExecStatus::Error,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
            protection: ProtectionStatus::NotRequired,
            attempts: outcome.attempts,
            error: Some(PipelineError::LiquidityInsufficient {
                attempts: attempts_count,
            }),
            cancel_all_issued: false,
            note: None,
        }
    }

    /// Market-flatten the position immediately, reduce-only.
    pub async fn force_flatten(&self, symbol: &Symbol) -> ExecutionReport {
        let position = match self.account.position(symbol).await {
            Ok(p) => p,
            Err(e) => return ExecutionReport::failed(PipelineError::Venue(e.to_string())),
        };
        let Some(position) = position else {
            return ExecutionReport::noop("no position to flatten");
        };

        let form = OrderForm::market(
            symbol.clone(),
            position.side.close_side(),
            position.side,
            position.quantity,
            true,
        );
        let ack = match self.venue.place_order(&form).await {
            Ok(ack) => ack,
            Err(e) => return ExecutionReport::failed(PipelineError::Venue(e.to_string())),
        };
        let attempt = AttemptRecord {
            strategy: AttemptStrategy::MarketFallback,
            price: None,
            filled_quantity: ack.filled_quantity(),
            outcome: summarize_ack(&ack),
        };

        // Confirm against the venue; a flatten is never assumed.
        let still_open = matches!(self.account.position(symbol).await, Ok(Some(p)) if p.quantity > Decimal::ZERO);
        if still_open {
            return ExecutionReport {
                status: ExecStatus::Error,
                filled_quantity: ack.filled_quantity(),
                avg_fill_price: ack.fill_price(),
                protection: ProtectionStatus::NotRequired,
                attempts: vec![attempt],
                error: Some(PipelineError::Venue(
                    "force-flatten not confirmed; position still open".into(),
                )),
                cancel_all_issued: false,
                note: None,
            };
        }

        let cancel_all_issued = self.venue.cancel_all(symbol).await.is_ok();
        ExecutionReport {
            status: ExecStatus::Success,
            filled_quantity: ack.filled_quantity(),
            avg_fill_price: ack.fill_price(),
            protection: ProtectionStatus::NotRequired,
            attempts: vec![attempt],
            error: None,
            cancel_all_issued,
            note: None,
        }
    }

    // ------------------------------------------------------------------
    // Protection helpers
    // ------------------------------------------------------------------

    /// Place TP/SL legs and report which requested legs are missing.
    pub async fn place_protection_checked(
        &self,
        symbol: &Symbol,
        side: PositionSide,
        quantity: Decimal,
        take_profit: Option<Decimal>,
        stop_loss: Option<Decimal>,
    ) -> Result<(ProtectionAck, Vec<String>), VenueError> {
        let ack = self
            .venue
            .place_protection(symbol, side, quantity, take_profit, stop_loss)
            .await?;
        let mut missing = Vec::new();
        if take_profit.is_some() && ack.tp_order_id.is_none() {
            missing.push("take-profit leg not placed".to_string());
        }
        if stop_loss.is_some() && ack.sl_order_id.is_none() {
            missing.push("stop-loss leg not placed".to_string());
        }
        Ok((ack, missing))
    }

    /// Cancel only the protective legs resting for a symbol.
    pub async fn cancel_protective_orders(&self, symbol: &Symbol) -> Result<(), VenueError> {
        let orders = self.account.open_orders(symbol).await?;
        for order in orders.iter().filter(|o| o.protective.is_some()) {
            self.venue.cancel_order(symbol, &order.order_id).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Chain interpreter
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn run_chain(
        &self,
        chain: &[AttemptStrategy],
        leg: &LegConfig,
        symbol: &Symbol,
        side: Side,
        position_side: PositionSide,
        quantity: Decimal,
        base_price: Decimal,
        gtc_price: Decimal,
        reduce_only: bool,
        stop_on_first_fill: bool,
    ) -> ChainOutcome {
        let mut outcome = ChainOutcome {
            filled: Decimal::ZERO,
            fill_notional: Decimal::ZERO,
            resting_order_id: None,
            attempts: Vec::new(),
            last_reject: None,
            venue_error: None,
        };

        for strategy in chain {
            let remaining = quantity - outcome.filled;
            if remaining <= Decimal::ZERO {
                break;
            }

            let form = match strategy {
                AttemptStrategy::LimitIoc => OrderForm::limit_ioc(
                    symbol.clone(),
                    side,
                    position_side,
                    remaining,
                    base_price,
                    reduce_only,
                ),
                AttemptStrategy::LimitIocSlip { attempt } => {
                    let price = slide_price(base_price, side, leg.ioc_step_bps, *attempt);
                    OrderForm::limit_ioc(
                        symbol.clone(),
                        side,
                        position_side,
                        remaining,
                        price,
                        reduce_only,
                    )
                }
                AttemptStrategy::GtcFallback => OrderForm::limit_gtc(
                    symbol.clone(),
                    side,
                    position_side,
                    remaining,
                    gtc_price,
                    reduce_only,
                ),
                AttemptStrategy::MarketFallback => OrderForm::market(
                    symbol.clone(),
                    side,
                    position_side,
                    remaining,
                    reduce_only,
                ),
            };
            let price = form.kind.price();

            let ack = match self.venue.place_order(&form).await {
                Ok(ack) => ack,
                Err(e) => {
                    outcome.attempts.push(AttemptRecord {
                        strategy: *strategy,
                        price,
                        filled_quantity: Decimal::ZERO,
                        outcome: format!("venue error: {e}"),
                    });
                    outcome.venue_error = Some(e);
                    break;
                }
            };
            outcome.attempts.push(AttemptRecord {
                strategy: *strategy,
                price,
                filled_quantity: ack.filled_quantity(),
                outcome: summarize_ack(&ack),
            });

            match &ack {
                OrderAck::Filled { quantity, price, .. } => {
                    outcome.filled += *quantity;
                    outcome.fill_notional += *quantity * *price;
                    if stop_on_first_fill {
                        break;
                    }
                }
                OrderAck::PartiallyFilled {
                    filled_quantity,
                    avg_price,
                    ..
                } => {
                    outcome.filled += *filled_quantity;
                    outcome.fill_notional += *filled_quantity * *avg_price;
                    if stop_on_first_fill {
                        break;
                    }
                }
                OrderAck::Resting { order_id } => {
                    outcome.resting_order_id = Some(order_id.clone());
                    break;
                }
                OrderAck::Rejected { reason } => {
                    outcome.last_reject = Some(reason.clone());
                    if !reason.is_no_liquidity() {
                        break;
                    }
                }
            }
        }

        outcome
    }
}

/// Price pushed `pct` percent through the mark in the order's direction.
fn aggressive_price(mark: Decimal, side: Side, pct: f64) -> Decimal {
    let slip = Decimal::from_f64(pct / 100.0).unwrap_or_default();
    match side {
        Side::Buy => mark * (Decimal::ONE + slip),
        Side::Sell => mark * (Decimal::ONE - slip),
    }
}

/// Slide a base price by `attempt` steps of `step_bps` toward aggression.
fn slide_price(base: Decimal, side: Side, step_bps: f64, attempt: u32) -> Decimal {
    let step = Decimal::from_f64(step_bps / 10_000.0).unwrap_or_default()
        * Decimal::from(attempt);
    match side {
        Side::Buy => base * (Decimal::ONE + step),
        Side::Sell => base * (Decimal::ONE - step),
    }
}

fn summarize_ack(ack: &OrderAck) -> String {
    match ack {
        OrderAck::Filled { quantity, price, .. } => format!("filled {quantity} @ {price}"),
        OrderAck::PartiallyFilled {
            filled_quantity,
            remaining,
            ..
        } => format!("partial {filled_quantity} (remaining {remaining})"),
        OrderAck::Resting { order_id } => format!("resting as {order_id}"),
        OrderAck::Rejected { reason } => format!("rejected: {reason:?}"),
    }
}

/// Quantity for a fresh entry: target notional with minimum-notional
/// correction, bounded by available margin.
fn size_entry(
    available_margin: Decimal,
    fraction: Decimal,
    leverage: u32,
    price: Decimal,
    meta: &SymbolMeta,
) -> Result<Decimal, String> {
    if price <= Decimal::ZERO {
        return Err("non-positive entry price".into());
    }
    let leverage_dec = Decimal::from(leverage.max(1));
    let margin = available_margin * fraction;
    let notional = margin * leverage_dec;
    let mut quantity = meta.round_qty(notional / price);

    // Minimum-notional correction: bump to the smallest executable size.
    if quantity * price < meta.min_notional {
        let step = if meta.qty_step > Decimal::ZERO {
            meta.qty_step
        } else {
            Decimal::new(1, 8)
        };
        let steps = (meta.min_notional / price / step).ceil();
        quantity = steps * step;
    }
    if quantity <= Decimal::ZERO {
        return Err("entry quantity is zero after rounding".into());
    }

    let required_margin = quantity * price / leverage_dec;
    if required_margin > available_margin {
        return Err(format!(
            "available margin {available_margin} below required {required_margin} for minimum size"
        ));
    }
    Ok(quantity)
}
