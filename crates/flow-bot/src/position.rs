//! Position lifecycle state machine.
//!
//! States: Flat → Opening → {OpenProtected ⇄ OpenUnprotected ⇄ Adding} →
//! Closing → Flat.
//!
//! A protected position always has both TP and SL bound to its current
//! quantity. The per-cycle coverage check can demote a position to
//! OpenUnprotected at any time, not only at open, which starts the SLA
//! timer; once the SLA expires a forced flatten is mandatory regardless of
//! configuration. Failure never fabricates a transition: a close that errors
//! leaves the prior state untouched.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use flow_common::{PositionSide, Symbol};

use crate::config::{DcaConfig, ProtectionConfig};
use crate::error::PipelineError;
use crate::venue::{OpenOrder, ProtectiveKind, VenuePosition};

/// Lifecycle state of one symbol's position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    Flat,
    /// Entry submitted, fill not yet confirmed (resting entry).
    Opening,
    /// Both protective legs bound to the current quantity.
    OpenProtected,
    /// Position live without full protection; SLA clock running.
    OpenUnprotected,
    /// DCA add in flight; protection being resized.
    Adding,
    Closing,
}

impl LifecycleState {
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            LifecycleState::OpenProtected
                | LifecycleState::OpenUnprotected
                | LifecycleState::Adding
                | LifecycleState::Closing
        )
    }
}

/// Local snapshot of a position. Advisory: the venue is authoritative and
/// every cycle recalibrates this from venue state before acting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: Symbol,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub tp_order_id: Option<String>,
    pub sl_order_id: Option<String>,
    pub opened_at: DateTime<Utc>,
    /// Next DCA stage to evaluate; only ever advances.
    pub dca_stage: usize,
    pub state: LifecycleState,
    pub unprotected_since: Option<DateTime<Utc>>,
    pub last_unprotected_alert: Option<DateTime<Utc>>,
}

impl PositionSnapshot {
    pub fn is_protected(&self) -> bool {
        self.tp_order_id.is_some() && self.sl_order_id.is_some()
    }

    /// Adverse move from entry as a fraction (positive = losing).
    pub fn drawdown(&self, mark: Decimal) -> f64 {
        if self.entry_price <= Decimal::ZERO {
            return 0.0;
        }
        let signed = match self.side {
            PositionSide::Long => (self.entry_price - mark) / self.entry_price,
            PositionSide::Short => (mark - self.entry_price) / self.entry_price,
        };
        signed.to_f64().unwrap_or(0.0)
    }

    /// Realized PnL for closing `quantity` at `price`.
    pub fn realized_pnl(&self, quantity: Decimal, price: Decimal) -> Decimal {
        let diff = match self.side {
            PositionSide::Long => price - self.entry_price,
            PositionSide::Short => self.entry_price - price,
        };
        diff * quantity
    }
}

/// Coverage verdict from the per-cycle check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Coverage {
    Flat,
    Protected,
    Unprotected { missing: Vec<String> },
}

/// A DCA stage that is ready to fire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DcaTrigger {
    pub stage: usize,
    pub threshold: f64,
    pub size_multiplier: f64,
}

/// Tracks position lifecycle per symbol and enforces its invariants.
#[derive(Debug, Default)]
pub struct PositionBook {
    positions: HashMap<Symbol, PositionSnapshot>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, symbol: &Symbol) -> Option<&PositionSnapshot> {
        self.positions.get(symbol)
    }

    pub fn open_count(&self) -> usize {
        self.positions.values().filter(|p| p.state.is_open()).count()
    }

    /// Symbols holding a capacity slot: open positions plus resting entries.
    pub fn committed_count(&self) -> usize {
        self.positions
            .values()
            .filter(|p| p.state.is_open() || p.state == LifecycleState::Opening)
            .count()
    }

    pub fn open_symbols(&self) -> Vec<Symbol> {
        self.positions
            .values()
            .filter(|p| p.state.is_open())
            .map(|p| p.symbol.clone())
            .collect()
    }

    /// Recalibrate local state against the venue and classify protection
    /// coverage. This is the entry point of every per-symbol cycle step.
    pub fn sync_with_venue(
        &mut self,
        symbol: &Symbol,
        venue_position: Option<&VenuePosition>,
        open_orders: &[OpenOrder],
        now: DateTime<Utc>,
    ) -> Coverage {
        let Some(venue_pos) = venue_position.filter(|p| p.quantity > Decimal::ZERO) else {
            // Venue is flat. An Opening snapshot survives (its entry is
            // still resting); anything else we believed locally is gone
            // (TP/SL hit, manual close, liquidation).
            let keep_opening = self
                .positions
                .get(symbol)
                .is_some_and(|p| p.state == LifecycleState::Opening);
            if !keep_opening {
                if let Some(prev) = self.positions.remove(symbol) {
                    info!(%symbol, prev_state = ?prev.state, "venue reports flat, clearing local snapshot");
                }
            }
            return Coverage::Flat;
        };

        let snapshot = self
            .positions
            .entry(symbol.clone())
            .or_insert_with(|| {
                // Ghost position discovered on the venue; adopt it rather
                // than fight it.
                warn!(%symbol, side = %venue_pos.side, qty = %venue_pos.quantity, "adopting untracked venue position");
                PositionSnapshot {
                    symbol: symbol.clone(),
                    side: venue_pos.side,
                    quantity: venue_pos.quantity,
                    entry_price: venue_pos.entry_price,
                    tp_order_id: None,
                    sl_order_id: None,
                    opened_at: now,
                    dca_stage: 0,
                    state: LifecycleState::OpenUnprotected,
                    unprotected_since: Some(now),
                    last_unprotected_alert: None,
                }
            });

        snapshot.side = venue_pos.side;
        snapshot.quantity = venue_pos.quantity;
        if venue_pos.entry_price > Decimal::ZERO {
            snapshot.entry_price = venue_pos.entry_price;
        }

        // Validate protective legs against the live order list: an id that
        // vanished or a quantity mismatch both void the leg.
        let find_leg = |kind: ProtectiveKind, id: &Option<String>| -> Option<String> {
            let id = id.as_deref()?;
            open_orders
                .iter()
                .find(|o| {
                    o.order_id == id
                        && o.protective == Some(kind)
                        && o.quantity == venue_pos.quantity
                })
                .map(|o| o.order_id.clone())
        };
        snapshot.tp_order_id = find_leg(ProtectiveKind::TakeProfit, &snapshot.tp_order_id);
        snapshot.sl_order_id = find_leg(ProtectiveKind::StopLoss, &snapshot.sl_order_id);

        let mut missing = Vec::new();
        if snapshot.tp_order_id.is_none() {
            missing.push("take-profit".to_string());
        }
        if snapshot.sl_order_id.is_none() {
            missing.push("stop-loss".to_string());
        }

        if missing.is_empty() {
            if snapshot.state != LifecycleState::Closing {
                snapshot.state = LifecycleState::OpenProtected;
            }
            snapshot.unprotected_since = None;
            Coverage::Protected
        } else {
            if snapshot.state != LifecycleState::Closing {
                if snapshot.state != LifecycleState::OpenUnprotected {
                    // Entering unprotected starts the SLA clock.
                    snapshot.unprotected_since = Some(now);
                }
                snapshot.state = LifecycleState::OpenUnprotected;
            }
            Coverage::Unprotected { missing }
        }
    }

    /// Track a resting entry: the order is on the book but unfilled. The
    /// snapshot graduates through [`Self::sync_with_venue`] once the venue
    /// reports the position.
    pub fn mark_opening(&mut self, symbol: &Symbol, side: PositionSide, now: DateTime<Utc>) {
        self.positions
            .entry(symbol.clone())
            .or_insert_with(|| PositionSnapshot {
                symbol: symbol.clone(),
                side,
                quantity: Decimal::ZERO,
                entry_price: Decimal::ZERO,
                tp_order_id: None,
                sl_order_id: None,
                opened_at: now,
                dca_stage: 0,
                state: LifecycleState::Opening,
                unprotected_since: None,
                last_unprotected_alert: None,
            });
    }

    /// Drop a stale Opening snapshot whose resting entry disappeared.
    pub fn clear_if_opening(&mut self, symbol: &Symbol) {
        if self
            .positions
            .get(symbol)
            .is_some_and(|p| p.state == LifecycleState::Opening)
        {
            self.positions.remove(symbol);
        }
    }

    /// Record a confirmed open fill. Opening a symbol that already holds a
    /// position is an invariant violation, never a merge.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_open_fill(
        &mut self,
        symbol: &Symbol,
        side: PositionSide,
        quantity: Decimal,
        price: Decimal,
        tp_order_id: Option<String>,
        sl_order_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        if self.positions.get(symbol).is_some_and(|p| p.state.is_open()) {
            return Err(PipelineError::StateInvariantViolation(format!(
                "open fill for {symbol} but a position is already tracked"
            )));
        }
        if quantity <= Decimal::ZERO {
            return Err(PipelineError::StateInvariantViolation(format!(
                "open fill for {symbol} with non-positive quantity {quantity}"
            )));
        }
        let protected = tp_order_id.is_some() && sl_order_id.is_some();
        self.positions.insert(
            symbol.clone(),
            PositionSnapshot {
                symbol: symbol.clone(),
                side,
                quantity,
                entry_price: price,
                tp_order_id,
                sl_order_id,
                opened_at: now,
                dca_stage: 0,
                state: if protected {
                    LifecycleState::OpenProtected
                } else {
                    LifecycleState::OpenUnprotected
                },
                unprotected_since: (!protected).then_some(now),
                last_unprotected_alert: None,
            },
        );
        Ok(())
    }

    /// Bind fresh protective legs to the position.
    pub fn apply_protection(
        &mut self,
        symbol: &Symbol,
        tp_order_id: Option<String>,
        sl_order_id: Option<String>,
    ) -> Result<(), PipelineError> {
        let snapshot = self.positions.get_mut(symbol).ok_or_else(|| {
            PipelineError::StateInvariantViolation(format!(
                "protection applied to flat symbol {symbol}"
            ))
        })?;
        snapshot.tp_order_id = tp_order_id;
        snapshot.sl_order_id = sl_order_id;
        if snapshot.is_protected() {
            snapshot.state = LifecycleState::OpenProtected;
            snapshot.unprotected_since = None;
        }
        Ok(())
    }

    /// Record a confirmed DCA fill: quantity grows, stage advances, state
    /// returns to protected only once protection has been resized.
    pub fn apply_add_fill(
        &mut self,
        symbol: &Symbol,
        added_quantity: Decimal,
        fill_price: Decimal,
        tp_order_id: Option<String>,
        sl_order_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        let snapshot = self.positions.get_mut(symbol).ok_or_else(|| {
            PipelineError::StateInvariantViolation(format!("add fill for flat symbol {symbol}"))
        })?;
        let old_notional = snapshot.entry_price * snapshot.quantity;
        snapshot.quantity += added_quantity;
        if snapshot.quantity > Decimal::ZERO {
            snapshot.entry_price =
                (old_notional + fill_price * added_quantity) / snapshot.quantity;
        }
        snapshot.dca_stage += 1;
        snapshot.tp_order_id = tp_order_id;
        snapshot.sl_order_id = sl_order_id;
        if snapshot.is_protected() {
            snapshot.state = LifecycleState::OpenProtected;
            snapshot.unprotected_since = None;
        } else {
            if snapshot.state != LifecycleState::OpenUnprotected {
                snapshot.unprotected_since = Some(now);
            }
            snapshot.state = LifecycleState::OpenUnprotected;
        }
        Ok(())
    }

    /// Enter the closing state. Kept separate from the close result so a
    /// failed close can restore the prior state.
    pub fn begin_closing(&mut self, symbol: &Symbol) -> Option<LifecycleState> {
        let snapshot = self.positions.get_mut(symbol)?;
        let prior = snapshot.state;
        snapshot.state = LifecycleState::Closing;
        Some(prior)
    }

    /// Apply a close outcome. Success and noop both end Flat; an error
    /// restores the state captured by [`Self::begin_closing`].
    pub fn finish_closing(&mut self, symbol: &Symbol, closed: bool, prior: LifecycleState) {
        if closed {
            self.positions.remove(symbol);
        } else if let Some(snapshot) = self.positions.get_mut(symbol) {
            snapshot.state = prior;
        }
    }

    /// Evaluate the DCA ladder. Fires only from OpenProtected, only for the
    /// next stage, and never past the configured maximum.
    pub fn dca_trigger(
        &self,
        symbol: &Symbol,
        mark: Decimal,
        config: &DcaConfig,
    ) -> Option<DcaTrigger> {
        let snapshot = self.positions.get(symbol)?;
        if snapshot.state != LifecycleState::OpenProtected {
            return None;
        }
        let stage = snapshot.dca_stage;
        if stage >= config.max_stages
            || stage >= config.drawdown_thresholds.len()
            || stage >= config.size_multipliers.len()
        {
            return None;
        }
        let threshold = config.drawdown_thresholds[stage];
        if snapshot.drawdown(mark) >= threshold {
            Some(DcaTrigger {
                stage,
                threshold,
                size_multiplier: config.size_multipliers[stage],
            })
        } else {
            None
        }
    }

    /// Base quantity for a DCA add: the current quantity scaled by the
    /// stage multiplier.
    pub fn dca_quantity(&self, symbol: &Symbol, trigger: &DcaTrigger) -> Decimal {
        let Some(snapshot) = self.positions.get(symbol) else {
            return Decimal::ZERO;
        };
        snapshot.quantity * Decimal::from_f64(trigger.size_multiplier).unwrap_or(Decimal::ONE)
    }

    /// Has the unprotected SLA expired for this symbol?
    pub fn sla_expired(
        &self,
        symbol: &Symbol,
        config: &ProtectionConfig,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(snapshot) = self.positions.get(symbol) else {
            return false;
        };
        if snapshot.state != LifecycleState::OpenUnprotected {
            return false;
        }
        match snapshot.unprotected_since {
            Some(since) => now - since >= Duration::seconds(config.sla_secs as i64),
            None => false,
        }
    }

    /// Rate-limited alert check for an unprotected position. Returns true
    /// when an alert should be emitted now.
    pub fn should_alert_unprotected(
        &mut self,
        symbol: &Symbol,
        config: &ProtectionConfig,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(snapshot) = self.positions.get_mut(symbol) else {
            return false;
        };
        let cooldown = Duration::seconds(config.alert_cooldown_secs as i64);
        match snapshot.last_unprotected_alert {
            Some(last) if now - last < cooldown => false,
            _ => {
                snapshot.last_unprotected_alert = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn sym() -> Symbol {
        Symbol::new("BTCUSDT")
    }

    fn ts(offset: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + offset, 0).unwrap()
    }

    fn venue_pos(qty: Decimal) -> VenuePosition {
        VenuePosition {
            symbol: sym(),
            side: PositionSide::Long,
            quantity: qty,
            entry_price: dec!(100),
        }
    }

    fn protective(id: &str, kind: ProtectiveKind, qty: Decimal) -> OpenOrder {
        OpenOrder {
            order_id: id.to_string(),
            symbol: sym(),
            side: flow_common::Side::Sell,
            quantity: qty,
            price: Some(dec!(100)),
            reduce_only: true,
            protective: Some(kind),
            created_at: ts(0),
        }
    }

    fn protection_cfg(sla: u64) -> ProtectionConfig {
        ProtectionConfig {
            sla_secs: sla,
            alert_cooldown_secs: 60,
            ..ProtectionConfig::default()
        }
    }

    fn book_with_protected_position() -> PositionBook {
        let mut book = PositionBook::new();
        book.apply_open_fill(
            &sym(),
            PositionSide::Long,
            dec!(1),
            dec!(100),
            Some("tp1".into()),
            Some("sl1".into()),
            ts(0),
        )
        .unwrap();
        book
    }

    #[test]
    fn test_open_fill_with_both_legs_is_protected() {
        let book = book_with_protected_position();
        let snap = book.get(&sym()).unwrap();
        assert_eq!(snap.state, LifecycleState::OpenProtected);
        assert!(snap.is_protected());
        assert_eq!(book.open_count(), 1);
    }

    #[test]
    fn test_double_open_is_invariant_violation() {
        let mut book = book_with_protected_position();
        let err = book
            .apply_open_fill(
                &sym(),
                PositionSide::Short,
                dec!(1),
                dec!(100),
                None,
                None,
                ts(1),
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::StateInvariantViolation(_)));
        // The original long position is untouched.
        assert_eq!(book.get(&sym()).unwrap().side, PositionSide::Long);
    }

    #[test]
    fn test_sync_flat_venue_clears_local() {
        let mut book = book_with_protected_position();
        let coverage = book.sync_with_venue(&sym(), None, &[], ts(10));
        assert_eq!(coverage, Coverage::Flat);
        assert!(book.get(&sym()).is_none());
    }

    #[test]
    fn test_sync_detects_missing_leg_and_starts_sla() {
        let mut book = book_with_protected_position();
        let pos = venue_pos(dec!(1));
        // Only the stop-loss survives on the venue.
        let orders = vec![protective("sl1", ProtectiveKind::StopLoss, dec!(1))];
        let coverage = book.sync_with_venue(&sym(), Some(&pos), &orders, ts(10));
        match coverage {
            Coverage::Unprotected { missing } => assert_eq!(missing, vec!["take-profit"]),
            other => panic!("unexpected coverage {other:?}"),
        }
        let snap = book.get(&sym()).unwrap();
        assert_eq!(snap.state, LifecycleState::OpenUnprotected);
        assert_eq!(snap.unprotected_since, Some(ts(10)));
    }

    #[test]
    fn test_sync_quantity_mismatch_voids_leg() {
        let mut book = book_with_protected_position();
        let pos = venue_pos(dec!(2)); // position grew, legs sized to 1
        let orders = vec![
            protective("tp1", ProtectiveKind::TakeProfit, dec!(1)),
            protective("sl1", ProtectiveKind::StopLoss, dec!(1)),
        ];
        let coverage = book.sync_with_venue(&sym(), Some(&pos), &orders, ts(10));
        assert!(matches!(coverage, Coverage::Unprotected { .. }));
    }

    #[test]
    fn test_sync_full_coverage_is_protected() {
        let mut book = book_with_protected_position();
        let pos = venue_pos(dec!(1));
        let orders = vec![
            protective("tp1", ProtectiveKind::TakeProfit, dec!(1)),
            protective("sl1", ProtectiveKind::StopLoss, dec!(1)),
        ];
        let coverage = book.sync_with_venue(&sym(), Some(&pos), &orders, ts(10));
        assert_eq!(coverage, Coverage::Protected);
        assert_eq!(book.get(&sym()).unwrap().state, LifecycleState::OpenProtected);
    }

    #[test]
    fn test_sync_adopts_ghost_position() {
        let mut book = PositionBook::new();
        let pos = venue_pos(dec!(3));
        let coverage = book.sync_with_venue(&sym(), Some(&pos), &[], ts(5));
        assert!(matches!(coverage, Coverage::Unprotected { .. }));
        let snap = book.get(&sym()).unwrap();
        assert_eq!(snap.quantity, dec!(3));
        assert_eq!(snap.state, LifecycleState::OpenUnprotected);
    }

    #[test]
    fn test_sla_expiry() {
        let mut book = book_with_protected_position();
        let pos = venue_pos(dec!(1));
        book.sync_with_venue(&sym(), Some(&pos), &[], ts(0));
        let cfg = protection_cfg(300);

        assert!(!book.sla_expired(&sym(), &cfg, ts(299)));
        assert!(book.sla_expired(&sym(), &cfg, ts(300)));
    }

    #[test]
    fn test_sla_clock_not_restarted_while_unprotected() {
        let mut book = book_with_protected_position();
        let pos = venue_pos(dec!(1));
        book.sync_with_venue(&sym(), Some(&pos), &[], ts(0));
        // Re-syncing later must keep the original SLA anchor.
        book.sync_with_venue(&sym(), Some(&pos), &[], ts(200));
        assert_eq!(book.get(&sym()).unwrap().unprotected_since, Some(ts(0)));
    }

    #[test]
    fn test_repair_restores_protected_and_clears_sla() {
        let mut book = book_with_protected_position();
        let pos = venue_pos(dec!(1));
        book.sync_with_venue(&sym(), Some(&pos), &[], ts(0));
        book.apply_protection(&sym(), Some("tp2".into()), Some("sl2".into()))
            .unwrap();
        let snap = book.get(&sym()).unwrap();
        assert_eq!(snap.state, LifecycleState::OpenProtected);
        assert!(snap.unprotected_since.is_none());
    }

    #[test]
    fn test_close_error_restores_prior_state() {
        let mut book = book_with_protected_position();
        let prior = book.begin_closing(&sym()).unwrap();
        assert_eq!(book.get(&sym()).unwrap().state, LifecycleState::Closing);

        book.finish_closing(&sym(), false, prior);
        assert_eq!(book.get(&sym()).unwrap().state, LifecycleState::OpenProtected);

        let prior = book.begin_closing(&sym()).unwrap();
        book.finish_closing(&sym(), true, prior);
        assert!(book.get(&sym()).is_none());
    }

    #[test]
    fn test_dca_fires_in_stage_order() {
        let mut book = book_with_protected_position();
        let cfg = DcaConfig {
            drawdown_thresholds: vec![0.02, 0.05],
            size_multipliers: vec![1.0, 1.5],
            max_stages: 2,
        };

        // 1% drawdown: below the first threshold.
        assert!(book.dca_trigger(&sym(), dec!(99), &cfg).is_none());

        // 3% drawdown: stage 0 fires.
        let trigger = book.dca_trigger(&sym(), dec!(97), &cfg).unwrap();
        assert_eq!(trigger.stage, 0);
        assert_eq!(trigger.size_multiplier, 1.0);
        assert_eq!(book.dca_quantity(&sym(), &trigger), dec!(1));

        book.apply_add_fill(&sym(), dec!(1), dec!(97), Some("tp2".into()), Some("sl2".into()), ts(1))
            .unwrap();
        let snap = book.get(&sym()).unwrap();
        assert_eq!(snap.dca_stage, 1);
        assert_eq!(snap.quantity, dec!(2));
        assert_eq!(snap.state, LifecycleState::OpenProtected);

        // Same drawdown does not re-fire stage 0; stage 1 needs 5%.
        assert!(book.dca_trigger(&sym(), dec!(97), &cfg).is_none());
        // Entry price averaged down to 98.5, so stage 1 needs mark <= 93.575.
        let trigger = book.dca_trigger(&sym(), dec!(93), &cfg).unwrap();
        assert_eq!(trigger.stage, 1);

        book.apply_add_fill(&sym(), dec!(3), dec!(93), Some("tp3".into()), Some("sl3".into()), ts(1))
            .unwrap();
        // Ladder exhausted.
        assert!(book.dca_trigger(&sym(), dec!(80), &cfg).is_none());
    }

    #[test]
    fn test_dca_requires_protected_state() {
        let mut book = book_with_protected_position();
        let cfg = DcaConfig {
            drawdown_thresholds: vec![0.01],
            size_multipliers: vec![1.0],
            max_stages: 1,
        };
        // Demote to unprotected: DCA must not fire.
        let pos = venue_pos(dec!(1));
        book.sync_with_venue(&sym(), Some(&pos), &[], ts(0));
        assert!(book.dca_trigger(&sym(), dec!(90), &cfg).is_none());
    }

    #[test]
    fn test_unprotected_alert_rate_limited() {
        let mut book = book_with_protected_position();
        let cfg = protection_cfg(300);
        assert!(book.should_alert_unprotected(&sym(), &cfg, ts(0)));
        assert!(!book.should_alert_unprotected(&sym(), &cfg, ts(30)));
        assert!(book.should_alert_unprotected(&sym(), &cfg, ts(61)));
    }

    #[test]
    fn test_opening_snapshot_survives_flat_sync() {
        let mut book = PositionBook::new();
        book.mark_opening(&sym(), PositionSide::Long, ts(0));
        assert_eq!(book.committed_count(), 1);
        assert_eq!(book.open_count(), 0);

        // Venue still flat: the resting entry keeps its slot.
        let coverage = book.sync_with_venue(&sym(), None, &[], ts(10));
        assert_eq!(coverage, Coverage::Flat);
        assert!(book.get(&sym()).is_some());

        // The entry fills: the snapshot graduates through sync.
        let pos = venue_pos(dec!(2));
        let coverage = book.sync_with_venue(&sym(), Some(&pos), &[], ts(20));
        assert!(matches!(coverage, Coverage::Unprotected { .. }));
        assert_eq!(book.get(&sym()).unwrap().quantity, dec!(2));

        // clear_if_opening only removes genuine Opening snapshots.
        book.clear_if_opening(&sym());
        assert!(book.get(&sym()).is_some());
    }

    #[test]
    fn test_clear_if_opening_drops_stale_entry() {
        let mut book = PositionBook::new();
        book.mark_opening(&sym(), PositionSide::Long, ts(0));
        book.clear_if_opening(&sym());
        assert!(book.get(&sym()).is_none());
    }

    #[test]
    fn test_drawdown_sign_per_side() {
        let snap = PositionSnapshot {
            symbol: sym(),
            side: PositionSide::Short,
            quantity: dec!(1),
            entry_price: dec!(100),
            tp_order_id: None,
            sl_order_id: None,
            opened_at: ts(0),
            dca_stage: 0,
            state: LifecycleState::OpenUnprotected,
            unprotected_since: None,
            last_unprotected_alert: None,
        };
        // Price up 5% is a 5% drawdown for a short.
        assert!((snap.drawdown(dec!(105)) - 0.05).abs() < 1e-12);
        assert!(snap.drawdown(dec!(95)) < 0.0);
    }

    #[test]
    fn test_realized_pnl_per_side() {
        let book = book_with_protected_position();
        let snap = book.get(&sym()).unwrap();
        assert_eq!(snap.realized_pnl(dec!(1), dec!(110)), dec!(10));
        assert_eq!(snap.realized_pnl(dec!(1), dec!(95)), dec!(-5));
    }
}
