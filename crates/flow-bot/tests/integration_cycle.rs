//! End-to-end cycle tests: orchestrator + sim venue.
//!
//! These drive full cycles through regime classification, scoring, gating,
//! execution and the position lifecycle, asserting the pipeline-level
//! properties: entries open protected, reversals close, the account breaker
//! blocks entries but never closes, the protective SLA forces a flatten, and
//! unchanged market state produces no new orders.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use flow_bot::config::{
    BotConfig, CycleConfig, DcaConfig, ExecutionConfig, MarketConfig, ProtectionConfig,
    RegimeConfig, RiskConfig, ThresholdConfig, TriggerConfig, WeightsConfig,
};
use flow_bot::market::{RawSample, TrendFilter};
use flow_bot::orchestrator::{CycleOrchestrator, SymbolOutcome};
use flow_bot::position::LifecycleState;
use flow_bot::venue::sim::SimVenue;
use flow_bot::venue::VenuePosition;
use flow_bot::{ExecStatus, NullAudit};
use flow_common::{PositionSide, Symbol};

fn ts(offset: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + offset, 0).unwrap()
}

fn btc() -> Symbol {
    Symbol::new("BTCUSDT")
}

fn eth() -> Symbol {
    Symbol::new("ETHUSDT")
}

fn test_config(symbols: &[&str], max_active: usize) -> BotConfig {
    let mut weights = WeightsConfig::default();
    // Depth imbalance drives the test signal deterministically.
    weights.trend.imbalance = 0.5;
    BotConfig {
        symbols: symbols.iter().map(|s| s.to_string()).collect(),
        market: MarketConfig::default(),
        regime: RegimeConfig::default(),
        weights,
        thresholds: ThresholdConfig {
            long_open: 0.22,
            short_open: 0.22,
            close: 0.32,
        },
        trigger: TriggerConfig::default(),
        risk: RiskConfig::default(),
        execution: ExecutionConfig::default(),
        protection: ProtectionConfig::default(),
        dca: DcaConfig::default(),
        cycle: CycleConfig {
            max_active_symbols: max_active,
            position_fraction: dec!(0.2),
            default_leverage: 2,
            soft_budget_secs: 60,
            regime_cadence_cycles: 1,
        },
    }
}

/// A trending-up sample whose imbalance encodes the signal direction:
/// positive favors longs, negative favors shorts.
fn sample(symbol: &Symbol, offset: i64, price: Decimal, imbalance_sign: f64) -> RawSample {
    let (bid, ask) = if imbalance_sign >= 0.0 {
        (dec!(9000), dec!(1000)) // imbalance +0.8
    } else {
        (dec!(1000), dec!(9000)) // imbalance -0.8
    };
    RawSample {
        symbol: symbol.clone(),
        timestamp: ts(offset),
        price,
        change_24h_pct: 0.0,
        bid_depth_notional: bid,
        ask_depth_notional: ask,
        funding_rate: 0.0,
        open_interest: 1_000_000.0,
        trend_filter: Some(TrendFilter {
            ema_fast: 101.0,
            ema_slow: 100.0,
            adx: 30.0,
            atr_pct: 0.005,
        }),
    }
}

fn neutral_sample(symbol: &Symbol, offset: i64, price: Decimal) -> RawSample {
    RawSample {
        bid_depth_notional: dec!(1000),
        ask_depth_notional: dec!(1000),
        ..sample(symbol, offset, price, 1.0)
    }
}

fn orchestrator(
    config: BotConfig,
    venue: &Arc<SimVenue>,
) -> CycleOrchestrator<SimVenue, SimVenue, SimVenue> {
    CycleOrchestrator::new(
        config,
        venue.clone(),
        venue.clone(),
        venue.clone(),
        Arc::new(NullAudit),
        ts(0),
    )
}

/// Warm the aggregator (first sample only seeds delta references) and open
/// a long position on the second cycle.
async fn open_long(
    orch: &mut CycleOrchestrator<SimVenue, SimVenue, SimVenue>,
    venue: &Arc<SimVenue>,
) {
    venue.set_account(dec!(10000), dec!(10000));
    venue.push_sample(sample(&btc(), 0, dec!(100), 1.0));
    orch.run_cycle(ts(0)).await;

    venue.push_sample(sample(&btc(), 60, dec!(100), 1.0));
    let report = orch.run_cycle(ts(60)).await;
    match report.outcome_for(&btc()) {
        Some(SymbolOutcome::Opened {
            status: ExecStatus::Success,
        }) => {}
        other => panic!("expected successful open, got {other:?}"),
    }
}

#[tokio::test]
async fn test_open_long_end_to_end() {
    let venue = Arc::new(SimVenue::new());
    let mut orch = orchestrator(test_config(&["BTCUSDT"], 1), &venue);
    open_long(&mut orch, &venue).await;

    let position = venue.position_of(&btc()).expect("position should exist");
    assert_eq!(position.side, PositionSide::Long);
    assert!(position.quantity > Decimal::ZERO);

    // Both protective legs rest, sized to the position.
    let orders = venue.open_orders_of(&btc());
    assert_eq!(orders.len(), 2);
    assert!(orders.iter().all(|o| o.reduce_only));
    assert!(orders.iter().all(|o| o.quantity == position.quantity));

    let snap = orch.book().get(&btc()).expect("book snapshot");
    assert_eq!(snap.state, LifecycleState::OpenProtected);
    assert!(snap.tp_order_id.is_some() && snap.sl_order_id.is_some());
}

#[tokio::test]
async fn test_unchanged_state_is_idempotent() {
    let venue = Arc::new(SimVenue::new());
    let mut orch = orchestrator(test_config(&["BTCUSDT"], 1), &venue);
    open_long(&mut orch, &venue).await;

    let orders_before = venue.placed_order_count();
    let position_before = venue.position_of(&btc()).unwrap();

    // Same sample replayed, position unchanged: cycles must be no-ops.
    for offset in [120, 180] {
        venue.push_sample(sample(&btc(), offset, dec!(100), 1.0));
        let report = orch.run_cycle(ts(offset)).await;
        match report.outcome_for(&btc()) {
            Some(SymbolOutcome::Held { .. }) => {}
            other => panic!("expected hold on unchanged state, got {other:?}"),
        }
    }

    assert_eq!(venue.placed_order_count(), orders_before);
    assert_eq!(venue.position_of(&btc()).unwrap(), position_before);
}

#[tokio::test]
async fn test_reversal_closes_position() {
    let venue = Arc::new(SimVenue::new());
    let mut orch = orchestrator(test_config(&["BTCUSDT"], 1), &venue);
    open_long(&mut orch, &venue).await;

    // Opposing flow: short score 0.40 >= close threshold 0.32.
    venue.push_sample(sample(&btc(), 120, dec!(100), -1.0));
    let report = orch.run_cycle(ts(120)).await;
    match report.outcome_for(&btc()) {
        Some(SymbolOutcome::Closed {
            status: ExecStatus::Success,
        }) => {}
        other => panic!("expected close, got {other:?}"),
    }

    // Never simultaneously long and short; venue fully flat, orphan
    // protective orders swept by the close's cancel-all.
    assert!(venue.position_of(&btc()).is_none());
    assert!(venue.open_orders_of(&btc()).is_empty());
    assert_eq!(orch.book().open_count(), 0);
    assert!(venue.cancel_all_count(&btc()) >= 1);
}

#[tokio::test]
async fn test_daily_loss_blocks_entries_not_closes() {
    let venue = Arc::new(SimVenue::new());
    let mut config = test_config(&["BTCUSDT"], 1);
    config.risk.max_daily_loss_pct = 5.0;
    let mut orch = orchestrator(config, &venue);
    open_long(&mut orch, &venue).await;

    // Market drops 10%: the reversal close realizes a loss far over 5%.
    venue.push_sample(sample(&btc(), 120, dec!(90), -1.0));
    let report = orch.run_cycle(ts(120)).await;
    assert!(matches!(
        report.outcome_for(&btc()),
        Some(SymbolOutcome::Closed { .. })
    ));
    assert!(orch.guard().state().realized_pnl_today < Decimal::ZERO);

    // Entry-favorable signal next cycle: blocked by the open circuit.
    venue.push_sample(sample(&btc(), 180, dec!(90), 1.0));
    let report = orch.run_cycle(ts(180)).await;
    match report.outcome_for(&btc()) {
        Some(SymbolOutcome::CircuitBlocked { reason }) => {
            assert!(reason.contains("daily_loss"), "reason: {reason}");
        }
        other => panic!("expected circuit block, got {other:?}"),
    }
    assert!(venue.position_of(&btc()).is_none());

    // A position that appears while the circuit is open can still be
    // protected and closed: the cooldown never blocks risk reduction.
    venue.seed_position(VenuePosition {
        symbol: btc(),
        side: PositionSide::Long,
        quantity: dec!(1),
        entry_price: dec!(90),
    });
    venue.push_sample(sample(&btc(), 240, dec!(90), 1.0));
    let report = orch.run_cycle(ts(240)).await;
    assert!(matches!(
        report.outcome_for(&btc()),
        Some(SymbolOutcome::ProtectionRepaired)
    ));

    venue.push_sample(sample(&btc(), 300, dec!(90), -1.0));
    let report = orch.run_cycle(ts(300)).await;
    match report.outcome_for(&btc()) {
        Some(SymbolOutcome::Closed {
            status: ExecStatus::Success,
        }) => {}
        other => panic!("close must not be circuit-blocked, got {other:?}"),
    }
}

#[tokio::test]
async fn test_sla_timeout_forces_flatten() {
    let venue = Arc::new(SimVenue::new());
    let mut config = test_config(&["BTCUSDT"], 1);
    config.protection.sla_secs = 300;
    config.protection.close_on_repair_fail = false;
    let mut orch = orchestrator(config, &venue);
    open_long(&mut orch, &venue).await;

    // Protection vanishes and repairs keep failing.
    venue.drop_protective_orders(&btc());
    venue.fail_take_profit(true);

    // Repair fails; the position stays, SLA clock running from here.
    venue.push_sample(sample(&btc(), 120, dec!(100), 1.0));
    let report = orch.run_cycle(ts(120)).await;
    assert!(matches!(
        report.outcome_for(&btc()),
        Some(SymbolOutcome::Held { .. })
    ));
    assert_eq!(
        orch.book().get(&btc()).unwrap().state,
        LifecycleState::OpenUnprotected
    );

    // Still inside the SLA: nothing forced yet.
    venue.push_sample(sample(&btc(), 240, dec!(100), 1.0));
    orch.run_cycle(ts(240)).await;
    assert!(venue.position_of(&btc()).is_some());

    // Past the SLA: flatten is mandatory regardless of configuration.
    venue.push_sample(sample(&btc(), 500, dec!(100), 1.0));
    let report = orch.run_cycle(ts(500)).await;
    match report.outcome_for(&btc()) {
        Some(SymbolOutcome::Flattened {
            status: ExecStatus::Success,
        }) => {}
        other => panic!("expected forced flatten, got {other:?}"),
    }
    assert!(venue.position_of(&btc()).is_none());
    assert_eq!(orch.book().open_count(), 0);
}

#[tokio::test]
async fn test_repair_failure_with_close_on_fail_goes_straight_to_close() {
    let venue = Arc::new(SimVenue::new());
    let mut config = test_config(&["BTCUSDT"], 1);
    config.protection.close_on_repair_fail = true;
    let mut orch = orchestrator(config, &venue);
    open_long(&mut orch, &venue).await;

    venue.drop_protective_orders(&btc());
    venue.fail_take_profit(true);

    venue.push_sample(sample(&btc(), 120, dec!(100), 1.0));
    let report = orch.run_cycle(ts(120)).await;
    match report.outcome_for(&btc()) {
        Some(SymbolOutcome::Closed {
            status: ExecStatus::Success,
        }) => {}
        other => panic!("expected immediate close on repair failure, got {other:?}"),
    }
    assert!(venue.position_of(&btc()).is_none());
}

#[tokio::test]
async fn test_repair_restores_protection() {
    let venue = Arc::new(SimVenue::new());
    let mut orch = orchestrator(test_config(&["BTCUSDT"], 1), &venue);
    open_long(&mut orch, &venue).await;

    venue.drop_protective_orders(&btc());
    venue.push_sample(sample(&btc(), 120, dec!(100), 1.0));
    let report = orch.run_cycle(ts(120)).await;
    assert!(matches!(
        report.outcome_for(&btc()),
        Some(SymbolOutcome::ProtectionRepaired)
    ));
    let snap = orch.book().get(&btc()).unwrap();
    assert_eq!(snap.state, LifecycleState::OpenProtected);
    assert_eq!(venue.open_orders_of(&btc()).len(), 2);
}

#[tokio::test]
async fn test_rollback_on_protection_failure_leaves_flat() {
    let venue = Arc::new(SimVenue::new());
    let mut orch = orchestrator(test_config(&["BTCUSDT"], 1), &venue);
    venue.set_account(dec!(10000), dec!(10000));
    venue.fail_take_profit(true);

    venue.push_sample(sample(&btc(), 0, dec!(100), 1.0));
    orch.run_cycle(ts(0)).await;
    venue.push_sample(sample(&btc(), 60, dec!(100), 1.0));
    let report = orch.run_cycle(ts(60)).await;

    match report.outcome_for(&btc()) {
        Some(SymbolOutcome::Opened {
            status: ExecStatus::Error,
        }) => {}
        other => panic!("expected errored open, got {other:?}"),
    }
    // Rollback flattened the fill: nothing lingers anywhere.
    assert!(venue.position_of(&btc()).is_none());
    assert_eq!(orch.book().open_count(), 0);
    assert!(venue.open_orders_of(&btc()).is_empty());
}

#[tokio::test]
async fn test_candidate_ranking_under_slot_scarcity() {
    let venue = Arc::new(SimVenue::new());
    let mut orch = orchestrator(test_config(&["BTCUSDT", "ETHUSDT"], 1), &venue);
    venue.set_account(dec!(10000), dec!(10000));

    // BTC clears the open threshold but ranks below ETH's full imbalance.
    let btc_sample = |offset| RawSample {
        bid_depth_notional: dec!(7500),
        ask_depth_notional: dec!(2500), // imbalance 0.5 -> score 0.25
        ..sample(&btc(), offset, dec!(100), 1.0)
    };
    let eth_sample = |offset| sample(&eth(), offset, dec!(50), 1.0); // 0.8 -> 0.40

    venue.push_sample(btc_sample(0));
    venue.push_sample(eth_sample(0));
    orch.run_cycle(ts(0)).await;

    venue.push_sample(btc_sample(60));
    venue.push_sample(eth_sample(60));
    let report = orch.run_cycle(ts(60)).await;

    assert_eq!(report.candidates_queued, 2);
    assert_eq!(report.candidates_executed, 1);
    // The stronger ETH signal wins the single slot.
    assert!(matches!(
        report.outcome_for(&eth()),
        Some(SymbolOutcome::Opened { .. })
    ));
    assert!(matches!(
        report.outcome_for(&btc()),
        Some(SymbolOutcome::OpenQueued { .. })
    ));
    assert!(venue.position_of(&eth()).is_some());
    assert!(venue.position_of(&btc()).is_none());
}

#[tokio::test]
async fn test_orphan_sweep_clears_flat_symbol_orders() {
    let venue = Arc::new(SimVenue::new());
    let mut orch = orchestrator(test_config(&["BTCUSDT"], 1), &venue);
    venue.set_account(dec!(10000), dec!(10000));

    // Stray protective legs with no position behind them.
    use flow_bot::venue::ExecutionVenue;
    venue
        .place_protection(&btc(), PositionSide::Long, dec!(1), Some(dec!(110)), Some(dec!(95)))
        .await
        .unwrap();
    assert_eq!(venue.open_orders_of(&btc()).len(), 2);

    venue.push_sample(neutral_sample(&btc(), 0, dec!(100)));
    let report = orch.run_cycle(ts(0)).await;

    assert_eq!(report.orphans_swept, 1);
    assert!(venue.open_orders_of(&btc()).is_empty());
}

#[tokio::test]
async fn test_no_sample_is_data_unavailable_not_error() {
    let venue = Arc::new(SimVenue::new());
    let mut orch = orchestrator(test_config(&["BTCUSDT"], 1), &venue);
    venue.set_account(dec!(10000), dec!(10000));
    venue.fail_market_data(true);

    let report = orch.run_cycle(ts(0)).await;
    assert!(matches!(
        report.outcome_for(&btc()),
        Some(SymbolOutcome::DataUnavailable)
    ));
    assert_eq!(venue.placed_order_count(), 0);
}

#[tokio::test]
async fn test_dca_add_from_protected_position() {
    let venue = Arc::new(SimVenue::new());
    let mut config = test_config(&["BTCUSDT"], 1);
    config.dca = DcaConfig {
        drawdown_thresholds: vec![0.05],
        size_multipliers: vec![0.5],
        max_stages: 1,
    };
    // Keep the reversal close out of the way while price drops.
    config.thresholds.close = 0.95;
    let mut orch = orchestrator(config, &venue);
    open_long(&mut orch, &venue).await;
    let before = venue.position_of(&btc()).unwrap();

    // 6% drawdown with bullish flow: the DCA ladder fires stage 0.
    venue.push_sample(sample(&btc(), 120, dec!(94), 1.0));
    let report = orch.run_cycle(ts(120)).await;
    match report.outcome_for(&btc()) {
        Some(SymbolOutcome::Added {
            status: ExecStatus::Success,
        }) => {}
        other => panic!("expected DCA add, got {other:?}"),
    }

    let after = venue.position_of(&btc()).unwrap();
    assert!(after.quantity > before.quantity);
    let snap = orch.book().get(&btc()).unwrap();
    assert_eq!(snap.dca_stage, 1);
    assert_eq!(snap.state, LifecycleState::OpenProtected);
    // Protection resized to the grown quantity.
    let orders = venue.open_orders_of(&btc());
    assert_eq!(orders.len(), 2);
    assert!(orders.iter().all(|o| o.quantity == after.quantity));

    // The same drawdown does not fire the (exhausted) ladder again.
    venue.push_sample(sample(&btc(), 180, dec!(94), 1.0));
    let report = orch.run_cycle(ts(180)).await;
    assert!(matches!(
        report.outcome_for(&btc()),
        Some(SymbolOutcome::Held { .. })
    ));
}
