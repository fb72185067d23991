//! Simulated venue for paper runs and tests.
//!
//! One object implements all three collaborator traits with scripted
//! behavior: queued market samples, optional forced rejections, TP/SL
//! placement failures and canned acks. Fills maintain an internal position
//! book so the account provider answers authoritatively, the way a real
//! venue would.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;

use flow_common::{PositionSide, Symbol};

use crate::market::RawSample;

use super::{
    AccountProvider, AccountState, ExecutionVenue, MarketDataProvider, OpenOrder, OrderAck,
    OrderForm, OrderKind, OrderRejectReason, ProtectionAck, ProtectiveKind, SymbolMeta,
    VenueError, VenuePosition,
};

#[derive(Debug, Default)]
struct SimState {
    samples: HashMap<Symbol, VecDeque<RawSample>>,
    last_sample: HashMap<Symbol, RawSample>,
    marks: HashMap<Symbol, Decimal>,
    positions: HashMap<Symbol, VenuePosition>,
    open_orders: HashMap<Symbol, Vec<OpenOrder>>,
    account: Option<AccountState>,
    meta: HashMap<Symbol, SymbolMeta>,

    // Scripting knobs.
    scripted_acks: VecDeque<OrderAck>,
    reject_ioc_remaining: u32,
    fail_take_profit: bool,
    fail_stop_loss: bool,
    fail_leverage_sync: bool,
    fail_market_data: bool,

    // Counters for assertions.
    placed: Vec<OrderForm>,
    cancel_all_calls: HashMap<Symbol, u32>,
    leverage_calls: Vec<(Symbol, u32)>,
}

/// Scripted in-memory venue.
#[derive(Debug, Default)]
pub struct SimVenue {
    state: Mutex<SimState>,
    order_seq: AtomicU64,
}

impl SimVenue {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_order_id(&self) -> String {
        let n = self.order_seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("sim-{n}")
    }

    // ------------------------------------------------------------------
    // Scripting API
    // ------------------------------------------------------------------

    /// Queue a market sample; repeated polls replay the last sample once
    /// the queue drains.
    pub fn push_sample(&self, sample: RawSample) {
        let mut s = self.state.lock().unwrap();
        s.marks.insert(sample.symbol.clone(), sample.price);
        s.samples
            .entry(sample.symbol.clone())
            .or_default()
            .push_back(sample);
    }

    pub fn set_account(&self, equity: Decimal, available_margin: Decimal) {
        self.state.lock().unwrap().account = Some(AccountState {
            equity,
            available_margin,
        });
    }

    pub fn set_mark(&self, symbol: &Symbol, price: Decimal) {
        self.state.lock().unwrap().marks.insert(symbol.clone(), price);
    }

    pub fn set_symbol_meta(&self, symbol: &Symbol, meta: SymbolMeta) {
        self.state.lock().unwrap().meta.insert(symbol.clone(), meta);
    }

    /// Force an existing position, as if it predated this session.
    pub fn seed_position(&self, position: VenuePosition) {
        let mut s = self.state.lock().unwrap();
        s.positions.insert(position.symbol.clone(), position);
    }

    /// Reject the next `n` IOC orders with a no-liquidity ack.
    pub fn reject_ioc_next(&self, n: u32) {
        self.state.lock().unwrap().reject_ioc_remaining = n;
    }

    /// Queue an explicit ack consumed by the next placement.
    pub fn script_ack(&self, ack: OrderAck) {
        self.state.lock().unwrap().scripted_acks.push_back(ack);
    }

    pub fn fail_take_profit(&self, fail: bool) {
        self.state.lock().unwrap().fail_take_profit = fail;
    }

    pub fn fail_stop_loss(&self, fail: bool) {
        self.state.lock().unwrap().fail_stop_loss = fail;
    }

    pub fn fail_leverage_sync(&self, fail: bool) {
        self.state.lock().unwrap().fail_leverage_sync = fail;
    }

    pub fn fail_market_data(&self, fail: bool) {
        self.state.lock().unwrap().fail_market_data = fail;
    }

    // ------------------------------------------------------------------
    // Assertion helpers
    // ------------------------------------------------------------------

    pub fn placed_orders(&self) -> Vec<OrderForm> {
        self.state.lock().unwrap().placed.clone()
    }

    pub fn placed_order_count(&self) -> usize {
        self.state.lock().unwrap().placed.len()
    }

    pub fn cancel_all_count(&self, symbol: &Symbol) -> u32 {
        self.state
            .lock()
            .unwrap()
            .cancel_all_calls
            .get(symbol)
            .copied()
            .unwrap_or(0)
    }

    pub fn position_of(&self, symbol: &Symbol) -> Option<VenuePosition> {
        self.state.lock().unwrap().positions.get(symbol).cloned()
    }

    pub fn open_orders_of(&self, symbol: &Symbol) -> Vec<OpenOrder> {
        self.state
            .lock()
            .unwrap()
            .open_orders
            .get(symbol)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop resting protective orders without touching the position, to
    /// simulate externally cancelled or consumed TP/SL legs.
    pub fn drop_protective_orders(&self, symbol: &Symbol) {
        let mut s = self.state.lock().unwrap();
        if let Some(orders) = s.open_orders.get_mut(symbol) {
            orders.retain(|o| o.protective.is_none());
        }
    }

    // ------------------------------------------------------------------
    // Fill mechanics
    // ------------------------------------------------------------------

    fn apply_fill(state: &mut SimState, form: &OrderForm, quantity: Decimal, price: Decimal) {
        if form.reduce_only {
            if let Some(pos) = state.positions.get_mut(&form.symbol) {
                pos.quantity -= quantity;
                if pos.quantity <= Decimal::ZERO {
                    state.positions.remove(&form.symbol);
                }
            }
            return;
        }
        match state.positions.get_mut(&form.symbol) {
            Some(pos) if pos.side == form.position_side => {
                // Weighted-average entry on adds.
                let old_notional = pos.entry_price * pos.quantity;
                let add_notional = price * quantity;
                pos.quantity += quantity;
                if pos.quantity > Decimal::ZERO {
                    pos.entry_price = (old_notional + add_notional) / pos.quantity;
                }
            }
            _ => {
                state.positions.insert(
                    form.symbol.clone(),
                    VenuePosition {
                        symbol: form.symbol.clone(),
                        side: form.position_side,
                        quantity,
                        entry_price: price,
                    },
                );
            }
        }
    }
}

#[async_trait]
impl MarketDataProvider for SimVenue {
    async fn poll(&self, symbol: &Symbol) -> Option<RawSample> {
        let mut s = self.state.lock().unwrap();
        if s.fail_market_data {
            return None;
        }
        if let Some(sample) = s.samples.get_mut(symbol).and_then(|q| q.pop_front()) {
            s.last_sample.insert(symbol.clone(), sample.clone());
            return Some(sample);
        }
        s.last_sample.get(symbol).cloned()
    }
}

#[async_trait]
impl AccountProvider for SimVenue {
    async fn position(&self, symbol: &Symbol) -> Result<Option<VenuePosition>, VenueError> {
        Ok(self.state.lock().unwrap().positions.get(symbol).cloned())
    }

    async fn account(&self) -> Result<AccountState, VenueError> {
        self.state
            .lock()
            .unwrap()
            .account
            .ok_or_else(|| VenueError::Transport("account state not scripted".into()))
    }

    async fn open_orders(&self, symbol: &Symbol) -> Result<Vec<OpenOrder>, VenueError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .open_orders
            .get(symbol)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl ExecutionVenue for SimVenue {
    async fn place_order(&self, form: &OrderForm) -> Result<OrderAck, VenueError> {
        let mut s = self.state.lock().unwrap();
        s.placed.push(form.clone());

        if let Some(ack) = s.scripted_acks.pop_front() {
            let filled = ack.filled_quantity();
            if filled > Decimal::ZERO {
                let price = ack
                    .fill_price()
                    .or_else(|| form.kind.price())
                    .or_else(|| s.marks.get(&form.symbol).copied())
                    .unwrap_or_default();
                Self::apply_fill(&mut s, form, filled, price);
            }
            return Ok(ack);
        }

        if form.reduce_only && !s.positions.contains_key(&form.symbol) {
            return Ok(OrderAck::Rejected {
                reason: OrderRejectReason::ReduceOnlyRejected,
            });
        }

        match form.kind {
            OrderKind::LimitIoc { price } => {
                if s.reject_ioc_remaining > 0 {
                    s.reject_ioc_remaining -= 1;
                    return Ok(OrderAck::Rejected {
                        reason: OrderRejectReason::NoLiquidity,
                    });
                }
                let quantity = if form.reduce_only {
                    // Cannot fill more than the position holds.
                    s.positions
                        .get(&form.symbol)
                        .map(|p| p.quantity.min(form.quantity))
                        .unwrap_or(form.quantity)
                } else {
                    form.quantity
                };
                Self::apply_fill(&mut s, form, quantity, price);
                Ok(OrderAck::Filled {
                    order_id: self.next_order_id(),
                    quantity,
                    price,
                })
            }
            OrderKind::Market => {
                let price = s
                    .marks
                    .get(&form.symbol)
                    .copied()
                    .unwrap_or_else(|| form.kind.price().unwrap_or_default());
                let quantity = if form.reduce_only {
                    s.positions
                        .get(&form.symbol)
                        .map(|p| p.quantity.min(form.quantity))
                        .unwrap_or(form.quantity)
                } else {
                    form.quantity
                };
                Self::apply_fill(&mut s, form, quantity, price);
                Ok(OrderAck::Filled {
                    order_id: self.next_order_id(),
                    quantity,
                    price,
                })
            }
            OrderKind::LimitGtc { price } => {
                let order_id = self.next_order_id();
                s.open_orders
                    .entry(form.symbol.clone())
                    .or_default()
                    .push(OpenOrder {
                        order_id: order_id.clone(),
                        symbol: form.symbol.clone(),
                        side: form.side,
                        quantity: form.quantity,
                        price: Some(price),
                        reduce_only: form.reduce_only,
                        protective: None,
                        created_at: Utc::now(),
                    });
                Ok(OrderAck::Resting { order_id })
            }
        }
    }

    async fn place_protection(
        &self,
        symbol: &Symbol,
        side: PositionSide,
        quantity: Decimal,
        take_profit: Option<Decimal>,
        stop_loss: Option<Decimal>,
    ) -> Result<ProtectionAck, VenueError> {
        let mut s = self.state.lock().unwrap();
        let mut ack = ProtectionAck::default();

        let mut place_leg = |s: &mut SimState,
                             kind: ProtectiveKind,
                             price: Decimal,
                             id: String| {
            s.open_orders.entry(symbol.clone()).or_default().push(OpenOrder {
                order_id: id.clone(),
                symbol: symbol.clone(),
                side: side.close_side(),
                quantity,
                price: Some(price),
                reduce_only: true,
                protective: Some(kind),
                created_at: Utc::now(),
            });
            id
        };

        if let Some(tp) = take_profit {
            if !s.fail_take_profit {
                let id = self.next_order_id();
                ack.tp_order_id = Some(place_leg(&mut s, ProtectiveKind::TakeProfit, tp, id));
            }
        }
        if let Some(sl) = stop_loss {
            if !s.fail_stop_loss {
                let id = self.next_order_id();
                ack.sl_order_id = Some(place_leg(&mut s, ProtectiveKind::StopLoss, sl, id));
            }
        }
        Ok(ack)
    }

    async fn cancel_order(&self, symbol: &Symbol, order_id: &str) -> Result<(), VenueError> {
        let mut s = self.state.lock().unwrap();
        if let Some(orders) = s.open_orders.get_mut(symbol) {
            orders.retain(|o| o.order_id != order_id);
        }
        Ok(())
    }

    async fn cancel_all(&self, symbol: &Symbol) -> Result<(), VenueError> {
        let mut s = self.state.lock().unwrap();
        *s.cancel_all_calls.entry(symbol.clone()).or_insert(0) += 1;
        s.open_orders.remove(symbol);
        Ok(())
    }

    async fn set_leverage(&self, symbol: &Symbol, leverage: u32) -> Result<u32, VenueError> {
        let mut s = self.state.lock().unwrap();
        if s.fail_leverage_sync {
            return Err(VenueError::Refused("leverage sync failed".into()));
        }
        s.leverage_calls.push((symbol.clone(), leverage));
        Ok(leverage)
    }

    async fn symbol_meta(&self, symbol: &Symbol) -> Result<SymbolMeta, VenueError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .meta
            .get(symbol)
            .copied()
            .unwrap_or(SymbolMeta {
                min_notional: Decimal::new(5, 0),
                qty_step: Decimal::new(1, 3),
            }))
    }
}
