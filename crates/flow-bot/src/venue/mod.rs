//! External collaborator interfaces.
//!
//! The pipeline is designed around polling confirmation, not push
//! notifications: every call is synchronous from the cycle's perspective and
//! the venue is the sole source of truth for position and order state. Local
//! caches are advisory and must be revalidated before any loss-sensitive
//! sizing decision.
//!
//! Implementations:
//! - a live exchange adapter lives outside this crate;
//! - [`sim::SimVenue`] provides scripted fills for paper runs and tests.

pub mod sim;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use flow_common::{PositionSide, Side, Symbol};

use crate::market::RawSample;

/// Transport/venue failure. Order *rejections* are data, not errors; they
/// come back inside [`OrderAck`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VenueError {
    #[error("venue transport failure: {0}")]
    Transport(String),
    #[error("venue refused request: {0}")]
    Refused(String),
}

/// Order flavor. Every reduce-class order must set the reduce-only flag on
/// its [`OrderForm`]; the kind only selects pricing behavior.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    /// Aggressive limit, immediate-or-cancel.
    LimitIoc { price: Decimal },
    /// Resting limit, good-till-cancelled.
    LimitGtc { price: Decimal },
}

impl OrderKind {
    pub fn tag(&self) -> &'static str {
        match self {
            OrderKind::Market => "MARKET",
            OrderKind::LimitIoc { .. } => "LIMIT_IOC",
            OrderKind::LimitGtc { .. } => "LIMIT_GTC",
        }
    }

    pub fn price(&self) -> Option<Decimal> {
        match self {
            OrderKind::Market => None,
            OrderKind::LimitIoc { price } | OrderKind::LimitGtc { price } => Some(*price),
        }
    }
}

/// A fully specified order request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderForm {
    pub client_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub position_side: PositionSide,
    pub quantity: Decimal,
    pub kind: OrderKind,
    /// Guarantees the order can only shrink the position, never grow or
    /// flip it.
    pub reduce_only: bool,
}

impl OrderForm {
    fn new(
        symbol: Symbol,
        side: Side,
        position_side: PositionSide,
        quantity: Decimal,
        kind: OrderKind,
        reduce_only: bool,
    ) -> Self {
        Self {
            client_id: Uuid::new_v4().to_string(),
            symbol,
            side,
            position_side,
            quantity,
            kind,
            reduce_only,
        }
    }

    /// Aggressive IOC limit.
    pub fn limit_ioc(
        symbol: Symbol,
        side: Side,
        position_side: PositionSide,
        quantity: Decimal,
        price: Decimal,
        reduce_only: bool,
    ) -> Self {
        Self::new(
            symbol,
            side,
            position_side,
            quantity,
            OrderKind::LimitIoc { price },
            reduce_only,
        )
    }

    /// Resting GTC limit.
    pub fn limit_gtc(
        symbol: Symbol,
        side: Side,
        position_side: PositionSide,
        quantity: Decimal,
        price: Decimal,
        reduce_only: bool,
    ) -> Self {
        Self::new(
            symbol,
            side,
            position_side,
            quantity,
            OrderKind::LimitGtc { price },
            reduce_only,
        )
    }

    /// Market order.
    pub fn market(
        symbol: Symbol,
        side: Side,
        position_side: PositionSide,
        quantity: Decimal,
        reduce_only: bool,
    ) -> Self {
        Self::new(
            symbol,
            side,
            position_side,
            quantity,
            OrderKind::Market,
            reduce_only,
        )
    }
}

/// Why the venue refused an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrderRejectReason {
    /// Nothing to match against at the requested price.
    NoLiquidity,
    /// A reduce-only order found no position to reduce.
    ReduceOnlyRejected,
    BelowMinNotional { min: Decimal },
    Other(String),
}

impl OrderRejectReason {
    /// Rejections the fallback chain may retry against.
    pub fn is_no_liquidity(&self) -> bool {
        matches!(self, OrderRejectReason::NoLiquidity)
    }
}

/// Venue response to an order placement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrderAck {
    Filled {
        order_id: String,
        quantity: Decimal,
        price: Decimal,
    },
    PartiallyFilled {
        order_id: String,
        filled_quantity: Decimal,
        avg_price: Decimal,
        remaining: Decimal,
    },
    /// A GTC order accepted onto the book without (full) execution.
    Resting { order_id: String },
    Rejected { reason: OrderRejectReason },
}

impl OrderAck {
    /// Quantity executed by this ack, zero for resting/rejected.
    pub fn filled_quantity(&self) -> Decimal {
        match self {
            OrderAck::Filled { quantity, .. } => *quantity,
            OrderAck::PartiallyFilled {
                filled_quantity, ..
            } => *filled_quantity,
            _ => Decimal::ZERO,
        }
    }

    pub fn fill_price(&self) -> Option<Decimal> {
        match self {
            OrderAck::Filled { price, .. } => Some(*price),
            OrderAck::PartiallyFilled { avg_price, .. } => Some(*avg_price),
            _ => None,
        }
    }

    pub fn is_filled(&self) -> bool {
        self.filled_quantity() > Decimal::ZERO
    }

    pub fn is_resting(&self) -> bool {
        matches!(self, OrderAck::Resting { .. })
    }

    pub fn reject_reason(&self) -> Option<&OrderRejectReason> {
        match self {
            OrderAck::Rejected { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Result of a protective-order placement. Either leg can fail
/// independently; completeness is judged by the caller against what it
/// requested.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtectionAck {
    pub tp_order_id: Option<String>,
    pub sl_order_id: Option<String>,
}

/// Authoritative position as reported by the venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenuePosition {
    pub symbol: Symbol,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub entry_price: Decimal,
}

/// Account equity and margin headroom.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
    pub equity: Decimal,
    pub available_margin: Decimal,
}

/// Classification of a resting protective order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtectiveKind {
    TakeProfit,
    StopLoss,
}

/// One resting order as listed by the venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub reduce_only: bool,
    /// Set when this is a conditional TP/SL order.
    pub protective: Option<ProtectiveKind>,
    pub created_at: DateTime<Utc>,
}

/// Exchange metadata needed for sizing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SymbolMeta {
    pub min_notional: Decimal,
    /// Quantity step; quantities are truncated to a multiple of it.
    pub qty_step: Decimal,
}

impl SymbolMeta {
    /// Truncate a quantity down to the step grid.
    pub fn round_qty(&self, qty: Decimal) -> Decimal {
        if self.qty_step <= Decimal::ZERO {
            return qty;
        }
        (qty / self.qty_step).floor() * self.qty_step
    }
}

/// Per-symbol market data polling.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// One poll. A transient upstream failure yields `None`, never a
    /// fabricated sample.
    async fn poll(&self, symbol: &Symbol) -> Option<RawSample>;
}

/// Authoritative account and position state.
#[async_trait]
pub trait AccountProvider: Send + Sync {
    async fn position(&self, symbol: &Symbol) -> Result<Option<VenuePosition>, VenueError>;
    async fn account(&self) -> Result<AccountState, VenueError>;
    async fn open_orders(&self, symbol: &Symbol) -> Result<Vec<OpenOrder>, VenueError>;
}

/// Order execution venue.
#[async_trait]
pub trait ExecutionVenue: Send + Sync {
    async fn place_order(&self, form: &OrderForm) -> Result<OrderAck, VenueError>;

    /// Place TP/SL conditional orders sized to `quantity`.
    async fn place_protection(
        &self,
        symbol: &Symbol,
        side: PositionSide,
        quantity: Decimal,
        take_profit: Option<Decimal>,
        stop_loss: Option<Decimal>,
    ) -> Result<ProtectionAck, VenueError>;

    async fn cancel_order(&self, symbol: &Symbol, order_id: &str) -> Result<(), VenueError>;

    async fn cancel_all(&self, symbol: &Symbol) -> Result<(), VenueError>;

    /// Sync the symbol's leverage; returns the leverage actually applied.
    async fn set_leverage(&self, symbol: &Symbol, leverage: u32) -> Result<u32, VenueError>;

    async fn symbol_meta(&self, symbol: &Symbol) -> Result<SymbolMeta, VenueError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_order_form_constructors() {
        let form = OrderForm::limit_ioc(
            Symbol::new("BTCUSDT"),
            Side::Buy,
            PositionSide::Long,
            dec!(0.5),
            dec!(50000),
            false,
        );
        assert_eq!(form.kind.tag(), "LIMIT_IOC");
        assert_eq!(form.kind.price(), Some(dec!(50000)));
        assert!(!form.reduce_only);
        assert!(!form.client_id.is_empty());

        let market = OrderForm::market(
            Symbol::new("BTCUSDT"),
            Side::Sell,
            PositionSide::Long,
            dec!(0.5),
            true,
        );
        assert_eq!(market.kind.tag(), "MARKET");
        assert!(market.kind.price().is_none());
        assert!(market.reduce_only);
    }

    #[test]
    fn test_ack_accessors() {
        let filled = OrderAck::Filled {
            order_id: "1".into(),
            quantity: dec!(2),
            price: dec!(100),
        };
        assert!(filled.is_filled());
        assert_eq!(filled.filled_quantity(), dec!(2));
        assert_eq!(filled.fill_price(), Some(dec!(100)));

        let rejected = OrderAck::Rejected {
            reason: OrderRejectReason::NoLiquidity,
        };
        assert!(!rejected.is_filled());
        assert!(rejected.reject_reason().unwrap().is_no_liquidity());

        let resting = OrderAck::Resting {
            order_id: "2".into(),
        };
        assert!(resting.is_resting());
        assert_eq!(resting.filled_quantity(), Decimal::ZERO);
    }

    #[test]
    fn test_symbol_meta_rounding() {
        let meta = SymbolMeta {
            min_notional: dec!(5),
            qty_step: dec!(0.001),
        };
        assert_eq!(meta.round_qty(dec!(0.12345)), dec!(0.123));
        assert_eq!(meta.round_qty(dec!(0.0005)), dec!(0));
    }
}
