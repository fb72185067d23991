//! Shared primitive types for the fund-flow perpetual-futures trading bot.
//!
//! Convention across the workspace: all prices, quantities and notionals
//! use `rust_decimal::Decimal`, never f64 for financial math. Dimensionless
//! indicator metrics and scores stay f64.

pub mod types;

pub use types::{PositionSide, Side, Symbol, Timeframe, TimeframeParseError};
