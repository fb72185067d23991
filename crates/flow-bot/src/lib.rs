//! Fund-flow perpetual-futures trading pipeline.
//!
//! Each cycle classifies market regime, scores directional signals, filters
//! them through dedup/edge-trigger rules, validates them against account
//! risk limits, and places orders through bounded retry-and-fallback chains
//! while guaranteeing a position is never left financially unprotected.
//!
//! ## Architecture
//!
//! - **Single-writer cycle loop**: all mutable state (risk guard, EMA
//!   baselines, edge machines, position book) is owned by the
//!   [`orchestrator::CycleOrchestrator`] and mutated once per cycle
//! - **Venue is truth**: local position snapshots are advisory and are
//!   recalibrated against the venue before any loss-sensitive decision
//! - **Degrade chains as data**: retry/fallback behavior is an ordered list
//!   of tagged strategies interpreted by the execution router
//!
//! ## Modules
//!
//! - `config`: TOML configuration with fail-fast validation
//! - `market`: multi-timeframe rolling aggregates from raw samples
//! - `decision`: regime classification and directional scoring
//! - `trigger`: dedup and signal-pool/edge filtering
//! - `risk`: pre-trade checks and the account circuit breaker
//! - `execution`: open/close/add/flatten paths with degrade chains
//! - `position`: the position lifecycle state machine
//! - `orchestrator`: per-cycle sequencing across symbols
//! - `venue`: external collaborator traits plus the simulated venue
//! - `audit`: structured decision/execution records

pub mod audit;
pub mod config;
pub mod decision;
pub mod error;
pub mod execution;
pub mod market;
pub mod orchestrator;
pub mod position;
pub mod risk;
pub mod trigger;
pub mod venue;

pub use audit::{DecisionAudit, DecisionRecord, ExecutionRecord, JsonlAudit, NullAudit};
pub use config::BotConfig;
pub use decision::{Regime, RegimeClassifier, RegimeState, ScoreResult, ScoringEngine, TradeIntent};
pub use error::PipelineError;
pub use execution::{ExecStatus, ExecutionReport, ExecutionRouter, ProtectionStatus};
pub use market::{MarketContextAggregator, MarketSnapshot, RawSample, TrendFilter};
pub use orchestrator::{CycleOrchestrator, CycleReport, SymbolOutcome};
pub use position::{Coverage, LifecycleState, PositionBook, PositionSnapshot};
pub use risk::{CircuitBreakerKind, CircuitOpen, PreTradeChecker, RiskGuard, RiskGuardState};
pub use trigger::{GateDecision, GateReason, TriggerGate, TriggerKind};
pub use venue::{
    sim::SimVenue, AccountProvider, AccountState, ExecutionVenue, MarketDataProvider, OpenOrder,
    OrderAck, OrderForm, OrderKind, ProtectionAck, VenueError, VenuePosition,
};
