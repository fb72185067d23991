//! Account-level circuit breaker.
//!
//! Tracks daily realized PnL% and the consecutive-loss streak. Crossing
//! either threshold arms an independent cooldown; the two breakers have
//! separate clocks. Any active cooldown blocks all OPEN/ADD proposals
//! cycle-wide; CLOSE is never blocked.
//!
//! The guard state is an explicit, injectable object owned by the
//! orchestrator and mutated exactly once per cycle, never a hidden
//! singleton. Daily counters reset at the UTC day boundary; the loss streak
//! resets on a winning close.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::RiskConfig;

/// Which breaker armed a cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitBreakerKind {
    DailyLoss,
    LossStreak,
}

impl std::fmt::Display for CircuitBreakerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerKind::DailyLoss => write!(f, "daily_loss"),
            CircuitBreakerKind::LossStreak => write!(f, "loss_streak"),
        }
    }
}

/// Active cooldowns blocking entries, most distant expiry first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitOpen {
    pub breakers: Vec<(CircuitBreakerKind, DateTime<Utc>)>,
}

impl std::fmt::Display for CircuitOpen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .breakers
            .iter()
            .map(|(kind, until)| format!("{kind} until {until}"))
            .collect();
        write!(f, "{}", parts.join(", "))
    }
}

/// Long-lived guard counters. Serializable so an embedding process can
/// persist them across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskGuardState {
    pub day: NaiveDate,
    pub day_start_equity: Decimal,
    pub realized_pnl_today: Decimal,
    pub consecutive_losses: u32,
    pub daily_cooldown_until: Option<DateTime<Utc>>,
    pub streak_cooldown_until: Option<DateTime<Utc>>,
}

impl RiskGuardState {
    pub fn new(day: NaiveDate, day_start_equity: Decimal) -> Self {
        Self {
            day,
            day_start_equity,
            realized_pnl_today: Decimal::ZERO,
            consecutive_losses: 0,
            daily_cooldown_until: None,
            streak_cooldown_until: None,
        }
    }

    /// Realized PnL today as a percent of day-start equity.
    pub fn daily_pnl_pct(&self) -> f64 {
        if self.day_start_equity <= Decimal::ZERO {
            return 0.0;
        }
        ((self.realized_pnl_today / self.day_start_equity) * Decimal::ONE_HUNDRED)
            .to_f64()
            .unwrap_or(0.0)
    }
}

/// Evaluates the account circuit breaker once per cycle.
#[derive(Debug, Clone)]
pub struct RiskGuard {
    config: RiskConfig,
    state: RiskGuardState,
}

impl RiskGuard {
    pub fn new(config: RiskConfig, now: DateTime<Utc>, equity: Decimal) -> Self {
        Self {
            config,
            state: RiskGuardState::new(now.date_naive(), equity),
        }
    }

    /// Rebuild around previously persisted state.
    pub fn with_state(config: RiskConfig, state: RiskGuardState) -> Self {
        Self { config, state }
    }

    pub fn state(&self) -> &RiskGuardState {
        &self.state
    }

    /// Per-cycle refresh: roll the UTC day boundary and arm any breaker
    /// whose threshold is crossed. Called exactly once per cycle, before any
    /// symbol is processed.
    pub fn refresh(&mut self, equity: Decimal, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today != self.state.day {
            info!(day = %today, %equity, "risk guard: daily counters reset");
            self.state.day = today;
            self.state.day_start_equity = equity;
            self.state.realized_pnl_today = Decimal::ZERO;
        } else if self.state.day_start_equity <= Decimal::ZERO {
            self.state.day_start_equity = equity;
        }

        // Daily-loss breaker: its own clock.
        let daily_loss_pct = -self.state.daily_pnl_pct();
        let daily_active = self
            .state
            .daily_cooldown_until
            .is_some_and(|until| until > now);
        if !daily_active && daily_loss_pct >= self.config.max_daily_loss_pct {
            let until = now + Duration::seconds(self.config.daily_loss_cooldown_secs as i64);
            warn!(
                loss_pct = daily_loss_pct,
                limit_pct = self.config.max_daily_loss_pct,
                %until,
                "risk guard: daily-loss breaker armed"
            );
            self.state.daily_cooldown_until = Some(until);
        }

        // Streak breaker: independent clock.
        let streak_active = self
            .state
            .streak_cooldown_until
            .is_some_and(|until| until > now);
        if !streak_active && self.state.consecutive_losses >= self.config.max_consecutive_losses {
            let until = now + Duration::seconds(self.config.consecutive_loss_cooldown_secs as i64);
            warn!(
                streak = self.state.consecutive_losses,
                limit = self.config.max_consecutive_losses,
                %until,
                "risk guard: loss-streak breaker armed"
            );
            self.state.streak_cooldown_until = Some(until);
        }
    }

    /// Record a realized close result. A win resets the loss streak.
    pub fn record_close(&mut self, realized_pnl: Decimal) {
        self.state.realized_pnl_today += realized_pnl;
        if realized_pnl < Decimal::ZERO {
            self.state.consecutive_losses += 1;
        } else {
            self.state.consecutive_losses = 0;
        }
    }

    /// Active cooldowns, if any. Entries are blocked while this is `Some`;
    /// closes always proceed.
    pub fn entries_blocked(&self, now: DateTime<Utc>) -> Option<CircuitOpen> {
        let mut breakers = Vec::new();
        if let Some(until) = self.state.daily_cooldown_until {
            if until > now {
                breakers.push((CircuitBreakerKind::DailyLoss, until));
            }
        }
        if let Some(until) = self.state.streak_cooldown_until {
            if until > now {
                breakers.push((CircuitBreakerKind::LossStreak, until));
            }
        }
        if breakers.is_empty() {
            None
        } else {
            breakers.sort_by_key(|(_, until)| std::cmp::Reverse(*until));
            Some(CircuitOpen { breakers })
        }
    }
}
