//! Structured decision and execution auditing.
//!
//! One record per decision and per execution attempt, with the inputs that
//! produced it. Audit failures must degrade, never block, a trading
//! decision: implementations swallow their own errors after logging them.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

use flow_common::Symbol;

use crate::execution::{ExecStatus, ExecutionReport};

/// A single trading decision with the inputs that led to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub timestamp: DateTime<Utc>,
    pub symbol: Symbol,
    pub trigger_kind: String,
    pub regime: String,
    pub regime_reason: String,
    pub long_score: Option<f64>,
    pub short_score: Option<f64>,
    pub action: String,
    pub reason: String,
    /// Trigger-gate verdict code, when the gate ran.
    pub gate: Option<String>,
}

/// One execution attempt and its terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub timestamp: DateTime<Utc>,
    pub symbol: Symbol,
    pub action: String,
    pub status: ExecStatus,
    pub filled_quantity: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub protection_complete: bool,
    pub attempt_tags: Vec<String>,
    pub error: Option<String>,
}

impl ExecutionRecord {
    /// Build a record from a router report.
    pub fn from_report(
        symbol: &Symbol,
        action: &str,
        report: &ExecutionReport,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            timestamp,
            symbol: symbol.clone(),
            action: action.to_string(),
            status: report.status,
            filled_quantity: report.filled_quantity,
            avg_fill_price: report.avg_fill_price,
            protection_complete: report.protection.is_complete(),
            attempt_tags: report
                .attempts
                .iter()
                .map(|a| a.strategy.tag().to_string())
                .collect(),
            error: report.error.as_ref().map(|e| e.to_string()),
        }
    }
}

/// Persistence/logging collaborator.
pub trait DecisionAudit: Send + Sync {
    fn record_decision(&self, record: &DecisionRecord);
    fn record_execution(&self, record: &ExecutionRecord);
}

/// Discards every record. Useful in tests and backfills.
#[derive(Debug, Default)]
pub struct NullAudit;

impl DecisionAudit for NullAudit {
    fn record_decision(&self, _record: &DecisionRecord) {}
    fn record_execution(&self, _record: &ExecutionRecord) {}
}

/// Appends JSON lines to a file. Write errors are logged and dropped so a
/// full disk cannot stall the cycle.
pub struct JsonlAudit {
    file: Mutex<File>,
}

impl JsonlAudit {
    pub fn create(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    fn append<T: Serialize>(&self, kind: &str, record: &T) {
        let line = match serde_json::to_string(record) {
            Ok(json) => json,
            Err(e) => {
                warn!(kind, error = %e, "audit serialization failed");
                return;
            }
        };
        let mut file = match self.file.lock() {
            Ok(f) => f,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(file, "{line}") {
            warn!(kind, error = %e, "audit write failed");
        }
    }
}

impl DecisionAudit for JsonlAudit {
    fn record_decision(&self, record: &DecisionRecord) {
        self.append("decision", record);
    }

    fn record_execution(&self, record: &ExecutionRecord) {
        self.append("execution", record);
    }
}
