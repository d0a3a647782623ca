//! JSONL audit trail logging.
//!
//! Each rebalance pass appends events to an audit.jsonl file, one JSON
//! object per line.

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::order::OrderRecord;
use crate::plan::{RebalancePlan, SkippedSymbol};
use crate::reconcile::AccountSnapshot;
use crate::risk::RiskReport;

/// An audit event written to the JSONL trail.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub event: &'static str,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub data: serde_json::Value,
}

/// Append-only audit logger.
pub struct AuditLog {
    writer: BufWriter<std::fs::File>,
}

impl AuditLog {
    /// Open (or create) the audit log file for appending.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    /// Log an event with arbitrary JSON data.
    pub fn log(&mut self, event: &'static str, data: serde_json::Value) -> Result<()> {
        let entry = AuditEvent {
            event,
            ts: Utc::now(),
            data,
        };
        let json = serde_json::to_string(&entry)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writeln!(self.writer, "{json}")?;
        self.writer.flush()?;
        Ok(())
    }

    /// Log a simple event with no additional data.
    pub fn log_simple(&mut self, event: &'static str) -> Result<()> {
        self.log(event, serde_json::json!({}))
    }
}

pub fn log_pass_started(audit: &mut AuditLog, pass_id: u64, scope: &str, symbols: usize) -> Result<()> {
    audit.log(
        "pass_started",
        serde_json::json!({
            "pass": pass_id,
            "scope": scope,
            "symbols": symbols,
        }),
    )
}

pub fn log_snapshot(audit: &mut AuditLog, snapshot: &AccountSnapshot) -> Result<()> {
    let positions: Vec<_> = snapshot
        .positions
        .iter()
        .map(|p| {
            serde_json::json!({
                "symbol": p.symbol.as_str(),
                "qty": p.quantity,
                "avg_cost": p.avg_cost_cents as f64 / 100.0,
                "value": p.market_value_cents as f64 / 100.0,
            })
        })
        .collect();

    audit.log(
        "snapshot",
        serde_json::json!({
            "taken_at": snapshot.taken_at,
            "nav": snapshot.nav_cents() as f64 / 100.0,
            "available": snapshot.cash.available_cents as f64 / 100.0,
            "frozen": snapshot.cash.frozen_cents as f64 / 100.0,
            "reported_frozen": snapshot.reported_frozen_cents as f64 / 100.0,
            "pending": snapshot.pending.len(),
            "positions": positions,
        }),
    )
}

pub fn log_plan(audit: &mut AuditLog, plan: &RebalancePlan, risk: &RiskReport) -> Result<()> {
    let checks: Vec<_> = risk
        .checks
        .iter()
        .map(|c| {
            serde_json::json!({
                "name": c.name,
                "status": c.status.to_string(),
                "detail": c.detail,
            })
        })
        .collect();

    audit.log(
        "plan",
        serde_json::json!({
            "nav": plan.nav_cents as f64 / 100.0,
            "sells": plan.sells,
            "buys": plan.buys,
            "risk_passed": !risk.has_failures(),
            "checks": checks,
        }),
    )
}

pub fn log_order_submitted(audit: &mut AuditLog, record: &OrderRecord) -> Result<()> {
    audit.log(
        "order_submitted",
        serde_json::json!({
            "symbol": record.intent.symbol.as_str(),
            "side": record.intent.side.to_string(),
            "qty": record.intent.quantity,
            "limit": record.intent.limit_price.map(|p| p.as_dollars()),
            "margin": record.intent.margin_pct,
            "broker_id": record.broker_id.map(|id| id.0),
            "attempts": record.attempts,
        }),
    )
}

pub fn log_order_terminal(audit: &mut AuditLog, record: &OrderRecord) -> Result<()> {
    audit.log(
        "order_terminal",
        serde_json::json!({
            "symbol": record.intent.symbol.as_str(),
            "side": record.intent.side.to_string(),
            "state": record.state.to_string(),
            "broker_id": record.broker_id.map(|id| id.0),
            "qty": record.intent.quantity,
            "filled": record.filled_quantity,
            "avg_price": record.avg_fill_price_cents as f64 / 100.0,
            "downgrades": record.downgrades,
            "note": record.note,
        }),
    )
}

/// An order cut off by a fatal broker error. It may still be working and is
/// kept for recovery.
pub fn log_order_interrupted(audit: &mut AuditLog, record: &OrderRecord, reason: &str) -> Result<()> {
    audit.log(
        "order_interrupted",
        serde_json::json!({
            "symbol": record.intent.symbol.as_str(),
            "side": record.intent.side.to_string(),
            "state": record.state.to_string(),
            "broker_id": record.broker_id.map(|id| id.0),
            "qty": record.intent.quantity,
            "filled": record.filled_quantity,
            "reason": reason,
        }),
    )
}

pub fn log_skipped(audit: &mut AuditLog, skip: &SkippedSymbol) -> Result<()> {
    audit.log(
        "symbol_skipped",
        serde_json::json!({
            "symbol": skip.symbol.as_str(),
            "side": skip.side.map(|s| s.to_string()),
            "reason": skip.reason.to_string(),
        }),
    )
}

pub fn log_zombie_reattached(audit: &mut AuditLog, record: &OrderRecord) -> Result<()> {
    audit.log(
        "zombie_reattached",
        serde_json::json!({
            "symbol": record.intent.symbol.as_str(),
            "side": record.intent.side.to_string(),
            "qty": record.intent.quantity,
            "broker_id": record.broker_id.map(|id| id.0),
        }),
    )
}

pub fn log_pass_completed(
    audit: &mut AuditLog,
    pass_id: u64,
    submitted: usize,
    filled: usize,
    skipped: usize,
    errors: usize,
) -> Result<()> {
    audit.log(
        "pass_completed",
        serde_json::json!({
            "pass": pass_id,
            "submitted": submitted,
            "filled": filled,
            "skipped": skipped,
            "errors": errors,
        }),
    )
}

pub fn log_pass_aborted(audit: &mut AuditLog, pass_id: u64, reason: &str) -> Result<()> {
    audit.log(
        "pass_aborted",
        serde_json::json!({
            "pass": pass_id,
            "reason": reason,
        }),
    )
}
