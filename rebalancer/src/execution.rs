//! CLI workflows: preview → confirm → execute → drift.
//!
//! Each workflow connects to the configured broker, builds a [`Rebalancer`]
//! and prints what it did. Nothing is kept between invocations.

use std::sync::Arc;
use std::time::Duration;

use ledgerless::Symbol;
use ledgerless_broker::Broker;
use log::{info, warn};

use crate::audit::AuditLog;
use crate::broker::connect_broker;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::plan::format_plan;
use crate::rebalancer::{RebalanceReport, Rebalancer};
use crate::reconcile::AccountSnapshot;
use crate::schedule::{ScheduleSummary, Scheduler, StopHandle, stop_on_signal};
use crate::target::TargetSpec;

/// Options for a rebalance run.
pub struct RunOptions {
    pub dry_run: bool,
    pub force: bool,
    pub target_file: String,
}

/// How a single-symbol order states its target.
#[derive(Debug, Clone, Copy)]
pub enum OrderTarget {
    Percent(f64),
    ValueCents(i64),
}

/// Route Ctrl-C and SIGTERM into `stop`.
fn stop_on_interrupt(stop: StopHandle) {
    if let Err(e) = stop_on_signal(stop) {
        warn!("cannot install signal handlers ({e}); an interrupt will end the process at once");
    }
}

fn open_rebalancer(config: &Config) -> Result<Rebalancer> {
    let broker: Arc<dyn Broker> = connect_broker(config)?;
    let audit = AuditLog::open(&config.audit_path())?;
    let rebalancer = Rebalancer::new(broker, config.clone()).with_audit(audit);
    rebalancer.connect()?;
    Ok(rebalancer)
}

/// Execute a full rebalance run.
pub fn run(config: &Config, target: &TargetSpec, opts: &RunOptions) -> Result<()> {
    let targets = target.weights()?;
    let rebalancer = open_rebalancer(config)?;

    let (snapshot, plan, risk) = rebalancer.preview(&targets)?;
    print_account(config, &snapshot);
    display_positions(&snapshot);

    if plan.is_empty() {
        println!("\nNo rebalancing needed, portfolio matches target.");
        return Ok(());
    }

    println!("\n{}", format_plan(&plan, &snapshot));
    print!("{risk}");

    if risk.has_failures() {
        return Err(Error::RiskFailed(risk.failure_summary()));
    }

    if opts.dry_run {
        println!("\n[DRY RUN] No orders submitted.");
        return Ok(());
    }

    if !opts.force {
        let confirmed = dialoguer::Confirm::new()
            .with_prompt(format!("Execute {} orders from {}?", plan.order_count(), opts.target_file))
            .default(false)
            .interact()
            .map_err(|e| Error::Aborted(format!("confirmation prompt failed: {e}")))?;
        if !confirmed {
            return Err(Error::Aborted("Aborted.".into()));
        }
    }

    stop_on_interrupt(rebalancer.stop_handle());
    let report = rebalancer.execute_targets(&targets)?;
    print!("\n{report}");
    println!("Audit logged to {}", config.audit_path().display());

    info!("running post-execution drift check");
    let drift = rebalancer.drift(&targets)?;
    print!("\n{drift}");
    Ok(())
}

/// Move one symbol to a target percent or value.
pub fn order_target(config: &Config, symbol: Symbol, target: OrderTarget) -> Result<()> {
    let rebalancer = open_rebalancer(config)?;
    stop_on_interrupt(rebalancer.stop_handle());
    let report = match target {
        OrderTarget::Percent(pct) => rebalancer.order_target_percent(symbol, pct)?,
        OrderTarget::ValueCents(value) => rebalancer.order_target_value(symbol, value)?,
    };
    print!("{report}");
    Ok(())
}

/// Rebalance to `target` every `interval` until interrupted.
pub fn watch(
    config: &Config,
    target: &TargetSpec,
    interval: Duration,
    max_passes: Option<u64>,
) -> Result<ScheduleSummary> {
    let targets = target.weights()?;
    let stop = StopHandle::new();
    let rebalancer = open_rebalancer(config)?.with_stop_handle(stop.clone());
    stop_on_interrupt(stop.clone());

    let mut scheduler = Scheduler::new(interval, stop);
    if let Some(n) = max_passes {
        scheduler = scheduler.with_max_passes(n);
    }
    let summary = scheduler.run(|_| {
        let report: RebalanceReport = rebalancer.execute_targets(&targets)?;
        print!("{report}");
        Ok(report)
    })?;
    println!(
        "{} passes: {} completed, {} failed",
        summary.passes, summary.completed, summary.failed
    );
    Ok(summary)
}

/// Show current positions.
pub fn show_positions(config: &Config) -> Result<()> {
    let rebalancer = open_rebalancer(config)?;
    let snapshot = rebalancer.snapshot(&[])?;
    print_account(config, &snapshot);
    println!();
    display_positions(&snapshot);
    Ok(())
}

/// Check the broker session and report pending orders.
pub fn check_status(config: &Config) -> Result<()> {
    print!("Connecting to {:?} broker... ", config.broker.kind);
    let rebalancer = open_rebalancer(config)?;
    println!("OK");

    let snapshot = rebalancer.snapshot(&[])?;
    print_account(config, &snapshot);
    if snapshot.pending.is_empty() {
        println!("No working orders.");
    } else {
        println!("WORKING ORDERS:");
        for p in &snapshot.pending {
            println!(
                "  {:>6} {:4} {:8} {:>6} ({} remaining)",
                p.id.0, p.side, p.symbol, p.quantity, p.remaining
            );
        }
    }
    Ok(())
}

/// Compare actual positions against a target without trading.
pub fn run_reconcile(config: &Config, target: &TargetSpec) -> Result<()> {
    let targets = target.weights()?;
    let rebalancer = open_rebalancer(config)?;
    let drift = rebalancer.drift(&targets)?;
    print!("{drift}");
    Ok(())
}

// === Helpers ===

fn print_account(config: &Config, snapshot: &AccountSnapshot) {
    println!(
        "Account {}: ${:.2} NAV, ${:.2} available, ${:.2} frozen",
        config.account.id,
        snapshot.nav_cents() as f64 / 100.0,
        snapshot.cash.available_cents as f64 / 100.0,
        snapshot.cash.frozen_cents as f64 / 100.0,
    );
}

fn display_positions(snapshot: &AccountSnapshot) {
    if snapshot.positions.is_empty() {
        println!("No positions.");
        return;
    }

    println!("CURRENT PORTFOLIO:");
    for pos in &snapshot.positions {
        println!(
            "  {:8} {:>6} @ ${:>8.2} avg = ${:>10.2}  ({:.1}%)",
            pos.symbol,
            pos.quantity,
            pos.avg_cost_cents as f64 / 100.0,
            pos.market_value_cents as f64 / 100.0,
            snapshot.weight(&pos.symbol) * 100.0,
        );
    }
}
