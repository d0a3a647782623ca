//! Pre-trade plan checks.
//!
//! The sell phase is checked against the planning snapshot before anything
//! is submitted; the buy phase is checked against the post-sell snapshot.

use ledgerless::Side;
use serde::Serialize;

use crate::plan::RebalancePlan;
use crate::reconcile::AccountSnapshot;
use crate::sizing::OrderIntent;

/// Single trades above this fraction of NAV are flagged.
const LARGE_TRADE_PCT: f64 = 0.25;

/// Result of running a set of checks.
#[derive(Debug, Clone, Serialize)]
pub struct RiskReport {
    pub checks: Vec<RiskCheck>,
}

/// A single check result.
#[derive(Debug, Clone, Serialize)]
pub struct RiskCheck {
    pub name: &'static str,
    pub status: RiskStatus,
    pub detail: String,
}

/// Whether a check passed, warned, or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RiskStatus {
    Pass,
    Warn,
    Fail,
}

impl std::fmt::Display for RiskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskStatus::Pass => write!(f, "PASS"),
            RiskStatus::Warn => write!(f, "WARN"),
            RiskStatus::Fail => write!(f, "FAIL"),
        }
    }
}

impl RiskReport {
    /// True if any check failed (not just warned).
    pub fn has_failures(&self) -> bool {
        self.checks.iter().any(|c| c.status == RiskStatus::Fail)
    }

    /// True if any check warned.
    pub fn has_warnings(&self) -> bool {
        self.checks.iter().any(|c| c.status == RiskStatus::Warn)
    }

    /// Details of the failed checks, joined.
    pub fn failure_summary(&self) -> String {
        self.checks
            .iter()
            .filter(|c| c.status == RiskStatus::Fail)
            .map(|c| format!("{}: {}", c.name, c.detail))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl std::fmt::Display for RiskReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "RISK CHECKS:")?;
        for check in &self.checks {
            writeln!(f, "  [{}] {}: {}", check.status, check.name, check.detail)?;
        }
        Ok(())
    }
}

/// Checks run before the sell phase.
pub fn check_plan(
    plan: &RebalancePlan,
    snapshot: &AccountSnapshot,
    max_orders: usize,
) -> RiskReport {
    let mut checks = Vec::new();

    // 1. NAV must be positive to size anything
    let nav = snapshot.nav_cents();
    checks.push(RiskCheck {
        name: "NAV",
        status: if nav > 0 || plan.is_empty() {
            RiskStatus::Pass
        } else {
            RiskStatus::Fail
        },
        detail: format!("${:.2}", nav as f64 / 100.0),
    });

    // 2. No sell may exceed the held quantity
    let shorts: Vec<String> = plan
        .sells
        .iter()
        .filter(|s| s.quantity as i64 > snapshot.held(&s.symbol))
        .map(|s| format!("{} {} > {} held", s.symbol, s.quantity, snapshot.held(&s.symbol)))
        .collect();
    checks.push(RiskCheck {
        name: "No shorting",
        status: if shorts.is_empty() {
            RiskStatus::Pass
        } else {
            RiskStatus::Fail
        },
        detail: if shorts.is_empty() {
            "all sells within holdings".into()
        } else {
            shorts.join(", ")
        },
    });

    // 3. Orders over the per-run limit are skipped, not failed
    let count = plan.order_count();
    checks.push(RiskCheck {
        name: "Order count",
        status: if count > max_orders {
            RiskStatus::Warn
        } else {
            RiskStatus::Pass
        },
        detail: format!("{count} orders ({max_orders} max per run)"),
    });

    // 4. Large single trades
    let previews = plan.sells.iter().chain(plan.buys.iter().map(|b| &b.preview));
    checks.extend(large_trades(previews, nav));

    // 5. Allocation summary
    let long_sum: f64 = plan.targets.iter().map(|&(_, w)| w).sum();
    checks.push(RiskCheck {
        name: "Weight allocation",
        status: RiskStatus::Pass,
        detail: format!(
            "{:.1}% invested, {:.1}% cash",
            long_sum * 100.0,
            (1.0 - long_sum) * 100.0,
        ),
    });

    RiskReport { checks }
}

/// Checks run on the post-sell snapshot before the buy phase.
pub fn check_buys(buys: &[OrderIntent], snapshot: &AccountSnapshot) -> RiskReport {
    let mut checks = Vec::new();

    // 1. Frozen cash above available means the broker is already
    //    over-committed; buying now could overdraw the account.
    let available = snapshot.cash.available_cents;
    let frozen = snapshot.cash.frozen_cents;
    checks.push(RiskCheck {
        name: "Frozen cash",
        status: if frozen <= available {
            RiskStatus::Pass
        } else {
            RiskStatus::Fail
        },
        detail: format!(
            "${:.2} frozen of ${:.2} available",
            frozen as f64 / 100.0,
            available as f64 / 100.0
        ),
    });

    // 2. Oversubscribed buys are shrunk in order, later ones may be dropped
    let wanted: i64 = buys
        .iter()
        .filter(|b| b.side == Side::Buy)
        .map(OrderIntent::estimated_cost_cents)
        .sum();
    let free = snapshot.free_cash_cents();
    checks.push(RiskCheck {
        name: "Cash capacity",
        status: if wanted <= free {
            RiskStatus::Pass
        } else {
            RiskStatus::Warn
        },
        detail: format!(
            "${:.2} wanted, ${:.2} free{}",
            wanted as f64 / 100.0,
            free as f64 / 100.0,
            if wanted > free { " (buys shrink to fit)" } else { "" }
        ),
    });

    checks.extend(large_trades(buys.iter(), snapshot.nav_cents()));

    RiskReport { checks }
}

fn large_trades<'a>(intents: impl Iterator<Item = &'a OrderIntent>, nav: i64) -> Vec<RiskCheck> {
    let limit = (nav as f64 * LARGE_TRADE_PCT) as i64;
    intents
        .filter(|i| nav > 0 && i.estimated_cost_cents() > limit)
        .map(|i| RiskCheck {
            name: "Max trade size",
            status: RiskStatus::Warn,
            detail: format!(
                "{} {}: ${:.0} > {:.0}% of NAV",
                i.side,
                i.symbol,
                i.estimated_cost_cents() as f64 / 100.0,
                LARGE_TRADE_PCT * 100.0,
            ),
        })
        .collect()
}
