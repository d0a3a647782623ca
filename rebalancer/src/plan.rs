//! CURRENT→TARGET plan: partition symbols into sells and buys from one
//! snapshot.
//!
//! Sells are sized here and executed as planned. Buys are only previewed:
//! they are re-sized from a fresh snapshot after the sells have settled.

use chrono::{DateTime, Utc};
use ledgerless::{Side, Symbol};
use serde::Serialize;

use crate::config::{Config, LotConfig};
use crate::reconcile::AccountSnapshot;
use crate::sizing::{OrderIntent, SkipReason, Sizing, compute_order_size};
use crate::target::TargetWeights;

/// Which symbols a pass may touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Scope {
    /// Every held symbol; anything absent from the targets is sold out.
    Portfolio,
    /// Only the listed symbols; other holdings are left alone.
    Listed,
}

/// Planning knobs taken from config.
#[derive(Debug, Clone)]
pub struct PlanPolicy {
    pub safety_margin_pct: f64,
    pub limit_offset_bps: u32,
    pub let_winners_run: bool,
    pub winner_tolerance: f64,
    pub drift_threshold: f64,
    pub min_trade_cents: i64,
    pub lots: LotConfig,
}

impl PlanPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            safety_margin_pct: config.execution.safety_margin_pct,
            limit_offset_bps: config.execution.limit_offset_bps,
            let_winners_run: config.policy.let_winners_run,
            winner_tolerance: config.policy.winner_tolerance,
            drift_threshold: config.policy.drift_threshold,
            min_trade_cents: config.policy.min_trade_cents(),
            lots: config.lots.clone(),
        }
    }

    /// Size one symbol, applying the limit offset and the trade filters.
    pub fn size(&self, symbol: Symbol, target_weight: f64, snapshot: &AccountSnapshot) -> Sizing {
        let lot = self.lots.lot_size(&symbol);
        let margin = if snapshot.weight(&symbol) > target_weight || target_weight == 0.0 {
            0.0
        } else {
            self.safety_margin_pct
        };
        match compute_order_size(symbol, target_weight, snapshot, lot, margin) {
            Sizing::Order(intent) => {
                if self.below_threshold(&intent, target_weight, snapshot) {
                    Sizing::Skip(SkipReason::BelowThreshold)
                } else {
                    Sizing::Order(intent.with_limit_offset(self.limit_offset_bps))
                }
            }
            skip => skip,
        }
    }

    /// Trades too small to matter. A full exit is never filtered.
    fn below_threshold(
        &self,
        intent: &OrderIntent,
        target_weight: f64,
        snapshot: &AccountSnapshot,
    ) -> bool {
        if target_weight == 0.0 {
            return false;
        }
        if intent.estimated_cost_cents() < self.min_trade_cents {
            return true;
        }
        let target_value = snapshot.nav_cents() as f64 * target_weight;
        let deviation = (target_value - snapshot.market_value_cents(&intent.symbol) as f64).abs();
        deviation < self.drift_threshold * target_value
    }

    /// Over target but left alone: within tolerance and in profit.
    fn winner_exempt(&self, symbol: &Symbol, target_weight: f64, snapshot: &AccountSnapshot) -> bool {
        self.let_winners_run
            && target_weight > 0.0
            && snapshot.weight(symbol) - target_weight <= self.winner_tolerance
            && snapshot.unrealized_pnl_cents(symbol) > 0
    }
}

/// A symbol that produced no order, and why.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedSymbol {
    pub symbol: Symbol,
    pub side: Option<Side>,
    pub reason: SkipReason,
}

/// A buy to be sized later from a fresh snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedBuy {
    pub symbol: Symbol,
    pub target_weight: f64,
    /// Sized from the planning snapshot, before sells; for display only.
    pub preview: OrderIntent,
}

/// The orders of one pass, computed from one snapshot. Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct RebalancePlan {
    pub nav_cents: i64,
    pub taken_at: DateTime<Utc>,
    pub scope: Scope,
    /// Every (symbol, target) the pass covers, in processing order.
    pub targets: Vec<(Symbol, f64)>,
    pub sells: Vec<OrderIntent>,
    pub buys: Vec<PlannedBuy>,
    pub skipped: Vec<SkippedSymbol>,
}

impl RebalancePlan {
    /// Partition the covered symbols into sells (over target, or target 0
    /// and held) and buys (under target).
    pub fn build(
        snapshot: &AccountSnapshot,
        targets: &TargetWeights,
        scope: Scope,
        policy: &PlanPolicy,
    ) -> Self {
        let mut covered: Vec<(Symbol, f64)> = targets.iter().collect();
        if scope == Scope::Portfolio {
            let mut extra: Vec<Symbol> = snapshot
                .positions
                .iter()
                .filter(|p| p.quantity != 0 && targets.get(&p.symbol).is_none())
                .map(|p| p.symbol)
                .collect();
            extra.sort();
            covered.extend(extra.into_iter().map(|s| (s, 0.0)));
        }

        let mut sells = Vec::new();
        let mut buys = Vec::new();
        let mut skipped = Vec::new();

        for &(symbol, target) in &covered {
            let current = snapshot.weight(&symbol);
            let side = if current > target || (target == 0.0 && snapshot.held(&symbol) > 0) {
                Side::Sell
            } else if current < target {
                Side::Buy
            } else {
                skipped.push(SkippedSymbol {
                    symbol,
                    side: None,
                    reason: SkipReason::NoChange,
                });
                continue;
            };

            if side == Side::Sell && policy.winner_exempt(&symbol, target, snapshot) {
                skipped.push(SkippedSymbol {
                    symbol,
                    side: Some(side),
                    reason: SkipReason::WinnerExempt,
                });
                continue;
            }

            match policy.size(symbol, target, snapshot) {
                Sizing::Order(intent) if intent.side == Side::Sell => sells.push(intent),
                Sizing::Order(intent) => buys.push(PlannedBuy {
                    symbol,
                    target_weight: target,
                    preview: intent,
                }),
                Sizing::Skip(reason) => skipped.push(SkippedSymbol {
                    symbol,
                    side: Some(side),
                    reason,
                }),
            }
        }

        Self {
            nav_cents: snapshot.nav_cents(),
            taken_at: snapshot.taken_at,
            scope,
            targets: covered,
            sells,
            buys,
            skipped,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sells.is_empty() && self.buys.is_empty()
    }

    pub fn order_count(&self) -> usize {
        self.sells.len() + self.buys.len()
    }

    /// Symbols the pass needs prices for.
    pub fn symbols(&self) -> Vec<Symbol> {
        self.targets.iter().map(|&(s, _)| s).collect()
    }
}

/// Describe a trade relative to the current holding.
pub fn trade_label(held: i64, side: Side, quantity: u64) -> &'static str {
    match side {
        Side::Buy if held == 0 => "open",
        Side::Buy => "increase",
        Side::Sell if quantity as i64 >= held => "close",
        Side::Sell => "decrease",
    }
}

/// Plan table for the CLI, labelled against the planning snapshot.
pub fn format_plan(plan: &RebalancePlan, snapshot: &AccountSnapshot) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    let _ = writeln!(out, "REBALANCE PLAN (NAV ${:.2}):", plan.nav_cents as f64 / 100.0);
    let _ = writeln!(
        out,
        "  {:>3}  {:6} {:12} {:>8} {:>12} {:>12}",
        "#", "Side", "Symbol", "Qty", "Price", "Notional"
    );
    let rows = plan
        .sells
        .iter()
        .chain(plan.buys.iter().map(|b| &b.preview));
    for (i, intent) in rows.enumerate() {
        let _ = writeln!(
            out,
            "  {:>3}  {:6} {:12} {:>8} {:>12} ${:>11.2}   ({})",
            i + 1,
            intent.side,
            intent.symbol,
            intent.quantity,
            intent.unit_price().to_string(),
            intent.estimated_cost_cents() as f64 / 100.0,
            trade_label(snapshot.held(&intent.symbol), intent.side, intent.quantity),
        );
    }
    if !plan.buys.is_empty() {
        let _ = writeln!(out, "  (buys are re-sized after sells settle)");
    }
    for skip in &plan.skipped {
        if skip.reason != SkipReason::NoChange {
            let _ = writeln!(out, "  skip {:12} {}", skip.symbol, skip.reason);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::tests::snapshot;
    use ledgerless::Price;

    fn sym(s: &str) -> Symbol {
        Symbol::new(s)
    }

    fn policy() -> PlanPolicy {
        PlanPolicy {
            safety_margin_pct: 0.02,
            limit_offset_bps: 0,
            let_winners_run: false,
            winner_tolerance: 0.05,
            drift_threshold: 0.0,
            min_trade_cents: 0,
            lots: LotConfig::default(),
        }
    }

    /// NAV $100k: A 60% at $100, B 10% at $50, $30k cash.
    fn account() -> AccountSnapshot {
        snapshot(
            100_000_00,
            30_000_00,
            &[("A", 600, 90_00, 100_00), ("B", 200, 40_00, 50_00)],
        )
    }

    #[test]
    fn partitions_sells_and_buys() {
        let targets = TargetWeights::from_pairs(&[("A", 0.5), ("B", 0.3)]).unwrap();
        let plan = RebalancePlan::build(&account(), &targets, Scope::Portfolio, &policy());

        assert_eq!(plan.sells.len(), 1);
        assert_eq!(plan.sells[0].symbol, sym("A"));
        assert_eq!(plan.sells[0].quantity, 100);
        assert_eq!(plan.buys.len(), 1);
        assert_eq!(plan.buys[0].symbol, sym("B"));
        // $20k gap shrunk 2% at $50
        assert_eq!(plan.buys[0].preview.quantity, 392);
        assert_eq!(plan.nav_cents, 100_000_00);
    }

    #[test]
    fn portfolio_scope_exits_untargeted() {
        let targets = TargetWeights::from_pairs(&[("A", 0.6)]).unwrap();
        let plan = RebalancePlan::build(&account(), &targets, Scope::Portfolio, &policy());
        assert_eq!(plan.sells.len(), 1);
        assert_eq!(plan.sells[0].symbol, sym("B"));
        assert_eq!(plan.sells[0].quantity, 200);
        assert!(plan.skipped.iter().any(|s| s.symbol == sym("A") && s.reason == SkipReason::NoChange));
    }

    #[test]
    fn listed_scope_leaves_others_alone() {
        let targets = TargetWeights::from_pairs(&[("B", 0.2)]).unwrap();
        let plan = RebalancePlan::build(&account(), &targets, Scope::Listed, &policy());
        assert!(plan.sells.is_empty());
        assert_eq!(plan.buys.len(), 1);
        assert_eq!(plan.targets, vec![(sym("B"), 0.2)]);
    }

    #[test]
    fn empty_targets_liquidate() {
        let targets = TargetWeights::new(Vec::new()).unwrap();
        let plan = RebalancePlan::build(&account(), &targets, Scope::Portfolio, &policy());
        assert_eq!(plan.sells.len(), 2);
        assert!(plan.buys.is_empty());
    }

    #[test]
    fn winners_run_within_tolerance() {
        let mut p = policy();
        p.let_winners_run = true;
        // A is 60% vs 57% target, bought at $90 now $100: exempt
        let targets = TargetWeights::from_pairs(&[("A", 0.57), ("B", 0.1)]).unwrap();
        let plan = RebalancePlan::build(&account(), &targets, Scope::Portfolio, &p);
        assert!(plan.sells.is_empty());
        assert!(plan.skipped.iter().any(|s| s.reason == SkipReason::WinnerExempt));

        // 10 points over is beyond tolerance
        let targets = TargetWeights::from_pairs(&[("A", 0.5), ("B", 0.1)]).unwrap();
        let plan = RebalancePlan::build(&account(), &targets, Scope::Portfolio, &p);
        assert_eq!(plan.sells.len(), 1);
    }

    #[test]
    fn losers_are_trimmed_even_with_winners_run() {
        let mut p = policy();
        p.let_winners_run = true;
        let snap = snapshot(100_000_00, 40_000_00, &[("A", 600, 120_00, 100_00)]);
        let targets = TargetWeights::from_pairs(&[("A", 0.57)]).unwrap();
        let plan = RebalancePlan::build(&snap, &targets, Scope::Portfolio, &p);
        assert_eq!(plan.sells.len(), 1);
    }

    #[test]
    fn small_drift_is_filtered() {
        let mut p = policy();
        p.drift_threshold = 0.1;
        // B 10% vs 10.5% target: 0.5 points is under 10% of target
        let targets = TargetWeights::from_pairs(&[("A", 0.6), ("B", 0.105)]).unwrap();
        let plan = RebalancePlan::build(&account(), &targets, Scope::Portfolio, &p);
        assert!(plan.buys.is_empty());
        assert!(plan.skipped.iter().any(|s| s.symbol == sym("B") && s.reason == SkipReason::BelowThreshold));
    }

    #[test]
    fn min_trade_does_not_block_exits() {
        let mut p = policy();
        p.min_trade_cents = 50_000_00;
        let targets = TargetWeights::from_pairs(&[("A", 0.6)]).unwrap();
        let plan = RebalancePlan::build(&account(), &targets, Scope::Portfolio, &p);
        // B's $10k exit is below the minimum but still happens
        assert_eq!(plan.sells.len(), 1);
    }

    #[test]
    fn limit_offset_applied() {
        let mut p = policy();
        p.limit_offset_bps = 10;
        let targets = TargetWeights::from_pairs(&[("A", 0.5), ("B", 0.3)]).unwrap();
        let plan = RebalancePlan::build(&account(), &targets, Scope::Portfolio, &p);
        assert_eq!(plan.sells[0].limit_price, Some(Price(99_90)));
        assert_eq!(plan.buys[0].preview.limit_price, Some(Price(50_05)));
    }

    #[test]
    fn labels() {
        assert_eq!(trade_label(0, Side::Buy, 10), "open");
        assert_eq!(trade_label(5, Side::Buy, 10), "increase");
        assert_eq!(trade_label(10, Side::Sell, 10), "close");
        assert_eq!(trade_label(10, Side::Sell, 4), "decrease");
    }

    #[test]
    fn format_lists_orders() {
        let targets = TargetWeights::from_pairs(&[("A", 0.5), ("B", 0.3)]).unwrap();
        let snap = account();
        let plan = RebalancePlan::build(&snap, &targets, Scope::Portfolio, &policy());
        let text = format_plan(&plan, &snap);
        assert!(text.contains("REBALANCE PLAN"));
        assert!(text.contains("decrease"));
        assert!(text.contains("re-sized"));
    }
}
