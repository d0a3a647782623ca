//! Broker reconciliation: authoritative account snapshots taken right before
//! each decision, and the post-execution drift report.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ledgerless::{Price, Side, Symbol};
use ledgerless_broker::{CashSnapshot, PendingOrder, Position};
use log::{debug, warn};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;

use crate::broker::GuardedBroker;
use crate::error::{Error, Result};
use crate::target::TargetWeights;

/// Point-in-time view of the account, as reported by the broker.
///
/// Never cached across a submission: each decision takes a new one.
#[derive(Debug, Clone)]
pub struct AccountSnapshot {
    pub taken_at: DateTime<Utc>,
    /// Broker cash, with `frozen_cents` raised to cover working buys.
    pub cash: CashSnapshot,
    /// Frozen cash exactly as the broker reported it.
    pub reported_frozen_cents: i64,
    pub positions: Vec<Position>,
    pub pending: Vec<PendingOrder>,
    pub prices: FxHashMap<Symbol, Price>,
    /// Upper bound on cash this account may deploy.
    pub capital_cap_cents: Option<i64>,
}

impl AccountSnapshot {
    pub fn nav_cents(&self) -> i64 {
        self.cash.nav_cents
    }

    /// Position for `symbol`, matching broker aliases.
    pub fn position(&self, symbol: &Symbol) -> Option<&Position> {
        self.positions
            .iter()
            .find(|p| p.symbol == *symbol)
            .or_else(|| self.positions.iter().find(|p| p.symbol.matches_alias(symbol)))
    }

    /// Held quantity (0 if flat).
    pub fn held(&self, symbol: &Symbol) -> i64 {
        self.position(symbol).map_or(0, |p| p.quantity)
    }

    pub fn market_value_cents(&self, symbol: &Symbol) -> i64 {
        self.position(symbol).map_or(0, |p| p.market_value_cents)
    }

    pub fn unrealized_pnl_cents(&self, symbol: &Symbol) -> i64 {
        self.position(symbol).map_or(0, |p| p.unrealized_pnl_cents())
    }

    /// Reference price: live quote, else the position's mark.
    pub fn price(&self, symbol: &Symbol) -> Option<Price> {
        self.prices
            .get(symbol)
            .copied()
            .or_else(|| self.position(symbol).and_then(|p| p.mark_price()))
    }

    /// Current fraction of NAV held in `symbol`.
    pub fn weight(&self, symbol: &Symbol) -> f64 {
        let nav = self.nav_cents();
        if nav <= 0 {
            return 0.0;
        }
        self.market_value_cents(symbol) as f64 / nav as f64
    }

    /// Cash that may be committed right now: available (capped) minus frozen.
    pub fn free_cash_cents(&self) -> i64 {
        let usable = match self.capital_cap_cents {
            Some(cap) => self.cash.available_cents.min(cap),
            None => self.cash.available_cents,
        };
        (usable - self.cash.frozen_cents).max(0)
    }

    /// Working broker orders on `symbol` and `side`, alias-aware.
    pub fn pending_for<'a>(
        &'a self,
        symbol: &'a Symbol,
        side: Side,
    ) -> impl Iterator<Item = &'a PendingOrder> + 'a {
        self.pending
            .iter()
            .filter(move |p| p.side == side && p.symbol.matches_alias(symbol))
    }

    pub fn has_pending(&self, symbol: &Symbol, side: Side) -> bool {
        self.pending_for(symbol, side).next().is_some()
    }
}

/// Takes fresh account snapshots from the broker.
pub struct PositionReconciler {
    broker: Arc<GuardedBroker>,
    pending_buy_buffer: f64,
    capital_cap_cents: Option<i64>,
}

impl PositionReconciler {
    pub fn new(
        broker: Arc<GuardedBroker>,
        pending_buy_buffer: f64,
        capital_cap_cents: Option<i64>,
    ) -> Self {
        Self {
            broker,
            pending_buy_buffer,
            capital_cap_cents,
        }
    }

    /// Query cash, positions, pending orders and prices for `symbols` (plus
    /// every held symbol).
    ///
    /// Fails when any query fails or the broker's answer is inconsistent. A
    /// failed pending-orders query is a failure too: working orders are
    /// never assumed absent.
    pub fn refresh(&self, symbols: &[Symbol]) -> Result<AccountSnapshot> {
        let taken_at = Utc::now();
        let mut cash = self
            .broker
            .cash()
            .map_err(|e| Error::reconciliation("cash query", e))?;
        let positions = self
            .broker
            .positions()
            .map_err(|e| Error::reconciliation("positions query", e))?;
        let pending = self
            .broker
            .pending_orders()
            .map_err(|e| Error::reconciliation("pending orders query", e))?;

        check_consistency(&cash, &positions)?;

        let mut wanted: Vec<Symbol> = symbols.to_vec();
        for p in &positions {
            if !wanted.contains(&p.symbol) {
                wanted.push(p.symbol);
            }
        }
        for p in &pending {
            if !wanted.contains(&p.symbol) {
                wanted.push(p.symbol);
            }
        }

        let mut prices = FxHashMap::default();
        for symbol in wanted {
            match self.broker.quote(symbol) {
                Ok(quote) => {
                    if let Some(px) = quote.reference_price() {
                        prices.insert(symbol, px);
                    }
                }
                Err(e) if e.is_fatal() => return Err(Error::BrokerFatal(e.to_string())),
                Err(e) if e.is_transient() => {
                    return Err(Error::Reconciliation(format!("quote for {symbol}: {e}")));
                }
                Err(e) => warn!("no quote for {symbol}: {e}"),
            }
        }

        let reported_frozen_cents = cash.frozen_cents;
        let estimated = estimate_frozen_cents(&pending, &prices, &positions, self.pending_buy_buffer);
        if estimated > cash.frozen_cents {
            debug!(
                "frozen cash raised from {} to {} for {} working orders",
                cash.frozen_cents,
                estimated,
                pending.len()
            );
            cash.frozen_cents = estimated;
        }

        Ok(AccountSnapshot {
            taken_at,
            cash,
            reported_frozen_cents,
            positions,
            pending,
            prices,
            capital_cap_cents: self.capital_cap_cents,
        })
    }
}

fn check_consistency(cash: &CashSnapshot, positions: &[Position]) -> Result<()> {
    if cash.available_cents < 0 {
        return Err(Error::Reconciliation(format!(
            "negative available cash: {}",
            cash.available_cents
        )));
    }
    if cash.frozen_cents < 0 {
        return Err(Error::Reconciliation(format!(
            "negative frozen cash: {}",
            cash.frozen_cents
        )));
    }
    if cash.nav_cents < 0 {
        return Err(Error::Reconciliation(format!(
            "negative NAV: {}",
            cash.nav_cents
        )));
    }
    let mut seen = FxHashSet::default();
    for p in positions {
        if !seen.insert(p.symbol) {
            return Err(Error::Reconciliation(format!(
                "position {} reported twice",
                p.symbol
            )));
        }
    }
    Ok(())
}

/// Cash committed to working buys, scaled by `buffer` for price drift.
fn estimate_frozen_cents(
    pending: &[PendingOrder],
    prices: &FxHashMap<Symbol, Price>,
    positions: &[Position],
    buffer: f64,
) -> i64 {
    let raw: i64 = pending
        .iter()
        .filter(|p| p.side == Side::Buy)
        .map(|p| {
            let px = p
                .limit_price
                .or_else(|| prices.get(&p.symbol).copied())
                .or_else(|| {
                    positions
                        .iter()
                        .find(|pos| pos.symbol.matches_alias(&p.symbol))
                        .and_then(|pos| pos.mark_price())
                })
                .unwrap_or(Price::ZERO);
            p.remaining as i64 * px.0
        })
        .sum();
    (raw as f64 * buffer).ceil() as i64
}

// === Drift report ===

/// Post-execution comparison of actual positions against targets.
#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    pub entries: Vec<DriftEntry>,
    pub tracking_error_pct: f64,
}

/// One symbol's drift entry.
#[derive(Debug, Clone, Serialize)]
pub struct DriftEntry {
    pub symbol: String,
    pub target_weight: f64,
    pub actual_weight: f64,
    pub diff_weight: f64,
    pub target_shares: i64,
    pub actual_shares: i64,
    pub diff_shares: i64,
}

/// Compare a snapshot against targets. Held symbols absent from the targets
/// count as target 0.
pub fn drift_report(snapshot: &AccountSnapshot, targets: &TargetWeights) -> DriftReport {
    let mut all_symbols: Vec<Symbol> = targets.symbols();
    for p in &snapshot.positions {
        if targets.get(&p.symbol).is_none() {
            all_symbols.push(p.symbol);
        }
    }
    all_symbols.sort();
    all_symbols.dedup();

    let nav = snapshot.nav_cents();
    let mut entries = Vec::new();
    let mut sum_sq_diff = 0.0_f64;

    for sym in &all_symbols {
        let price = snapshot.price(sym).map_or(0, |p| p.0);
        let target_weight = targets.get(sym).unwrap_or(0.0);
        let actual_shares = snapshot.held(sym);
        let actual_weight = snapshot.weight(sym);

        let target_shares = if price > 0 {
            (nav as f64 * target_weight / price as f64) as i64
        } else {
            0
        };

        let diff_weight = actual_weight - target_weight;
        sum_sq_diff += diff_weight * diff_weight;

        entries.push(DriftEntry {
            symbol: sym.as_str().to_string(),
            target_weight,
            actual_weight,
            diff_weight,
            target_shares,
            actual_shares,
            diff_shares: actual_shares - target_shares,
        });
    }

    let tracking_error_pct = (sum_sq_diff / all_symbols.len().max(1) as f64).sqrt() * 100.0;

    DriftReport {
        entries,
        tracking_error_pct,
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "DRIFT:")?;
        writeln!(
            f,
            "  {:12} {:>10} {:>10} {:>10} {:>10} {:>10}",
            "Symbol", "Target%", "Actual%", "Diff%", "TargetQty", "ActualQty"
        )?;
        for e in &self.entries {
            writeln!(
                f,
                "  {:12} {:>9.2}% {:>9.2}% {:>+9.2}% {:>10} {:>10}",
                e.symbol,
                e.target_weight * 100.0,
                e.actual_weight * 100.0,
                e.diff_weight * 100.0,
                e.target_shares,
                e.actual_shares,
            )?;
        }
        writeln!(f, "\n  Tracking error: {:.3}%", self.tracking_error_pct)?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::broker::RetryPolicy;
    use ledgerless_broker::BrokerError;
    use ledgerless_broker::mock::{FillMode, MockBroker, MockCall};
    use std::time::Duration;

    fn sym(s: &str) -> Symbol {
        Symbol::new(s)
    }

    /// Snapshot built by hand, for pure sizing and planning tests.
    pub(crate) fn snapshot(
        nav: i64,
        available: i64,
        holdings: &[(&str, i64, i64, i64)],
    ) -> AccountSnapshot {
        let positions = holdings
            .iter()
            .map(|&(s, qty, avg_cost, price)| Position {
                symbol: sym(s),
                quantity: qty,
                avg_cost_cents: avg_cost,
                market_value_cents: qty * price,
            })
            .collect();
        let prices = holdings
            .iter()
            .map(|&(s, _, _, price)| (sym(s), Price(price)))
            .collect();
        AccountSnapshot {
            taken_at: Utc::now(),
            cash: CashSnapshot {
                available_cents: available,
                frozen_cents: 0,
                nav_cents: nav,
            },
            reported_frozen_cents: 0,
            positions,
            pending: Vec::new(),
            prices,
            capital_cap_cents: None,
        }
    }

    fn guarded(mock: Arc<MockBroker>) -> Arc<GuardedBroker> {
        Arc::new(GuardedBroker::new(
            mock,
            RetryPolicy {
                call_timeout: Duration::from_secs(1),
                max_attempts: 2,
                backoff_initial: Duration::from_millis(1),
                backoff_max: Duration::from_millis(2),
            },
        ))
    }

    #[test]
    fn refresh_reads_everything() {
        let mock = Arc::new(
            MockBroker::builder()
                .with_cash(10_000_00)
                .with_price(sym("AAPL"), 200_00)
                .with_price(sym("MSFT"), 400_00)
                .with_position(sym("AAPL"), 10, 150_00)
                .build(),
        );
        let reconciler = PositionReconciler::new(guarded(mock), 1.015, None);
        let snap = reconciler.refresh(&[sym("MSFT")]).unwrap();

        assert_eq!(snap.nav_cents(), 10_000_00 + 2_000_00);
        assert_eq!(snap.held(&sym("AAPL")), 10);
        assert_eq!(snap.price(&sym("MSFT")), Some(Price(400_00)));
        assert_eq!(snap.price(&sym("AAPL")), Some(Price(200_00)));
        assert_eq!(snap.free_cash_cents(), 10_000_00);
    }

    #[test]
    fn unreported_frozen_cash_is_estimated() {
        let mock = Arc::new(
            MockBroker::builder()
                .connected()
                .fill_mode(FillMode::Never)
                .report_frozen(false)
                .with_cash(10_000_00)
                .with_price(sym("AAPL"), 100_00)
                .build(),
        );
        mock.seed_pending_order(sym("AAPL"), Side::Buy, 20, Utc::now(), FillMode::Never);
        let reconciler = PositionReconciler::new(guarded(mock), 1.015, None);
        let snap = reconciler.refresh(&[]).unwrap();

        assert_eq!(snap.reported_frozen_cents, 0);
        // 20 × $100 × 1.015
        assert_eq!(snap.cash.frozen_cents, 2_030_00);
        assert_eq!(snap.free_cash_cents(), 7_970_00);
        assert!(snap.has_pending(&sym("AAPL"), Side::Buy));
        assert!(!snap.has_pending(&sym("AAPL"), Side::Sell));
    }

    #[test]
    fn capital_cap_limits_free_cash() {
        let mut snap = snapshot(100_000_00, 80_000_00, &[]);
        snap.capital_cap_cents = Some(50_000_00);
        snap.cash.frozen_cents = 10_000_00;
        assert_eq!(snap.free_cash_cents(), 40_000_00);
    }

    #[test]
    fn pending_query_failure_fails_refresh() {
        let mock = Arc::new(MockBroker::builder().connected().build());
        for _ in 0..2 {
            mock.inject_fault(MockCall::PendingOrders, BrokerError::Timeout(Duration::from_secs(1)));
        }
        let reconciler = PositionReconciler::new(guarded(mock), 1.015, None);
        assert!(matches!(
            reconciler.refresh(&[]),
            Err(Error::Reconciliation(_))
        ));
    }

    #[test]
    fn fatal_cash_error_is_fatal() {
        let mock = Arc::new(MockBroker::builder().connected().build());
        mock.inject_fault(MockCall::Cash, BrokerError::Auth("revoked".into()));
        let reconciler = PositionReconciler::new(guarded(mock), 1.015, None);
        assert!(reconciler.refresh(&[]).unwrap_err().is_fatal());
    }

    #[test]
    fn negative_cash_is_inconsistent() {
        let cash = CashSnapshot {
            available_cents: -1,
            frozen_cents: 0,
            nav_cents: 0,
        };
        assert!(check_consistency(&cash, &[]).is_err());
    }

    #[test]
    fn duplicate_positions_are_inconsistent() {
        let p = Position {
            symbol: sym("AAPL"),
            quantity: 1,
            avg_cost_cents: 1_00,
            market_value_cents: 1_00,
        };
        let cash = CashSnapshot::default();
        assert!(check_consistency(&cash, &[p.clone(), p]).is_err());
    }

    #[test]
    fn alias_position_lookup() {
        let snap = snapshot(100_000_00, 0, &[("600000", 1000, 10_00, 11_00)]);
        assert_eq!(snap.held(&sym("SHSE.600000")), 1000);
        assert_eq!(snap.price(&sym("SHSE.600000")), Some(Price(11_00)));
    }

    #[test]
    fn drift_perfect_match() {
        let snap = snapshot(1_000_000_00, 500_000_00, &[("AAPL", 2702, 185_00, 185_00)]);
        let targets = TargetWeights::from_pairs(&[("AAPL", 0.5)]).unwrap();
        let report = drift_report(&snap, &targets);
        assert!(report.tracking_error_pct < 1.0);
    }

    #[test]
    fn drift_extra_position() {
        let snap = snapshot(
            1_000_000_00,
            0,
            &[("AAPL", 2702, 185_00, 185_00), ("MSFT", 100, 400_00, 410_00)],
        );
        let targets = TargetWeights::from_pairs(&[("AAPL", 0.5)]).unwrap();
        let report = drift_report(&snap, &targets);
        let msft = report.entries.iter().find(|e| e.symbol == "MSFT").unwrap();
        assert_eq!(msft.target_weight, 0.0);
        assert_eq!(msft.actual_shares, 100);
        assert!(format!("{report}").contains("Tracking error"));
    }
}
