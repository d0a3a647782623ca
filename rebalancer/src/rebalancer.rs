//! Rebalance passes: recover, reconcile, plan, sell, re-reconcile, buy.
//!
//! A pass holds the account's pass lock for its whole duration. Every order
//! is admitted through the [`DoubleSpendGuard`] and sized from a snapshot
//! taken after the previous submission. All sells reach a final state (or
//! time out) before the first buy is sized.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use ledgerless::{Price, Side, Symbol};
use ledgerless_broker::{Broker, PendingOrder};
use log::{error, info, warn};
use serde::Serialize;

use crate::audit::{self, AuditLog};
use crate::broker::{GuardedBroker, RetryPolicy};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::guard::{DoubleSpendGuard, GuardTicket};
use crate::order::{Halted, OrderRecord, OrderState, OrderTracker, TrackerConfig};
use crate::plan::{PlanPolicy, RebalancePlan, Scope, SkippedSymbol};
use crate::reconcile::{AccountSnapshot, DriftReport, PositionReconciler, drift_report};
use crate::risk::{self, RiskReport};
use crate::schedule::StopHandle;
use crate::sizing::{BuyBudget, OrderIntent, SkipReason, Sizing};
use crate::target::TargetWeights;
use crate::zombie::{Disposition, ZombieMatcher};

/// An order whose broker side may still be live, kept across passes until
/// recovery settles it.
struct InFlight {
    record: OrderRecord,
    ticket: Option<GuardTicket>,
}

/// Outcome of one pass.
#[derive(Debug, Clone, Serialize)]
pub struct RebalanceReport {
    pub pass_id: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub nav_cents: i64,
    pub sells: Vec<OrderRecord>,
    pub buys: Vec<OrderRecord>,
    /// Orders from earlier passes found still working and tracked again.
    pub reattached: Vec<OrderRecord>,
    /// Working broker orders with no local record, tracked to a final state.
    pub adopted: Vec<OrderRecord>,
    pub skipped: Vec<SkippedSymbol>,
    pub errors: Vec<String>,
    /// Set when the pass stopped part way after submitting orders.
    pub aborted: Option<String>,
    /// Set when the stop signal ended the pass early.
    pub stopped: bool,
}

impl RebalanceReport {
    pub fn new(pass_id: u64) -> Self {
        Self {
            pass_id,
            started_at: Utc::now(),
            finished_at: None,
            nav_cents: 0,
            sells: Vec::new(),
            buys: Vec::new(),
            reattached: Vec::new(),
            adopted: Vec::new(),
            skipped: Vec::new(),
            errors: Vec::new(),
            aborted: None,
            stopped: false,
        }
    }

    /// Orders this pass submitted (downgrade retries count once).
    pub fn submitted_count(&self) -> usize {
        self.sells.len() + self.buys.len()
    }

    pub fn filled_count(&self) -> usize {
        self.sells
            .iter()
            .chain(&self.buys)
            .filter(|r| r.state == OrderState::Filled)
            .count()
    }

    /// Skip entries with a reason other than "already at target".
    pub fn notable_skips(&self) -> impl Iterator<Item = &SkippedSymbol> {
        self.skipped
            .iter()
            .filter(|s| s.reason != SkipReason::NoChange)
    }

    fn skip(&mut self, symbol: Symbol, side: Side, reason: SkipReason) {
        self.skipped.push(SkippedSymbol {
            symbol,
            side: Some(side),
            reason,
        });
    }
}

impl std::fmt::Display for RebalanceReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "PASS #{} (NAV ${:.2}):",
            self.pass_id,
            self.nav_cents as f64 / 100.0
        )?;
        let recovered = self.reattached.iter().chain(&self.adopted);
        for r in recovered.chain(&self.sells).chain(&self.buys) {
            write!(
                f,
                "  {:4} {:12} {:>8}  {:16} filled {}",
                r.intent.side, r.intent.symbol, r.intent.quantity, r.state, r.filled_quantity
            )?;
            if r.filled_quantity > 0 {
                write!(f, " @ {}", Price(r.avg_fill_price_cents))?;
            }
            if let Some(note) = &r.note {
                write!(f, "  ({note})")?;
            }
            writeln!(f)?;
        }
        for s in self.notable_skips() {
            writeln!(f, "  skip {:12} {}", s.symbol, s.reason)?;
        }
        for e in &self.errors {
            writeln!(f, "  error: {e}")?;
        }
        if let Some(reason) = &self.aborted {
            writeln!(f, "  aborted: {reason}")?;
        }
        if self.stopped {
            writeln!(f, "  stopped before completion")?;
        }
        writeln!(
            f,
            "  {} submitted, {} filled, {} skipped",
            self.submitted_count(),
            self.filled_count(),
            self.notable_skips().count()
        )
    }
}

/// Drives rebalance passes for one account.
///
/// Share one [`DoubleSpendGuard`] and one pass lock between every
/// `Rebalancer` that trades the same account (see [`Rebalancer::with_guard`]
/// and [`Rebalancer::with_pass_lock`]).
pub struct Rebalancer {
    config: Config,
    broker: Arc<GuardedBroker>,
    reconciler: PositionReconciler,
    guard: Arc<DoubleSpendGuard>,
    pass_lock: Arc<Mutex<()>>,
    audit: Option<Mutex<AuditLog>>,
    in_flight: Mutex<Vec<InFlight>>,
    stop: StopHandle,
    policy: PlanPolicy,
    matcher: ZombieMatcher,
    tracker: TrackerConfig,
    passes: AtomicU64,
}

impl Rebalancer {
    pub fn new(broker: Arc<dyn Broker>, config: Config) -> Self {
        let guarded = Arc::new(GuardedBroker::new(
            broker,
            RetryPolicy::from_config(&config.broker),
        ));
        let reconciler = PositionReconciler::new(
            Arc::clone(&guarded),
            config.execution.pending_buy_buffer,
            config.policy.capital_cap_cents(),
        );
        let exec = &config.execution;
        Self {
            guard: Arc::new(DoubleSpendGuard::new(exec.cooldown())),
            pass_lock: Arc::new(Mutex::new(())),
            matcher: ZombieMatcher::new(
                Duration::from_secs(exec.zombie_match_window_secs),
                Duration::from_secs(exec.zombie_grace_secs),
            ),
            tracker: TrackerConfig::from_config(exec),
            policy: PlanPolicy::from_config(&config),
            broker: guarded,
            reconciler,
            audit: None,
            in_flight: Mutex::new(Vec::new()),
            stop: StopHandle::new(),
            passes: AtomicU64::new(0),
            config,
        }
    }

    /// Use a guard shared with other rebalancers on the same account.
    pub fn with_guard(mut self, guard: Arc<DoubleSpendGuard>) -> Self {
        let lifetime = self.config.order_lifetime();
        if guard.cooldown() < lifetime {
            warn!(
                "shared guard cooldown {:?} is shorter than the order lifetime {:?}; \
                 downgrade retries may be cut short",
                guard.cooldown(),
                lifetime
            );
        }
        self.guard = guard;
        self
    }

    /// Use a pass lock shared with other rebalancers on the same account.
    pub fn with_pass_lock(mut self, lock: Arc<Mutex<()>>) -> Self {
        self.pass_lock = lock;
        self
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(Mutex::new(audit));
        self
    }

    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn guard(&self) -> &Arc<DoubleSpendGuard> {
        &self.guard
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Orders kept from earlier passes because their broker side may still
    /// be live.
    pub fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Establish the broker session.
    pub fn connect(&self) -> Result<()> {
        self.broker.connect().map_err(Error::from_broker)
    }

    /// A fresh snapshot covering `symbols` and every holding.
    pub fn snapshot(&self, symbols: &[Symbol]) -> Result<AccountSnapshot> {
        self.reconciler.refresh(symbols)
    }

    /// Plan a portfolio pass without submitting anything.
    pub fn preview(
        &self,
        targets: &TargetWeights,
    ) -> Result<(AccountSnapshot, RebalancePlan, RiskReport)> {
        let snapshot = self.reconciler.refresh(&targets.symbols())?;
        let plan = RebalancePlan::build(&snapshot, targets, Scope::Portfolio, &self.policy);
        let report = risk::check_plan(&plan, &snapshot, self.config.execution.max_orders_per_run);
        Ok((snapshot, plan, report))
    }

    /// Compare the account against `targets` right now.
    pub fn drift(&self, targets: &TargetWeights) -> Result<DriftReport> {
        let snapshot = self.reconciler.refresh(&targets.symbols())?;
        Ok(drift_report(&snapshot, targets))
    }

    /// Full multi-symbol pass. Held symbols missing from `weights` are sold.
    pub fn execute_rebalance(&self, weights: &[(Symbol, f64)]) -> Result<RebalanceReport> {
        let targets = TargetWeights::new(weights.iter().copied())?;
        self.execute_targets(&targets)
    }

    pub fn execute_targets(&self, targets: &TargetWeights) -> Result<RebalanceReport> {
        let hint = targets.symbols();
        self.run_pass(Scope::Portfolio, &hint, |_| Ok(targets.clone()))
    }

    /// Move one symbol to `pct` of NAV. Other holdings are untouched.
    pub fn order_target_percent(&self, symbol: Symbol, pct: f64) -> Result<RebalanceReport> {
        let targets = TargetWeights::new([(symbol, pct)])?;
        self.run_pass(Scope::Listed, &[symbol], |_| Ok(targets.clone()))
    }

    /// Move one symbol to `value_cents` of market value, converted to a
    /// weight against the NAV of the pass snapshot.
    pub fn order_target_value(&self, symbol: Symbol, value_cents: i64) -> Result<RebalanceReport> {
        if value_cents < 0 {
            return Err(Error::InvalidPlan(format!(
                "target value for {symbol} must be >= 0"
            )));
        }
        self.run_pass(Scope::Listed, &[symbol], |snapshot| {
            let nav = snapshot.nav_cents();
            if nav <= 0 {
                return Err(Error::InvalidPlan("NAV is not positive".into()));
            }
            if value_cents > nav {
                return Err(Error::InvalidPlan(format!(
                    "target value {} exceeds NAV {}",
                    Price(value_cents),
                    Price(nav)
                )));
            }
            TargetWeights::new([(symbol, value_cents as f64 / nav as f64)])
        })
    }

    /// Reattach or settle orders left from earlier passes and adopt unknown
    /// broker orders, without trading.
    pub fn recover(&self) -> Result<RebalanceReport> {
        let _pass = self.lock_pass()?;
        let pass_id = self.passes.fetch_add(1, Ordering::SeqCst) + 1;
        let mut report = RebalanceReport::new(pass_id);
        self.recover_into(&mut report)?;
        report.finished_at = Some(Utc::now());
        Ok(report)
    }

    fn lock_pass(&self) -> Result<MutexGuard<'_, ()>> {
        let timeout = self.config.execution.pass_lock_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            match self.pass_lock.try_lock() {
                Ok(g) => return Ok(g),
                Err(TryLockError::Poisoned(p)) => return Ok(p.into_inner()),
                Err(TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return Err(Error::PassInProgress(timeout));
                    }
                    thread::sleep(Duration::from_millis(10));
                }
            }
        }
    }

    fn run_pass<F>(&self, scope: Scope, hint: &[Symbol], resolve: F) -> Result<RebalanceReport>
    where
        F: FnOnce(&AccountSnapshot) -> Result<TargetWeights>,
    {
        let _pass = self.lock_pass()?;
        let pass_id = self.passes.fetch_add(1, Ordering::SeqCst) + 1;
        let mut report = RebalanceReport::new(pass_id);
        let scope_name = match scope {
            Scope::Portfolio => "portfolio",
            Scope::Listed => "listed",
        };
        self.audit(|a| audit::log_pass_started(a, pass_id, scope_name, hint.len()));
        info!("pass {pass_id}: starting ({scope_name}, {} symbols)", hint.len());

        let outcome = self.pass_body(scope, hint, resolve, &mut report);
        report.finished_at = Some(Utc::now());

        match outcome {
            Ok(()) => {
                self.audit(|a| {
                    audit::log_pass_completed(
                        a,
                        pass_id,
                        report.submitted_count(),
                        report.filled_count(),
                        report.notable_skips().count(),
                        report.errors.len(),
                    )
                });
                Ok(report)
            }
            Err(e) if e.is_fatal() || report.submitted_count() == 0 => {
                error!("pass {pass_id} aborted: {e}");
                if report.submitted_count() > 0 {
                    error!("pass {pass_id} orders at abort:\n{report}");
                }
                let reason = e.to_string();
                self.audit(|a| audit::log_pass_aborted(a, pass_id, &reason));
                Err(e)
            }
            Err(e) => {
                error!(
                    "pass {pass_id} stopped after {} orders: {e}",
                    report.submitted_count()
                );
                let reason = e.to_string();
                self.audit(|a| audit::log_pass_aborted(a, pass_id, &reason));
                report.errors.push(reason.clone());
                report.aborted = Some(reason);
                Ok(report)
            }
        }
    }

    fn pass_body<F>(
        &self,
        scope: Scope,
        hint: &[Symbol],
        resolve: F,
        report: &mut RebalanceReport,
    ) -> Result<()>
    where
        F: FnOnce(&AccountSnapshot) -> Result<TargetWeights>,
    {
        self.recover_into(report)?;

        let mut snapshot = self.reconciler.refresh(hint)?;
        self.audit(|a| audit::log_snapshot(a, &snapshot));
        let targets = resolve(&snapshot)?;

        let plan = RebalancePlan::build(&snapshot, &targets, scope, &self.policy);
        let checks = risk::check_plan(&plan, &snapshot, self.config.execution.max_orders_per_run);
        self.audit(|a| audit::log_plan(a, &plan, &checks));
        if checks.has_failures() {
            return Err(Error::RiskFailed(checks.failure_summary()));
        }
        report.nav_cents = plan.nav_cents;
        for skip in &plan.skipped {
            self.audit(|a| audit::log_skipped(a, skip));
        }
        report.skipped.extend(plan.skipped.iter().cloned());

        // Sells: each from the latest snapshot, each final before the next.
        let mut dirty = false;
        for planned in &plan.sells {
            if self.stopped(report) {
                return Ok(());
            }
            if dirty {
                snapshot = self.reconciler.refresh(&plan.symbols())?;
            }
            let intent = if dirty {
                match self.policy.size(planned.symbol, target_of(&plan, planned.symbol), &snapshot) {
                    Sizing::Order(i) if i.side == Side::Sell => i,
                    Sizing::Order(_) => {
                        report.skip(planned.symbol, Side::Sell, SkipReason::NoChange);
                        continue;
                    }
                    Sizing::Skip(reason) => {
                        report.skip(planned.symbol, Side::Sell, reason);
                        continue;
                    }
                }
            } else {
                planned.clone()
            };

            let mut keep = |candidate: OrderIntent| -> Result<Option<OrderIntent>> { Ok(Some(candidate)) };
            if let Some(record) = self.submit_guarded(intent, &snapshot, report, &mut keep)? {
                dirty = true;
                report.sells.push(record);
            }
        }

        if plan.buys.is_empty() {
            return Ok(());
        }

        // Buys: re-reconcile now that the sells have settled.
        snapshot = self.reconciler.refresh(&plan.symbols())?;
        self.audit(|a| audit::log_snapshot(a, &snapshot));

        let mut sized = Vec::with_capacity(plan.buys.len());
        for planned in &plan.buys {
            match self.policy.size(planned.symbol, planned.target_weight, &snapshot) {
                Sizing::Order(i) if i.side == Side::Buy => sized.push(i),
                Sizing::Order(_) => report.skip(planned.symbol, Side::Buy, SkipReason::NoChange),
                Sizing::Skip(reason) => report.skip(planned.symbol, Side::Buy, reason),
            }
        }
        let checks = risk::check_buys(&sized, &snapshot);
        if checks.has_failures() {
            let reason = format!("buy phase skipped: {}", checks.failure_summary());
            warn!("{reason}");
            report.errors.push(reason);
            return Ok(());
        }

        let mut budget = BuyBudget::new(snapshot.free_cash_cents());
        let mut dirty = false;
        for first in sized {
            if self.stopped(report) {
                return Ok(());
            }
            let symbol = first.symbol;
            let intent = if dirty {
                snapshot = self.reconciler.refresh(&plan.symbols())?;
                match self.policy.size(symbol, target_of(&plan, symbol), &snapshot) {
                    Sizing::Order(i) if i.side == Side::Buy => i,
                    Sizing::Order(_) => {
                        report.skip(symbol, Side::Buy, SkipReason::NoChange);
                        continue;
                    }
                    Sizing::Skip(reason) => {
                        report.skip(symbol, Side::Buy, reason);
                        continue;
                    }
                }
            } else {
                first
            };

            budget.cap(snapshot.free_cash_cents());
            let intent = match budget.fit(intent) {
                Sizing::Order(i) => i,
                Sizing::Skip(reason) => {
                    report.skip(symbol, Side::Buy, reason);
                    continue;
                }
            };

            let ceiling = budget;
            let mut resize = |candidate: OrderIntent| -> Result<Option<OrderIntent>> {
                match self.reconciler.refresh(&[candidate.symbol]) {
                    Ok(fresh) => {
                        let mut cap = ceiling;
                        cap.cap(fresh.free_cash_cents());
                        Ok(cap.fit(candidate).intent())
                    }
                    Err(e) if e.is_fatal() => Err(e),
                    Err(e) => {
                        warn!("{}: cannot re-size after rejection: {e}", candidate.symbol);
                        Ok(None)
                    }
                }
            };

            let estimate = intent.estimated_cost_cents();
            if let Some(record) = self.submit_guarded(intent, &snapshot, report, &mut resize)? {
                dirty = true;
                let spent = if record.is_settled() {
                    record.filled_notional_cents()
                } else {
                    estimate
                };
                budget.commit(spent);
                report.buys.push(record);
            }
        }
        Ok(())
    }

    fn stopped(&self, report: &mut RebalanceReport) -> bool {
        if self.stop.is_stopped() {
            warn!("pass {}: stop requested, ending at symbol boundary", report.pass_id);
            report.stopped = true;
        }
        report.stopped
    }

    /// Admission checks, then submit and track one order. `None` means the
    /// symbol was skipped (the reason is in the report).
    fn submit_guarded(
        &self,
        intent: OrderIntent,
        snapshot: &AccountSnapshot,
        report: &mut RebalanceReport,
        resize: &mut crate::order::Resize<'_>,
    ) -> Result<Option<OrderRecord>> {
        let (symbol, side) = (intent.symbol, intent.side);

        if report.submitted_count() >= self.config.execution.max_orders_per_run {
            report.skip(symbol, side, SkipReason::OrderLimit);
            return Ok(None);
        }
        if snapshot.has_pending(&symbol, side) {
            warn!("{side} {symbol}: broker already has a working order, skipping");
            report.skip(symbol, side, SkipReason::PendingOrder);
            return Ok(None);
        }
        let ticket = match self.guard.acquire(symbol, side) {
            Ok(t) => t,
            Err(conflict) => {
                warn!("{conflict}; skipping this pass");
                report.skip(symbol, side, SkipReason::GuardConflict);
                return Ok(None);
            }
        };

        if report.submitted_count() > 0 {
            thread::sleep(self.config.execution.order_interval());
        }
        if !self.lock_covers_submission(&ticket) {
            report.skip(symbol, side, SkipReason::LockExpiring);
            self.guard.release(ticket);
            return Ok(None);
        }

        let hook = |record: &OrderRecord| self.audit(|a| audit::log_order_submitted(a, record));
        let tracker = OrderTracker::new(&self.broker, self.tracker.clone()).on_submit(&hook);
        // a downgrade resubmits under the same lock, so it must still cover it
        let mut checked = |candidate: OrderIntent| -> Result<Option<OrderIntent>> {
            if self.lock_covers_submission(&ticket) {
                resize(candidate)
            } else {
                Ok(None)
            }
        };
        let record = match tracker.execute(intent, &mut checked) {
            Ok(record) => record,
            Err(halted) => {
                let Halted { mut record, error } = *halted;
                let reason = error.to_string();
                error!("{side} {symbol}: interrupted in state {}: {reason}", record.state);
                record.note = Some(format!("interrupted: {reason}"));
                self.audit(|a| audit::log_order_interrupted(a, &record, &reason));
                if record.state == OrderState::Intent {
                    // nothing working at the broker under this record
                    self.guard.release(ticket);
                } else {
                    self.settle_or_park(&record, Some(ticket));
                }
                if record.history.len() > 1 {
                    match side {
                        Side::Sell => report.sells.push(record),
                        Side::Buy => report.buys.push(record),
                    }
                }
                return Err(error);
            }
        };
        self.audit(|a| audit::log_order_terminal(a, &record));
        info!(
            "{side} {symbol}: {} ({} of {} filled)",
            record.state, record.filled_quantity, record.intent.quantity
        );

        self.settle_or_park(&record, Some(ticket));
        Ok(Some(record))
    }

    /// Whether the lock still has time for one more full submission.
    fn lock_covers_submission(&self, ticket: &GuardTicket) -> bool {
        let needed = self.config.submission_bound();
        match self.guard.remaining(ticket) {
            Some(left) if left >= needed => true,
            left => {
                warn!(
                    "{} {}: lock has {:?} left, a submission needs up to {:?}; not submitting",
                    ticket.side,
                    ticket.symbol,
                    left.unwrap_or_default(),
                    needed
                );
                false
            }
        }
    }

    /// Release the lock of a settled order; keep anything else for recovery.
    fn settle_or_park(&self, record: &OrderRecord, ticket: Option<GuardTicket>) {
        if record.is_settled() {
            if let Some(ticket) = ticket {
                self.guard.release(ticket);
            }
            return;
        }
        warn!(
            "{}: {} not confirmed final, holding lock until recovered",
            record.intent, record.state
        );
        lock(&self.in_flight).push(InFlight {
            record: record.clone(),
            ticket,
        });
    }

    /// Match kept orders and unknown broker orders against the pending list.
    /// Runs before anything new is submitted.
    fn recover_into(&self, report: &mut RebalanceReport) -> Result<()> {
        let pending = self
            .broker
            .pending_orders()
            .map_err(|e| Error::reconciliation("pending orders query", e))?;

        let entries = std::mem::take(&mut *lock(&self.in_flight));
        if entries.is_empty() && pending.is_empty() {
            return Ok(());
        }
        let records: Vec<OrderRecord> = entries.iter().map(|e| e.record.clone()).collect();
        let outcome = self.matcher.reattach(&records, &pending, Utc::now());
        info!(
            "recovery: {} kept orders ({} still working), {} unknown broker orders",
            records.len(),
            outcome.reattached_count(),
            outcome.unknown.len()
        );
        let tracker = OrderTracker::new(&self.broker, self.tracker.clone());

        let mut rest = entries.into_iter().zip(outcome.dispositions);
        while let Some((entry, disposition)) = rest.next() {
            let InFlight { mut record, ticket } = entry;
            match disposition {
                Disposition::Settled | Disposition::Lost => {
                    info!("{}: no longer working at broker, lock released", record.intent);
                    if let Some(ticket) = ticket {
                        self.guard.release(ticket);
                    }
                }
                Disposition::Waiting => lock(&self.in_flight).push(InFlight { record, ticket }),
                Disposition::Reattached(p) => {
                    record.broker_id = Some(p.id);
                    if record.state != OrderState::Submitted {
                        record.transition(OrderState::Submitted);
                    }
                    self.audit(|a| audit::log_zombie_reattached(a, &record));
                    if let Err(e) = tracker.track(&mut record) {
                        // keep the rest for the next pass
                        lock(&self.in_flight).push(InFlight { record, ticket });
                        for (entry, _) in rest {
                            lock(&self.in_flight).push(entry);
                        }
                        return Err(e);
                    }
                    self.audit(|a| audit::log_order_terminal(a, &record));
                    self.settle_or_park(&record, ticket);
                    report.reattached.push(record);
                }
            }
        }

        for p in outcome.unknown {
            let ticket = match self.guard.acquire(p.symbol, p.side) {
                Ok(t) => t,
                Err(conflict) => {
                    info!("{}: {conflict}; leaving it to its owner", p.id);
                    continue;
                }
            };
            warn!(
                "{}: adopting untracked {} {} {}",
                p.id, p.side, p.quantity, p.symbol
            );
            let mut record =
                OrderRecord::adopted(self.intent_for(&p), p.id, p.submitted_at);
            record.note = Some("adopted from broker".into());
            if let Err(e) = tracker.track(&mut record) {
                lock(&self.in_flight).push(InFlight {
                    record,
                    ticket: Some(ticket),
                });
                return Err(e);
            }
            self.audit(|a| audit::log_order_terminal(a, &record));
            self.settle_or_park(&record, Some(ticket));
            report.adopted.push(record);
        }
        Ok(())
    }

    fn intent_for(&self, p: &PendingOrder) -> OrderIntent {
        OrderIntent {
            symbol: p.symbol,
            side: p.side,
            quantity: p.quantity,
            limit_price: p.limit_price,
            reference_price: p.limit_price.unwrap_or(Price::ZERO),
            lot_size: self.policy.lots.lot_size(&p.symbol),
            margin_pct: 0.0,
        }
    }

    /// Write to the audit log if one is attached. Failures are logged and
    /// never abort the pass.
    fn audit<F>(&self, f: F)
    where
        F: FnOnce(&mut AuditLog) -> Result<()>,
    {
        if let Some(audit) = &self.audit {
            if let Err(e) = f(&mut lock(audit)) {
                warn!("audit write failed: {e}");
            }
        }
    }
}

fn target_of(plan: &RebalancePlan, symbol: Symbol) -> f64 {
    plan.targets
        .iter()
        .find(|(s, _)| *s == symbol)
        .map_or(0.0, |&(_, w)| w)
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerless_broker::mock::{FillMode, MockBroker};

    fn sym(s: &str) -> Symbol {
        Symbol::new(s)
    }

    fn fast_config() -> Config {
        let mut config = Config::from_toml("[account]\nid = \"TEST\"\n").unwrap();
        config.broker.call_timeout_secs = 1;
        config.broker.backoff_initial_ms = 1;
        config.broker.backoff_max_ms = 2;
        config.execution.poll_interval_ms = 1;
        config.execution.poll_max_interval_ms = 2;
        config.execution.order_timeout_secs = 1;
        config.execution.order_interval_ms = 0;
        config
    }

    #[test]
    fn report_counts_and_display() {
        let mut report = RebalanceReport::new(7);
        report.skip(sym("A"), Side::Buy, SkipReason::GuardConflict);
        report.skipped.push(SkippedSymbol {
            symbol: sym("B"),
            side: None,
            reason: SkipReason::NoChange,
        });
        assert_eq!(report.notable_skips().count(), 1);
        let text = report.to_string();
        assert!(text.contains("PASS #7"));
        assert!(text.contains("order already in flight"));
    }

    #[test]
    fn target_percent_buys_within_margin() {
        let mock = Arc::new(
            MockBroker::builder()
                .connected()
                .with_cash(100_000_00)
                .with_price(sym("AAPL"), 100_00)
                .build(),
        );
        let rebalancer = Rebalancer::new(mock.clone(), fast_config());
        let report = rebalancer.order_target_percent(sym("AAPL"), 0.1).unwrap();

        assert_eq!(report.buys.len(), 1);
        // $10k target shrunk 2% at $100
        assert_eq!(report.buys[0].intent.quantity, 98);
        assert_eq!(report.buys[0].state, OrderState::Filled);
        assert_eq!(rebalancer.guard().held_count(), 0);
    }

    #[test]
    fn target_value_converts_against_nav() {
        let mock = Arc::new(
            MockBroker::builder()
                .connected()
                .with_cash(50_000_00)
                .with_price(sym("AAPL"), 100_00)
                .with_position(sym("AAPL"), 100, 100_00)
                .build(),
        );
        let rebalancer = Rebalancer::new(mock.clone(), fast_config());
        // NAV $60k, AAPL at $10k; target $5k: sell 50
        let report = rebalancer.order_target_value(sym("AAPL"), 5_000_00).unwrap();
        assert_eq!(report.sells.len(), 1);
        assert_eq!(report.sells[0].intent.quantity, 50);
        assert_eq!(mock.held(sym("AAPL")), 50);

        assert!(matches!(
            rebalancer.order_target_value(sym("AAPL"), 70_000_00),
            Err(Error::InvalidPlan(_))
        ));
        assert!(matches!(
            rebalancer.order_target_value(sym("AAPL"), -1),
            Err(Error::InvalidPlan(_))
        ));
    }

    #[test]
    fn guard_conflict_skips_symbol() {
        let mock = Arc::new(
            MockBroker::builder()
                .connected()
                .with_price(sym("AAPL"), 100_00)
                .build(),
        );
        let rebalancer = Rebalancer::new(mock.clone(), fast_config());
        let _held = rebalancer.guard().acquire(sym("AAPL"), Side::Buy).unwrap();

        let report = rebalancer.order_target_percent(sym("AAPL"), 0.1).unwrap();
        assert!(report.buys.is_empty());
        assert_eq!(report.skipped[0].reason, SkipReason::GuardConflict);
        assert!(mock.submitted_orders().is_empty());
    }

    #[test]
    fn stop_signal_ends_pass_before_orders() {
        let mock = Arc::new(
            MockBroker::builder()
                .connected()
                .with_price(sym("AAPL"), 100_00)
                .build(),
        );
        let rebalancer = Rebalancer::new(mock.clone(), fast_config());
        rebalancer.stop_handle().stop();
        let report = rebalancer.order_target_percent(sym("AAPL"), 0.1).unwrap();
        assert!(report.stopped);
        assert!(mock.submitted_orders().is_empty());
    }

    #[test]
    fn unconfirmed_timeout_is_kept_then_settled() {
        let mock = Arc::new(
            MockBroker::builder()
                .connected()
                .fill_mode(FillMode::Never)
                .cancel_confirms(false)
                .with_price(sym("AAPL"), 100_00)
                .build(),
        );
        let rebalancer = Rebalancer::new(mock.clone(), fast_config());
        let report = rebalancer.order_target_percent(sym("AAPL"), 0.1).unwrap();
        assert_eq!(report.buys[0].state, OrderState::CanceledAssumed);
        assert_eq!(rebalancer.in_flight_count(), 1);
        assert!(rebalancer.guard().is_held(sym("AAPL"), Side::Buy));

        // still working at the broker: recovery reattaches, it times out again
        let recovered = rebalancer.recover().unwrap();
        assert_eq!(recovered.reattached.len(), 1);
        assert_eq!(rebalancer.in_flight_count(), 1);
        assert_eq!(mock.submitted_orders().len(), 1);
    }
}
