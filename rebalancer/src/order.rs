//! Order lifecycle: submit, poll to a final state, downgrade on rejection.
//!
//! ```text
//! Intent ─► Submitted ─► Filled
//!   │          │ ▲
//!   │          ▼ │
//!   │        Partial ─► PartialFinal      (timeout with some fill)
//!   │          │
//!   │          ├─► Canceled / CanceledAssumed (timeout, no fill)
//!   │          └─► Rejected ─► Intent     (downgrade retry)
//!   │                   └────► Failed     (retries exhausted)
//!   └─► Rejected / Failed / CanceledAssumed (submission outcome unknown)
//! ```

use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use ledgerless_broker::{BrokerOrderStatus, OrderId, OrderState as BrokerState, RejectReason};
use log::{debug, info, warn};
use serde::Serialize;

use crate::broker::GuardedBroker;
use crate::config::ExecutionConfig;
use crate::error::{Error, Result};
use crate::sizing::{OrderIntent, lot_floor};

/// Local lifecycle state of one order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OrderState {
    Intent,
    Submitted,
    Partial,
    Filled,
    Rejected,
    Canceled,
    PartialFinal,
    Failed,
    CanceledAssumed,
}

impl OrderState {
    /// No further local transitions are expected.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderState::Filled
                | OrderState::Rejected
                | OrderState::Canceled
                | OrderState::PartialFinal
                | OrderState::Failed
                | OrderState::CanceledAssumed
        )
    }

    pub fn can_transition_to(self, next: OrderState) -> bool {
        use OrderState::*;
        matches!(
            (self, next),
            (Intent, Submitted | Rejected | Failed | CanceledAssumed)
                | (Submitted, Partial | Filled | Rejected | Canceled)
                | (Submitted, CanceledAssumed | PartialFinal)
                | (Partial, Submitted | Filled | PartialFinal)
                | (Rejected, Intent | Failed)
                // re-verified after a reconnect
                | (CanceledAssumed, Submitted | Canceled | Filled | PartialFinal)
                | (PartialFinal, Submitted)
        )
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderState::Intent => "INTENT",
            OrderState::Submitted => "SUBMITTED",
            OrderState::Partial => "PARTIAL",
            OrderState::Filled => "FILLED",
            OrderState::Rejected => "REJECTED",
            OrderState::Canceled => "CANCELED",
            OrderState::PartialFinal => "PARTIAL_FINAL",
            OrderState::Failed => "FAILED",
            OrderState::CanceledAssumed => "CANCELED_ASSUMED",
        };
        f.pad(s)
    }
}

/// One tracked order.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRecord {
    pub intent: OrderIntent,
    pub broker_id: Option<OrderId>,
    pub state: OrderState,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub filled_quantity: u64,
    pub avg_fill_price_cents: i64,
    /// Submissions made, including downgrades.
    pub attempts: u32,
    pub downgrades: u32,
    pub reject_reason: Option<RejectReason>,
    /// The broker confirmed the order can no longer fill.
    pub broker_final: bool,
    pub history: Vec<OrderState>,
    pub note: Option<String>,
}

impl OrderRecord {
    pub fn new(intent: OrderIntent) -> Self {
        Self {
            intent,
            broker_id: None,
            state: OrderState::Intent,
            created_at: Utc::now(),
            submitted_at: None,
            last_polled_at: None,
            filled_quantity: 0,
            avg_fill_price_cents: 0,
            attempts: 0,
            downgrades: 0,
            reject_reason: None,
            broker_final: false,
            history: vec![OrderState::Intent],
            note: None,
        }
    }

    /// A record for a broker order found working with no local record.
    pub fn adopted(intent: OrderIntent, id: OrderId, submitted_at: DateTime<Utc>) -> Self {
        let mut record = Self::new(intent);
        record.broker_id = Some(id);
        record.submitted_at = Some(submitted_at);
        record.transition(OrderState::Submitted);
        record
    }

    pub(crate) fn transition(&mut self, next: OrderState) {
        if !self.state.can_transition_to(next) {
            warn!(
                "{}: unexpected transition {} -> {}",
                self.intent.symbol, self.state, next
            );
        }
        self.state = next;
        self.history.push(next);
    }

    /// Whether the broker side is settled: the order can no longer fill and
    /// its admission lock may be released.
    pub fn is_settled(&self) -> bool {
        match self.state {
            OrderState::Filled | OrderState::Rejected | OrderState::Canceled | OrderState::Failed => {
                true
            }
            OrderState::PartialFinal | OrderState::CanceledAssumed => self.broker_final,
            OrderState::Intent | OrderState::Submitted | OrderState::Partial => false,
        }
    }

    /// Cash actually spent (buys) or raised (sells) so far.
    pub fn filled_notional_cents(&self) -> i64 {
        self.filled_quantity as i64 * self.avg_fill_price_cents
    }

    fn apply_status(&mut self, status: &BrokerOrderStatus) {
        self.last_polled_at = Some(Utc::now());
        self.filled_quantity = status.filled_quantity;
        self.avg_fill_price_cents = status.avg_fill_price_cents;
        if status.reject_reason.is_some() {
            self.reject_reason = status.reject_reason;
        }
    }
}

/// Downgrade callback: given the smaller candidate, return the intent to
/// resubmit (possibly smaller still) or `None` to give up.
pub type Resize<'a> = dyn FnMut(OrderIntent) -> Result<Option<OrderIntent>> + 'a;

/// Timing and retry bounds for one order.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub order_timeout: Duration,
    pub poll_interval: Duration,
    pub poll_max_interval: Duration,
    pub max_downgrade_retries: u32,
    pub downgrade_factor: f64,
}

impl TrackerConfig {
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self {
            order_timeout: config.order_timeout(),
            poll_interval: config.poll_interval(),
            poll_max_interval: config.poll_max_interval(),
            max_downgrade_retries: config.max_downgrade_retries,
            downgrade_factor: config.downgrade_factor,
        }
    }
}

/// A fatal broker error that interrupted an order, with the record as far
/// as it got. The order may still be working at the broker.
#[derive(Debug)]
pub struct Halted {
    pub record: OrderRecord,
    pub error: Error,
}

/// Drives single orders through their lifecycle against the broker.
pub struct OrderTracker<'a> {
    broker: &'a GuardedBroker,
    config: TrackerConfig,
    on_submit: Option<&'a dyn Fn(&OrderRecord)>,
}

impl<'a> OrderTracker<'a> {
    pub fn new(broker: &'a GuardedBroker, config: TrackerConfig) -> Self {
        Self {
            broker,
            config,
            on_submit: None,
        }
    }

    /// Called each time the broker accepts a submission, downgrade retries
    /// included.
    pub fn on_submit(mut self, hook: &'a dyn Fn(&OrderRecord)) -> Self {
        self.on_submit = Some(hook);
        self
    }

    /// Submit `intent` and track it to a terminal state.
    ///
    /// Only a fatal broker error is returned as `Err`; every other failure
    /// ends in a terminal record.
    pub fn execute(
        &self,
        intent: OrderIntent,
        resize: &mut Resize<'_>,
    ) -> std::result::Result<OrderRecord, Box<Halted>> {
        let mut record = OrderRecord::new(intent);
        match self.drive(&mut record, resize) {
            Ok(()) => Ok(record),
            Err(error) => Err(Box::new(Halted { record, error })),
        }
    }

    fn drive(&self, record: &mut OrderRecord, resize: &mut Resize<'_>) -> Result<()> {
        loop {
            self.submit(record)?;
            if record.state == OrderState::Submitted {
                self.track(record)?;
            }

            if record.state != OrderState::Rejected {
                return Ok(());
            }
            let downgradable = record
                .reject_reason
                .is_some_and(RejectReason::is_downgradable);
            if !downgradable {
                return Ok(());
            }
            if record.downgrades >= self.config.max_downgrade_retries {
                record.note = Some(format!(
                    "rejected after {} downgrade retries",
                    record.downgrades
                ));
                record.transition(OrderState::Failed);
                return Ok(());
            }

            let candidate = self.downgrade(&record.intent);
            let next = match candidate {
                Some(c) => resize(c)?,
                None => None,
            };
            match next {
                Some(next) if next.quantity > 0 => {
                    warn!(
                        "{}: rejected ({:?}), retrying with {} instead of {}",
                        record.intent.symbol,
                        record.reject_reason,
                        next.quantity,
                        record.intent.quantity
                    );
                    record.downgrades += 1;
                    record.intent = next;
                    record.broker_id = None;
                    record.broker_final = false;
                    record.reject_reason = None;
                    record.transition(OrderState::Intent);
                }
                _ => {
                    record.note = Some("rejected; no smaller size available".into());
                    record.transition(OrderState::Failed);
                    return Ok(());
                }
            }
        }
    }

    /// Smaller intent with a wider margin, or `None` if under one lot.
    fn downgrade(&self, intent: &OrderIntent) -> Option<OrderIntent> {
        let factor = self.config.downgrade_factor;
        let shrunk = (intent.quantity as f64 * factor).floor() as u64;
        let quantity = lot_floor(shrunk, intent.lot_size);
        if quantity == 0 {
            return None;
        }
        let mut next = intent.resized(quantity);
        next.margin_pct = 1.0 - (1.0 - intent.margin_pct) * factor;
        Some(next)
    }

    /// One submission. A transient failure may still have reached the
    /// broker, so the pending list is checked instead of resubmitting.
    fn submit(&self, record: &mut OrderRecord) -> Result<()> {
        let order = record.intent.to_broker_order();
        let sent_at = Utc::now();
        record.attempts += 1;
        record.submitted_at = Some(sent_at);

        match self.broker.submit_order(&order) {
            Ok(Some(id)) => {
                info!("{}: submitted {}", id, record.intent);
                record.broker_id = Some(id);
                record.transition(OrderState::Submitted);
                self.notify_submitted(record);
            }
            Ok(None) => {
                warn!("{}: broker refused without an id", record.intent);
                record.reject_reason = Some(RejectReason::Other);
                record.broker_final = true;
                record.note = Some("broker returned no order id".into());
                record.transition(OrderState::Rejected);
            }
            Err(e) if e.is_fatal() => return Err(Error::BrokerFatal(e.to_string())),
            Err(e) if e.is_transient() => {
                warn!("{}: submission outcome unknown: {e}", record.intent);
                match self.find_submitted(record, sent_at) {
                    Some(id) => {
                        info!("{id}: found at broker after failed submission, reattached");
                        record.broker_id = Some(id);
                        record.note = Some("reattached after ambiguous submission".into());
                        record.transition(OrderState::Submitted);
                        self.notify_submitted(record);
                    }
                    None => {
                        record.note = Some(format!("submission outcome unknown: {e}"));
                        record.transition(OrderState::CanceledAssumed);
                    }
                }
            }
            Err(e) => {
                warn!("{}: submission failed: {e}", record.intent);
                record.broker_final = true;
                record.note = Some(e.to_string());
                record.transition(OrderState::Failed);
            }
        }
        Ok(())
    }

    fn notify_submitted(&self, record: &OrderRecord) {
        if let Some(hook) = self.on_submit {
            hook(record);
        }
    }

    /// Look for our order among the broker's working orders.
    fn find_submitted(&self, record: &OrderRecord, sent_at: DateTime<Utc>) -> Option<OrderId> {
        let pending = match self.broker.pending_orders() {
            Ok(p) => p,
            Err(e) => {
                warn!("cannot list pending orders to verify submission: {e}");
                return None;
            }
        };
        let earliest = sent_at - chrono::Duration::seconds(5);
        pending
            .iter()
            .filter(|p| {
                p.symbol.matches_alias(&record.intent.symbol)
                    && p.side == record.intent.side
                    && p.quantity == record.intent.quantity
                    && p.submitted_at >= earliest
            })
            .max_by_key(|p| p.submitted_at)
            .map(|p| p.id)
    }

    /// Poll a submitted order until it is final or the timeout passes,
    /// backing off between polls. On timeout the order is cancelled.
    pub fn track(&self, record: &mut OrderRecord) -> Result<()> {
        let Some(id) = record.broker_id else {
            return Ok(());
        };
        let deadline = Instant::now() + self.config.order_timeout;
        let mut interval = self.config.poll_interval;

        loop {
            match self.broker.order_status(id) {
                Ok(status) => {
                    let before = record.filled_quantity;
                    record.apply_status(&status);
                    match status.state {
                        BrokerState::Filled => {
                            info!("{id}: filled {} {}", status.filled_quantity, record.intent.symbol);
                            record.broker_final = true;
                            if record.state == OrderState::Partial {
                                record.transition(OrderState::Submitted);
                            }
                            record.transition(OrderState::Filled);
                            return Ok(());
                        }
                        BrokerState::Rejected => {
                            warn!("{id}: rejected ({:?})", status.reject_reason);
                            record.broker_final = true;
                            record.transition(OrderState::Rejected);
                            return Ok(());
                        }
                        BrokerState::Cancelled => {
                            record.broker_final = true;
                            if record.filled_quantity > 0 {
                                record.transition(OrderState::PartialFinal);
                            } else {
                                record.transition(OrderState::Canceled);
                            }
                            return Ok(());
                        }
                        BrokerState::PartiallyFilled if record.filled_quantity > before => {
                            debug!(
                                "{id}: partial {}/{}",
                                record.filled_quantity, record.intent.quantity
                            );
                            record.transition(OrderState::Partial);
                            record.transition(OrderState::Submitted);
                        }
                        _ => {}
                    }
                }
                Err(e) if e.is_fatal() => return Err(Error::BrokerFatal(e.to_string())),
                Err(e) => warn!("{id}: status poll failed: {e}"),
            }

            let now = Instant::now();
            if now >= deadline {
                return self.on_timeout(record, id);
            }
            thread::sleep(interval.min(deadline - now));
            interval = (interval * 2).min(self.config.poll_max_interval);
        }
    }

    fn on_timeout(&self, record: &mut OrderRecord, id: OrderId) -> Result<()> {
        warn!(
            "{id}: no final state after {:?}, cancelling",
            self.config.order_timeout
        );
        match self.broker.cancel_order(id) {
            Ok(true) => {
                record.broker_final = true;
                if let Ok(status) = self.broker.order_status(id) {
                    record.apply_status(&status);
                    if status.state == BrokerState::Filled {
                        record.transition(OrderState::Filled);
                        return Ok(());
                    }
                }
            }
            Ok(false) => warn!("{id}: cancel not confirmed"),
            Err(e) if e.is_fatal() => return Err(Error::BrokerFatal(e.to_string())),
            Err(e) => warn!("{id}: cancel failed: {e}"),
        }

        if record.filled_quantity > 0 {
            record.transition(OrderState::PartialFinal);
        } else {
            record.transition(OrderState::CanceledAssumed);
        }
        record.note = Some(format!(
            "timed out after {:?}; re-verify on next pass",
            self.config.order_timeout
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::RetryPolicy;
    use ledgerless::{Price, Side, Symbol};
    use ledgerless_broker::{Broker, BrokerError};
    use ledgerless_broker::mock::{FillMode, MockBroker, MockCall};
    use std::cell::RefCell;
    use std::sync::Arc;

    fn sym() -> Symbol {
        Symbol::new("AAPL")
    }

    fn guarded(mock: &Arc<MockBroker>) -> GuardedBroker {
        GuardedBroker::new(
            mock.clone(),
            RetryPolicy {
                call_timeout: Duration::from_secs(1),
                max_attempts: 2,
                backoff_initial: Duration::from_millis(1),
                backoff_max: Duration::from_millis(2),
            },
        )
    }

    fn config() -> TrackerConfig {
        TrackerConfig {
            order_timeout: Duration::from_millis(40),
            poll_interval: Duration::from_millis(1),
            poll_max_interval: Duration::from_millis(4),
            max_downgrade_retries: 3,
            downgrade_factor: 0.5,
        }
    }

    fn buy(quantity: u64) -> OrderIntent {
        OrderIntent {
            symbol: sym(),
            side: Side::Buy,
            quantity,
            limit_price: None,
            reference_price: Price(100_00),
            lot_size: 1,
            margin_pct: 0.02,
        }
    }

    fn keep(intent: OrderIntent) -> Result<Option<OrderIntent>> {
        Ok(Some(intent))
    }

    #[test]
    fn transitions() {
        assert!(OrderState::Intent.can_transition_to(OrderState::Submitted));
        assert!(OrderState::Partial.can_transition_to(OrderState::Submitted));
        assert!(OrderState::Rejected.can_transition_to(OrderState::Intent));
        assert!(!OrderState::Filled.can_transition_to(OrderState::Submitted));
        assert!(!OrderState::Intent.can_transition_to(OrderState::Filled));
        assert!(OrderState::CanceledAssumed.is_terminal());
        assert!(!OrderState::Partial.is_terminal());
    }

    #[test]
    fn fills_after_polls() {
        let mock = Arc::new(
            MockBroker::builder()
                .connected()
                .fill_mode(FillMode::FillAfterPolls(2))
                .with_price(sym(), 100_00)
                .build(),
        );
        let broker = guarded(&mock);
        let tracker = OrderTracker::new(&broker, config());
        let record = tracker.execute(buy(10), &mut keep).unwrap();

        assert_eq!(record.state, OrderState::Filled);
        assert_eq!(record.filled_quantity, 10);
        assert!(record.is_settled());
        assert_eq!(
            record.history,
            vec![OrderState::Intent, OrderState::Submitted, OrderState::Filled]
        );
    }

    #[test]
    fn partial_fill_times_out_to_partial_final() {
        let mock = Arc::new(
            MockBroker::builder()
                .connected()
                .fill_mode(FillMode::ImmediatePartial(0.4))
                .with_price(sym(), 100_00)
                .build(),
        );
        let broker = guarded(&mock);
        let tracker = OrderTracker::new(&broker, config());
        let record = tracker.execute(buy(10), &mut keep).unwrap();

        assert_eq!(record.state, OrderState::PartialFinal);
        assert_eq!(record.filled_quantity, 4);
        assert!(record.history.contains(&OrderState::Partial));
        assert!(record.is_settled());
        assert!(mock.pending_orders().unwrap().is_empty());
    }

    #[test]
    fn no_fill_times_out_to_canceled_assumed() {
        let mock = Arc::new(
            MockBroker::builder()
                .connected()
                .fill_mode(FillMode::Never)
                .cancel_confirms(false)
                .with_price(sym(), 100_00)
                .build(),
        );
        let broker = guarded(&mock);
        let tracker = OrderTracker::new(&broker, config());
        let record = tracker.execute(buy(10), &mut keep).unwrap();

        assert_eq!(record.state, OrderState::CanceledAssumed);
        // cancel unconfirmed: the order may still be live
        assert!(!record.is_settled());
    }

    #[test]
    fn downgrade_retry_until_it_fits() {
        // $1,000 of cash: 40 shares at $100 rejected, then 20, then 10 fits
        let mock = Arc::new(
            MockBroker::builder()
                .connected()
                .with_cash(1_000_00)
                .with_price(sym(), 100_00)
                .build(),
        );
        let broker = guarded(&mock);
        let tracker = OrderTracker::new(&broker, config());
        let record = tracker.execute(buy(40), &mut keep).unwrap();

        assert_eq!(record.state, OrderState::Filled);
        assert_eq!(record.intent.quantity, 10);
        assert_eq!(record.downgrades, 2);
        assert_eq!(record.attempts, 3);
        assert!(record.intent.margin_pct > 0.02);
        let sizes: Vec<u64> = mock.submitted_orders().iter().map(|o| o.quantity).collect();
        assert_eq!(sizes, vec![40, 20, 10]);
    }

    #[test]
    fn downgrade_retries_are_bounded() {
        let mock = Arc::new(
            MockBroker::builder()
                .connected()
                .fill_mode(FillMode::Reject(RejectReason::PositionLimit))
                .with_price(sym(), 100_00)
                .build(),
        );
        let broker = guarded(&mock);
        let tracker = OrderTracker::new(&broker, config());
        let record = tracker.execute(buy(64), &mut keep).unwrap();

        assert_eq!(record.state, OrderState::Failed);
        assert_eq!(record.downgrades, 3);
        assert_eq!(mock.submitted_orders().len(), 4);
    }

    #[test]
    fn non_downgradable_rejection_is_final() {
        let mock = Arc::new(
            MockBroker::builder()
                .connected()
                .fill_mode(FillMode::Reject(RejectReason::Other))
                .with_price(sym(), 100_00)
                .build(),
        );
        let broker = guarded(&mock);
        let tracker = OrderTracker::new(&broker, config());
        let record = tracker.execute(buy(5), &mut keep).unwrap();
        assert_eq!(record.state, OrderState::Rejected);
        assert_eq!(mock.submitted_orders().len(), 1);
    }

    #[test]
    fn resize_can_give_up() {
        let mock = Arc::new(
            MockBroker::builder()
                .connected()
                .fill_mode(FillMode::Reject(RejectReason::InsufficientFunds))
                .with_price(sym(), 100_00)
                .build(),
        );
        let broker = guarded(&mock);
        let tracker = OrderTracker::new(&broker, config());
        let record = tracker.execute(buy(5), &mut |_| Ok(None)).unwrap();
        assert_eq!(record.state, OrderState::Failed);
        assert_eq!(mock.submitted_orders().len(), 1);
    }

    #[test]
    fn ambiguous_submission_is_reattached_not_resubmitted() {
        let mock = Arc::new(
            MockBroker::builder()
                .connected()
                .with_price(sym(), 100_00)
                .build(),
        );
        mock.inject_ambiguous_submit(BrokerError::Connection("reset".into()));
        let broker = guarded(&mock);
        let tracker = OrderTracker::new(&broker, config());
        let record = tracker.execute(buy(5), &mut keep).unwrap();

        assert_eq!(record.state, OrderState::Filled);
        assert_eq!(mock.submitted_orders().len(), 1);
        assert_eq!(mock.held(sym()), 5);
    }

    #[test]
    fn unverifiable_submission_is_assumed_canceled() {
        let mock = Arc::new(
            MockBroker::builder()
                .connected()
                .with_price(sym(), 100_00)
                .build(),
        );
        mock.inject_ambiguous_submit(BrokerError::Connection("reset".into()));
        for _ in 0..2 {
            mock.inject_fault(MockCall::PendingOrders, BrokerError::RateLimit);
        }
        let broker = guarded(&mock);
        let tracker = OrderTracker::new(&broker, config());
        let record = tracker.execute(buy(5), &mut keep).unwrap();

        assert_eq!(record.state, OrderState::CanceledAssumed);
        assert!(record.broker_id.is_none());
        assert!(!record.is_settled());
        assert_eq!(mock.submitted_orders().len(), 1);
    }

    #[test]
    fn fatal_error_propagates() {
        let mock = Arc::new(
            MockBroker::builder()
                .connected()
                .with_price(sym(), 100_00)
                .build(),
        );
        mock.inject_fault(MockCall::Submit, BrokerError::Auth("revoked".into()));
        let broker = guarded(&mock);
        let tracker = OrderTracker::new(&broker, config());
        let halted = tracker.execute(buy(5), &mut keep).unwrap_err();
        assert!(halted.error.is_fatal());
        assert_eq!(halted.record.state, OrderState::Intent);
        assert!(halted.record.broker_id.is_none());
    }

    #[test]
    fn fatal_error_while_tracking_returns_live_record() {
        let mock = Arc::new(
            MockBroker::builder()
                .connected()
                .fill_mode(FillMode::Never)
                .with_price(sym(), 100_00)
                .build(),
        );
        mock.inject_fault(MockCall::Status, BrokerError::Auth("revoked".into()));
        let broker = guarded(&mock);
        let tracker = OrderTracker::new(&broker, config());
        let halted = tracker.execute(buy(5), &mut keep).unwrap_err();

        assert!(halted.error.is_fatal());
        assert_eq!(halted.record.state, OrderState::Submitted);
        assert!(halted.record.broker_id.is_some());
        assert!(!halted.record.is_settled());
        assert_eq!(mock.pending_orders().unwrap().len(), 1);
    }

    #[test]
    fn partial_fills_progress_to_filled() {
        let mock = Arc::new(
            MockBroker::builder()
                .connected()
                .fill_mode(FillMode::InSteps(3))
                .with_price(sym(), 100_00)
                .build(),
        );
        let broker = guarded(&mock);
        let tracker = OrderTracker::new(&broker, config());
        let record = tracker.execute(buy(9), &mut keep).unwrap();

        assert_eq!(record.state, OrderState::Filled);
        assert_eq!(record.filled_quantity, 9);
        assert_eq!(
            record.history,
            vec![
                OrderState::Intent,
                OrderState::Submitted,
                OrderState::Partial,
                OrderState::Submitted,
                OrderState::Partial,
                OrderState::Submitted,
                OrderState::Filled,
            ]
        );
    }

    #[test]
    fn submit_hook_sees_every_accepted_submission() {
        let mock = Arc::new(
            MockBroker::builder()
                .connected()
                .with_cash(1_000_00)
                .with_price(sym(), 100_00)
                .build(),
        );
        let broker = guarded(&mock);
        let seen = RefCell::new(Vec::new());
        let hook = |r: &OrderRecord| seen.borrow_mut().push((r.intent.quantity, r.state));
        let tracker = OrderTracker::new(&broker, config()).on_submit(&hook);
        tracker.execute(buy(40), &mut keep).unwrap();

        assert_eq!(
            *seen.borrow(),
            vec![
                (40, OrderState::Submitted),
                (20, OrderState::Submitted),
                (10, OrderState::Submitted),
            ]
        );
    }
}
