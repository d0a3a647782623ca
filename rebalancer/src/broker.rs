//! Broker access with bounded waits: every call runs under a timeout, and
//! transient failures are retried with full-jitter exponential backoff.

use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use ledgerless::Symbol;
use ledgerless_broker::paper::PaperAccount;
use ledgerless_broker::{
    Broker, BrokerError, BrokerOrder, BrokerOrderStatus, BrokerResult, CashSnapshot, OrderId,
    PendingOrder, Position, Quote,
};
use log::{debug, warn};
use rand::Rng;

use crate::config::{BrokerConfig, BrokerKind, Config};
use crate::error::{Error, Result};

/// Timeout and retry bounds for broker calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub call_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            call_timeout: Duration::from_secs(config.call_timeout_secs),
            max_attempts: config.max_call_attempts.max(1),
            backoff_initial: Duration::from_millis(config.backoff_initial_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// Sleep before retry number `attempt` (1-based): a uniform draw from
    /// `[0, min(max, initial * 2^(attempt-1))]`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let initial = self.backoff_initial.as_millis() as f64;
        let exp = initial * 2f64.powi(attempt.saturating_sub(1).min(30) as i32);
        let capped = exp.min(self.backoff_max.as_millis() as f64);
        if capped <= 0.0 {
            return Duration::ZERO;
        }
        let jitter = rand::rng().random_range(0.0..=capped);
        Duration::from_millis(jitter as u64)
    }
}

/// A broker wrapped with per-call timeouts, reconnects and bounded retries.
///
/// Order submission is the one call that is never retried here: a failed
/// submission may still have reached the broker, so the caller must check
/// the pending list before trying again.
pub struct GuardedBroker {
    inner: Arc<dyn Broker>,
    policy: RetryPolicy,
}

impl GuardedBroker {
    pub fn new(inner: Arc<dyn Broker>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Run `f` on a helper thread and wait at most `call_timeout` for it.
    ///
    /// A call that times out keeps running in the background; its result is
    /// discarded.
    fn call_once<T, F>(&self, name: &'static str, f: F) -> BrokerResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Broker) -> BrokerResult<T> + Send + 'static,
    {
        let broker = Arc::clone(&self.inner);
        let (tx, rx) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name(format!("broker-{name}"))
            .spawn(move || {
                let _ = tx.send(f(broker.as_ref()));
            });
        if let Err(e) = spawned {
            return Err(BrokerError::Other(format!("cannot spawn broker call: {e}")));
        }

        match rx.recv_timeout(self.policy.call_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!("broker {name} timed out after {:?}", self.policy.call_timeout);
                Err(BrokerError::Timeout(self.policy.call_timeout))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(BrokerError::Other(format!("broker {name} call panicked")))
            }
        }
    }

    fn ensure_connected(&self) -> BrokerResult<()> {
        if self.inner.is_connected() {
            return Ok(());
        }
        debug!("broker session down, reconnecting");
        self.call_once("connect", |b| b.connect())
    }

    /// Retry transient failures up to `max_attempts`, reconnecting as needed.
    fn with_retry<T, F>(&self, name: &'static str, f: F) -> BrokerResult<T>
    where
        T: Send + 'static,
        F: Fn(&dyn Broker) -> BrokerResult<T> + Send + Sync + Clone + 'static,
    {
        let mut attempt = 1;
        loop {
            let result = self
                .ensure_connected()
                .and_then(|()| self.call_once(name, f.clone()));
            match result {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        "broker {name} failed (attempt {attempt}/{}): {e}; retrying in {delay:?}",
                        self.policy.max_attempts
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Establish the session, retrying transient failures.
    pub fn connect(&self) -> BrokerResult<()> {
        self.with_retry("connect", |b| b.connect())
    }

    pub fn cash(&self) -> BrokerResult<CashSnapshot> {
        self.with_retry("cash", |b| b.cash())
    }

    pub fn positions(&self) -> BrokerResult<Vec<Position>> {
        self.with_retry("positions", |b| b.positions())
    }

    pub fn pending_orders(&self) -> BrokerResult<Vec<PendingOrder>> {
        self.with_retry("pending_orders", |b| b.pending_orders())
    }

    pub fn order_status(&self, id: OrderId) -> BrokerResult<BrokerOrderStatus> {
        self.with_retry("order_status", move |b| b.order_status(id))
    }

    pub fn cancel_order(&self, id: OrderId) -> BrokerResult<bool> {
        self.with_retry("cancel_order", move |b| b.cancel_order(id))
    }

    pub fn quote(&self, symbol: Symbol) -> BrokerResult<Quote> {
        self.with_retry("quote", move |b| b.quote(&symbol))
    }

    /// Submit once. The session is re-established first if needed, but the
    /// submission itself is never repeated.
    pub fn submit_order(&self, order: &BrokerOrder) -> BrokerResult<Option<OrderId>> {
        self.ensure_connected()?;
        let order = order.clone();
        self.call_once("submit_order", move |b| b.submit_order(&order))
    }
}

/// Build the broker named in config.
pub fn connect_broker(config: &Config) -> Result<Arc<dyn Broker>> {
    match config.broker.kind {
        BrokerKind::Paper => {
            let account = PaperAccount::load(&config.account_file()).map_err(Error::from_broker)?;
            let broker: Arc<dyn Broker> = Arc::new(account.into_broker());
            Ok(broker)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerless_broker::mock::{MockBroker, MockCall};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            call_timeout: Duration::from_millis(200),
            max_attempts: 3,
            backoff_initial: Duration::from_millis(1),
            backoff_max: Duration::from_millis(4),
        }
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy {
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_millis(300),
            ..fast_policy()
        };
        for attempt in 1..10 {
            assert!(policy.backoff(attempt) <= Duration::from_millis(300));
        }
        let zero = RetryPolicy {
            backoff_initial: Duration::ZERO,
            ..fast_policy()
        };
        assert_eq!(zero.backoff(3), Duration::ZERO);
    }

    #[test]
    fn reconnects_before_calling() {
        let mock = Arc::new(MockBroker::builder().with_cash(100_00).build());
        let broker = GuardedBroker::new(mock.clone(), fast_policy());
        assert!(!broker.is_connected());
        assert_eq!(broker.cash().unwrap().available_cents, 100_00);
        assert!(broker.is_connected());
    }

    #[test]
    fn transient_errors_are_retried() {
        let mock = Arc::new(MockBroker::builder().connected().build());
        mock.inject_fault(MockCall::Positions, BrokerError::RateLimit);
        mock.inject_fault(MockCall::Positions, BrokerError::Connection("reset".into()));
        let broker = GuardedBroker::new(mock.clone(), fast_policy());
        assert!(broker.positions().is_ok());
    }

    #[test]
    fn retries_are_bounded() {
        let mock = Arc::new(MockBroker::builder().connected().build());
        for _ in 0..3 {
            mock.inject_fault(MockCall::Cash, BrokerError::RateLimit);
        }
        let broker = GuardedBroker::new(mock.clone(), fast_policy());
        assert!(matches!(broker.cash(), Err(BrokerError::RateLimit)));
        assert!(broker.cash().is_ok());
    }

    #[test]
    fn fatal_errors_are_not_retried() {
        let mock = Arc::new(MockBroker::builder().connected().build());
        mock.inject_fault(MockCall::Cash, BrokerError::Auth("revoked".into()));
        mock.inject_fault(MockCall::Cash, BrokerError::Auth("revoked".into()));
        let broker = GuardedBroker::new(mock.clone(), fast_policy());
        assert!(broker.cash().unwrap_err().is_fatal());
        // second fault still queued: only one attempt was made
        assert!(broker.cash().is_err());
    }

    #[test]
    fn slow_calls_time_out() {
        let mock = Arc::new(
            MockBroker::builder()
                .connected()
                .latency(Duration::from_millis(300))
                .build(),
        );
        let policy = RetryPolicy {
            call_timeout: Duration::from_millis(20),
            max_attempts: 1,
            ..fast_policy()
        };
        let broker = GuardedBroker::new(mock.clone(), policy);
        assert!(matches!(broker.cash(), Err(BrokerError::Timeout(_))));
    }
}
