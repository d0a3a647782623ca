//! Broker capability trait and implementations for ledgerless.
//!
//! The rebalancer never inspects brokerage-specific types: every brokerage is
//! driven through the [`Broker`] trait. Implementations:
//!
//! - [`mock::MockBroker`]: in-memory broker with fault injection, for tests
//! - [`paper::PaperAccount`]: JSON-backed paper account built on the mock,
//!   for dry runs from the command line

pub mod error;
pub mod mock;
pub mod paper;
pub mod types;

pub use error::{BrokerError, Severity};
pub use types::*;

use ledgerless::Symbol;

/// Result alias for broker calls.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// A broker connection: the external system of record for cash and positions.
///
/// Every method may fail with a transient error (retry with backoff) or a
/// fatal one (abort and surface to the operator); see
/// [`BrokerError::severity`].
pub trait Broker: Send + Sync {
    /// (Re)establish the session.
    fn connect(&self) -> BrokerResult<()>;

    /// Disconnect gracefully.
    fn disconnect(&self) -> BrokerResult<()>;

    /// Whether the session is currently up.
    fn is_connected(&self) -> bool;

    /// Current cash figures.
    fn cash(&self) -> BrokerResult<CashSnapshot>;

    /// All current positions.
    fn positions(&self) -> BrokerResult<Vec<Position>>;

    /// Orders still working at the broker.
    fn pending_orders(&self) -> BrokerResult<Vec<PendingOrder>>;

    /// Submit an order. `Ok(None)` means the broker refused it without
    /// assigning an id.
    fn submit_order(&self, order: &BrokerOrder) -> BrokerResult<Option<OrderId>>;

    /// Status of a submitted order.
    fn order_status(&self, id: OrderId) -> BrokerResult<BrokerOrderStatus>;

    /// Request cancellation. `Ok(true)` if the broker confirmed it.
    fn cancel_order(&self, id: OrderId) -> BrokerResult<bool>;

    /// Current quote for a symbol.
    fn quote(&self, symbol: &Symbol) -> BrokerResult<Quote>;
}
