//! Shared broker types: positions, cash, orders, quotes.

use chrono::{DateTime, Utc};
use ledgerless::{Price, Side, Symbol};
use serde::{Deserialize, Serialize};

/// Broker-level position. Owned by the broker; callers only read copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    /// Positive = long, negative = short.
    pub quantity: i64,
    pub avg_cost_cents: i64,
    pub market_value_cents: i64,
}

impl Position {
    /// Mark price implied by market value, if the position is non-empty.
    pub fn mark_price(&self) -> Option<Price> {
        if self.quantity == 0 {
            return None;
        }
        let p = self.market_value_cents / self.quantity;
        (p > 0).then_some(Price(p))
    }

    /// Unrealized gain in cents (market value minus cost basis).
    pub fn unrealized_pnl_cents(&self) -> i64 {
        self.market_value_cents - self.quantity * self.avg_cost_cents
    }
}

/// Point-in-time cash figures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CashSnapshot {
    /// Cash the broker reports as available.
    pub available_cents: i64,
    /// Cash committed to working orders but not yet settled.
    pub frozen_cents: i64,
    /// Net asset value (total account equity).
    pub nav_cents: i64,
}

/// Order to submit to a broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerOrder {
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: u64,
    pub order_type: BrokerOrderType,
}

/// Market or limit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerOrderType {
    Market,
    Limit(Price),
}

impl BrokerOrderType {
    pub fn limit_price(&self) -> Option<Price> {
        match self {
            BrokerOrderType::Market => None,
            BrokerOrderType::Limit(p) => Some(*p),
        }
    }
}

/// Live quote from the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: Symbol,
    pub bid_cents: i64,
    pub ask_cents: i64,
    pub last_cents: i64,
}

impl Quote {
    /// Best usable reference price: mid if both sides are live, else last.
    pub fn reference_price(&self) -> Option<Price> {
        if self.bid_cents > 0 && self.ask_cents > 0 {
            return Some(Price((self.bid_cents + self.ask_cents) / 2));
        }
        (self.last_cents > 0).then_some(Price(self.last_cents))
    }
}

/// Opaque order ID returned by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderId(pub u64);

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A working order as listed by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOrder {
    pub id: OrderId,
    pub symbol: Symbol,
    pub side: Side,
    /// Original order quantity.
    pub quantity: u64,
    /// Quantity still working.
    pub remaining: u64,
    pub limit_price: Option<Price>,
    pub submitted_at: DateTime<Utc>,
}

/// Why the broker refused an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    InsufficientFunds,
    PositionLimit,
    Other,
}

impl RejectReason {
    /// Rejections that a smaller order could get past.
    pub fn is_downgradable(self) -> bool {
        matches!(
            self,
            RejectReason::InsufficientFunds | RejectReason::PositionLimit
        )
    }
}

/// Status of a submitted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerOrderStatus {
    pub id: OrderId,
    pub state: OrderState,
    pub filled_quantity: u64,
    pub remaining_quantity: u64,
    pub avg_fill_price_cents: i64,
    pub reject_reason: Option<RejectReason>,
}

/// Broker-side lifecycle state of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    Pending,
    Submitted,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderState {
    /// No further fills can occur.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Cancelled | OrderState::Rejected
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_price_from_market_value() {
        let p = Position {
            symbol: Symbol::new("AAPL"),
            quantity: 100,
            avg_cost_cents: 150_00,
            market_value_cents: 185_00 * 100,
        };
        assert_eq!(p.mark_price(), Some(Price(185_00)));
        assert_eq!(p.unrealized_pnl_cents(), 35_00 * 100);
    }

    #[test]
    fn quote_reference_falls_back_to_last() {
        let q = Quote {
            symbol: Symbol::new("AAPL"),
            bid_cents: 0,
            ask_cents: 0,
            last_cents: 101_00,
        };
        assert_eq!(q.reference_price(), Some(Price(101_00)));
    }

    #[test]
    fn downgradable_reasons() {
        assert!(RejectReason::InsufficientFunds.is_downgradable());
        assert!(!RejectReason::Other.is_downgradable());
    }
}
