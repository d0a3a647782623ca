//! Mock broker for testing: implements the `Broker` trait with configurable
//! fills and injectable faults.
//!
//! The mock keeps a small simulated account: fills move cash and positions,
//! working buys freeze cash, and every submission and final order state is
//! written to an event log so tests can assert ordering.
//!
//! ```ignore
//! use ledgerless_broker::mock::{MockBroker, FillMode};
//! use ledgerless::Symbol;
//!
//! let broker = MockBroker::builder()
//!     .fill_mode(FillMode::ImmediateFull)
//!     .with_cash(30_000_00)
//!     .with_price(Symbol::new("AAPL"), 150_00)
//!     .with_position(Symbol::new("AAPL"), 100, 120_00)
//!     .build();
//! ```

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ledgerless::{Price, Side, Symbol};
use rustc_hash::FxHashMap;

use crate::error::BrokerError;
use crate::types::*;
use crate::{Broker, BrokerResult};

/// How the mock broker handles submitted orders.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FillMode {
    /// Filled in full on the first status poll.
    ImmediateFull,
    /// The given fraction fills on the first poll; the remainder never does.
    ImmediatePartial(f64),
    /// Stays working for this many polls, then fills in full.
    FillAfterPolls(u32),
    /// Fills a 1/n slice on each poll until complete.
    InSteps(u32),
    /// Rejected on the first poll.
    Reject(RejectReason),
    /// Never fills.
    Never,
}

/// Broker calls that faults can be injected into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MockCall {
    Cash,
    Positions,
    PendingOrders,
    Submit,
    Status,
    Cancel,
    Quote,
}

/// A recorded order submission for assertion in tests.
#[derive(Clone, Debug)]
pub struct RecordedOrder {
    pub id: OrderId,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: u64,
    pub limit_price: Option<Price>,
    /// Cash available minus frozen at the moment of submission.
    pub free_cash_at_submit: i64,
}

/// Something the mock observed, in order.
#[derive(Clone, Debug, PartialEq)]
pub enum MockEvent {
    Submitted {
        id: OrderId,
        symbol: Symbol,
        side: Side,
        quantity: u64,
    },
    Finalized {
        id: OrderId,
        symbol: Symbol,
        side: Side,
        state: OrderState,
    },
}

#[derive(Clone, Debug)]
struct MockOrder {
    order: BrokerOrder,
    state: OrderState,
    filled: u64,
    avg_fill_price_cents: i64,
    polls: u32,
    mode: FillMode,
    reject_reason: Option<RejectReason>,
    submitted_at: DateTime<Utc>,
}

impl MockOrder {
    fn remaining(&self) -> u64 {
        self.order.quantity - self.filled
    }
}

#[derive(Debug)]
struct MockState {
    connected: bool,
    cash_cents: i64,
    positions: Vec<Position>,
    quotes: FxHashMap<Symbol, Quote>,
    orders: FxHashMap<OrderId, MockOrder>,
    next_order_id: u64,
    faults: FxHashMap<MockCall, VecDeque<BrokerError>>,
    ambiguous_submits: VecDeque<BrokerError>,
    submitted: Vec<RecordedOrder>,
    events: Vec<MockEvent>,
    max_open: FxHashMap<(Symbol, Side), usize>,
}

/// Builder for `MockBroker`.
pub struct MockBrokerBuilder {
    fill_mode: FillMode,
    symbol_modes: FxHashMap<Symbol, FillMode>,
    positions: Vec<(Symbol, i64, i64)>,
    quotes: FxHashMap<Symbol, Quote>,
    cash_cents: i64,
    report_frozen: bool,
    enforce_cash: bool,
    cancel_confirms: bool,
    latency: Option<Duration>,
    connected: bool,
}

impl MockBrokerBuilder {
    pub fn fill_mode(mut self, mode: FillMode) -> Self {
        self.fill_mode = mode;
        self
    }

    /// Override the fill mode for one symbol.
    pub fn symbol_fill_mode(mut self, symbol: Symbol, mode: FillMode) -> Self {
        self.symbol_modes.insert(symbol, mode);
        self
    }

    pub fn with_position(mut self, symbol: Symbol, quantity: i64, avg_cost_cents: i64) -> Self {
        self.positions.push((symbol, quantity, avg_cost_cents));
        self
    }

    pub fn with_quote(mut self, symbol: Symbol, bid: i64, ask: i64) -> Self {
        self.quotes.insert(
            symbol,
            Quote {
                symbol,
                bid_cents: bid,
                ask_cents: ask,
                last_cents: (bid + ask) / 2,
            },
        );
        self
    }

    /// Quote with zero spread.
    pub fn with_price(self, symbol: Symbol, price_cents: i64) -> Self {
        self.with_quote(symbol, price_cents, price_cents)
    }

    pub fn with_cash(mut self, cash_cents: i64) -> Self {
        self.cash_cents = cash_cents;
        self
    }

    /// Whether `cash()` reports working buys as frozen (default true). Some
    /// brokers do not, leaving the caller to estimate it.
    pub fn report_frozen(mut self, yes: bool) -> Self {
        self.report_frozen = yes;
        self
    }

    /// Whether buys costing more than free cash are rejected (default true).
    pub fn enforce_cash(mut self, yes: bool) -> Self {
        self.enforce_cash = yes;
        self
    }

    /// Whether `cancel_order` confirms cancellation (default true).
    pub fn cancel_confirms(mut self, yes: bool) -> Self {
        self.cancel_confirms = yes;
        self
    }

    /// Delay every call by `latency`.
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Start with the session already up.
    pub fn connected(mut self) -> Self {
        self.connected = true;
        self
    }

    pub fn build(self) -> MockBroker {
        let positions = self
            .positions
            .into_iter()
            .map(|(symbol, quantity, avg_cost_cents)| Position {
                symbol,
                quantity,
                avg_cost_cents,
                market_value_cents: quantity * avg_cost_cents,
            })
            .collect();

        MockBroker {
            default_mode: self.fill_mode,
            symbol_modes: self.symbol_modes,
            report_frozen: self.report_frozen,
            enforce_cash: self.enforce_cash,
            cancel_confirms: self.cancel_confirms,
            latency: self.latency,
            state: Mutex::new(MockState {
                connected: self.connected,
                cash_cents: self.cash_cents,
                positions,
                quotes: self.quotes,
                orders: FxHashMap::default(),
                next_order_id: 1,
                faults: FxHashMap::default(),
                ambiguous_submits: VecDeque::new(),
                submitted: Vec::new(),
                events: Vec::new(),
                max_open: FxHashMap::default(),
            }),
        }
    }
}

/// A mock broker that records submitted orders and simulates fills.
pub struct MockBroker {
    default_mode: FillMode,
    symbol_modes: FxHashMap<Symbol, FillMode>,
    report_frozen: bool,
    enforce_cash: bool,
    cancel_confirms: bool,
    latency: Option<Duration>,
    state: Mutex<MockState>,
}

impl MockBroker {
    pub fn builder() -> MockBrokerBuilder {
        MockBrokerBuilder {
            fill_mode: FillMode::ImmediateFull,
            symbol_modes: FxHashMap::default(),
            positions: Vec::new(),
            quotes: FxHashMap::default(),
            cash_cents: 1_000_000_00,
            report_frozen: true,
            enforce_cash: true,
            cancel_confirms: true,
            latency: None,
            connected: false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enter a call: apply latency, connection check and injected faults.
    fn enter(&self, call: MockCall) -> BrokerResult<MutexGuard<'_, MockState>> {
        if let Some(latency) = self.latency {
            thread::sleep(latency);
        }
        let mut state = self.lock();
        if let Some(err) = state.faults.get_mut(&call).and_then(|q| q.pop_front()) {
            if matches!(err, BrokerError::Connection(_)) {
                state.connected = false;
            }
            return Err(err);
        }
        if !state.connected {
            return Err(BrokerError::NotConnected);
        }
        Ok(state)
    }

    /// Make the next call of `call` fail with `err`. Faults queue up.
    pub fn inject_fault(&self, call: MockCall, err: BrokerError) {
        self.lock().faults.entry(call).or_default().push_back(err);
    }

    /// Make the next submission reach the broker but report `err` to the
    /// caller, as when the connection drops after the order was sent.
    pub fn inject_ambiguous_submit(&self, err: BrokerError) {
        self.lock().ambiguous_submits.push_back(err);
    }

    /// Place a working order directly at the broker, bypassing the caller
    /// (e.g. an order whose local record was lost).
    pub fn seed_pending_order(
        &self,
        symbol: Symbol,
        side: Side,
        quantity: u64,
        submitted_at: DateTime<Utc>,
        mode: FillMode,
    ) -> OrderId {
        let mut state = self.lock();
        let id = OrderId(state.next_order_id);
        state.next_order_id += 1;
        state.orders.insert(
            id,
            MockOrder {
                order: BrokerOrder {
                    symbol,
                    side,
                    quantity,
                    order_type: BrokerOrderType::Market,
                },
                state: OrderState::Submitted,
                filled: 0,
                avg_fill_price_cents: 0,
                polls: 0,
                mode,
                reject_reason: None,
                submitted_at,
            },
        );
        id
    }

    /// Get all orders that were submitted (for assertion in tests).
    pub fn submitted_orders(&self) -> Vec<RecordedOrder> {
        self.lock().submitted.clone()
    }

    /// Submission and finalization events in the order they happened.
    pub fn events(&self) -> Vec<MockEvent> {
        self.lock().events.clone()
    }

    /// Largest number of simultaneously working orders seen for a key.
    pub fn max_open(&self, symbol: Symbol, side: Side) -> usize {
        self.lock()
            .max_open
            .get(&(symbol, side))
            .copied()
            .unwrap_or(0)
    }

    /// Current held quantity of a symbol.
    pub fn held(&self, symbol: Symbol) -> i64 {
        self.lock()
            .positions
            .iter()
            .find(|p| p.symbol == symbol)
            .map_or(0, |p| p.quantity)
    }

    /// Settled cash.
    pub fn cash_cents(&self) -> i64 {
        self.lock().cash_cents
    }

    fn mode_for(&self, symbol: &Symbol) -> FillMode {
        self.symbol_modes
            .get(symbol)
            .copied()
            .unwrap_or(self.default_mode)
    }
}

impl MockState {
    fn price_of(&self, symbol: &Symbol) -> Option<i64> {
        if let Some(p) = self.quotes.get(symbol).and_then(|q| q.reference_price()) {
            return Some(p.0);
        }
        self.positions
            .iter()
            .find(|p| p.symbol == *symbol)
            .and_then(|p| p.mark_price())
            .map(|p| p.0)
    }

    fn frozen_cents(&self) -> i64 {
        self.orders
            .values()
            .filter(|o| o.order.side == Side::Buy && !o.state.is_final())
            .map(|o| {
                let px = o
                    .order
                    .order_type
                    .limit_price()
                    .map(|p| p.0)
                    .or_else(|| self.price_of(&o.order.symbol))
                    .unwrap_or(0);
                o.remaining() as i64 * px
            })
            .sum()
    }

    fn marked_positions(&self) -> Vec<Position> {
        self.positions
            .iter()
            .map(|p| {
                let mut p = p.clone();
                if let Some(px) = self.quotes.get(&p.symbol).and_then(|q| q.reference_price()) {
                    p.market_value_cents = p.quantity * px.0;
                }
                p
            })
            .collect()
    }

    fn open_count(&self, symbol: Symbol, side: Side) -> usize {
        self.orders
            .values()
            .filter(|o| o.order.symbol == symbol && o.order.side == side && !o.state.is_final())
            .count()
    }

    /// Apply a fill of `qty` at `price` to cash and positions.
    fn apply_fill(&mut self, id: OrderId, qty: u64, price: i64) {
        let Some(order) = self.orders.get_mut(&id) else {
            return;
        };
        if qty == 0 {
            return;
        }
        let prev_filled = order.filled as i64;
        order.filled += qty;
        order.avg_fill_price_cents =
            (order.avg_fill_price_cents * prev_filled + price * qty as i64) / order.filled as i64;
        let symbol = order.order.symbol;
        let side = order.order.side;

        let signed = side.sign() * qty as i64;
        self.cash_cents += side.cash_sign() * qty as i64 * price;

        match self.positions.iter_mut().find(|p| p.symbol == symbol) {
            Some(pos) => {
                if side == Side::Buy && pos.quantity + signed != 0 {
                    pos.avg_cost_cents = (pos.avg_cost_cents * pos.quantity
                        + price * qty as i64)
                        / (pos.quantity + signed);
                }
                pos.quantity += signed;
                pos.market_value_cents = pos.quantity * price;
            }
            None => self.positions.push(Position {
                symbol,
                quantity: signed,
                avg_cost_cents: price,
                market_value_cents: signed * price,
            }),
        }
        self.positions.retain(|p| p.quantity != 0);
    }

    fn finalize(&mut self, id: OrderId, state: OrderState) {
        let Some(order) = self.orders.get_mut(&id) else {
            return;
        };
        if order.state.is_final() {
            return;
        }
        order.state = state;
        let (symbol, side) = (order.order.symbol, order.order.side);
        self.events.push(MockEvent::Finalized {
            id,
            symbol,
            side,
            state,
        });
    }

    /// Advance an order by one poll according to its fill mode.
    fn advance(&mut self, id: OrderId) {
        let Some(order) = self.orders.get_mut(&id) else {
            return;
        };
        if order.state.is_final() {
            return;
        }
        order.polls += 1;
        let (mode, polls, symbol, remaining, quantity, filled) = (
            order.mode,
            order.polls,
            order.order.symbol,
            order.remaining(),
            order.order.quantity,
            order.filled,
        );
        let price = self.price_of(&symbol).unwrap_or(0);

        match mode {
            FillMode::ImmediateFull => {
                self.apply_fill(id, remaining, price);
                self.finalize(id, OrderState::Filled);
            }
            FillMode::ImmediatePartial(frac) => {
                if filled == 0 {
                    let qty = ((quantity as f64 * frac) as u64).min(remaining);
                    self.apply_fill(id, qty, price);
                    if let Some(o) = self.orders.get_mut(&id) {
                        o.state = if qty > 0 {
                            OrderState::PartiallyFilled
                        } else {
                            OrderState::Submitted
                        };
                    }
                }
            }
            FillMode::FillAfterPolls(n) => {
                if polls > n {
                    self.apply_fill(id, remaining, price);
                    self.finalize(id, OrderState::Filled);
                }
            }
            FillMode::InSteps(n) => {
                let step = quantity.div_ceil(u64::from(n.max(1)));
                let qty = step.min(remaining);
                self.apply_fill(id, qty, price);
                if qty == remaining {
                    self.finalize(id, OrderState::Filled);
                } else if let Some(o) = self.orders.get_mut(&id) {
                    o.state = OrderState::PartiallyFilled;
                }
            }
            FillMode::Reject(reason) => {
                if let Some(o) = self.orders.get_mut(&id) {
                    o.reject_reason = Some(reason);
                }
                self.finalize(id, OrderState::Rejected);
            }
            FillMode::Never => {}
        }
    }
}

impl Broker for MockBroker {
    fn connect(&self) -> BrokerResult<()> {
        self.lock().connected = true;
        Ok(())
    }

    fn disconnect(&self) -> BrokerResult<()> {
        self.lock().connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    fn cash(&self) -> BrokerResult<CashSnapshot> {
        let state = self.enter(MockCall::Cash)?;
        let positions_value: i64 = state
            .marked_positions()
            .iter()
            .map(|p| p.market_value_cents)
            .sum();
        Ok(CashSnapshot {
            available_cents: state.cash_cents,
            frozen_cents: if self.report_frozen {
                state.frozen_cents()
            } else {
                0
            },
            nav_cents: state.cash_cents + positions_value,
        })
    }

    fn positions(&self) -> BrokerResult<Vec<Position>> {
        let state = self.enter(MockCall::Positions)?;
        Ok(state.marked_positions())
    }

    fn pending_orders(&self) -> BrokerResult<Vec<PendingOrder>> {
        let state = self.enter(MockCall::PendingOrders)?;
        let mut pending: Vec<PendingOrder> = state
            .orders
            .iter()
            .filter(|(_, o)| !o.state.is_final())
            .map(|(id, o)| PendingOrder {
                id: *id,
                symbol: o.order.symbol,
                side: o.order.side,
                quantity: o.order.quantity,
                remaining: o.remaining(),
                limit_price: o.order.order_type.limit_price(),
                submitted_at: o.submitted_at,
            })
            .collect();
        pending.sort_by_key(|p| p.id);
        Ok(pending)
    }

    fn submit_order(&self, order: &BrokerOrder) -> BrokerResult<Option<OrderId>> {
        let mut state = self.enter(MockCall::Submit)?;
        if order.quantity == 0 {
            return Err(BrokerError::Order("quantity must be > 0".into()));
        }
        let price = state
            .price_of(&order.symbol)
            .ok_or_else(|| BrokerError::InvalidSymbol(order.symbol.as_str().to_string()))?;

        let id = OrderId(state.next_order_id);
        state.next_order_id += 1;

        let free_cash = state.cash_cents - state.frozen_cents();
        let mut mode = self.mode_for(&order.symbol);
        if self.enforce_cash && order.side == Side::Buy {
            let cost_px = order.order_type.limit_price().map_or(price, |p| p.0);
            if order.quantity as i64 * cost_px > free_cash {
                mode = FillMode::Reject(RejectReason::InsufficientFunds);
            }
        }

        state.orders.insert(
            id,
            MockOrder {
                order: order.clone(),
                state: OrderState::Submitted,
                filled: 0,
                avg_fill_price_cents: 0,
                polls: 0,
                mode,
                reject_reason: None,
                submitted_at: Utc::now(),
            },
        );
        state.submitted.push(RecordedOrder {
            id,
            symbol: order.symbol,
            side: order.side,
            quantity: order.quantity,
            limit_price: order.order_type.limit_price(),
            free_cash_at_submit: free_cash,
        });
        state.events.push(MockEvent::Submitted {
            id,
            symbol: order.symbol,
            side: order.side,
            quantity: order.quantity,
        });
        let open = state.open_count(order.symbol, order.side);
        let max = state.max_open.entry((order.symbol, order.side)).or_insert(0);
        *max = (*max).max(open);

        if let Some(err) = state.ambiguous_submits.pop_front() {
            if matches!(err, BrokerError::Connection(_)) {
                state.connected = false;
            }
            return Err(err);
        }
        Ok(Some(id))
    }

    fn order_status(&self, id: OrderId) -> BrokerResult<BrokerOrderStatus> {
        let mut state = self.enter(MockCall::Status)?;
        if !state.orders.contains_key(&id) {
            return Err(BrokerError::Order(format!("unknown order {id}")));
        }
        state.advance(id);
        let order = &state.orders[&id];
        Ok(BrokerOrderStatus {
            id,
            state: order.state,
            filled_quantity: order.filled,
            remaining_quantity: order.remaining(),
            avg_fill_price_cents: order.avg_fill_price_cents,
            reject_reason: order.reject_reason,
        })
    }

    fn cancel_order(&self, id: OrderId) -> BrokerResult<bool> {
        let mut state = self.enter(MockCall::Cancel)?;
        match state.orders.get(&id) {
            None => Ok(false),
            Some(o) if o.state.is_final() => Ok(false),
            Some(_) if !self.cancel_confirms => Ok(false),
            Some(_) => {
                state.finalize(id, OrderState::Cancelled);
                Ok(true)
            }
        }
    }

    fn quote(&self, symbol: &Symbol) -> BrokerResult<Quote> {
        let state = self.enter(MockCall::Quote)?;
        state
            .quotes
            .get(symbol)
            .copied()
            .ok_or_else(|| BrokerError::InvalidSymbol(symbol.as_str().to_string()))
    }
}
