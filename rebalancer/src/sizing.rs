//! Order sizing: target weight → lot-rounded quantity, with the safety
//! margin applied to buys and a running cash budget across a pass.

use ledgerless::{Price, Side, Symbol};
use ledgerless_broker::{BrokerOrder, BrokerOrderType};
use serde::Serialize;

use crate::reconcile::AccountSnapshot;

/// A sized order, ready for admission and submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderIntent {
    pub symbol: Symbol,
    pub side: Side,
    /// Whole lots, except a full exit which may include an odd lot.
    pub quantity: u64,
    pub limit_price: Option<Price>,
    /// Price the quantity was sized at.
    pub reference_price: Price,
    pub lot_size: u64,
    /// Fraction the buy was shrunk by (0 for sells).
    pub margin_pct: f64,
}

impl OrderIntent {
    /// Per-share price used for cost estimates: the limit if set.
    pub fn unit_price(&self) -> Price {
        self.limit_price.unwrap_or(self.reference_price)
    }

    pub fn estimated_cost_cents(&self) -> i64 {
        self.quantity as i64 * self.unit_price().0
    }

    /// Use a limit `bps` away from the reference price (buys above, sells
    /// below). Zero keeps a market order.
    pub fn with_limit_offset(mut self, bps: u32) -> Self {
        if bps > 0 {
            let signed = self.side.sign() * bps as i64;
            self.limit_price = Some(self.reference_price.offset_bps(signed));
        }
        self
    }

    /// Same intent at a new quantity.
    pub fn resized(&self, quantity: u64) -> Self {
        Self {
            quantity,
            ..self.clone()
        }
    }

    pub fn to_broker_order(&self) -> BrokerOrder {
        BrokerOrder {
            symbol: self.symbol,
            side: self.side,
            quantity: self.quantity,
            order_type: match self.limit_price {
                Some(p) => BrokerOrderType::Limit(p),
                None => BrokerOrderType::Market,
            },
        }
    }
}

impl std::fmt::Display for OrderIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.side, self.quantity, self.symbol)?;
        match self.limit_price {
            Some(p) => write!(f, " @ {p}"),
            None => write!(f, " @ MKT (~{})", self.reference_price),
        }
    }
}

/// Why a symbol produced no order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    /// Already at target.
    NoChange,
    /// No usable price.
    NoPrice,
    /// Nothing held to sell.
    NoHolding,
    /// The trade rounds to less than one lot.
    SubLot,
    /// Below the drift threshold or minimum trade size.
    BelowThreshold,
    /// Over target, but within tolerance and in profit.
    WinnerExempt,
    /// No cash left in this pass's budget.
    InsufficientCapacity,
    /// Another order for this symbol and side is in flight.
    GuardConflict,
    /// The broker lists a working order for this symbol and side.
    PendingOrder,
    /// The per-run order limit was reached.
    OrderLimit,
    /// The admission lock would expire before the order could finish.
    LockExpiring,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SkipReason::NoChange => "at target",
            SkipReason::NoPrice => "no price",
            SkipReason::NoHolding => "nothing held",
            SkipReason::SubLot => "less than one lot",
            SkipReason::BelowThreshold => "below threshold",
            SkipReason::WinnerExempt => "winner left to run",
            SkipReason::InsufficientCapacity => "insufficient cash",
            SkipReason::GuardConflict => "order already in flight",
            SkipReason::PendingOrder => "working order at broker",
            SkipReason::OrderLimit => "order limit reached",
            SkipReason::LockExpiring => "admission lock near expiry",
        };
        f.pad(s)
    }
}

/// Outcome of sizing one symbol.
#[derive(Debug, Clone, PartialEq)]
pub enum Sizing {
    Order(OrderIntent),
    Skip(SkipReason),
}

impl Sizing {
    pub fn intent(self) -> Option<OrderIntent> {
        match self {
            Sizing::Order(i) => Some(i),
            Sizing::Skip(_) => None,
        }
    }
}

/// Round down to whole lots.
pub fn lot_floor(quantity: u64, lot_size: u64) -> u64 {
    let lot = lot_size.max(1);
    quantity / lot * lot
}

/// Size the order that moves `symbol` toward `target_weight` of NAV.
///
/// Pure: the same snapshot always gives the same answer.
///
/// - Sells (over target, or target 0) use the full gap, are never shrunk by
///   the margin, and never exceed the held quantity. When the gap reaches
///   the whole holding, the whole holding is sold, odd lot included.
/// - Buys use `gap * (1 - margin_pct)`.
/// - Quantities round down to whole lots; less than one lot is a skip.
pub fn compute_order_size(
    symbol: Symbol,
    target_weight: f64,
    snapshot: &AccountSnapshot,
    lot_size: u64,
    margin_pct: f64,
) -> Sizing {
    let Some(price) = snapshot.price(&symbol).filter(|p| p.0 > 0) else {
        return Sizing::Skip(SkipReason::NoPrice);
    };
    let lot = lot_size.max(1);

    let target_value = (snapshot.nav_cents() as f64 * target_weight) as i64;
    let current_value = snapshot.market_value_cents(&symbol);
    let delta = target_value - current_value;

    if target_weight == 0.0 || delta < 0 {
        let held = snapshot.held(&symbol);
        if held <= 0 {
            return if target_weight == 0.0 {
                Sizing::Skip(SkipReason::NoChange)
            } else {
                Sizing::Skip(SkipReason::NoHolding)
            };
        }
        let held = held as u64;
        let raw = if target_weight == 0.0 {
            held
        } else {
            (delta.unsigned_abs() / price.0 as u64).min(held)
        };
        let quantity = if raw >= held { held } else { lot_floor(raw, lot) };
        if quantity == 0 {
            return Sizing::Skip(SkipReason::SubLot);
        }
        return Sizing::Order(OrderIntent {
            symbol,
            side: Side::Sell,
            quantity,
            limit_price: None,
            reference_price: price,
            lot_size: lot,
            margin_pct: 0.0,
        });
    }

    if delta == 0 {
        return Sizing::Skip(SkipReason::NoChange);
    }

    let usable = delta as f64 * (1.0 - margin_pct);
    let shares = (usable / price.0 as f64).floor().max(0.0) as u64;
    let quantity = lot_floor(shares, lot);
    if quantity == 0 {
        return Sizing::Skip(SkipReason::SubLot);
    }
    Sizing::Order(OrderIntent {
        symbol,
        side: Side::Buy,
        quantity,
        limit_price: None,
        reference_price: price,
        lot_size: lot,
        margin_pct,
    })
}

/// Cash still available to buys in one pass.
///
/// Starts from the snapshot's free cash (available minus frozen) and only
/// goes down: a buy that does not fit is shrunk to whole lots or dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuyBudget {
    remaining_cents: i64,
}

impl BuyBudget {
    pub fn new(free_cash_cents: i64) -> Self {
        Self {
            remaining_cents: free_cash_cents.max(0),
        }
    }

    pub fn remaining_cents(&self) -> i64 {
        self.remaining_cents
    }

    /// Lower the budget to `cents` if that is tighter (e.g. a fresh snapshot
    /// shows less free cash than expected).
    pub fn cap(&mut self, cents: i64) {
        self.remaining_cents = self.remaining_cents.min(cents.max(0));
    }

    /// Largest whole-lot quantity of `intent` the budget can pay for.
    pub fn capacity(&self, intent: &OrderIntent) -> u64 {
        let unit = intent.unit_price().0;
        if unit <= 0 {
            return 0;
        }
        lot_floor((self.remaining_cents / unit) as u64, intent.lot_size)
    }

    /// Shrink `intent` to what remains, or skip it.
    pub fn fit(&self, intent: OrderIntent) -> Sizing {
        let max = self.capacity(&intent);
        if intent.quantity <= max {
            Sizing::Order(intent)
        } else if max == 0 {
            Sizing::Skip(SkipReason::InsufficientCapacity)
        } else {
            Sizing::Order(intent.resized(max))
        }
    }

    /// Record cash spent or committed.
    pub fn commit(&mut self, cents: i64) {
        self.remaining_cents = (self.remaining_cents - cents.max(0)).max(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::tests::snapshot;

    fn sym(s: &str) -> Symbol {
        Symbol::new(s)
    }

    #[test]
    fn buy_is_margin_shrunk() {
        // NAV $100k, flat, price $100, target 30%: gap $30k, usable $29.4k
        let mut snap = snapshot(100_000_00, 100_000_00, &[]);
        snap.prices.insert(sym("B"), Price(100_00));
        let Sizing::Order(intent) = compute_order_size(sym("B"), 0.3, &snap, 1, 0.02) else {
            panic!("expected order");
        };
        assert_eq!(intent.side, Side::Buy);
        assert_eq!(intent.quantity, 294);
        assert_eq!(intent.margin_pct, 0.02);
    }

    #[test]
    fn sell_uses_full_gap() {
        // A at 60% of $100k, target 50%: sell $10k at $100 = 100 shares
        let snap = snapshot(100_000_00, 0, &[("A", 600, 90_00, 100_00)]);
        let Sizing::Order(intent) = compute_order_size(sym("A"), 0.5, &snap, 1, 0.5) else {
            panic!("expected order");
        };
        assert_eq!(intent.side, Side::Sell);
        assert_eq!(intent.quantity, 100);
        assert_eq!(intent.margin_pct, 0.0);
    }

    #[test]
    fn lot_rounding_drops_sub_lot() {
        let mut snap = snapshot(100_000_00, 100_000_00, &[]);
        snap.prices.insert(sym("SHSE.600000"), Price(10_00));
        // $500 at $10 = 50 shares < 100 lot
        assert_eq!(
            compute_order_size(sym("SHSE.600000"), 0.005, &snap, 100, 0.0),
            Sizing::Skip(SkipReason::SubLot)
        );
        let Sizing::Order(i) = compute_order_size(sym("SHSE.600000"), 0.0275, &snap, 100, 0.0)
        else {
            panic!("expected order");
        };
        assert_eq!(i.quantity, 200);
    }

    #[test]
    fn full_exit_releases_odd_lot() {
        let snap = snapshot(100_000_00, 0, &[("SHSE.600000", 250, 9_00, 10_00)]);
        let Sizing::Order(i) = compute_order_size(sym("SHSE.600000"), 0.0, &snap, 100, 0.02) else {
            panic!("expected order");
        };
        assert_eq!(i.quantity, 250);
    }

    #[test]
    fn partial_sell_rounds_to_lots() {
        // hold 250 @ $10 = $2500 of $100k; target 0.5% = $500: gap $2000 = 200 sh
        let snap = snapshot(100_000_00, 0, &[("SHSE.600000", 250, 9_00, 10_00)]);
        let Sizing::Order(i) = compute_order_size(sym("SHSE.600000"), 0.005, &snap, 100, 0.0)
        else {
            panic!("expected order");
        };
        assert_eq!(i.quantity, 200);
    }

    #[test]
    fn sell_clamps_to_held() {
        // market value says 600 shares' worth but broker holds only 100
        let mut snap = snapshot(100_000_00, 0, &[("A", 100, 90_00, 100_00)]);
        snap.positions[0].market_value_cents = 60_000_00;
        let Sizing::Order(i) = compute_order_size(sym("A"), 0.1, &snap, 1, 0.0) else {
            panic!("expected order");
        };
        assert_eq!(i.quantity, 100);
    }

    #[test]
    fn exit_of_flat_symbol_is_noop() {
        let mut snap = snapshot(100_000_00, 100_000_00, &[]);
        snap.prices.insert(sym("A"), Price(1_00));
        assert_eq!(
            compute_order_size(sym("A"), 0.0, &snap, 1, 0.0),
            Sizing::Skip(SkipReason::NoChange)
        );
    }

    #[test]
    fn missing_price_skips() {
        let snap = snapshot(100_000_00, 100_000_00, &[]);
        assert_eq!(
            compute_order_size(sym("ZZZ"), 0.1, &snap, 1, 0.0),
            Sizing::Skip(SkipReason::NoPrice)
        );
    }

    #[test]
    fn sizing_is_idempotent() {
        let snap = snapshot(100_000_00, 40_000_00, &[("A", 600, 90_00, 100_00)]);
        let a = compute_order_size(sym("A"), 0.2, &snap, 1, 0.02);
        let b = compute_order_size(sym("A"), 0.2, &snap, 1, 0.02);
        assert_eq!(a, b);
    }

    #[test]
    fn limit_offset_direction() {
        let mut snap = snapshot(100_000_00, 100_000_00, &[]);
        snap.prices.insert(sym("B"), Price(200_00));
        let buy = compute_order_size(sym("B"), 0.1, &snap, 1, 0.0)
            .intent()
            .unwrap()
            .with_limit_offset(10);
        assert_eq!(buy.limit_price, Some(Price(200_20)));
        assert_eq!(buy.estimated_cost_cents(), buy.quantity as i64 * 200_20);

        let sell = OrderIntent {
            side: Side::Sell,
            ..buy.clone()
        }
        .with_limit_offset(10);
        assert_eq!(sell.limit_price, Some(Price(199_80)));
    }

    #[test]
    fn budget_shrinks_then_drops() {
        let intent = OrderIntent {
            symbol: sym("B"),
            side: Side::Buy,
            quantity: 300,
            limit_price: None,
            reference_price: Price(10_00),
            lot_size: 100,
            margin_pct: 0.0,
        };
        let mut budget = BuyBudget::new(2_500_00);
        let Sizing::Order(fitted) = budget.fit(intent.clone()) else {
            panic!("expected order");
        };
        assert_eq!(fitted.quantity, 200);
        budget.commit(fitted.estimated_cost_cents());
        assert_eq!(budget.remaining_cents(), 500_00);
        assert_eq!(budget.fit(intent), Sizing::Skip(SkipReason::InsufficientCapacity));
    }

    #[test]
    fn budget_never_negative() {
        let mut budget = BuyBudget::new(-5);
        assert_eq!(budget.remaining_cents(), 0);
        budget.commit(100);
        assert_eq!(budget.remaining_cents(), 0);
        budget = BuyBudget::new(1_000);
        budget.cap(400);
        assert_eq!(budget.remaining_cents(), 400);
        budget.cap(900);
        assert_eq!(budget.remaining_cents(), 400);
    }
}
