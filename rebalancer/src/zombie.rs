//! Zombie reattachment: after a reconnect, match broker-side working orders
//! to orders we were tracking, so nothing is submitted twice.

use std::time::Duration;

use chrono::{DateTime, Utc};
use ledgerless_broker::{OrderId, PendingOrder};
use log::{info, warn};

use crate::order::OrderRecord;

/// What recovery decided for one locally known order.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Still working at the broker under this order.
    Reattached(PendingOrder),
    /// Attached, but no longer working: the broker has finished with it.
    Settled,
    /// No matching broker order within the grace window; safe to resubmit.
    Lost,
    /// No match yet, but too recent to give up on.
    Waiting,
}

/// Result of [`ZombieMatcher::reattach`].
#[derive(Debug, Clone, Default)]
pub struct ZombieOutcome {
    /// One entry per input record, in order.
    pub dispositions: Vec<Disposition>,
    /// Working broker orders no local record claims.
    pub unknown: Vec<PendingOrder>,
}

impl ZombieOutcome {
    pub fn reattached_count(&self) -> usize {
        self.dispositions
            .iter()
            .filter(|d| matches!(d, Disposition::Reattached(_)))
            .count()
    }
}

/// Matches unattached local orders to broker pending orders by symbol (alias
/// aware), side, quantity and submission time.
#[derive(Debug, Clone, Copy)]
pub struct ZombieMatcher {
    /// Largest gap between local and broker submission times for a match.
    pub window: Duration,
    /// How long an unmatched order is kept before it is declared lost.
    pub grace: Duration,
}

impl ZombieMatcher {
    pub fn new(window: Duration, grace: Duration) -> Self {
        Self { window, grace }
    }

    /// Decide the fate of each record against the broker's pending list.
    ///
    /// Records that already carry a broker id are matched by id first; the
    /// remaining pending orders are then offered to unattached records, each
    /// claimed at most once, closest submission time first.
    pub fn reattach(
        &self,
        records: &[OrderRecord],
        pending: &[PendingOrder],
        now: DateTime<Utc>,
    ) -> ZombieOutcome {
        let mut claimed: Vec<OrderId> = Vec::new();
        let mut dispositions = vec![Disposition::Waiting; records.len()];

        for (i, record) in records.iter().enumerate() {
            let Some(id) = record.broker_id else {
                continue;
            };
            dispositions[i] = match pending.iter().find(|p| p.id == id) {
                Some(p) => {
                    claimed.push(id);
                    Disposition::Reattached(p.clone())
                }
                None => Disposition::Settled,
            };
        }

        for (i, record) in records.iter().enumerate() {
            if record.broker_id.is_some() {
                continue;
            }
            let found = pending
                .iter()
                .filter(|p| !claimed.contains(&p.id) && self.matches(record, p))
                .min_by_key(|p| gap(record, p));
            dispositions[i] = match found {
                Some(p) => {
                    info!(
                        "{}: reattached {} {} {} to broker order",
                        p.id, record.intent.side, record.intent.quantity, record.intent.symbol
                    );
                    claimed.push(p.id);
                    Disposition::Reattached(p.clone())
                }
                None if self.past_grace(record, now) => {
                    warn!(
                        "{}: no broker order found within {:?}, treating as lost",
                        record.intent, self.grace
                    );
                    Disposition::Lost
                }
                None => Disposition::Waiting,
            };
        }

        let unknown = pending
            .iter()
            .filter(|p| !claimed.contains(&p.id))
            .cloned()
            .collect();

        ZombieOutcome {
            dispositions,
            unknown,
        }
    }

    /// Whether `pending` could be the broker's copy of `record`.
    pub fn matches(&self, record: &OrderRecord, pending: &PendingOrder) -> bool {
        let intent = &record.intent;
        if !pending.symbol.matches_alias(&intent.symbol)
            || pending.side != intent.side
            || pending.quantity != intent.quantity
        {
            return false;
        }
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::MAX);
        gap(record, pending) <= window
    }

    fn past_grace(&self, record: &OrderRecord, now: DateTime<Utc>) -> bool {
        let since = record.submitted_at.unwrap_or(record.created_at);
        let grace = chrono::Duration::from_std(self.grace).unwrap_or(chrono::Duration::MAX);
        now - since >= grace
    }
}

fn gap(record: &OrderRecord, pending: &PendingOrder) -> chrono::Duration {
    let local = record.submitted_at.unwrap_or(record.created_at);
    (pending.submitted_at - local).abs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::OrderState;
    use crate::sizing::OrderIntent;
    use ledgerless::{Price, Side, Symbol};

    fn matcher() -> ZombieMatcher {
        ZombieMatcher::new(Duration::from_secs(300), Duration::from_secs(30))
    }

    fn unattached(symbol: &str, side: Side, quantity: u64, at: DateTime<Utc>) -> OrderRecord {
        let mut record = OrderRecord::new(OrderIntent {
            symbol: Symbol::new(symbol),
            side,
            quantity,
            limit_price: None,
            reference_price: Price(10_00),
            lot_size: 1,
            margin_pct: 0.0,
        });
        record.submitted_at = Some(at);
        record.transition(OrderState::CanceledAssumed);
        record
    }

    fn pending(id: u64, symbol: &str, side: Side, quantity: u64, at: DateTime<Utc>) -> PendingOrder {
        PendingOrder {
            id: OrderId(id),
            symbol: Symbol::new(symbol),
            side,
            quantity,
            remaining: quantity,
            limit_price: None,
            submitted_at: at,
        }
    }

    #[test]
    fn matches_by_alias_side_quantity_and_time() {
        let now = Utc::now();
        let records = vec![unattached("SHSE.600000", Side::Buy, 200, now)];
        let broker = vec![
            pending(1, "600000", Side::Sell, 200, now),
            pending(2, "600000", Side::Buy, 100, now),
            pending(3, "600000", Side::Buy, 200, now + chrono::Duration::seconds(2)),
        ];
        let out = matcher().reattach(&records, &broker, now);
        assert!(matches!(&out.dispositions[0], Disposition::Reattached(p) if p.id == OrderId(3)));
        let unknown: Vec<_> = out.unknown.iter().map(|p| p.id).collect();
        assert_eq!(unknown, vec![OrderId(1), OrderId(2)]);
    }

    #[test]
    fn outside_window_does_not_match() {
        let now = Utc::now();
        let records = vec![unattached("AAPL", Side::Buy, 10, now)];
        let broker = vec![pending(7, "AAPL", Side::Buy, 10, now - chrono::Duration::minutes(10))];
        let out = matcher().reattach(&records, &broker, now);
        assert_eq!(out.dispositions[0], Disposition::Waiting);
        assert_eq!(out.unknown.len(), 1);
    }

    #[test]
    fn unmatched_past_grace_is_lost() {
        let now = Utc::now();
        let old = now - chrono::Duration::seconds(31);
        let records = vec![
            unattached("AAPL", Side::Buy, 10, old),
            unattached("MSFT", Side::Buy, 10, now),
        ];
        let out = matcher().reattach(&records, &[], now);
        assert_eq!(out.dispositions, vec![Disposition::Lost, Disposition::Waiting]);
    }

    #[test]
    fn each_pending_order_is_claimed_once() {
        let now = Utc::now();
        let records = vec![
            unattached("AAPL", Side::Buy, 10, now),
            unattached("AAPL", Side::Buy, 10, now + chrono::Duration::seconds(1)),
        ];
        let broker = vec![pending(4, "AAPL", Side::Buy, 10, now)];
        let out = matcher().reattach(&records, &broker, now);
        assert_eq!(out.reattached_count(), 1);
        assert!(out.unknown.is_empty());
    }

    #[test]
    fn attached_records_match_by_id() {
        let now = Utc::now();
        let mut live = unattached("AAPL", Side::Sell, 10, now);
        live.broker_id = Some(OrderId(9));
        let mut done = unattached("MSFT", Side::Sell, 10, now);
        done.broker_id = Some(OrderId(8));
        let broker = vec![pending(9, "AAPL", Side::Sell, 10, now)];

        let out = matcher().reattach(&[live, done], &broker, now);
        assert!(matches!(&out.dispositions[0], Disposition::Reattached(p) if p.id == OrderId(9)));
        assert_eq!(out.dispositions[1], Disposition::Settled);
        assert!(out.unknown.is_empty());
    }
}
