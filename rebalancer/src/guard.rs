//! Per-(symbol, side) admission lock against double submission.
//!
//! A lock is taken before an order is submitted and released when the order
//! is known to be final at the broker. A lock that is never released expires
//! after the cooldown, which bounds how long a stuck broker session can block
//! a symbol.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use ledgerless::{Side, Symbol};
use log::{debug, warn};
use rustc_hash::FxHashMap;

#[derive(Debug, Clone, Copy)]
struct Lock {
    token: u64,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct GuardState {
    locks: FxHashMap<(Symbol, Side), Lock>,
    next_token: u64,
}

/// Proof of a held lock. Dropping a ticket without [`DoubleSpendGuard::release`]
/// leaves the lock in place until it expires.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "an unreleased ticket blocks its symbol until the cooldown expires"]
pub struct GuardTicket {
    pub symbol: Symbol,
    pub side: Side,
    token: u64,
}

/// The lock for this symbol and side is already held.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{side} {symbol} already in flight (lock expires in {remaining:?})")]
pub struct Conflict {
    pub symbol: Symbol,
    pub side: Side,
    pub remaining: Duration,
}

/// Cooldown locks keyed by (symbol, side). Thread-safe; share one instance
/// between every rebalancer driving the same account.
#[derive(Debug)]
pub struct DoubleSpendGuard {
    cooldown: Duration,
    state: Mutex<GuardState>,
}

impl DoubleSpendGuard {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            state: Mutex::new(GuardState::default()),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn acquire(&self, symbol: Symbol, side: Side) -> Result<GuardTicket, Conflict> {
        self.acquire_at(symbol, side, Instant::now())
    }

    /// Take the lock as of `now`. An expired lock is reclaimed.
    pub fn acquire_at(
        &self,
        symbol: Symbol,
        side: Side,
        now: Instant,
    ) -> Result<GuardTicket, Conflict> {
        let mut state = self.lock_state();
        if let Some(lock) = state.locks.get(&(symbol, side)) {
            if lock.expires_at > now {
                return Err(Conflict {
                    symbol,
                    side,
                    remaining: lock.expires_at - now,
                });
            }
            warn!("{side} {symbol}: reclaiming expired lock");
        }
        state.next_token += 1;
        let token = state.next_token;
        state.locks.insert(
            (symbol, side),
            Lock {
                token,
                expires_at: now + self.cooldown,
            },
        );
        debug!("{side} {symbol}: lock acquired");
        Ok(GuardTicket {
            symbol,
            side,
            token,
        })
    }

    /// Release a lock. Returns false if the ticket is stale (the lock expired
    /// and was taken by someone else), in which case nothing changes.
    pub fn release(&self, ticket: GuardTicket) -> bool {
        let mut state = self.lock_state();
        let key = (ticket.symbol, ticket.side);
        match state.locks.get(&key) {
            Some(lock) if lock.token == ticket.token => {
                state.locks.remove(&key);
                debug!("{} {}: lock released", ticket.side, ticket.symbol);
                true
            }
            _ => false,
        }
    }

    /// Whether a live lock is held for this key.
    pub fn is_held(&self, symbol: Symbol, side: Side) -> bool {
        self.is_held_at(symbol, side, Instant::now())
    }

    pub fn is_held_at(&self, symbol: Symbol, side: Side, now: Instant) -> bool {
        self.lock_state()
            .locks
            .get(&(symbol, side))
            .is_some_and(|l| l.expires_at > now)
    }

    /// Time left on the lock `ticket` holds, or `None` once it has expired
    /// or been taken over.
    pub fn remaining(&self, ticket: &GuardTicket) -> Option<Duration> {
        self.remaining_at(ticket, Instant::now())
    }

    pub fn remaining_at(&self, ticket: &GuardTicket, now: Instant) -> Option<Duration> {
        self.lock_state()
            .locks
            .get(&(ticket.symbol, ticket.side))
            .filter(|l| l.token == ticket.token && l.expires_at > now)
            .map(|l| l.expires_at - now)
    }

    /// Number of live locks.
    pub fn held_count(&self) -> usize {
        let now = Instant::now();
        self.lock_state()
            .locks
            .values()
            .filter(|l| l.expires_at > now)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn aapl() -> Symbol {
        Symbol::new("AAPL")
    }

    #[test]
    fn second_acquire_conflicts() {
        let guard = DoubleSpendGuard::new(Duration::from_secs(60));
        let ticket = guard.acquire(aapl(), Side::Buy).unwrap();
        let conflict = guard.acquire(aapl(), Side::Buy).unwrap_err();
        assert_eq!(conflict.symbol, aapl());
        assert!(conflict.remaining <= Duration::from_secs(60));

        // other side is independent
        let sell = guard.acquire(aapl(), Side::Sell).unwrap();
        assert!(guard.release(ticket));
        assert!(guard.release(sell));
        assert!(guard.acquire(aapl(), Side::Buy).is_ok());
    }

    #[test]
    fn expired_lock_is_reclaimed() {
        let guard = DoubleSpendGuard::new(Duration::from_secs(10));
        let t0 = Instant::now();
        let stale = guard.acquire_at(aapl(), Side::Buy, t0).unwrap();
        assert!(guard.acquire_at(aapl(), Side::Buy, t0 + Duration::from_secs(5)).is_err());

        let fresh = guard
            .acquire_at(aapl(), Side::Buy, t0 + Duration::from_secs(11))
            .unwrap();
        // the stale ticket must not free the new holder's lock
        assert!(!guard.release(stale));
        assert_eq!(
            guard.remaining_at(&fresh, t0 + Duration::from_secs(12)),
            Some(Duration::from_secs(9))
        );
        assert!(guard.release(fresh));
    }

    #[test]
    fn dropped_ticket_holds_until_expiry() {
        let guard = DoubleSpendGuard::new(Duration::from_secs(10));
        let t0 = Instant::now();
        let _ = guard.acquire_at(aapl(), Side::Sell, t0).unwrap();
        assert!(guard.is_held_at(aapl(), Side::Sell, t0 + Duration::from_secs(9)));
        assert!(!guard.is_held_at(aapl(), Side::Sell, t0 + Duration::from_secs(10)));
    }

    #[test]
    fn remaining_runs_out_at_expiry() {
        let guard = DoubleSpendGuard::new(Duration::from_secs(10));
        let t0 = Instant::now();
        let ticket = guard.acquire_at(aapl(), Side::Buy, t0).unwrap();
        assert_eq!(
            guard.remaining_at(&ticket, t0 + Duration::from_secs(4)),
            Some(Duration::from_secs(6))
        );
        assert_eq!(guard.remaining_at(&ticket, t0 + Duration::from_secs(10)), None);
    }

    #[test]
    fn concurrent_acquire_admits_one() {
        let guard = Arc::new(DoubleSpendGuard::new(Duration::from_secs(60)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let g = Arc::clone(&guard);
                thread::spawn(move || g.acquire(aapl(), Side::Buy).is_ok())
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 1);
        assert_eq!(guard.held_count(), 1);
    }
}
