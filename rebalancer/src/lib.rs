//! ledgerless-rebalancer: stateless portfolio rebalancer.
//!
//! Holds no ledger of its own. Every pass reads cash, positions and working
//! orders from the broker, sells down over-weight symbols, re-reads the
//! account, then buys into the freed cash with a safety margin. A
//! per-(symbol, side) lock keeps concurrent passes from double-spending.

pub mod audit;
pub mod broker;
pub mod config;
pub mod error;
pub mod execution;
pub mod guard;
pub mod order;
pub mod plan;
pub mod rebalancer;
pub mod reconcile;
pub mod risk;
pub mod schedule;
pub mod sizing;
pub mod target;
pub mod zombie;

pub use error::{Error, Result};
pub use rebalancer::{RebalanceReport, Rebalancer};
