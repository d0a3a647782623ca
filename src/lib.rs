// Allow our dollar.cents digit grouping convention (e.g., 100_00 = $100.00)
#![allow(clippy::inconsistent_digit_grouping)]

//! # ledgerless
//!
//! Core value types shared by the broker facade and the rebalancer.
//!
//! The rebalancer keeps no local ledger of cash or positions: every decision
//! is derived from a fresh broker query. These types are the vocabulary those
//! queries and decisions are expressed in.
//!
//! ## Price Representation
//!
//! Prices and cash are stored as [`i64`] cents:
//!
//! ```
//! use ledgerless::Price;
//!
//! let price = Price(100_50);  // $100.50
//! assert_eq!(format!("{}", price), "$100.50");
//! ```
//!
//! ## Symbols
//!
//! Symbols are inline and `Copy`. Exchange-qualified and bare codes can be
//! compared with [`Symbol::matches_alias`]:
//!
//! ```
//! use ledgerless::Symbol;
//!
//! let local = Symbol::new("SHSE.600000");
//! let broker = Symbol::new("600000");
//! assert!(local.matches_alias(&broker));
//! ```

mod error;
mod side;
mod types;

pub use error::{ValidationError, validate_symbol, validate_weight};
pub use side::Side;
pub use types::{Price, SYMBOL_CAPACITY, Symbol};
