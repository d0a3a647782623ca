//! Paper account: a JSON snapshot of cash, positions and quotes, served
//! through the mock broker with immediate fills.
//!
//! ```json
//! {
//!   "cash_cents": 5000000,
//!   "positions": [{ "symbol": "AAPL", "quantity": 100, "avg_cost_cents": 15000 }],
//!   "quotes": [{ "symbol": "AAPL", "bid_cents": 18500, "ask_cents": 18510 }]
//! }
//! ```

use std::path::Path;

use ledgerless::Symbol;
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;
use crate::mock::{FillMode, MockBroker};
use crate::BrokerResult;

/// A position line in a paper account file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperPosition {
    pub symbol: Symbol,
    pub quantity: i64,
    pub avg_cost_cents: i64,
}

/// A quote line in a paper account file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperQuote {
    pub symbol: Symbol,
    pub bid_cents: i64,
    pub ask_cents: i64,
}

/// On-disk paper account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperAccount {
    pub cash_cents: i64,
    #[serde(default)]
    pub positions: Vec<PaperPosition>,
    #[serde(default)]
    pub quotes: Vec<PaperQuote>,
    /// Whether the simulated broker reports frozen cash for working buys.
    #[serde(default = "default_true")]
    pub report_frozen: bool,
}

fn default_true() -> bool {
    true
}

impl PaperAccount {
    /// Load a paper account from a JSON file.
    pub fn load(path: &Path) -> BrokerResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            BrokerError::Connection(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&contents)
    }

    /// Parse a paper account from JSON text.
    pub fn from_json(json: &str) -> BrokerResult<Self> {
        let account: PaperAccount = serde_json::from_str(json)
            .map_err(|e| BrokerError::Fatal(format!("bad paper account: {e}")))?;
        if account.cash_cents < 0 {
            return Err(BrokerError::Fatal("paper cash must be >= 0".into()));
        }
        Ok(account)
    }

    /// Serialize the account back to JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// Build a broker that serves this account.
    pub fn into_broker(self) -> MockBroker {
        let mut builder = MockBroker::builder()
            .fill_mode(FillMode::ImmediateFull)
            .with_cash(self.cash_cents)
            .report_frozen(self.report_frozen);
        for q in &self.quotes {
            builder = builder.with_quote(q.symbol, q.bid_cents, q.ask_cents);
        }
        for p in &self.positions {
            builder = builder.with_position(p.symbol, p.quantity, p.avg_cost_cents);
        }
        log::debug!(
            "paper account: {} positions, {} quotes",
            self.positions.len(),
            self.quotes.len()
        );
        builder.build()
    }
}
