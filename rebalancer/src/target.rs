//! Target portfolio specification (target.json) loading and validation.

use std::path::Path;

use chrono::{DateTime, Utc};
use ledgerless::{SYMBOL_CAPACITY, Symbol, validate_symbol, validate_weight};
use rustc_hash::FxHashSet;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Tolerance on the weight sum, so that weights written with two decimals
/// that add to 1.0 are not rejected for float rounding.
const SUM_EPSILON: f64 = 1e-9;

/// A target portfolio specification from the signal generator.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetSpec {
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    pub targets: Vec<TargetPosition>,
}

/// A single target position: symbol + weight.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetPosition {
    pub symbol: String,
    pub weight: f64,
}

impl TargetSpec {
    /// Load and validate a target.json file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::TargetRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_json(&contents)
    }

    /// Parse from a JSON string (useful for testing).
    pub fn from_json(json: &str) -> Result<Self> {
        let spec: TargetSpec = serde_json::from_str(json)?;
        spec.weights()?;
        Ok(spec)
    }

    /// Validated weight map.
    pub fn weights(&self) -> Result<TargetWeights> {
        let mut pairs = Vec::with_capacity(self.targets.len());
        for t in &self.targets {
            let symbol = Symbol::try_new(&t.symbol).ok_or_else(|| {
                Error::InvalidPlan(format!(
                    "symbol '{}' exceeds {SYMBOL_CAPACITY} bytes",
                    t.symbol
                ))
            })?;
            pairs.push((symbol, t.weight));
        }
        TargetWeights::new(pairs)
    }
}

/// Symbol → fraction of NAV. Every weight is in [0, 1] and the sum is at
/// most 1.0. An empty map means "hold nothing".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetWeights {
    entries: Vec<(Symbol, f64)>,
}

impl TargetWeights {
    /// Validate and build a weight map, keeping input order.
    pub fn new(pairs: impl IntoIterator<Item = (Symbol, f64)>) -> Result<Self> {
        let entries: Vec<(Symbol, f64)> = pairs.into_iter().collect();

        let mut seen = FxHashSet::default();
        for (i, &(symbol, weight)) in entries.iter().enumerate() {
            validate_symbol(&symbol)
                .map_err(|e| Error::InvalidPlan(format!("symbol '{symbol}': {e}")))?;
            validate_weight(weight)
                .map_err(|e| Error::InvalidPlan(format!("{symbol}: {e}")))?;
            if !seen.insert(symbol) {
                return Err(Error::Target(format!("duplicate symbol: {symbol}")));
            }
            // one instrument listed under two broker aliases
            if let Some((other, _)) = entries[..i].iter().find(|(s, _)| s.matches_alias(&symbol)) {
                return Err(Error::Target(format!(
                    "{symbol} and {other} name the same instrument"
                )));
            }
        }

        let sum: f64 = entries.iter().map(|(_, w)| w).sum();
        if sum > 1.0 + SUM_EPSILON {
            return Err(Error::InvalidPlan(format!(
                "weights sum to {sum:.4} (> 1.0)"
            )));
        }

        Ok(Self { entries })
    }

    /// Build from string symbols (useful for testing and the CLI).
    pub fn from_pairs(pairs: &[(&str, f64)]) -> Result<Self> {
        let mut out = Vec::with_capacity(pairs.len());
        for &(s, w) in pairs {
            let symbol = Symbol::try_new(s)
                .ok_or_else(|| Error::InvalidPlan(format!("symbol '{s}' is too long")))?;
            out.push((symbol, w));
        }
        Self::new(out)
    }

    /// Weight for `symbol`, matching broker aliases.
    pub fn get(&self, symbol: &Symbol) -> Option<f64> {
        self.entries
            .iter()
            .find(|(s, _)| s == symbol)
            .or_else(|| self.entries.iter().find(|(s, _)| s.matches_alias(symbol)))
            .map(|&(_, w)| w)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Symbol, f64)> + '_ {
        self.entries.iter().copied()
    }

    pub fn symbols(&self) -> Vec<Symbol> {
        self.entries.iter().map(|(s, _)| *s).collect()
    }

    pub fn sum(&self) -> f64 {
        self.entries.iter().map(|(_, w)| w).sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
