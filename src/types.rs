//! Core types: Symbol, Price

use std::fmt;

/// Maximum length of a [`Symbol`] in bytes.
pub const SYMBOL_CAPACITY: usize = 16;

/// Instrument identifier stored inline (no heap allocation), so it is `Copy`
/// and cheap to use as a map key.
///
/// Holds up to [`SYMBOL_CAPACITY`] bytes of UTF-8, enough for exchange
/// qualified codes such as `SHSE.600000` or `QQQ.ISLAND`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Symbol {
    bytes: [u8; SYMBOL_CAPACITY],
    len: u8,
}

impl Symbol {
    /// Create a symbol.
    ///
    /// # Panics
    ///
    /// Panics if `s` is longer than [`SYMBOL_CAPACITY`] bytes. Use
    /// [`Symbol::try_new`] for untrusted input.
    #[track_caller]
    pub fn new(s: &str) -> Self {
        match Self::try_new(s) {
            Some(sym) => sym,
            None => panic!("symbol '{s}' exceeds {SYMBOL_CAPACITY} bytes"),
        }
    }

    /// Create a symbol, returning `None` if it does not fit.
    pub fn try_new(s: &str) -> Option<Self> {
        if s.len() > SYMBOL_CAPACITY {
            return None;
        }
        let mut bytes = [0u8; SYMBOL_CAPACITY];
        bytes[..s.len()].copy_from_slice(s.as_bytes());
        Some(Self {
            bytes,
            len: s.len() as u8,
        })
    }

    /// The symbol as a string slice.
    pub fn as_str(&self) -> &str {
        // Only ever built from a &str cut at a char boundary.
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Dot-separated components, e.g. `SHSE.600000` → `["SHSE", "600000"]`.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.as_str().split('.')
    }

    /// True if both symbols name the same instrument.
    ///
    /// Brokers often report bare codes (`600000`, `SMH`) where the caller uses
    /// an exchange-qualified form (`SHSE.600000`, `SMH.ISLAND`). Two symbols
    /// match when they are equal, or when one has no dot and equals a
    /// component of the other.
    pub fn matches_alias(&self, other: &Symbol) -> bool {
        if self == other {
            return true;
        }
        let (a, b) = (self.as_str(), other.as_str());
        if !a.contains('.') && !a.is_empty() {
            return other.components().any(|c| c.eq_ignore_ascii_case(a));
        }
        if !b.contains('.') && !b.is_empty() {
            return self.components().any(|c| c.eq_ignore_ascii_case(b));
        }
        false
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({:?})", self.as_str())
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Symbol {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Symbol {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        Symbol::try_new(&s).ok_or_else(|| {
            serde::de::Error::custom(format!("symbol '{s}' exceeds {SYMBOL_CAPACITY} bytes"))
        })
    }
}

/// Price in smallest units (cents).
///
/// `Price(10050)` represents $100.50.
/// Using fixed-point avoids floating-point errors in cash arithmetic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Price(pub i64);

impl Price {
    pub const ZERO: Price = Price(0);

    /// Dollars as a float, for display only.
    #[inline]
    pub fn as_dollars(self) -> f64 {
        self.0 as f64 / 100.0
    }

    /// Shift the price by `bps` basis points (positive = up).
    pub fn offset_bps(self, bps: i64) -> Price {
        Price(self.0 + self.0 * bps / 10_000)
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dollars = self.0 / 100;
        let cents = (self.0 % 100).abs();
        if self.0 < 0 {
            write!(f, "-${}.{:02}", dollars.abs(), cents)
        } else {
            write!(f, "${}.{:02}", dollars, cents)
        }
    }
}
