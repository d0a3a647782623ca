//! Validation errors for symbols and target weights.

use std::fmt;

/// Errors returned when a symbol or target weight is malformed.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ValidationError {
    /// Symbol must not be empty.
    EmptySymbol,
    /// Symbol contains whitespace or control characters.
    MalformedSymbol,
    /// Weight must be finite and within [0, 1].
    WeightOutOfRange(f64),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::EmptySymbol => write!(f, "symbol must not be empty"),
            ValidationError::MalformedSymbol => {
                write!(f, "symbol contains whitespace or control characters")
            }
            ValidationError::WeightOutOfRange(w) => {
                write!(f, "weight {w} is outside [0.0, 1.0]")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Check that a symbol is usable for order routing.
pub fn validate_symbol(symbol: &crate::Symbol) -> Result<(), ValidationError> {
    if symbol.is_empty() {
        return Err(ValidationError::EmptySymbol);
    }
    if symbol
        .as_str()
        .chars()
        .any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(ValidationError::MalformedSymbol);
    }
    Ok(())
}

/// Check that a target weight is a finite fraction in [0, 1].
pub fn validate_weight(weight: f64) -> Result<(), ValidationError> {
    if !weight.is_finite() || !(0.0..=1.0).contains(&weight) {
        return Err(ValidationError::WeightOutOfRange(weight));
    }
    Ok(())
}
