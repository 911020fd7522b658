//! Errors raised while validating domain values.
use thiserror::Error;

/// Failure reasons for domain-level validation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DomainError {
    /// A numeric parameter fell outside its accepted range.
    #[error("{name} must be within [{min}, {max}], got {value}")]
    OutOfRange {
        /// Parameter name as it appears in configuration.
        name: &'static str,
        /// Offending value.
        value: f64,
        /// Inclusive lower bound.
        min: f64,
        /// Inclusive upper bound.
        max: f64,
    },
    /// The schedule window starts after it ends.
    #[error("start_at ({start_at}) must not exceed end_at ({end_at})")]
    InvertedSchedule {
        /// Fraction of sampling at which conditioning starts.
        start_at: f64,
        /// Fraction of sampling at which conditioning ends.
        end_at: f64,
    },
    /// A weight type string did not name a known mode.
    #[error("unknown weight type: {0}")]
    UnknownWeightType(String),
}
