//! Error taxonomy shared by every nlyap crate.
//!
//! Configuration mistakes (bad dimensions, empty domains, contradictory
//! arguments) are errors. An infeasible MILP that answers a question is not:
//! it is reported through the solver status instead.

use thiserror::Error;

/// Error types for nlyap operations.
#[derive(Error, Debug)]
pub enum NlyapError {
    #[error("dimension mismatch for {what}: expected {expected}, got {got}")]
    DimensionMismatch {
        what: String,
        expected: usize,
        got: usize,
    },

    #[error("invalid domain: {0}")]
    InvalidDomain(String),

    #[error("invalid bounds at index {index}: lower {lower} > upper {upper}")]
    InvalidBounds { index: usize, lower: f64, upper: f64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("solver failure: {0}")]
    Solver(String),

    /// A query whose trivial point must be feasible came back infeasible.
    #[error("unexpected infeasibility: {0}")]
    UnexpectedInfeasible(String),

    #[error("enumerating {what} needs {count} combinations (limit {limit})")]
    EnumerationTooLarge {
        what: String,
        count: usize,
        limit: usize,
    },

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl NlyapError {
    /// Create a dimension mismatch error.
    pub fn dimension_mismatch(what: impl Into<String>, expected: usize, got: usize) -> Self {
        NlyapError::DimensionMismatch {
            what: what.into(),
            expected,
            got,
        }
    }

    /// True for errors caused by the caller's configuration rather than by the solver.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            NlyapError::DimensionMismatch { .. }
                | NlyapError::InvalidDomain(_)
                | NlyapError::InvalidBounds { .. }
                | NlyapError::InvalidConfig(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, NlyapError>;

/// Check that a vector has the expected length.
#[inline]
pub fn ensure_dim(what: &str, expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(NlyapError::dimension_mismatch(what, expected, got));
    }
    Ok(())
}
