//! Error types shared by the solvers

use ndarray_linalg::error::LinalgError;
use thiserror::Error;

/// Error raised by a user-supplied oracle (objective, gradient,
/// Hessian-vector product or proximal operator).
///
/// Solvers never inspect or wrap these beyond boxing: the caller gets
/// back exactly what its oracle returned and can `downcast` it.
pub type OracleError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur while configuring or running a solver.
#[derive(Error, Debug)]
pub enum SolverError {
    /// A parameter that must be strictly positive was not
    #[error("{name} must be strictly positive, got {value}")]
    NonPositive { name: &'static str, value: f64 },

    /// Sketch rank outside of `1..dim`
    #[error("invalid sketch size {sketch_size} for problem dimension {dim}")]
    InvalidSketchSize { sketch_size: usize, dim: usize },

    /// Any other rejected configuration value
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Vector or operator sizes disagree
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Bracket expansion of the projection root-finder found no sign change
    #[error("no sign change found after {iterations} bracket expansions")]
    BracketFailure { iterations: usize },

    /// LAPACK failure that could not be recovered locally
    #[error("linear algebra failure: {0}")]
    Linalg(#[from] LinalgError),

    /// Error returned by a user oracle, passed through untouched
    #[error(transparent)]
    Oracle(#[from] OracleError),
}

/// Result type for solver operations.
pub type Result<T> = std::result::Result<T, SolverError>;

pub(crate) fn ensure_positive(name: &'static str, value: f64) -> Result<()> {
    // written so that NaN is rejected as well
    if value > 0.0 {
        Ok(())
    } else {
        Err(SolverError::NonPositive { name, value })
    }
}

pub(crate) fn ensure_len(expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(SolverError::DimensionMismatch { expected, actual })
    }
}
