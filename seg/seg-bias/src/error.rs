//! Error types for bias field estimation.

use seg_basis::BasisError;
use seg_gmm::MixtureError;
use thiserror::Error;

/// Errors that can occur while estimating or applying a bias field.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BiasFieldError {
    /// The normal equations have no unique solution.
    #[error("bias field normal equations are singular ({size}x{size})")]
    SingularSystem {
        /// Number of unknowns.
        size: usize,
    },

    /// The solve produced NaN or infinite coefficients.
    #[error("bias field solve produced non-finite coefficients")]
    NonFiniteSolution,

    /// Two inputs disagree on a dimension.
    #[error("{what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Which dimension disagrees.
        what: &'static str,
        /// Expected size.
        expected: usize,
        /// Supplied size.
        actual: usize,
    },

    /// A basis operation failed.
    #[error(transparent)]
    Basis(#[from] BasisError),

    /// The mixture parameters are unusable.
    #[error(transparent)]
    Mixture(#[from] MixtureError),
}

/// Result type for bias field operations.
pub type BiasFieldResult<T> = Result<T, BiasFieldError>;
