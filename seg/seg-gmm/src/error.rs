//! Error types for mixture estimation.

use thiserror::Error;

/// Errors that can occur while estimating a Gaussian mixture.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MixtureError {
    /// A covariance matrix has no Cholesky factor.
    #[error("covariance of component {component} is not positive definite")]
    NotPositiveDefinite {
        /// Component index.
        component: usize,
    },

    /// A class has zero total prior over the active voxels.
    #[error("class {class} has no prior mass over the active voxels")]
    EmptyClassPrior {
        /// Class index.
        class: usize,
    },

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

    /// There are no active voxels to estimate from.
    #[error("no active voxels")]
    NoActiveVoxels,
}

/// Result type for mixture operations.
pub type MixtureResult<T> = Result<T, MixtureError>;
