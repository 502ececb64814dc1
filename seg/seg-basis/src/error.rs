//! Error types for basis construction and evaluation.

use thiserror::Error;

/// Errors that can occur while building or applying a separable basis.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BasisError {
    /// An axis has no samples or no basis functions.
    #[error("basis axis {axis} is empty ({samples} samples, {functions} functions)")]
    EmptyAxis {
        /// Axis index (0, 1 or 2).
        axis: usize,
        /// Number of samples along the axis.
        samples: usize,
        /// Number of basis functions along the axis.
        functions: usize,
    },

    /// More basis functions were requested than samples exist.
    #[error("axis {axis} has {samples} samples but {functions} functions were requested")]
    TooManyFunctions {
        /// Axis index (0, 1 or 2).
        axis: usize,
        /// Number of samples along the axis.
        samples: usize,
        /// Number of requested functions.
        functions: usize,
    },

    /// An input vector does not match the basis dimensions.
    #[error("expected {expected} values, got {actual}")]
    LengthMismatch {
        /// Required length.
        expected: usize,
        /// Supplied length.
        actual: usize,
    },
}

/// Result type for basis operations.
pub type BasisResult<T> = Result<T, BasisError>;
