//! Error types for configuration and volume handling.

use thiserror::Error;

/// Errors raised while validating configuration records or building volumes.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A parameter is outside its valid range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A buffer does not have the number of elements its dimensions imply.
    #[error("volume of dimensions {dims:?} needs {expected} values, got {actual}")]
    BufferLength {
        /// Requested dimensions.
        dims: [usize; 3],
        /// Number of values implied by the dimensions.
        expected: usize,
        /// Number of values supplied.
        actual: usize,
    },

    /// Two volumes that must share a grid do not.
    #[error("volume shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected dimensions.
        expected: [usize; 3],
        /// Supplied dimensions.
        actual: [usize; 3],
    },

    /// The affine transform cannot be inverted.
    #[error("affine transform is singular")]
    SingularTransform,

    /// A JSON document could not be parsed into a configuration record.
    #[cfg(feature = "serde")]
    #[error("failed to parse configuration: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConfigError {
    /// Create an invalid parameter error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }
}

/// Result type for configuration and volume operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
