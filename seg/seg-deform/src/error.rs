//! Error types for mesh deformation.

use seg_atlas::AtlasError;
use seg_gmm::MixtureError;
use seg_types::ConfigError;
use thiserror::Error;

/// Errors that can occur while building or driving a mesh optimizer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DeformationError {
    /// The optimizer reported a NaN cost or a NaN or negative displacement.
    #[error("degenerate optimizer step {iteration}: cost {cost}, max displacement {max_displacement}")]
    DegenerateStep {
        /// One-based step number.
        iteration: usize,
        /// Reported cost.
        cost: f64,
        /// Reported maximal node displacement.
        max_displacement: f64,
    },

    /// The cost at the starting node positions is not finite.
    #[error("cost at the starting positions is not finite ({cost})")]
    NonFiniteCost {
        /// Evaluated cost.
        cost: f64,
    },

    /// Node positions do not match the mesh.
    #[error("expected {expected} node positions, got {actual}")]
    NodeCountMismatch {
        /// Nodes in the mesh.
        expected: usize,
        /// Positions supplied.
        actual: usize,
    },

    /// The functional inputs disagree on a dimension.
    #[error("{what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Which dimension disagrees.
        what: &'static str,
        /// Expected size.
        expected: usize,
        /// Supplied size.
        actual: usize,
    },

    /// Invalid optimizer parameters or transform.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Mesh operation failed.
    #[error(transparent)]
    Atlas(#[from] AtlasError),

    /// Mixture parameters are unusable.
    #[error(transparent)]
    Mixture(#[from] MixtureError),
}

/// Result type for deformation operations.
pub type DeformResult<T> = Result<T, DeformationError>;
