//! Error types for the multi-resolution controller.

use seg_atlas::AtlasError;
use seg_basis::BasisError;
use seg_bias::BiasFieldError;
use seg_deform::DeformationError;
use seg_gmm::MixtureError;
use seg_types::ConfigError;
use thiserror::Error;

/// Errors that abort a segmentation run.
///
/// Non-convergence within an iteration cap is never an error; it is
/// reported through [`crate::StopReason`].
#[derive(Debug, Error)]
pub enum SegmentationError {
    /// Inputs disagree on a dimension.
    #[error("{what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Which dimension disagrees.
        what: &'static str,
        /// Expected size.
        expected: usize,
        /// Supplied size.
        actual: usize,
    },

    /// The downsampled mask of a level selects no voxel.
    #[error("resolution level {level} has no active voxels")]
    NoActiveVoxels {
        /// Zero-based level index.
        level: usize,
    },

    /// Every level had a zero iteration cap, so no mixture was estimated.
    #[error("no outer iteration ran; the mixture was never estimated")]
    NotEstimated,

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Basis utilities failed.
    #[error(transparent)]
    Basis(#[from] BasisError),

    /// Mesh engine or prior merge failed.
    #[error(transparent)]
    Atlas(#[from] AtlasError),

    /// Mixture estimation failed.
    #[error(transparent)]
    Mixture(#[from] MixtureError),

    /// Bias field estimation failed.
    #[error(transparent)]
    BiasField(#[from] BiasFieldError),

    /// Mesh deformation failed.
    #[error(transparent)]
    Deformation(#[from] DeformationError),
}

/// Result type for segmentation runs.
pub type SegmentationResult<T> = Result<T, SegmentationError>;
