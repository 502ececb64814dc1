//! Atlas-based multi-resolution tissue segmentation.
//!
//! This umbrella crate re-exports the seg-* crates. A run jointly estimates a
//! Gaussian mixture per tissue class, a smooth bias field per contrast and a
//! deformation of a probabilistic tetrahedral atlas, coarse to fine.
//!
//! # Quick Start
//!
//! ```no_run
//! use seg::prelude::*;
//!
//! # fn inputs() -> (VolumeState, KroneckerBasis, InMemoryMeshEngine) { unimplemented!() }
//! let (volume, basis, engine) = inputs();
//! let model = ModelSpecification::new(vec![
//!     ClassSpec::new("background", ["Unknown"], 1),
//!     ClassSpec::new("tissue", ["White", "Gray"], 2),
//! ]);
//! let options = OptimizationOptions::new(vec![
//!     MultiResolutionLevelSpec::new("atlas_level1.mesh", 2.0),
//!     MultiResolutionLevelSpec::new("atlas_level2.mesh", 1.0),
//! ]);
//!
//! let segmenter = MultiResolutionSegmenter::new(Collaborators::new(
//!     &engine,
//!     &AtlasLikelihoodFactory,
//!     &LbfgsFactory,
//! ));
//! let bias_coefficients = nalgebra::DMatrix::zeros(basis.basis_count(), volume.contrast_count());
//! let output = segmenter
//!     .run(
//!         SegmentationInput { volume, basis, bias_coefficients, model, options },
//!         &mut NoObserver,
//!     )
//!     .unwrap();
//! println!("{:?}", output.levels.last().map(|l| l.stop_reason));
//! ```
//!
//! # Module Organization
//!
//! ## Foundation
//! - [`types`] - Volumes, affine transforms and configuration records
//! - [`basis`] - Separable basis functions for the bias field
//! - [`atlas`] - Atlas meshes, prior rasterization, label merging, mesh engine
//!
//! ## Estimation
//! - [`gmm`] - Gaussian mixture EM with a conjugate covariance prior
//! - [`bias`] - Bias field estimation
//! - [`deform`] - Cost functionals, mesh optimizers and the step driver
//!
//! ## Orchestration
//! - [`multires`] - The multi-resolution controller
//!
//! # Feature Flags
//!
//! - `serde` (default) - JSON configuration and serializable records

// Safety: Deny unwrap/expect in library code. Tests may use them (workspace warns).
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]

// =============================================================================
// Re-exports
// =============================================================================

/// Volumes, affine transforms and configuration records.
pub use seg_types as types;

/// Separable basis functions.
pub use seg_basis as basis;

/// Atlas meshes and the mesh engine.
pub use seg_atlas as atlas;

/// Gaussian mixture estimation.
pub use seg_gmm as gmm;

/// Bias field estimation.
pub use seg_bias as bias;

/// Mesh deformation.
pub use seg_deform as deform;

/// Multi-resolution controller.
pub use seg_multires as multires;

// =============================================================================
// Prelude
// =============================================================================

/// Common imports for running a segmentation.
///
/// # Usage
///
/// ```
/// use seg::prelude::*;
/// ```
pub mod prelude {
    // Inputs and configuration
    pub use seg_types::{
        AffineTransform, ClassSpec, ModelSpecification, MultiResolutionLevelSpec,
        OptimizationOptions, OptimizerParams, Volume, VolumeState,
    };

    // Basis
    pub use seg_basis::KroneckerBasis;

    // Atlas
    pub use seg_atlas::{
        AtlasMesh, InMemoryMeshEngine, MeshCollection, MeshEngine, RasterizedPriors, WarpResult,
    };

    // Estimation results
    pub use seg_bias::BiasField;
    pub use seg_gmm::GaussianMixture;

    // Deformation backends
    pub use seg_deform::{
        AtlasLikelihoodFactory, CostFunctionalFactory, LbfgsFactory, MeshOptimizer,
        OptimizerFactory,
    };

    // Controller
    pub use seg_multires::{
        Collaborators, LevelReport, MultiResolutionSegmenter, NoObserver, SegmentationError,
        SegmentationInput, SegmentationOutput, StageEvent, StageObserver, StopReason,
    };
}
