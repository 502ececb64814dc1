//! Probabilistic atlas meshes for segmentation.
//!
//! A probabilistic atlas is a tetrahedral mesh whose nodes carry label
//! probabilities (alphas). This crate provides:
//!
//! - [`AtlasMesh`] / [`MeshCollection`] - the mesh and its stiffness
//! - [`MeshEngine`] - the backend interface the segmenter talks to, with
//!   the in-memory reference backend [`InMemoryMeshEngine`]
//! - [`rasterize_priors`] - barycentric rasterization of alphas onto a voxel
//!   grid, stored as 16-bit fixed point ([`PRIOR_SCALE`])
//! - [`merge_alphas`] - summing label priors into mixture classes
//! - [`warp_deformation`] - carrying a node deformation onto another mesh
//!
//! # Coordinate frames
//!
//! Meshes are loaded in template space. [`MeshEngine::transform`] maps them
//! into the working voxel frame, where voxel centres sit at integer
//! coordinates.

// Safety: Deny unwrap/expect in library code. Tests may use them (workspace warns).
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]

mod engine;
mod error;
mod merge;
mod mesh;
mod raster;

pub use engine::{InMemoryMeshEngine, MeshEngine, WarpResult, warp_deformation};
pub use error::{AtlasError, AtlasResult};
pub use merge::{MergedAlphas, merge_alphas};
pub use mesh::{AtlasMesh, MeshCollection, Tetrahedron, bounds};
pub use raster::{PRIOR_SCALE, RasterizedPriors, VoxelHit, covered_voxels, rasterize_priors};
