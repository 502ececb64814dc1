//! Shared data types for atlas-based segmentation.
//!
//! This crate holds the records every other stage consumes:
//! - **Configuration** - [`ModelSpecification`], [`OptimizationOptions`] and
//!   their nested records, each with a `validate` method
//! - **Volumes** - dense column-major [`Volume`] grids and the full-resolution
//!   [`VolumeState`] handed to the segmenter
//! - **Transforms** - the homogeneous [`AffineTransform`] linking template
//!   space to voxel space
//!
//! # Layer 0
//!
//! No I/O, no global state. JSON loading of configuration records is
//! available behind the `serde` feature.
//!
//! # Quick Start
//!
//! ```
//! use seg_types::{
//!     ClassSpec, ModelSpecification, MultiResolutionLevelSpec, OptimizationOptions,
//! };
//!
//! let model = ModelSpecification::new(vec![
//!     ClassSpec::new("background", ["Unknown"], 1),
//!     ClassSpec::new("brain", ["White", "Gray", "CSF"], 3),
//! ]);
//! model.validate().unwrap();
//!
//! let options = OptimizationOptions::new(vec![
//!     MultiResolutionLevelSpec::new("atlas_level1", 2.0),
//!     MultiResolutionLevelSpec::new("atlas_level2", 1.0),
//! ]);
//! options.validate().unwrap();
//! ```

// Safety: Deny unwrap/expect in library code. Tests may use them (workspace warns).
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]

mod config;
mod error;
mod transform;
mod volume;

pub use config::{
    ClassSpec, ModelSpecification, MultiResolutionLevelSpec, OptimizationOptions,
    OptimizerParams,
};
pub use error::{ConfigError, ConfigResult};
pub use transform::AffineTransform;
pub use volume::{Volume, VolumeState, linear_index};

/// Guard added to denominators and logarithm arguments throughout the
/// estimation stages.
pub const EPS: f64 = f64::EPSILON;
