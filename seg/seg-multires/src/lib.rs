//! Multi-resolution atlas-based segmentation.
//!
//! For each level of the schedule, coarse to fine:
//!
//! 1. subsample the mask, images and bias basis by integer factors
//! 2. load the level's atlas, map it into the downsampled voxel frame and
//!    carry over the previous level's deformation
//! 3. merge atlas labels into mixture classes
//! 4. alternate EM (with bias field refreshes) and mesh deformation until
//!    the cost per active voxel stops decreasing or the cap is reached
//! 5. record the template-space node deformation for the next level
//!
//! The mesh engine, cost functional and optimizer are injected through
//! [`Collaborators`]; `seg-atlas` and `seg-deform` provide reference
//! implementations.

// Safety: Deny unwrap/expect in library code. Tests may use them (workspace warns).
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]

mod controller;
mod error;
mod level;
mod observer;
mod report;

pub use controller::{
    Collaborators, MultiResolutionSegmenter, SegmentationInput, SegmentationOutput,
};
pub use error::{SegmentationError, SegmentationResult};
pub use level::{LevelGrid, downsampling_factors};
pub use observer::{NoObserver, StageEvent, StageObserver};
pub use report::{LevelReport, StopReason};
