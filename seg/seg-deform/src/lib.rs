//! Atlas mesh deformation.
//!
//! The segmentation loop moves mesh nodes against a likelihood-plus-prior
//! objective while the intensity model is held fixed. Both the objective and
//! the optimizer are pluggable:
//!
//! - [`CostFunctional`] / [`CostFunctionalFactory`] - objective and gradient
//!   over node positions
//! - [`MeshOptimizer`] / [`OptimizerFactory`] - step-wise node updates
//! - [`drive_deformation`] - steps an optimizer until it reports zero
//!   displacement
//!
//! [`AtlasLikelihoodFactory`] and [`LbfgsFactory`] are the reference
//! implementations.
//!
//! # Example
//!
//! ```
//! use nalgebra::{Point3, Vector3};
//! use seg_atlas::AtlasMesh;
//! use seg_deform::{DeformResult, MeshOptimizer, OptimizerStep, drive_deformation};
//!
//! struct Done;
//!
//! impl MeshOptimizer for Done {
//!     fn step(&mut self, _mesh: &mut AtlasMesh) -> DeformResult<OptimizerStep> {
//!         Ok(OptimizerStep { cost: 1.0, max_displacement: 0.0 })
//!     }
//! }
//!
//! let mut mesh = AtlasMesh::regular_grid(
//!     Point3::origin(),
//!     Vector3::new(1.0, 1.0, 1.0),
//!     [1, 1, 1],
//!     vec!["a".to_string()],
//!     |_| vec![1.0],
//! )
//! .unwrap();
//! let outcome = drive_deformation(&mut Done, &mut mesh, |_| {}).unwrap();
//! assert_eq!(outcome.steps, 1);
//! ```

// Safety: Deny unwrap/expect in library code. Tests may use them (workspace warns).
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]

mod driver;
mod error;
mod functional;
mod lbfgs;
mod likelihood;
mod optimizer;

pub use driver::{DeformationOutcome, DeformationStep, drive_deformation};
pub use error::{DeformResult, DeformationError};
pub use functional::{
    BoundaryCondition, CostAndGradient, CostFunctional, CostFunctionalFactory,
    CostFunctionalRequest,
};
pub use lbfgs::{LbfgsFactory, LbfgsOptimizer};
pub use likelihood::{AtlasLikelihoodCost, AtlasLikelihoodFactory};
pub use optimizer::{MeshOptimizer, OptimizerFactory, OptimizerStep};
