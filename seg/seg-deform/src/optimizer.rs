//! Mesh optimizer interface.

use seg_atlas::AtlasMesh;
use seg_types::OptimizerParams;

use crate::error::DeformResult;
use crate::functional::CostFunctional;

/// Outcome of one optimizer step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizerStep {
    /// Objective value after the step.
    pub cost: f64,
    /// Largest node displacement applied by the step. Exactly zero means the
    /// optimizer cannot make further progress.
    pub max_displacement: f64,
}

/// Moves mesh nodes to reduce a cost functional, one step at a time.
pub trait MeshOptimizer {
    /// Performs one step, updating the node positions of `mesh` in place.
    ///
    /// # Errors
    ///
    /// Fails if the functional cannot be evaluated.
    fn step(&mut self, mesh: &mut AtlasMesh) -> DeformResult<OptimizerStep>;
}

/// Builds mesh optimizers.
pub trait OptimizerFactory: Send + Sync {
    /// Creates an optimizer for `functional` with `params`.
    ///
    /// # Errors
    ///
    /// Fails if the parameters are invalid.
    fn build(
        &self,
        functional: Box<dyn CostFunctional>,
        params: &OptimizerParams,
    ) -> DeformResult<Box<dyn MeshOptimizer>>;
}
