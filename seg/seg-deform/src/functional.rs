//! Cost functional interface.
//!
//! A cost functional scores a candidate set of node positions against the
//! bias-corrected images. The optimizer only ever sees it through
//! [`CostFunctional`]; the controller builds one per outer iteration through
//! a [`CostFunctionalFactory`].

use nalgebra::{Point3, Vector3};

use seg_atlas::AtlasMesh;
use seg_gmm::GaussianMixture;
use seg_types::{AffineTransform, Volume};

use crate::error::DeformResult;

/// How nodes on the boundary of the mesh may move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BoundaryCondition {
    /// Nodes on a face of the rest bounding box may only slide within
    /// that face.
    #[default]
    Sliding,
    /// Every node moves freely.
    None,
}

/// Objective value and its gradient with respect to every node position.
#[derive(Debug, Clone, PartialEq)]
pub struct CostAndGradient {
    /// Likelihood term plus deformation prior. `f64::INFINITY` for a folded
    /// mesh.
    pub cost: f64,
    /// One entry per node.
    pub gradient: Vec<Vector3<f64>>,
}

/// Objective minimized by a mesh optimizer.
pub trait CostFunctional: Send + Sync {
    /// Evaluates the objective at `points`, using the connectivity, rest
    /// positions and alphas of `mesh`.
    ///
    /// # Errors
    ///
    /// Fails if `points` does not have one entry per node of `mesh`.
    fn evaluate(&self, mesh: &AtlasMesh, points: &[Point3<f64>]) -> DeformResult<CostAndGradient>;
}

/// Inputs from which a cost functional is built.
#[derive(Debug, Clone, Copy)]
pub struct CostFunctionalRequest<'a> {
    /// Bias-corrected image of every contrast on the working grid.
    pub images: &'a [Volume<f64>],
    /// Foreground mask on the working grid.
    pub mask: &'a Volume<bool>,
    /// Boundary handling.
    pub boundary: BoundaryCondition,
    /// Template-to-working-frame transform of the mesh.
    pub transform: &'a AffineTransform,
    /// Current intensity model.
    pub mixture: &'a GaussianMixture,
    /// Deformation prior stiffness.
    pub stiffness: f64,
}

/// Builds cost functionals.
pub trait CostFunctionalFactory: Send + Sync {
    /// Creates a functional bound to `request`.
    ///
    /// # Errors
    ///
    /// Fails if the request is inconsistent.
    fn build(&self, request: &CostFunctionalRequest<'_>) -> DeformResult<Box<dyn CostFunctional>>;
}
