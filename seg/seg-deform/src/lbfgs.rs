//! Reference limited-memory BFGS mesh optimizer.

use std::collections::VecDeque;

use nalgebra::{DVector, Point3};
use tracing::{debug, info};

use seg_atlas::AtlasMesh;
use seg_types::{EPS, OptimizerParams};

use crate::error::{DeformResult, DeformationError};
use crate::functional::CostFunctional;
use crate::optimizer::{MeshOptimizer, OptimizerFactory, OptimizerStep};

/// Sufficient decrease constant of the Armijo condition.
const ARMIJO: f64 = 1e-4;

/// Largest node displacement of a steepest-descent step, in voxels.
const INITIAL_STEP: f64 = 1.0;

/// Upper bound on line-search halvings.
const MAX_HALVINGS: usize = 60;

/// L-BFGS over the flattened node positions.
///
/// Every call to [`MeshOptimizer::step`] performs one quasi-Newton iteration
/// with a backtracking line search. A step reports zero displacement (and
/// leaves the mesh untouched) when:
///
/// - the gradient vanishes
/// - the line-search interval, measured as the largest node displacement of
///   the trial step, drops below `line_search_interval_stop`
/// - the previous step moved no node farther than `max_deformation_stop`
/// - `max_iterations` steps have been taken
///
/// The optimizer caches the cost and gradient at the positions it last
/// wrote; the mesh must not be moved by anyone else between steps.
pub struct LbfgsOptimizer {
    functional: Box<dyn CostFunctional>,
    params: OptimizerParams,
    history: VecDeque<(DVector<f64>, DVector<f64>)>,
    current: Option<(f64, DVector<f64>)>,
    iterations: usize,
    finished: bool,
}

impl std::fmt::Debug for LbfgsOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LbfgsOptimizer")
            .field("params", &self.params)
            .field("history", &self.history.len())
            .field("iterations", &self.iterations)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl LbfgsOptimizer {
    /// Creates an optimizer for `functional`.
    ///
    /// # Errors
    ///
    /// Fails if `params` is invalid.
    pub fn new(functional: Box<dyn CostFunctional>, params: OptimizerParams) -> DeformResult<Self> {
        params.validate()?;
        Ok(Self {
            functional,
            params,
            history: VecDeque::with_capacity(params.memory_length),
            current: None,
            iterations: 0,
            finished: false,
        })
    }

    /// Number of steps that moved the mesh.
    #[must_use]
    pub const fn iterations(&self) -> usize {
        self.iterations
    }

    fn evaluate(&self, mesh: &AtlasMesh, x: &DVector<f64>) -> DeformResult<(f64, DVector<f64>)> {
        let result = self.functional.evaluate(mesh, &unflatten(x))?;
        Ok((result.cost, flatten_vectors(&result.gradient)))
    }

    fn current(&mut self, mesh: &AtlasMesh) -> DeformResult<(f64, DVector<f64>)> {
        match self.current.take() {
            Some(current) => Ok(current),
            None => self.evaluate(mesh, &flatten(mesh.points())),
        }
    }

    fn stop(&mut self, cost: f64, gradient: DVector<f64>) -> OptimizerStep {
        self.finished = true;
        self.current = Some((cost, gradient));
        OptimizerStep {
            cost,
            max_displacement: 0.0,
        }
    }

    /// Two-loop recursion: `-H·g` with `H` the implicit inverse Hessian.
    fn direction(&self, gradient: &DVector<f64>) -> DVector<f64> {
        let mut q = gradient.clone();
        let mut coefficients = Vec::with_capacity(self.history.len());
        for (s, y) in self.history.iter().rev() {
            let rho = 1.0 / y.dot(s);
            let a = rho * s.dot(&q);
            q.axpy(-a, y, 1.0);
            coefficients.push((rho, a));
        }
        if let Some((s, y)) = self.history.back() {
            q *= s.dot(y) / y.dot(y);
        }
        for ((s, y), (rho, a)) in self.history.iter().zip(coefficients.into_iter().rev()) {
            let b = rho * y.dot(&q);
            q.axpy(a - b, s, 1.0);
        }
        -q
    }
}

impl MeshOptimizer for LbfgsOptimizer {
    fn step(&mut self, mesh: &mut AtlasMesh) -> DeformResult<OptimizerStep> {
        let (cost, gradient) = self.current(mesh)?;
        if self.finished || self.iterations >= self.params.max_iterations {
            return Ok(self.stop(cost, gradient));
        }
        if !cost.is_finite() {
            return Err(DeformationError::NonFiniteCost { cost });
        }
        if max_node_norm(&gradient) == 0.0 {
            return Ok(self.stop(cost, gradient));
        }

        let mut direction = self.direction(&gradient);
        let mut slope = direction.dot(&gradient);
        if slope.is_nan() || slope >= 0.0 {
            self.history.clear();
            direction = -&gradient;
            slope = direction.dot(&gradient);
        }
        if self.history.is_empty() {
            let scale = INITIAL_STEP / max_node_norm(&direction);
            direction *= scale;
            slope *= scale;
        }

        let x = flatten(mesh.points());
        let length = max_node_norm(&direction);
        let mut alpha = 1.0;
        let mut halvings = 0;
        let (trial, trial_cost, trial_gradient) = loop {
            if alpha * length < self.params.line_search_interval_stop || halvings > MAX_HALVINGS {
                debug!(alpha, halvings, "line search exhausted");
                return Ok(self.stop(cost, gradient));
            }
            let trial = &x + &direction * alpha;
            let (trial_cost, trial_gradient) = self.evaluate(mesh, &trial)?;
            if trial_cost.is_finite() && trial_cost <= cost + ARMIJO * alpha * slope {
                break (trial, trial_cost, trial_gradient);
            }
            alpha *= 0.5;
            halvings += 1;
        };

        let s = &direction * alpha;
        let y = &trial_gradient - &gradient;
        if s.dot(&y) > EPS {
            if self.history.len() == self.params.memory_length {
                self.history.pop_front();
            }
            self.history.push_back((s, y));
        }

        mesh.set_points(unflatten(&trial))?;
        self.current = Some((trial_cost, trial_gradient));
        self.iterations += 1;
        let max_displacement = alpha * length;
        if max_displacement < self.params.max_deformation_stop {
            self.finished = true;
        }

        if self.params.verbose {
            info!(iteration = self.iterations, cost = trial_cost, max_displacement, alpha, "L-BFGS step");
        } else {
            debug!(iteration = self.iterations, cost = trial_cost, max_displacement, alpha, "L-BFGS step");
        }
        Ok(OptimizerStep {
            cost: trial_cost,
            max_displacement,
        })
    }
}

/// Factory for [`LbfgsOptimizer`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LbfgsFactory;

impl OptimizerFactory for LbfgsFactory {
    fn build(
        &self,
        functional: Box<dyn CostFunctional>,
        params: &OptimizerParams,
    ) -> DeformResult<Box<dyn MeshOptimizer>> {
        Ok(Box::new(LbfgsOptimizer::new(functional, *params)?))
    }
}

fn flatten(points: &[Point3<f64>]) -> DVector<f64> {
    DVector::from_iterator(points.len() * 3, points.iter().flat_map(|p| [p.x, p.y, p.z]))
}

fn flatten_vectors(vectors: &[nalgebra::Vector3<f64>]) -> DVector<f64> {
    DVector::from_iterator(vectors.len() * 3, vectors.iter().flat_map(|v| [v.x, v.y, v.z]))
}

fn unflatten(x: &DVector<f64>) -> Vec<Point3<f64>> {
    x.as_slice()
        .chunks_exact(3)
        .map(|c| Point3::new(c[0], c[1], c[2]))
        .collect()
}

/// Largest Euclidean norm of a per-node 3-vector block.
fn max_node_norm(x: &DVector<f64>) -> f64 {
    x.as_slice()
        .chunks_exact(3)
        .map(|c| (c[0] * c[0] + c[1] * c[1] + c[2] * c[2]).sqrt())
        .fold(0.0, f64::max)
}
