//! Step loop around a mesh optimizer.

use nalgebra::Vector3;
use tracing::{debug, info};

use seg_atlas::AtlasMesh;

use crate::error::{DeformResult, DeformationError};
use crate::optimizer::MeshOptimizer;

/// Diagnostics of a single optimizer step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeformationStep {
    /// One-based step number.
    pub iteration: usize,
    /// Objective after the step.
    pub cost: f64,
    /// Largest node displacement of the step.
    pub max_displacement: f64,
}

/// Result of driving an optimizer to completion.
#[derive(Debug, Clone, PartialEq)]
pub struct DeformationOutcome {
    /// Number of steps taken, including the final zero-displacement one.
    pub steps: usize,
    /// Objective reported by the last step.
    pub cost: f64,
    /// Node positions after minus before, per node.
    pub displacement: Vec<Vector3<f64>>,
    /// Largest norm in `displacement`.
    pub max_displacement_applied: f64,
}

/// Steps `optimizer` until it reports a maximal displacement of exactly
/// zero.
///
/// `on_step` sees every step's iteration number, cost and displacement.
///
/// # Errors
///
/// Returns [`DeformationError::DegenerateStep`] if a step reports a NaN
/// cost or a NaN or negative displacement, and propagates optimizer errors.
pub fn drive_deformation<F>(
    optimizer: &mut dyn MeshOptimizer,
    mesh: &mut AtlasMesh,
    mut on_step: F,
) -> DeformResult<DeformationOutcome>
where
    F: FnMut(&DeformationStep),
{
    let before = mesh.points().to_vec();
    let mut iteration = 0;
    let cost = loop {
        iteration += 1;
        let step = optimizer.step(mesh)?;
        if step.cost.is_nan() || step.max_displacement.is_nan() || step.max_displacement < 0.0 {
            return Err(DeformationError::DegenerateStep {
                iteration,
                cost: step.cost,
                max_displacement: step.max_displacement,
            });
        }
        let record = DeformationStep {
            iteration,
            cost: step.cost,
            max_displacement: step.max_displacement,
        };
        debug!(iteration, cost = step.cost, max_displacement = step.max_displacement, "deformation step");
        on_step(&record);
        if step.max_displacement == 0.0 {
            break step.cost;
        }
    };

    let displacement: Vec<Vector3<f64>> = mesh
        .points()
        .iter()
        .zip(&before)
        .map(|(after, before)| after - before)
        .collect();
    let max_displacement_applied = displacement.iter().map(Vector3::norm).fold(0.0, f64::max);
    info!(steps = iteration, cost, max_displacement_applied, "deformation finished");
    Ok(DeformationOutcome {
        steps: iteration,
        cost,
        displacement,
        max_displacement_applied,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::optimizer::OptimizerStep;
    use approx::assert_relative_eq;
    use nalgebra::Point3;

    /// Replays a fixed list of steps, shifting every node by each
    /// displacement along x.
    struct Scripted {
        steps: Vec<(f64, f64)>,
        next: usize,
    }

    impl MeshOptimizer for Scripted {
        fn step(&mut self, mesh: &mut AtlasMesh) -> DeformResult<OptimizerStep> {
            let (cost, max_displacement) = self.steps[self.next];
            self.next += 1;
            if max_displacement > 0.0 {
                let moved = mesh
                    .points()
                    .iter()
                    .map(|p| p + Vector3::new(max_displacement, 0.0, 0.0))
                    .collect();
                mesh.set_points(moved)?;
            }
            Ok(OptimizerStep {
                cost,
                max_displacement,
            })
        }
    }

    fn cube() -> AtlasMesh {
        AtlasMesh::regular_grid(
            Point3::origin(),
            Vector3::new(1.0, 1.0, 1.0),
            [1, 1, 1],
            vec!["a".to_string()],
            |_| vec![1.0],
        )
        .unwrap()
    }

    #[test]
    fn test_zero_on_first_step_stops_after_one_step() {
        let mut mesh = cube();
        let mut optimizer = Scripted {
            steps: vec![(4.0, 0.0), (1.0, 1.0)],
            next: 0,
        };
        let mut seen = Vec::new();
        let outcome = drive_deformation(&mut optimizer, &mut mesh, |s| seen.push(*s)).unwrap();
        assert_eq!(outcome.steps, 1);
        assert_eq!(outcome.max_displacement_applied, 0.0);
        assert_eq!(outcome.cost, 4.0);
        assert_eq!(seen.len(), 1);
        assert_eq!(optimizer.next, 1);
    }

    #[test]
    fn test_records_applied_displacement() {
        let mut mesh = cube();
        let mut optimizer = Scripted {
            steps: vec![(3.0, 0.5), (2.0, 0.25), (1.5, 0.0)],
            next: 0,
        };
        let mut seen = Vec::new();
        let outcome = drive_deformation(&mut optimizer, &mut mesh, |s| seen.push(*s)).unwrap();
        assert_eq!(outcome.steps, 3);
        assert_eq!(outcome.cost, 1.5);
        assert_relative_eq!(outcome.max_displacement_applied, 0.75, epsilon = 1e-12);
        assert_relative_eq!(outcome.displacement[3], Vector3::new(0.75, 0.0, 0.0), epsilon = 1e-12);
        let iterations: Vec<usize> = seen.iter().map(|s| s.iteration).collect();
        assert_eq!(iterations, vec![1, 2, 3]);
    }

    #[test]
    fn test_nan_cost_is_fatal() {
        let mut mesh = cube();
        let mut optimizer = Scripted {
            steps: vec![(f64::NAN, 0.5)],
            next: 0,
        };
        assert!(matches!(
            drive_deformation(&mut optimizer, &mut mesh, |_| {}),
            Err(DeformationError::DegenerateStep { iteration: 1, .. })
        ));
    }

    #[test]
    fn test_negative_displacement_is_fatal() {
        let mut mesh = cube();
        let mut optimizer = Scripted {
            steps: vec![(1.0, 0.5), (1.0, -0.1)],
            next: 0,
        };
        assert!(matches!(
            drive_deformation(&mut optimizer, &mut mesh, |_| {}),
            Err(DeformationError::DegenerateStep { iteration: 2, .. })
        ));
    }
}
