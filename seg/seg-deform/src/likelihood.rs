//! Reference cost functional: atlas likelihood plus a linear-elastic prior.
//!
//! For every masked voxel centre `x` covered by the mesh, with containing
//! tetrahedron `t` and barycentric coordinates `λ`, the class prior is
//! `π_c(x) = Σ_j λ_j·α_{j,c}` and the data term is
//!
//! ```text
//! -log Σ_c π_c(x)·L_c(x)
//! ```
//!
//! where `L_c` is the mixture likelihood of class `c`. Moving node `k`
//! changes `λ` at fixed `x` by `∂λ_j/∂p_k = -λ_k·∇λ_j`, which gives the
//! analytic gradient.
//!
//! A masked voxel that no tetrahedron covers has zero prior and is charged
//! `-log(EPS)`, so shrinking the mesh away from the mask never lowers the
//! cost.
//!
//! The deformation prior is `K·V₀·‖F - I‖²` per tetrahedron, measured in
//! template space through the linear part of the template-to-voxel transform.
//! A tetrahedron whose orientation flips relative to its rest shape makes
//! the cost infinite.

// Voxel counts fit in f64
#![allow(clippy::cast_precision_loss)]

use nalgebra::{DMatrix, Matrix3, Point3, Vector3};
use rayon::prelude::*;
use tracing::trace;

use seg_atlas::{AtlasMesh, Tetrahedron, covered_voxels};
use seg_gmm::class_likelihoods;
use seg_types::{ConfigError, EPS};

use crate::error::{DeformResult, DeformationError};
use crate::functional::{
    BoundaryCondition, CostAndGradient, CostFunctional, CostFunctionalFactory,
    CostFunctionalRequest,
};

/// Relative tolerance for deciding that a rest node lies on a face of the
/// bounding box.
const FACE_TOLERANCE: f64 = 1e-9;

/// Atlas likelihood functional bound to one set of images and mixture
/// parameters.
#[derive(Debug, Clone)]
pub struct AtlasLikelihoodCost {
    dims: [usize; 3],
    /// Row of `likelihoods` for every voxel, `None` outside the mask.
    rows: Vec<Option<usize>>,
    /// Active voxels × classes.
    likelihoods: DMatrix<f64>,
    boundary: BoundaryCondition,
    linear: Matrix3<f64>,
    linear_inverse: Matrix3<f64>,
    stiffness: f64,
}

impl AtlasLikelihoodCost {
    /// Binds the functional to `request`.
    ///
    /// # Errors
    ///
    /// Fails if no image is given, an image is not on the mask grid, the
    /// image count differs from the mixture's contrast count, the transform
    /// is singular, or a covariance is not positive definite.
    pub fn new(request: &CostFunctionalRequest<'_>) -> DeformResult<Self> {
        let contrasts = request.mixture.contrast_count();
        if request.images.len() != contrasts || contrasts == 0 {
            return Err(DeformationError::DimensionMismatch {
                what: "images",
                expected: contrasts,
                actual: request.images.len(),
            });
        }
        let mask = request.mask;
        if let Some(image) = request.images.iter().find(|image| image.dims() != mask.dims()) {
            return Err(ConfigError::ShapeMismatch {
                expected: mask.dims(),
                actual: image.dims(),
            }
            .into());
        }

        let active = mask.active_indices();
        let columns: Vec<Vec<f64>> = request.images.iter().map(|image| image.gather(&active)).collect();
        let data = DMatrix::from_fn(active.len(), contrasts, |row, contrast| columns[contrast][row]);
        let likelihoods = class_likelihoods(&data, request.mixture)?;
        let mut rows = vec![None; mask.len()];
        for (row, &voxel) in active.iter().enumerate() {
            rows[voxel] = Some(row);
        }

        let linear = request.transform.linear();
        let linear_inverse = linear.try_inverse().ok_or(ConfigError::SingularTransform)?;
        Ok(Self {
            dims: mask.dims(),
            rows,
            likelihoods,
            boundary: request.boundary,
            linear,
            linear_inverse,
            stiffness: request.stiffness,
        })
    }

    /// Number of classes the functional expects in the mesh alphas.
    #[must_use]
    pub fn class_count(&self) -> usize {
        self.likelihoods.ncols()
    }

    /// Data term and its per-hit node gradients, in voxel order of
    /// `covered_voxels`.
    fn likelihood_term(
        &self,
        mesh: &AtlasMesh,
        points: &[Point3<f64>],
        gradient: &mut [Vector3<f64>],
    ) -> f64 {
        let tetrahedra = mesh.tetrahedra();
        let alphas = mesh.alphas();
        let inverses: Vec<Option<Matrix3<f64>>> = tetrahedra
            .par_iter()
            .map(|tet| tet.edge_matrix(points).try_inverse())
            .collect();

        let hits = covered_voxels(points, tetrahedra, self.dims);
        let contributions: Vec<(f64, [(usize, Vector3<f64>); 4])> = hits
            .par_iter()
            .filter_map(|hit| {
                let row = self.rows[hit.voxel]?;
                let inverse = inverses[hit.tetrahedron]?;
                let nodes = tetrahedra[hit.tetrahedron].vertices;
                let node_terms: [f64; 4] = std::array::from_fn(|j| {
                    (0..self.class_count())
                        .map(|c| alphas[(nodes[j], c)] * self.likelihoods[(row, c)])
                        .sum()
                });
                let density = (0..4).map(|j| hit.barycentric[j] * node_terms[j]).sum::<f64>() + EPS;

                // ∇λ_j for j = 1..3 are the rows of the inverse edge matrix
                let lambda_gradients: [Vector3<f64>; 3] =
                    std::array::from_fn(|r| inverse.row(r).transpose());
                let density_gradient = lambda_gradients[0] * (node_terms[1] - node_terms[0])
                    + lambda_gradients[1] * (node_terms[2] - node_terms[0])
                    + lambda_gradients[2] * (node_terms[3] - node_terms[0]);
                let grads: [(usize, Vector3<f64>); 4] = std::array::from_fn(|k| {
                    (nodes[k], density_gradient * (hit.barycentric[k] / density))
                });
                Some((-density.ln(), grads))
            })
            .collect();

        let uncovered = self.likelihoods.nrows() - contributions.len();
        let mut cost = uncovered as f64 * -EPS.ln();
        for (value, grads) in contributions {
            cost += value;
            for (node, g) in grads {
                gradient[node] += g;
            }
        }
        cost
    }

    /// Elastic term, or `None` if a tetrahedron is folded.
    fn elastic_term(
        &self,
        mesh: &AtlasMesh,
        points: &[Point3<f64>],
        gradient: &mut [Vector3<f64>],
    ) -> Option<f64> {
        let rest = mesh.rest_points();
        let terms: Vec<Option<(f64, Tetrahedron, Matrix3<f64>)>> = mesh
            .tetrahedra()
            .par_iter()
            .map(|tet| self.tetrahedron_energy(tet, rest, points))
            .collect();

        let mut cost = 0.0;
        for term in terms {
            let (energy, tet, edges) = term?;
            cost += energy;
            let [p0, p1, p2, p3] = tet.vertices;
            let columns: [Vector3<f64>; 3] = std::array::from_fn(|c| edges.column(c).into_owned());
            gradient[p1] += columns[0];
            gradient[p2] += columns[1];
            gradient[p3] += columns[2];
            gradient[p0] -= columns[0] + columns[1] + columns[2];
        }
        Some(cost)
    }

    /// Energy of one tetrahedron and its gradient with respect to the edge
    /// matrix. Flat rest shapes contribute nothing; folding gives `None`.
    fn tetrahedron_energy(
        &self,
        tet: &Tetrahedron,
        rest: &[Point3<f64>],
        points: &[Point3<f64>],
    ) -> Option<(f64, Tetrahedron, Matrix3<f64>)> {
        let rest_edges = tet.edge_matrix(rest);
        let current_edges = tet.edge_matrix(points);
        let rest_det = rest_edges.determinant();
        if rest_det == 0.0 {
            return Some((0.0, *tet, Matrix3::zeros()));
        }
        if rest_det * current_edges.determinant() <= 0.0 {
            return None;
        }
        let rest_inverse = rest_edges.try_inverse()?;

        let template_volume = (self.linear_inverse * rest_edges).determinant().abs() / 6.0;
        let right = rest_inverse * self.linear;
        let strain = self.linear_inverse * current_edges * right - Matrix3::identity();
        let scale = self.stiffness * template_volume;
        let energy = scale * strain.norm_squared();
        let edges = self.linear_inverse.transpose() * strain * right.transpose() * (2.0 * scale);
        Some((energy, *tet, edges))
    }

    fn apply_boundary(&self, mesh: &AtlasMesh, gradient: &mut [Vector3<f64>]) {
        if self.boundary == BoundaryCondition::None {
            return;
        }
        let (lo, hi) = mesh.rest_bounds();
        let tolerance = FACE_TOLERANCE * (hi - lo).amax().max(1.0);
        for (rest, g) in mesh.rest_points().iter().zip(gradient.iter_mut()) {
            for axis in 0..3 {
                if (rest[axis] - lo[axis]).abs() <= tolerance || (hi[axis] - rest[axis]).abs() <= tolerance {
                    g[axis] = 0.0;
                }
            }
        }
    }
}

impl CostFunctional for AtlasLikelihoodCost {
    fn evaluate(&self, mesh: &AtlasMesh, points: &[Point3<f64>]) -> DeformResult<CostAndGradient> {
        if points.len() != mesh.node_count() {
            return Err(DeformationError::NodeCountMismatch {
                expected: mesh.node_count(),
                actual: points.len(),
            });
        }
        if mesh.label_count() != self.class_count() {
            return Err(DeformationError::DimensionMismatch {
                what: "mesh alpha columns",
                expected: self.class_count(),
                actual: mesh.label_count(),
            });
        }

        let mut gradient = vec![Vector3::zeros(); points.len()];
        let Some(elastic) = self.elastic_term(mesh, points, &mut gradient) else {
            trace!("folded tetrahedron");
            return Ok(CostAndGradient {
                cost: f64::INFINITY,
                gradient: vec![Vector3::zeros(); points.len()],
            });
        };
        let likelihood = self.likelihood_term(mesh, points, &mut gradient);
        self.apply_boundary(mesh, &mut gradient);
        trace!(likelihood, elastic, "evaluated atlas cost");
        Ok(CostAndGradient {
            cost: likelihood + elastic,
            gradient,
        })
    }
}

/// Factory for [`AtlasLikelihoodCost`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AtlasLikelihoodFactory;

impl CostFunctionalFactory for AtlasLikelihoodFactory {
    fn build(&self, request: &CostFunctionalRequest<'_>) -> DeformResult<Box<dyn CostFunctional>> {
        Ok(Box::new(AtlasLikelihoodCost::new(request)?))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::DVector;
    use seg_gmm::{ComponentLayout, GaussianMixture};
    use seg_types::{AffineTransform, Volume};

    /// Two classes centred at 0 and 10, with a left/right intensity split
    /// at `x = 2`.
    fn setup(boundary: BoundaryCondition) -> (AtlasLikelihoodCost, AtlasMesh) {
        let dims = [5, 3, 3];
        let image = Volume::from_fn(dims, |i, _, _| if i < 2 { 0.0 } else { 10.0 });
        let mask = Volume::filled(dims, true);
        let mixture = GaussianMixture::from_parameters(
            ComponentLayout::new(vec![1, 1]),
            DMatrix::from_column_slice(2, 1, &[0.0, 10.0]),
            vec![DMatrix::from_element(1, 1, 4.0); 2],
            DVector::from_element(2, 1.0),
        )
        .unwrap();
        let transform = AffineTransform::identity();
        let images = [image];
        let request = CostFunctionalRequest {
            images: &images,
            mask: &mask,
            boundary,
            transform: &transform,
            mixture: &mixture,
            stiffness: 0.1,
        };
        let cost = AtlasLikelihoodCost::new(&request).unwrap();
        let mesh = AtlasMesh::regular_grid(
            Point3::new(-0.5, -0.5, -0.5),
            Vector3::new(1.25, 1.5, 1.5),
            [4, 2, 2],
            vec!["dark".to_string(), "bright".to_string()],
            |p| {
                let t = ((p.x + 0.5) / 5.0).clamp(0.0, 1.0);
                vec![1.0 - t, t]
            },
        )
        .unwrap();
        (cost, mesh)
    }

    #[test]
    fn test_gradient_matches_finite_differences() {
        let (cost, mesh) = setup(BoundaryCondition::None);
        let mut points = mesh.points().to_vec();
        // an interior node, nudged so no voxel centre sits on a face
        let node = 1 + 5 + 15;
        points[node] += Vector3::new(0.13, -0.07, 0.05);
        let base = cost.evaluate(&mesh, &points).unwrap();

        let h = 1e-6;
        for axis in 0..3 {
            let mut plus = points.clone();
            plus[node][axis] += h;
            let mut minus = points.clone();
            minus[node][axis] -= h;
            let numeric = (cost.evaluate(&mesh, &plus).unwrap().cost
                - cost.evaluate(&mesh, &minus).unwrap().cost)
                / (2.0 * h);
            assert_relative_eq!(base.gradient[node][axis], numeric, epsilon = 1e-4, max_relative = 1e-4);
        }
    }

    #[test]
    fn test_uncovered_voxels_are_charged() {
        let (cost, full) = setup(BoundaryCondition::None);
        // covers x in -0.5..1.5 only, leaving 3 × 3 × 3 masked voxels outside
        let partial = AtlasMesh::regular_grid(
            Point3::new(-0.5, -0.5, -0.5),
            Vector3::new(1.0, 1.5, 1.5),
            [2, 2, 2],
            vec!["dark".to_string(), "bright".to_string()],
            |_| vec![0.5, 0.5],
        )
        .unwrap();

        let uncovered_charge = 27.0 * -EPS.ln();
        let full_cost = cost.evaluate(&full, full.points()).unwrap().cost;
        let partial_cost = cost.evaluate(&partial, partial.points()).unwrap().cost;
        assert!(full_cost < uncovered_charge);
        assert!(partial_cost >= uncovered_charge);
        assert!(partial_cost > full_cost);
    }

    #[test]
    fn test_rest_shape_has_no_elastic_energy() {
        let (cost, mesh) = setup(BoundaryCondition::None);
        let mut gradient = vec![Vector3::zeros(); mesh.node_count()];
        let energy = cost.elastic_term(&mesh, mesh.points(), &mut gradient).unwrap();
        assert_relative_eq!(energy, 0.0, epsilon = 1e-12);
        assert!(gradient.iter().all(|g| g.norm() < 1e-12));
    }

    #[test]
    fn test_folded_mesh_costs_infinity() {
        let (cost, mesh) = setup(BoundaryCondition::None);
        let mut points = mesh.points().to_vec();
        let node = 1 + 5 + 15;
        points[node].x += 3.0;
        let result = cost.evaluate(&mesh, &points).unwrap();
        assert!(result.cost.is_infinite());
    }

    #[test]
    fn test_sliding_zeroes_normal_gradient_on_faces() {
        let (cost, mesh) = setup(BoundaryCondition::Sliding);
        let mut points = mesh.points().to_vec();
        for p in &mut points {
            p.y += 0.1 * p.x;
        }
        let result = cost.evaluate(&mesh, &points).unwrap();
        // node 0 is a corner of the box: every component is constrained
        assert_eq!(result.gradient[0], Vector3::zeros());
        // node 1 lies on the y and z faces only
        assert_eq!(result.gradient[1].y, 0.0);
        assert_eq!(result.gradient[1].z, 0.0);
    }

    #[test]
    fn test_rejects_mismatched_alpha_columns() {
        let (cost, mesh) = setup(BoundaryCondition::None);
        let mut mesh = mesh;
        let alphas = DMatrix::from_element(mesh.node_count(), 1, 1.0);
        mesh.set_alphas(alphas, vec!["all".to_string()]).unwrap();
        assert!(matches!(
            cost.evaluate(&mesh, &mesh.points().to_vec()),
            Err(DeformationError::DimensionMismatch { .. })
        ));
    }
}
