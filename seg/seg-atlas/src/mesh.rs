//! Tetrahedral atlas meshes.
//!
//! - [`Tetrahedron`] - four node indices with geometric helpers
//! - [`AtlasMesh`] - node positions, rest positions, per-node label
//!   probabilities and tetrahedra
//! - [`MeshCollection`] - a reference mesh together with its stiffness

use nalgebra::{DMatrix, Matrix3, Point3, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use seg_types::AffineTransform;

use crate::error::{AtlasError, AtlasResult};

/// A tetrahedron (four node indices).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Tetrahedron {
    /// Indices of the four nodes.
    pub vertices: [usize; 4],
}

impl Tetrahedron {
    /// Create a new tetrahedron.
    #[must_use]
    pub const fn new(v0: usize, v1: usize, v2: usize, v3: usize) -> Self {
        Self {
            vertices: [v0, v1, v2, v3],
        }
    }

    /// Edge matrix with columns `p1 - p0`, `p2 - p0`, `p3 - p0`.
    #[must_use]
    pub fn edge_matrix(&self, positions: &[Point3<f64>]) -> Matrix3<f64> {
        let p0 = positions[self.vertices[0]];
        Matrix3::from_columns(&[
            positions[self.vertices[1]] - p0,
            positions[self.vertices[2]] - p0,
            positions[self.vertices[3]] - p0,
        ])
    }

    /// Signed volume (negative if the tetrahedron is inverted).
    #[must_use]
    pub fn signed_volume(&self, positions: &[Point3<f64>]) -> f64 {
        self.edge_matrix(positions).determinant() / 6.0
    }

    /// Barycentric coordinates of `point`, or `None` for a flat tetrahedron.
    #[must_use]
    pub fn barycentric(&self, positions: &[Point3<f64>], point: &Point3<f64>) -> Option<[f64; 4]> {
        let inverse = self.edge_matrix(positions).try_inverse()?;
        let l = inverse * (point - positions[self.vertices[0]]);
        Some([1.0 - l.x - l.y - l.z, l.x, l.y, l.z])
    }
}

/// A probabilistic atlas mesh.
///
/// `alphas` has one row per node and one column per label (or per class
/// after merging). Rows are expected to sum to one, but this is not
/// enforced.
#[derive(Debug, Clone, PartialEq)]
pub struct AtlasMesh {
    points: Vec<Point3<f64>>,
    rest_points: Vec<Point3<f64>>,
    alphas: DMatrix<f64>,
    label_names: Vec<String>,
    tetrahedra: Vec<Tetrahedron>,
}

impl AtlasMesh {
    /// Builds a mesh whose rest positions equal `points`.
    ///
    /// # Errors
    ///
    /// Fails if the alpha matrix does not have one row per node and one
    /// column per label name, holds negative or non-finite values, or a
    /// tetrahedron refers to a missing node.
    pub fn new(
        points: Vec<Point3<f64>>,
        alphas: DMatrix<f64>,
        label_names: Vec<String>,
        tetrahedra: Vec<Tetrahedron>,
    ) -> AtlasResult<Self> {
        if alphas.nrows() != points.len() {
            return Err(AtlasError::NodeCountMismatch {
                expected: points.len(),
                actual: alphas.nrows(),
            });
        }
        if alphas.ncols() != label_names.len() {
            return Err(AtlasError::InvalidMesh(format!(
                "{} alpha columns for {} label names",
                alphas.ncols(),
                label_names.len()
            )));
        }
        if alphas.iter().any(|a| !(a.is_finite() && *a >= 0.0)) {
            return Err(AtlasError::InvalidMesh(
                "alphas must be finite and non-negative".to_string(),
            ));
        }
        if let Some(tet) = tetrahedra
            .iter()
            .find(|tet| tet.vertices.iter().any(|&v| v >= points.len()))
        {
            return Err(AtlasError::InvalidMesh(format!(
                "tetrahedron {:?} refers to a node outside 0..{}",
                tet.vertices,
                points.len()
            )));
        }
        Ok(Self {
            rest_points: points.clone(),
            points,
            alphas,
            label_names,
            tetrahedra,
        })
    }

    /// Builds a box of `cells` hexahedral cells, each split into five
    /// positively oriented tetrahedra.
    ///
    /// Neighbouring cells alternate their split so faces match. The alpha
    /// row of each node is `alpha(position)`.
    ///
    /// # Errors
    ///
    /// Fails if a cell count is zero, `alpha` returns a row of the wrong
    /// length, or the alphas are invalid.
    ///
    /// # Example
    ///
    /// ```
    /// use nalgebra::{Point3, Vector3};
    /// use seg_atlas::AtlasMesh;
    ///
    /// let mesh = AtlasMesh::regular_grid(
    ///     Point3::origin(),
    ///     Vector3::new(1.0, 1.0, 1.0),
    ///     [2, 2, 2],
    ///     vec!["a".to_string(), "b".to_string()],
    ///     |_| vec![0.5, 0.5],
    /// )
    /// .unwrap();
    /// assert_eq!(mesh.node_count(), 27);
    /// assert_eq!(mesh.tetrahedra().len(), 40);
    /// ```
    pub fn regular_grid(
        origin: Point3<f64>,
        cell_size: Vector3<f64>,
        cells: [usize; 3],
        label_names: Vec<String>,
        mut alpha: impl FnMut(&Point3<f64>) -> Vec<f64>,
    ) -> AtlasResult<Self> {
        if cells.contains(&0) {
            return Err(AtlasError::InvalidMesh(format!(
                "grid needs at least one cell per axis, got {cells:?}"
            )));
        }
        let nodes = [cells[0] + 1, cells[1] + 1, cells[2] + 1];
        let node = |i: usize, j: usize, k: usize| i + j * nodes[0] + k * nodes[0] * nodes[1];

        let mut points = Vec::with_capacity(nodes.iter().product());
        for k in 0..nodes[2] {
            for j in 0..nodes[1] {
                for i in 0..nodes[0] {
                    #[allow(clippy::cast_precision_loss)]
                    let offset = Vector3::new(
                        i as f64 * cell_size.x,
                        j as f64 * cell_size.y,
                        k as f64 * cell_size.z,
                    );
                    points.push(origin + offset);
                }
            }
        }

        let labels = label_names.len();
        let mut alphas = DMatrix::zeros(points.len(), labels);
        for (row, point) in points.iter().enumerate() {
            let values = alpha(point);
            if values.len() != labels {
                return Err(AtlasError::InvalidMesh(format!(
                    "alpha row has {} entries for {labels} labels",
                    values.len()
                )));
            }
            for (col, value) in values.into_iter().enumerate() {
                alphas[(row, col)] = value;
            }
        }

        let mut tetrahedra = Vec::with_capacity(5 * cells.iter().product::<usize>());
        for k in 0..cells[2] {
            for j in 0..cells[1] {
                for i in 0..cells[0] {
                    // corner c = x + 2y + 4z
                    let c: [usize; 8] = std::array::from_fn(|b| {
                        node(i + (b & 1), j + ((b >> 1) & 1), k + ((b >> 2) & 1))
                    });
                    let split = if (i + j + k) % 2 == 0 {
                        [
                            [c[1], c[2], c[4], c[7]],
                            [c[0], c[1], c[2], c[4]],
                            [c[3], c[1], c[2], c[7]],
                            [c[5], c[1], c[4], c[7]],
                            [c[6], c[2], c[4], c[7]],
                        ]
                    } else {
                        [
                            [c[0], c[3], c[5], c[6]],
                            [c[1], c[0], c[3], c[5]],
                            [c[2], c[0], c[3], c[6]],
                            [c[4], c[0], c[5], c[6]],
                            [c[7], c[3], c[5], c[6]],
                        ]
                    };
                    for [a, b, d, e] in split {
                        let mut tet = Tetrahedron::new(a, b, d, e);
                        if tet.signed_volume(&points) < 0.0 {
                            tet.vertices.swap(2, 3);
                        }
                        tetrahedra.push(tet);
                    }
                }
            }
        }

        Self::new(points, alphas, label_names, tetrahedra)
    }

    /// Number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.points.len()
    }

    /// Number of alpha columns.
    #[must_use]
    pub fn label_count(&self) -> usize {
        self.alphas.ncols()
    }

    /// Current node positions.
    #[must_use]
    pub fn points(&self) -> &[Point3<f64>] {
        &self.points
    }

    /// Replaces the current node positions.
    ///
    /// # Errors
    ///
    /// Fails if `points` does not hold one position per node.
    pub fn set_points(&mut self, points: Vec<Point3<f64>>) -> AtlasResult<()> {
        if points.len() != self.points.len() {
            return Err(AtlasError::NodeCountMismatch {
                expected: self.points.len(),
                actual: points.len(),
            });
        }
        self.points = points;
        Ok(())
    }

    /// Reference node positions used by the deformation prior.
    #[must_use]
    pub fn rest_points(&self) -> &[Point3<f64>] {
        &self.rest_points
    }

    /// Per-node probabilities, one column per label.
    #[must_use]
    pub const fn alphas(&self) -> &DMatrix<f64> {
        &self.alphas
    }

    /// Names of the alpha columns.
    #[must_use]
    pub fn label_names(&self) -> &[String] {
        &self.label_names
    }

    /// Replaces the alphas and their column names.
    ///
    /// # Errors
    ///
    /// Fails if the matrix does not have one row per node and one column per
    /// name.
    pub fn set_alphas(&mut self, alphas: DMatrix<f64>, names: Vec<String>) -> AtlasResult<()> {
        if alphas.nrows() != self.points.len() {
            return Err(AtlasError::NodeCountMismatch {
                expected: self.points.len(),
                actual: alphas.nrows(),
            });
        }
        if alphas.ncols() != names.len() {
            return Err(AtlasError::InvalidMesh(format!(
                "{} alpha columns for {} names",
                alphas.ncols(),
                names.len()
            )));
        }
        self.alphas = alphas;
        self.label_names = names;
        Ok(())
    }

    /// Tetrahedra.
    #[must_use]
    pub fn tetrahedra(&self) -> &[Tetrahedron] {
        &self.tetrahedra
    }

    /// Applies `transform` to both the current and the rest positions.
    pub fn apply_transform(&mut self, transform: &AffineTransform) {
        self.points = transform.transform_points(&self.points);
        self.rest_points = transform.transform_points(&self.rest_points);
    }

    /// Axis-aligned bounding box of the rest positions.
    #[must_use]
    pub fn rest_bounds(&self) -> (Point3<f64>, Point3<f64>) {
        bounds(&self.rest_points)
    }
}

/// Axis-aligned bounding box of a point set; `(origin, origin)` when empty.
#[must_use]
pub fn bounds(points: &[Point3<f64>]) -> (Point3<f64>, Point3<f64>) {
    let Some(first) = points.first() else {
        return (Point3::origin(), Point3::origin());
    };
    points
        .iter()
        .fold((*first, *first), |(lo, hi), p| (lo.inf(p), hi.sup(p)))
}

/// A reference atlas mesh plus the stiffness of its deformation prior.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshCollection {
    reference: AtlasMesh,
    stiffness: f64,
}

impl MeshCollection {
    /// Wraps a reference mesh with stiffness `K`.
    #[must_use]
    pub const fn new(reference: AtlasMesh, stiffness: f64) -> Self {
        Self {
            reference,
            stiffness,
        }
    }

    /// Stiffness `K` of the deformation prior.
    #[must_use]
    pub const fn stiffness(&self) -> f64 {
        self.stiffness
    }

    /// Sets the stiffness.
    pub fn set_stiffness(&mut self, stiffness: f64) {
        self.stiffness = stiffness;
    }

    /// The reference mesh.
    #[must_use]
    pub const fn reference(&self) -> &AtlasMesh {
        &self.reference
    }

    /// Mutable access to the reference mesh.
    pub fn reference_mut(&mut self) -> &mut AtlasMesh {
        &mut self.reference
    }

    /// Consumes the collection, returning the reference mesh.
    #[must_use]
    pub fn into_reference(self) -> AtlasMesh {
        self.reference
    }
}
