//! Voxel coverage and prior rasterization.
//!
//! Voxel centres sit at integer coordinates of the working (voxel) frame.
//! Each voxel is attributed to the first tetrahedron, in mesh order, that
//! contains its centre.

// Voxel coordinates fit comfortably in f64 and back
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use nalgebra::{DMatrix, Point3};
use rayon::prelude::*;

use seg_types::linear_index;

use crate::mesh::{AtlasMesh, Tetrahedron};

/// Fixed-point scale of rasterized priors: a stored value of
/// `PRIOR_SCALE` means probability one.
pub const PRIOR_SCALE: f64 = 65535.0;

/// Barycentric tolerance for deciding that a voxel centre lies inside a
/// tetrahedron.
const INSIDE_TOLERANCE: f64 = 1e-10;

/// A voxel centre located inside a tetrahedron.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoxelHit {
    /// Column-major voxel index.
    pub voxel: usize,
    /// Index of the containing tetrahedron.
    pub tetrahedron: usize,
    /// Barycentric coordinates of the voxel centre.
    pub barycentric: [f64; 4],
}

/// Locates every voxel centre of a `dims` grid that lies inside the mesh.
///
/// Tetrahedra are scanned in parallel; hits are then deduplicated in
/// tetrahedron order so the result does not depend on scheduling.
#[must_use]
pub fn covered_voxels(
    points: &[Point3<f64>],
    tetrahedra: &[Tetrahedron],
    dims: [usize; 3],
) -> Vec<VoxelHit> {
    let candidates: Vec<Vec<VoxelHit>> = tetrahedra
        .par_iter()
        .enumerate()
        .map(|(index, tet)| tetrahedron_hits(points, tet, index, dims))
        .collect();

    let mut visited = vec![false; dims[0] * dims[1] * dims[2]];
    let mut hits = Vec::new();
    for hit in candidates.into_iter().flatten() {
        if !visited[hit.voxel] {
            visited[hit.voxel] = true;
            hits.push(hit);
        }
    }
    hits
}

fn tetrahedron_hits(
    points: &[Point3<f64>],
    tet: &Tetrahedron,
    index: usize,
    dims: [usize; 3],
) -> Vec<VoxelHit> {
    let corners = tet.vertices.map(|v| points[v]);
    let mut lo = corners[0];
    let mut hi = corners[0];
    for corner in &corners[1..] {
        lo = lo.inf(corner);
        hi = hi.sup(corner);
    }

    let mut range = [(0_usize, 0_usize); 3];
    for axis in 0..3 {
        let first = lo[axis].ceil().max(0.0);
        let last = hi[axis].floor().min(dims[axis] as f64 - 1.0);
        if last < first {
            return Vec::new();
        }
        range[axis] = (first as usize, last as usize);
    }

    let Some(inverse) = tet.edge_matrix(points).try_inverse() else {
        return Vec::new();
    };

    let mut hits = Vec::new();
    for k in range[2].0..=range[2].1 {
        for j in range[1].0..=range[1].1 {
            for i in range[0].0..=range[0].1 {
                let x = Point3::new(i as f64, j as f64, k as f64);
                let l = inverse * (x - corners[0]);
                let barycentric = [1.0 - l.x - l.y - l.z, l.x, l.y, l.z];
                if barycentric.iter().all(|&b| b >= -INSIDE_TOLERANCE) {
                    hits.push(VoxelHit {
                        voxel: linear_index(dims, i, j, k),
                        tetrahedron: index,
                        barycentric,
                    });
                }
            }
        }
    }
    hits
}

/// Per-voxel label priors in 16-bit fixed point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterizedPriors {
    dims: [usize; 3],
    label_count: usize,
    data: Vec<u16>,
}

impl RasterizedPriors {
    /// Wraps voxel-major prior values (`data[voxel * labels + label]`).
    ///
    /// Returns `None` if the buffer length does not match.
    #[must_use]
    pub fn from_raw(dims: [usize; 3], label_count: usize, data: Vec<u16>) -> Option<Self> {
        (data.len() == dims[0] * dims[1] * dims[2] * label_count).then_some(Self {
            dims,
            label_count,
            data,
        })
    }

    /// Grid dimensions.
    #[must_use]
    pub const fn dims(&self) -> [usize; 3] {
        self.dims
    }

    /// Number of labels (or classes).
    #[must_use]
    pub const fn label_count(&self) -> usize {
        self.label_count
    }

    /// Fixed-point prior of `label` at column-major `voxel`.
    #[must_use]
    pub fn get(&self, voxel: usize, label: usize) -> u16 {
        self.data[voxel * self.label_count + label]
    }

    /// Probabilities (`value / PRIOR_SCALE`) at the given voxels, one row
    /// per voxel.
    #[must_use]
    pub fn probabilities(&self, voxels: &[usize]) -> DMatrix<f64> {
        DMatrix::from_fn(voxels.len(), self.label_count, |row, label| {
            f64::from(self.get(voxels[row], label)) / PRIOR_SCALE
        })
    }
}

/// Rasterizes the node alphas of `mesh` onto a `dims` grid by barycentric
/// interpolation. Voxels outside the mesh get zero prior for every label.
#[must_use]
pub fn rasterize_priors(mesh: &AtlasMesh, dims: [usize; 3]) -> RasterizedPriors {
    let labels = mesh.label_count();
    let alphas = mesh.alphas();
    let mut data = vec![0_u16; dims[0] * dims[1] * dims[2] * labels];
    for hit in covered_voxels(mesh.points(), mesh.tetrahedra(), dims) {
        let nodes = mesh.tetrahedra()[hit.tetrahedron].vertices;
        for label in 0..labels {
            let value: f64 = (0..4)
                .map(|j| hit.barycentric[j] * alphas[(nodes[j], label)])
                .sum();
            data[hit.voxel * labels + label] = (value.clamp(0.0, 1.0) * PRIOR_SCALE).round() as u16;
        }
    }
    RasterizedPriors {
        dims,
        label_count: labels,
        data,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn covering_mesh(alpha: impl FnMut(&Point3<f64>) -> Vec<f64>) -> AtlasMesh {
        AtlasMesh::regular_grid(
            Point3::new(-1.0, -1.0, -1.0),
            Vector3::new(3.0, 3.0, 3.0),
            [3, 3, 3],
            vec!["a".to_string(), "b".to_string()],
            alpha,
        )
        .unwrap()
    }

    #[test]
    fn test_every_voxel_covered_once() {
        let mesh = covering_mesh(|_| vec![0.5, 0.5]);
        let hits = covered_voxels(mesh.points(), mesh.tetrahedra(), [6, 5, 4]);
        assert_eq!(hits.len(), 6 * 5 * 4);
        let mut voxels: Vec<usize> = hits.iter().map(|h| h.voxel).collect();
        voxels.sort_unstable();
        voxels.dedup();
        assert_eq!(voxels.len(), 6 * 5 * 4);
    }

    #[test]
    fn test_uniform_alphas_rasterize_uniformly() {
        let mesh = covering_mesh(|_| vec![0.25, 0.75]);
        let priors = rasterize_priors(&mesh, [4, 4, 4]);
        assert_eq!(priors.label_count(), 2);
        let probabilities = priors.probabilities(&(0..64).collect::<Vec<_>>());
        for row in probabilities.row_iter() {
            assert_relative_eq!(row[0], 0.25, epsilon = 1e-4);
            assert_relative_eq!(row[1], 0.75, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_linear_alphas_are_interpolated_exactly() {
        let mesh = covering_mesh(|p| {
            let a = (p.x + 1.0) / 9.0;
            vec![a, 1.0 - a]
        });
        let dims = [5, 3, 3];
        let priors = rasterize_priors(&mesh, dims);
        for i in 0..dims[0] {
            let voxel = linear_index(dims, i, 1, 2);
            let expected = (i as f64 + 1.0) / 9.0;
            assert_relative_eq!(
                f64::from(priors.get(voxel, 0)) / PRIOR_SCALE,
                expected,
                epsilon = 1e-4
            );
        }
    }

    #[test]
    fn test_voxels_outside_mesh_are_zero() {
        let mesh = AtlasMesh::regular_grid(
            Point3::new(-0.5, -0.5, -0.5),
            Vector3::new(2.0, 2.0, 2.0),
            [1, 1, 1],
            vec!["a".to_string()],
            |_| vec![1.0],
        )
        .unwrap();
        let dims = [4, 4, 4];
        let priors = rasterize_priors(&mesh, dims);
        assert_eq!(priors.get(linear_index(dims, 0, 0, 0), 0), u16::MAX);
        assert_eq!(priors.get(linear_index(dims, 3, 3, 3), 0), 0);
    }

    #[test]
    fn test_from_raw_checks_length() {
        assert!(RasterizedPriors::from_raw([2, 2, 2], 2, vec![0; 16]).is_some());
        assert!(RasterizedPriors::from_raw([2, 2, 2], 2, vec![0; 15]).is_none());
    }
}
