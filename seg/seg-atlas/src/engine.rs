//! The mesh engine interface and an in-memory implementation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use nalgebra::{Point3, Vector3};
use rayon::prelude::*;
use tracing::debug;

use seg_types::AffineTransform;

use crate::error::{AtlasError, AtlasResult};
use crate::mesh::{AtlasMesh, MeshCollection};
use crate::raster::{RasterizedPriors, rasterize_priors};

/// Barycentric tolerance used when locating target nodes in a source mesh.
const WARP_TOLERANCE: f64 = 1e-9;

/// Result of carrying a node deformation from one atlas mesh onto another.
#[derive(Debug, Clone, PartialEq)]
pub struct WarpResult {
    /// Template-space deformation of every target node.
    pub deformation: Vec<Vector3<f64>>,
    /// Mean distance from target nodes to the source mesh.
    pub average_distance: f64,
    /// Largest distance from a target node to the source mesh.
    pub max_distance: f64,
}

/// Operations the segmenter needs from an atlas mesh backend.
///
/// Implementations must be usable from several threads; the segmenter
/// itself calls them sequentially.
pub trait MeshEngine: Send + Sync {
    /// Loads the mesh collection stored under `path`, in template space.
    ///
    /// # Errors
    ///
    /// Fails if no collection exists under `path`.
    fn load_collection(&self, path: &Path) -> AtlasResult<MeshCollection>;

    /// Maps every node (current and rest positions) through `transform`.
    fn transform(&self, collection: &mut MeshCollection, transform: &AffineTransform);

    /// Rasterizes the mesh alphas onto a `dims` voxel grid.
    ///
    /// # Errors
    ///
    /// Backend specific.
    fn rasterize_priors(&self, mesh: &AtlasMesh, dims: [usize; 3]) -> AtlasResult<RasterizedPriors>;

    /// Interpolates a per-node template-space `deformation` of `source` at
    /// the nodes of `target`. Both meshes are in template space.
    ///
    /// # Errors
    ///
    /// Fails if `deformation` does not have one entry per source node.
    fn warp_deformation(
        &self,
        source: &AtlasMesh,
        deformation: &[Vector3<f64>],
        target: &AtlasMesh,
    ) -> AtlasResult<WarpResult>;
}

/// A mesh engine serving collections registered in memory.
///
/// # Example
///
/// ```
/// use nalgebra::{Point3, Vector3};
/// use seg_atlas::{AtlasMesh, InMemoryMeshEngine, MeshCollection, MeshEngine};
///
/// let mesh = AtlasMesh::regular_grid(
///     Point3::origin(),
///     Vector3::new(1.0, 1.0, 1.0),
///     [1, 1, 1],
///     vec!["label".to_string()],
///     |_| vec![1.0],
/// )
/// .unwrap();
/// let engine = InMemoryMeshEngine::new().with_collection("level1", MeshCollection::new(mesh, 0.1));
///
/// let collection = engine.load_collection("level1".as_ref()).unwrap();
/// assert_eq!(collection.reference().node_count(), 8);
/// assert!(engine.load_collection("missing".as_ref()).is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryMeshEngine {
    collections: HashMap<PathBuf, MeshCollection>,
}

impl InMemoryMeshEngine {
    /// Creates an engine with no collections.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `collection` under `path` (builder style).
    #[must_use]
    pub fn with_collection(mut self, path: impl AsRef<Path>, collection: MeshCollection) -> Self {
        self.insert(path, collection);
        self
    }

    /// Registers `collection` under `path`, replacing any previous entry.
    pub fn insert(&mut self, path: impl AsRef<Path>, collection: MeshCollection) {
        self.collections.insert(path.as_ref().to_path_buf(), collection);
    }
}

impl MeshEngine for InMemoryMeshEngine {
    fn load_collection(&self, path: &Path) -> AtlasResult<MeshCollection> {
        self.collections
            .get(path)
            .cloned()
            .ok_or_else(|| AtlasError::UnknownCollection(path.to_path_buf()))
    }

    fn transform(&self, collection: &mut MeshCollection, transform: &AffineTransform) {
        collection.reference_mut().apply_transform(transform);
    }

    fn rasterize_priors(&self, mesh: &AtlasMesh, dims: [usize; 3]) -> AtlasResult<RasterizedPriors> {
        Ok(rasterize_priors(mesh, dims))
    }

    fn warp_deformation(
        &self,
        source: &AtlasMesh,
        deformation: &[Vector3<f64>],
        target: &AtlasMesh,
    ) -> AtlasResult<WarpResult> {
        warp_deformation(source, deformation, target)
    }
}

/// Barycentric warp of a node deformation between two meshes.
///
/// Target nodes inside a source tetrahedron receive the interpolated
/// deformation; nodes outside the source mesh take the deformation of the
/// nearest source node, and their distance to it is reported.
///
/// # Errors
///
/// Fails if `deformation` does not have one entry per source node.
pub fn warp_deformation(
    source: &AtlasMesh,
    deformation: &[Vector3<f64>],
    target: &AtlasMesh,
) -> AtlasResult<WarpResult> {
    if deformation.len() != source.node_count() {
        return Err(AtlasError::NodeCountMismatch {
            expected: source.node_count(),
            actual: deformation.len(),
        });
    }

    let samples: Vec<(Vector3<f64>, f64)> = target
        .points()
        .par_iter()
        .map(|node| sample_deformation(source, deformation, node))
        .collect();

    #[allow(clippy::cast_precision_loss)]
    let average_distance = if samples.is_empty() {
        0.0
    } else {
        samples.iter().map(|(_, d)| d).sum::<f64>() / samples.len() as f64
    };
    let max_distance = samples.iter().map(|(_, d)| *d).fold(0.0, f64::max);
    debug!(
        target_nodes = samples.len(),
        average_distance, max_distance, "warped deformation onto new atlas"
    );

    Ok(WarpResult {
        deformation: samples.into_iter().map(|(v, _)| v).collect(),
        average_distance,
        max_distance,
    })
}

fn sample_deformation(
    source: &AtlasMesh,
    deformation: &[Vector3<f64>],
    node: &Point3<f64>,
) -> (Vector3<f64>, f64) {
    let points = source.points();
    for tet in source.tetrahedra() {
        let Some(l) = tet.barycentric(points, node) else {
            continue;
        };
        if l.iter().all(|&b| b >= -WARP_TOLERANCE) {
            let value = (0..4).fold(Vector3::zeros(), |acc, j| acc + deformation[tet.vertices[j]] * l[j]);
            return (value, 0.0);
        }
    }

    points
        .iter()
        .enumerate()
        .map(|(index, p)| (index, (p - node).norm()))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map_or((Vector3::zeros(), 0.0), |(index, distance)| {
            (deformation[index], distance)
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn grid(origin: f64, size: f64, cells: usize) -> AtlasMesh {
        AtlasMesh::regular_grid(
            Point3::new(origin, origin, origin),
            Vector3::new(size, size, size),
            [cells, cells, cells],
            vec!["a".to_string()],
            |_| vec![1.0],
        )
        .unwrap()
    }

    #[test]
    fn test_identical_meshes_map_node_to_node() {
        let mesh = grid(0.0, 1.0, 2);
        let deformation: Vec<_> = (0..mesh.node_count())
            .map(|i| Vector3::new(i as f64 * 0.1, -(i as f64), 0.5))
            .collect();
        let warped = warp_deformation(&mesh, &deformation, &mesh).unwrap();
        for (a, b) in warped.deformation.iter().zip(&deformation) {
            assert_relative_eq!(a, b, epsilon = 1e-9);
        }
        assert_relative_eq!(warped.max_distance, 0.0);
    }

    #[test]
    fn test_linear_field_is_reproduced_on_finer_mesh() {
        let coarse = grid(0.0, 2.0, 2);
        let fine = grid(0.0, 1.0, 4);
        let field = |p: &Point3<f64>| Vector3::new(0.1 * p.x, 0.2 * p.y - 0.05 * p.z, 1.0);
        let deformation: Vec<_> = coarse.points().iter().map(field).collect();
        let warped = warp_deformation(&coarse, &deformation, &fine).unwrap();
        for (value, node) in warped.deformation.iter().zip(fine.points()) {
            assert_relative_eq!(*value, field(node), epsilon = 1e-9);
        }
    }

    #[test]
    fn test_outside_nodes_use_nearest_source_node() {
        let source = grid(0.0, 1.0, 1);
        let target = grid(0.0, 2.0, 1);
        let deformation = vec![Vector3::new(1.0, 0.0, 0.0); source.node_count()];
        let warped = warp_deformation(&source, &deformation, &target).unwrap();
        assert_relative_eq!(warped.max_distance, 3.0_f64.sqrt(), epsilon = 1e-12);
        assert!(warped.average_distance > 0.0);
        assert_relative_eq!(warped.deformation[7], Vector3::new(1.0, 0.0, 0.0));
    }

    #[test]
    fn test_deformation_length_is_checked() {
        let mesh = grid(0.0, 1.0, 1);
        assert!(matches!(
            warp_deformation(&mesh, &[Vector3::zeros()], &mesh),
            Err(AtlasError::NodeCountMismatch { .. })
        ));
    }

    #[test]
    fn test_engine_transform_maps_points() {
        let engine = InMemoryMeshEngine::new().with_collection("a", MeshCollection::new(grid(0.0, 1.0, 1), 0.1));
        let mut collection = engine.load_collection(Path::new("a")).unwrap();
        engine.transform(&mut collection, &AffineTransform::from_scale(Vector3::new(2.0, 2.0, 2.0)));
        let (_, hi) = collection.reference().rest_bounds();
        assert_relative_eq!(hi.x, 2.0, epsilon = 1e-12);
    }
}
