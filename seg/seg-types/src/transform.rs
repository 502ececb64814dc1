//! Affine transforms between template space and voxel space.

use nalgebra::{Matrix3, Matrix4, Point3, Vector3};

use crate::{ConfigError, ConfigResult};

/// A general 3-D affine transform stored as a homogeneous 4×4 matrix.
///
/// The registration stage produces a transform from atlas template
/// coordinates to image voxel coordinates; each resolution level prepends a
/// downsampling scale to it.
///
/// # Example
///
/// ```
/// use seg_types::AffineTransform;
/// use nalgebra::{Point3, Vector3};
///
/// let registration = AffineTransform::from_translation(Vector3::new(1.0, 2.0, 3.0));
/// let downsampling = AffineTransform::downsampling([2, 2, 1]);
/// let total = downsampling.compose(&registration);
///
/// let p = total.transform_point(&Point3::new(1.0, 0.0, 0.0));
/// assert_eq!(p, Point3::new(1.0, 1.0, 3.0));
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AffineTransform {
    matrix: Matrix4<f64>,
}

impl Default for AffineTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl AffineTransform {
    /// Wraps a homogeneous matrix.
    ///
    /// # Errors
    ///
    /// Fails if the last row is not `[0, 0, 0, 1]` or any entry is not finite.
    #[allow(clippy::float_cmp)]
    pub fn from_matrix(matrix: Matrix4<f64>) -> ConfigResult<Self> {
        if matrix.iter().any(|v| !v.is_finite()) {
            return Err(ConfigError::invalid("affine matrix has non-finite entries"));
        }
        let last_row = [matrix[(3, 0)], matrix[(3, 1)], matrix[(3, 2)], matrix[(3, 3)]];
        if last_row != [0.0, 0.0, 0.0, 1.0] {
            return Err(ConfigError::invalid(format!(
                "affine matrix last row must be [0, 0, 0, 1], got {last_row:?}"
            )));
        }
        Ok(Self { matrix })
    }

    /// The identity transform.
    #[must_use]
    pub fn identity() -> Self {
        Self {
            matrix: Matrix4::identity(),
        }
    }

    /// A pure translation.
    #[must_use]
    pub fn from_translation(translation: Vector3<f64>) -> Self {
        Self {
            matrix: Matrix4::new_translation(&translation),
        }
    }

    /// A per-axis scale.
    #[must_use]
    pub fn from_scale(scale: Vector3<f64>) -> Self {
        Self {
            matrix: Matrix4::new_nonuniform_scaling(&scale),
        }
    }

    /// The scale `diag(1/f)` mapping full-resolution voxel coordinates onto a
    /// grid subsampled by integer `factors`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn downsampling(factors: [usize; 3]) -> Self {
        let f = factors.map(|f| f.max(1) as f64);
        Self::from_scale(Vector3::new(1.0 / f[0], 1.0 / f[1], 1.0 / f[2]))
    }

    /// The homogeneous matrix.
    #[must_use]
    pub const fn matrix(&self) -> &Matrix4<f64> {
        &self.matrix
    }

    /// The upper-left 3×3 block.
    #[must_use]
    pub fn linear(&self) -> Matrix3<f64> {
        self.matrix.fixed_view::<3, 3>(0, 0).into_owned()
    }

    /// The translation column.
    #[must_use]
    pub fn translation(&self) -> Vector3<f64> {
        self.matrix.fixed_view::<3, 1>(0, 3).into_owned()
    }

    /// Determinant of the linear part.
    #[must_use]
    pub fn determinant(&self) -> f64 {
        self.linear().determinant()
    }

    /// Applies the transform to a point.
    #[must_use]
    pub fn transform_point(&self, point: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.linear() * point.coords + self.translation())
    }

    /// Applies the linear part to a vector.
    #[must_use]
    pub fn transform_vector(&self, vector: &Vector3<f64>) -> Vector3<f64> {
        self.linear() * vector
    }

    /// Applies the transform to every point.
    #[must_use]
    pub fn transform_points(&self, points: &[Point3<f64>]) -> Vec<Point3<f64>> {
        let linear = self.linear();
        let translation = self.translation();
        points
            .iter()
            .map(|p| Point3::from(linear * p.coords + translation))
            .collect()
    }

    /// Composes two transforms: the result applies `other` first, then `self`.
    #[must_use]
    pub fn compose(&self, other: &Self) -> Self {
        Self {
            matrix: self.matrix * other.matrix,
        }
    }

    /// The inverse transform.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::SingularTransform`] if the matrix is not invertible.
    pub fn try_inverse(&self) -> ConfigResult<Self> {
        self.matrix
            .try_inverse()
            .map(|matrix| Self { matrix })
            .ok_or(ConfigError::SingularTransform)
    }
}
