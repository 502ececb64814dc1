//! Dense 3-D voxel volumes.
//!
//! Volumes are stored column-major (x varies fastest), which is also the
//! ordering used for active-voxel lists and basis coefficients.

use nalgebra::Vector3;

use crate::{AffineTransform, ConfigError, ConfigResult};

/// Linear index of voxel `(i, j, k)` in a column-major grid.
#[inline]
#[must_use]
pub const fn linear_index(dims: [usize; 3], i: usize, j: usize, k: usize) -> usize {
    i + j * dims[0] + k * dims[0] * dims[1]
}

/// A dense 3-D array.
///
/// # Example
///
/// ```
/// use seg_types::Volume;
///
/// let mut volume = Volume::filled([4, 3, 2], 0.0_f64);
/// volume.set(1, 2, 1, 5.0);
/// assert_eq!(volume.get(1, 2, 1), 5.0);
/// assert_eq!(volume.len(), 24);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Volume<T> {
    dims: [usize; 3],
    data: Vec<T>,
}

impl<T: Copy> Volume<T> {
    /// Wraps an existing column-major buffer.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BufferLength`] if `data` does not hold exactly
    /// `dims[0] * dims[1] * dims[2]` values.
    pub fn new(dims: [usize; 3], data: Vec<T>) -> ConfigResult<Self> {
        let expected = dims[0] * dims[1] * dims[2];
        if data.len() != expected {
            return Err(ConfigError::BufferLength {
                dims,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { dims, data })
    }

    /// Creates a volume with every voxel set to `value`.
    #[must_use]
    pub fn filled(dims: [usize; 3], value: T) -> Self {
        Self {
            dims,
            data: vec![value; dims[0] * dims[1] * dims[2]],
        }
    }

    /// Builds a volume by evaluating `f(i, j, k)` at every voxel.
    #[must_use]
    pub fn from_fn(dims: [usize; 3], mut f: impl FnMut(usize, usize, usize) -> T) -> Self {
        let mut data = Vec::with_capacity(dims[0] * dims[1] * dims[2]);
        for k in 0..dims[2] {
            for j in 0..dims[1] {
                for i in 0..dims[0] {
                    data.push(f(i, j, k));
                }
            }
        }
        Self { dims, data }
    }

    /// Grid dimensions.
    #[must_use]
    pub const fn dims(&self) -> [usize; 3] {
        self.dims
    }

    /// Number of voxels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the volume has no voxels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Value at voxel `(i, j, k)`.
    ///
    /// # Panics
    ///
    /// Panics if the coordinates are outside the grid.
    #[must_use]
    pub fn get(&self, i: usize, j: usize, k: usize) -> T {
        self.data[linear_index(self.dims, i, j, k)]
    }

    /// Sets voxel `(i, j, k)`.
    ///
    /// # Panics
    ///
    /// Panics if the coordinates are outside the grid.
    pub fn set(&mut self, i: usize, j: usize, k: usize, value: T) {
        let index = linear_index(self.dims, i, j, k);
        self.data[index] = value;
    }

    /// Column-major voxel values.
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Mutable column-major voxel values.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Strided subsampling: keeps voxels `0, f, 2f, ...` on every axis.
    ///
    /// No anti-alias filtering is applied. Factors of zero are treated as one.
    ///
    /// # Example
    ///
    /// ```
    /// use seg_types::Volume;
    ///
    /// let volume = Volume::from_fn([5, 4, 1], |i, j, _| (i + 10 * j) as f64);
    /// let coarse = volume.subsample([2, 2, 1]);
    /// assert_eq!(coarse.dims(), [3, 2, 1]);
    /// assert_eq!(coarse.get(2, 1, 0), 24.0);
    /// ```
    #[must_use]
    pub fn subsample(&self, factors: [usize; 3]) -> Self {
        let f = factors.map(|f| f.max(1));
        let dims = [
            self.dims[0].div_ceil(f[0]),
            self.dims[1].div_ceil(f[1]),
            self.dims[2].div_ceil(f[2]),
        ];
        Self::from_fn(dims, |i, j, k| self.get(i * f[0], j * f[1], k * f[2]))
    }

    /// Collects the values at the given linear indices.
    #[must_use]
    pub fn gather(&self, indices: &[usize]) -> Vec<T> {
        indices.iter().map(|&index| self.data[index]).collect()
    }
}

impl Volume<bool> {
    /// Linear indices of every `true` voxel, in storage order.
    #[must_use]
    pub fn active_indices(&self) -> Vec<usize> {
        self.data
            .iter()
            .enumerate()
            .filter_map(|(index, &on)| on.then_some(index))
            .collect()
    }

    /// Number of `true` voxels.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.data.iter().filter(|&&on| on).count()
    }
}

/// Full-resolution input to the segmentation core.
///
/// Owns one image per contrast, the foreground mask, the voxel spacing and the
/// registration transform mapping template coordinates to voxel coordinates.
#[derive(Debug, Clone)]
pub struct VolumeState {
    images: Vec<Volume<f64>>,
    mask: Volume<bool>,
    spacing: Vector3<f64>,
    transform: AffineTransform,
}

impl VolumeState {
    /// Bundles the images, mask, spacing and transform.
    ///
    /// # Errors
    ///
    /// Fails if no image is supplied, if an image does not share the mask's
    /// grid, or if a spacing component is not strictly positive.
    pub fn new(
        images: Vec<Volume<f64>>,
        mask: Volume<bool>,
        spacing: Vector3<f64>,
        transform: AffineTransform,
    ) -> ConfigResult<Self> {
        if images.is_empty() {
            return Err(ConfigError::invalid("at least one contrast is required"));
        }
        if let Some(image) = images.iter().find(|image| image.dims() != mask.dims()) {
            return Err(ConfigError::ShapeMismatch {
                expected: mask.dims(),
                actual: image.dims(),
            });
        }
        if spacing.iter().any(|s| !(s.is_finite() && *s > 0.0)) {
            return Err(ConfigError::invalid(format!(
                "voxel spacing must be positive, got {spacing:?}"
            )));
        }
        Ok(Self {
            images,
            mask,
            spacing,
            transform,
        })
    }

    /// One image per contrast.
    #[must_use]
    pub fn images(&self) -> &[Volume<f64>] {
        &self.images
    }

    /// Number of contrasts.
    #[must_use]
    pub fn contrast_count(&self) -> usize {
        self.images.len()
    }

    /// Foreground mask.
    #[must_use]
    pub const fn mask(&self) -> &Volume<bool> {
        &self.mask
    }

    /// Grid dimensions shared by the images and the mask.
    #[must_use]
    pub const fn dims(&self) -> [usize; 3] {
        self.mask.dims()
    }

    /// Voxel spacing in millimetres.
    #[must_use]
    pub const fn spacing(&self) -> &Vector3<f64> {
        &self.spacing
    }

    /// Template-to-voxel registration transform.
    #[must_use]
    pub const fn transform(&self) -> &AffineTransform {
        &self.transform
    }
}
