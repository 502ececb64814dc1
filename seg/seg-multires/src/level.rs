//! Downsampled working grid of one resolution level.

// Spacing ratios are small positive numbers
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use nalgebra::{DMatrix, Vector3};

use seg_basis::KroneckerBasis;
use seg_types::{Volume, VolumeState};

/// Integer downsampling factor per axis: `round(target / spacing)`,
/// clamped to at least one. Non-finite ratios give one.
///
/// # Example
///
/// ```
/// use nalgebra::Vector3;
/// use seg_multires::downsampling_factors;
///
/// assert_eq!(downsampling_factors(2.0, &Vector3::new(1.0, 0.9, 3.0)), [2, 2, 1]);
/// ```
#[must_use]
pub fn downsampling_factors(target_spacing: f64, spacing: &Vector3<f64>) -> [usize; 3] {
    std::array::from_fn(|axis| {
        let ratio = (target_spacing / spacing[axis]).round();
        if ratio.is_finite() && ratio >= 1.0 {
            ratio as usize
        } else {
            1
        }
    })
}

/// Strided views of the images, mask and basis at one level.
#[derive(Debug, Clone)]
pub struct LevelGrid {
    /// Per-axis factors.
    pub factors: [usize; 3],
    /// Subsampled mask.
    pub mask: Volume<bool>,
    /// Subsampled raw images, one per contrast.
    pub images: Vec<Volume<f64>>,
    /// Subsampled bias basis.
    pub basis: KroneckerBasis,
    /// Column-major indices of the masked voxels.
    pub active: Vec<usize>,
    /// Raw intensities of the masked voxels, one column per contrast.
    pub raw: DMatrix<f64>,
}

impl LevelGrid {
    /// Subsamples `volume` and `basis` by `factors`.
    #[must_use]
    pub fn new(volume: &VolumeState, basis: &KroneckerBasis, factors: [usize; 3]) -> Self {
        let mask = volume.mask().subsample(factors);
        let images: Vec<Volume<f64>> = volume
            .images()
            .iter()
            .map(|image| image.subsample(factors))
            .collect();
        let active = mask.active_indices();
        let columns: Vec<Vec<f64>> = images.iter().map(|image| image.gather(&active)).collect();
        let raw = DMatrix::from_fn(active.len(), images.len(), |row, contrast| columns[contrast][row]);
        Self {
            factors,
            mask,
            images,
            basis: basis.subsample(factors),
            active,
            raw,
        }
    }

    /// Grid dimensions.
    #[must_use]
    pub const fn dims(&self) -> [usize; 3] {
        self.mask.dims()
    }
}
