//! Bias field coefficients and their weighted least-squares estimate.
//!
//! The log-domain bias field of contrast `c` is `B·x_c`, with `B` a
//! [`KroneckerBasis`] evaluated on the voxel grid. Given the latest
//! posteriors and mixture parameters, the coefficients solve the normal
//! equations
//!
//! ```text
//! Σ_c2 (Bᵀ·diag(w_c1c2)·B) · x_c2 = Bᵀ · Σ_c2 w_c1c2 ⊙ r_c2
//! ```
//!
//! where `w_c1c2 = Σ_g p_g·Λ_g[c1,c2]` and `r_c2` is the raw intensity minus
//! the precision-weighted prediction of the mixture means.

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use tracing::debug;

use seg_basis::KroneckerBasis;
use seg_gmm::{DataRefresh, GaussianMixture};
use seg_types::{EPS, Volume};

use crate::error::{BiasFieldError, BiasFieldResult};

/// Bias field coefficients: one column per contrast, one row per basis
/// function.
#[derive(Debug, Clone, PartialEq)]
pub struct BiasField {
    coefficients: DMatrix<f64>,
}

impl BiasField {
    /// A flat (all zero) field.
    #[must_use]
    pub fn zeros(basis_count: usize, contrast_count: usize) -> Self {
        Self {
            coefficients: DMatrix::zeros(basis_count, contrast_count),
        }
    }

    /// Wraps existing coefficients.
    #[must_use]
    pub const fn from_coefficients(coefficients: DMatrix<f64>) -> Self {
        Self { coefficients }
    }

    /// Coefficient matrix (basis functions × contrasts).
    #[must_use]
    pub const fn coefficients(&self) -> &DMatrix<f64> {
        &self.coefficients
    }

    /// Consumes the field, returning its coefficients.
    #[must_use]
    pub fn into_coefficients(self) -> DMatrix<f64> {
        self.coefficients
    }

    /// Number of contrasts.
    #[must_use]
    pub fn contrast_count(&self) -> usize {
        self.coefficients.ncols()
    }

    /// Number of basis functions per contrast.
    #[must_use]
    pub fn basis_count(&self) -> usize {
        self.coefficients.nrows()
    }

    /// Field of one contrast over every voxel of `basis`, column-major.
    ///
    /// # Errors
    ///
    /// Fails if the coefficient count does not match the basis.
    pub fn field(&self, basis: &KroneckerBasis, contrast: usize) -> BiasFieldResult<Vec<f64>> {
        let column = self.coefficients.column(contrast).into_owned();
        Ok(basis.backproject(column.as_slice())?)
    }

    /// Bias-corrected images: `image - field` inside the mask, untouched
    /// outside.
    ///
    /// # Errors
    ///
    /// Fails if the image count differs from the contrast count or the
    /// grids do not match the basis.
    pub fn correct(
        &self,
        basis: &KroneckerBasis,
        images: &[Volume<f64>],
        mask: &Volume<bool>,
    ) -> BiasFieldResult<Vec<Volume<f64>>> {
        check("contrasts", self.contrast_count(), images.len())?;
        check("mask voxels", basis.voxel_count(), mask.len())?;
        images
            .iter()
            .enumerate()
            .map(|(contrast, image)| {
                check("image voxels", basis.voxel_count(), image.len())?;
                let field = self.field(basis, contrast)?;
                let mut corrected = image.clone();
                for ((value, inside), bias) in corrected
                    .as_mut_slice()
                    .iter_mut()
                    .zip(mask.as_slice())
                    .zip(&field)
                {
                    if *inside {
                        *value -= bias;
                    }
                }
                Ok(corrected)
            })
            .collect()
    }
}

/// Fits [`BiasField`] coefficients on the active voxels of one resolution
/// level.
#[derive(Debug, Clone, Copy)]
pub struct BiasFieldEstimator<'a> {
    basis: &'a KroneckerBasis,
    active: &'a [usize],
    raw: &'a DMatrix<f64>,
}

impl<'a> BiasFieldEstimator<'a> {
    /// Builds an estimator.
    ///
    /// `active` lists the column-major indices of the masked voxels and
    /// `raw` holds their uncorrected intensities (one row per active voxel,
    /// one column per contrast).
    ///
    /// # Errors
    ///
    /// Fails if `raw` does not have one row per active voxel or an index
    /// lies outside the basis grid.
    pub fn new(
        basis: &'a KroneckerBasis,
        active: &'a [usize],
        raw: &'a DMatrix<f64>,
    ) -> BiasFieldResult<Self> {
        check("raw rows", active.len(), raw.nrows())?;
        if let Some(&index) = active.iter().find(|&&i| i >= basis.voxel_count()) {
            return Err(BiasFieldError::DimensionMismatch {
                what: "active voxel index",
                expected: basis.voxel_count(),
                actual: index,
            });
        }
        Ok(Self { basis, active, raw })
    }

    /// Solves for the coefficients that best explain the residual between
    /// the raw intensities and the mixture.
    ///
    /// Contrast pairs are assembled in parallel and combined in a fixed
    /// order, so the result is deterministic.
    ///
    /// # Errors
    ///
    /// Fails on dimension mismatches, if a covariance is not invertible,
    /// if the normal equations are singular, or if the solution is not
    /// finite.
    pub fn estimate(
        &self,
        posteriors: &DMatrix<f64>,
        mixture: &GaussianMixture,
    ) -> BiasFieldResult<BiasField> {
        check("posterior rows", self.active.len(), posteriors.nrows())?;
        check("posterior columns", mixture.gaussian_count(), posteriors.ncols())?;
        check("contrasts", mixture.contrast_count(), self.raw.ncols())?;

        let contrasts = self.raw.ncols();
        let functions = self.basis.basis_count();
        let precisions = mixture.precisions()?;
        let means = mixture.means();

        let pairs: Vec<(usize, usize)> = (0..contrasts)
            .flat_map(|c1| (0..contrasts).map(move |c2| (c1, c2)))
            .collect();
        let blocks = pairs
            .par_iter()
            .map(|&(c1, c2)| {
                let mut weights = Vec::with_capacity(self.active.len());
                let mut contribution = Vec::with_capacity(self.active.len());
                for (row, posterior) in posteriors.row_iter().enumerate() {
                    let mut weight = 0.0;
                    let mut weighted_mean = 0.0;
                    for (g, p) in posterior.iter().enumerate() {
                        let w = p * precisions[g][(c1, c2)];
                        weight += w;
                        weighted_mean += w * means[(g, c2)];
                    }
                    let predicted = weighted_mean / (weight + EPS);
                    let residue = self.raw[(row, c2)] - predicted;
                    weights.push(weight);
                    contribution.push(weight * residue);
                }
                let block = self.basis.precision(&self.scatter(&weights))?;
                Ok((block, contribution))
            })
            .collect::<BiasFieldResult<Vec<_>>>()?;

        let size = functions * contrasts;
        let mut lhs = DMatrix::zeros(size, size);
        let mut rhs = DVector::zeros(size);
        for ((c1, c2), (block, contribution)) in pairs.iter().zip(blocks) {
            lhs.view_mut((c1 * functions, c2 * functions), (functions, functions))
                .copy_from(&block);
            let projected = self.basis.project(&self.scatter(&contribution))?;
            let mut target = rhs.rows_mut(c1 * functions, functions);
            target += projected;
        }

        let solution = lhs
            .lu()
            .solve(&rhs)
            .ok_or(BiasFieldError::SingularSystem { size })?;
        if solution.iter().any(|x| !x.is_finite()) {
            return Err(BiasFieldError::NonFiniteSolution);
        }
        debug!(
            functions,
            contrasts,
            norm = solution.norm(),
            "bias field updated"
        );
        Ok(BiasField::from_coefficients(DMatrix::from_column_slice(
            functions,
            contrasts,
            solution.as_slice(),
        )))
    }

    /// Writes `raw - field` for every active voxel into `data`.
    ///
    /// # Errors
    ///
    /// Fails if `data` or `field` do not match the estimator's shape.
    pub fn apply(&self, field: &BiasField, data: &mut DMatrix<f64>) -> BiasFieldResult<()> {
        check("data rows", self.raw.nrows(), data.nrows())?;
        check("data columns", self.raw.ncols(), data.ncols())?;
        check("field contrasts", self.raw.ncols(), field.contrast_count())?;
        for contrast in 0..self.raw.ncols() {
            let values = field.field(self.basis, contrast)?;
            for (row, &voxel) in self.active.iter().enumerate() {
                data[(row, contrast)] = self.raw[(row, contrast)] - values[voxel];
            }
        }
        Ok(())
    }

    /// Spreads per-active-voxel values over the full grid, zero elsewhere.
    fn scatter(&self, values: &[f64]) -> Vec<f64> {
        let mut full = vec![0.0; self.basis.voxel_count()];
        for (&voxel, &value) in self.active.iter().zip(values) {
            full[voxel] = value;
        }
        full
    }
}

/// EM refresh hook that re-fits the bias field after every M-step and
/// rewrites the corrected intensities.
#[derive(Debug)]
pub struct BiasFieldRefresh<'a> {
    estimator: BiasFieldEstimator<'a>,
    field: &'a mut BiasField,
}

impl<'a> BiasFieldRefresh<'a> {
    /// Refreshes `field` in place on every call.
    #[must_use]
    pub fn new(estimator: BiasFieldEstimator<'a>, field: &'a mut BiasField) -> Self {
        Self { estimator, field }
    }
}

impl DataRefresh for BiasFieldRefresh<'_> {
    type Error = BiasFieldError;

    fn refresh(
        &mut self,
        posteriors: &DMatrix<f64>,
        mixture: &GaussianMixture,
        data: &mut DMatrix<f64>,
    ) -> Result<(), Self::Error> {
        let updated = self.estimator.estimate(posteriors, mixture)?;
        self.estimator.apply(&updated, data)?;
        *self.field = updated;
        Ok(())
    }
}

fn check(what: &'static str, expected: usize, actual: usize) -> BiasFieldResult<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(BiasFieldError::DimensionMismatch {
            what,
            expected,
            actual,
        })
    }
}
