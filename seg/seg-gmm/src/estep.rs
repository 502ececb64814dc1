//! Expectation step: posterior responsibilities of every component.

// Contrast counts are small integers
#![allow(clippy::cast_precision_loss)]

use std::f64::consts::PI;

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use seg_types::EPS;

use crate::error::{MixtureError, MixtureResult};
use crate::mixture::{GaussianMixture, check};

/// Output of one expectation step.
#[derive(Debug, Clone, PartialEq)]
pub struct EStep {
    /// Normalized responsibilities, one row per voxel and one column per
    /// component. Rows sum to one up to `EPS`.
    pub posteriors: DMatrix<f64>,
    /// `-Σ log(normalizer)` over the voxels.
    pub min_log_likelihood: f64,
}

/// A component's whitening transform `L⁻¹` and Gaussian normalizing
/// constant, where `L·Lᵀ` is its covariance.
struct Whitening {
    inverse_factor: DMatrix<f64>,
    normalizer: f64,
}

impl Whitening {
    fn new(component: usize, covariance: &DMatrix<f64>) -> MixtureResult<Self> {
        let dimension = covariance.nrows();
        let chol = covariance
            .clone()
            .cholesky()
            .ok_or(MixtureError::NotPositiveDefinite { component })?;
        let l = chol.l();
        let inverse_factor = l
            .solve_lower_triangular(&DMatrix::identity(dimension, dimension))
            .ok_or(MixtureError::NotPositiveDefinite { component })?;
        let sqrt_det: f64 = l.diagonal().iter().product();
        let normalizer = 1.0 / ((2.0 * PI).powf(dimension as f64 / 2.0) * sqrt_det);
        Ok(Self {
            inverse_factor,
            normalizer,
        })
    }

    fn likelihood(&self, centered: &DVector<f64>) -> f64 {
        let whitened = &self.inverse_factor * centered;
        (-0.5 * whitened.norm_squared()).exp() * self.normalizer
    }
}

/// Computes normalized posteriors and the negative log-likelihood.
///
/// For voxel `v` and component `g` of class `c` the unnormalized posterior
/// is `N(x_v; μ_g, Σ_g) · w_g · π_c(v)`. Each row is divided by its sum plus
/// `EPS`, and the negative log-likelihood is `-Σ_v log(sum_v + EPS)`.
///
/// Voxels are processed in parallel; the likelihood sum is reduced in voxel
/// order.
///
/// # Errors
///
/// Fails on dimension mismatches or if a covariance is not positive
/// definite.
pub fn e_step(
    data: &DMatrix<f64>,
    priors: &DMatrix<f64>,
    mixture: &GaussianMixture,
) -> MixtureResult<EStep> {
    check("prior rows", data.nrows(), priors.nrows())?;
    check("prior columns", mixture.layout().class_count(), priors.ncols())?;
    check("data columns", mixture.contrast_count(), data.ncols())?;

    let gaussians = mixture.gaussian_count();
    let whitenings = mixture
        .covariances()
        .iter()
        .enumerate()
        .map(|(component, covariance)| Whitening::new(component, covariance))
        .collect::<MixtureResult<Vec<_>>>()?;
    let means: Vec<DVector<f64>> = (0..gaussians).map(|g| mixture.mean(g)).collect();
    let classes: Vec<usize> = (0..gaussians).map(|g| mixture.layout().class_of(g)).collect();
    let weights = mixture.weights();

    let rows: Vec<(Vec<f64>, f64)> = (0..data.nrows())
        .into_par_iter()
        .map(|voxel| {
            let x = data.row(voxel).transpose();
            let mut row: Vec<f64> = (0..gaussians)
                .map(|g| {
                    whitenings[g].likelihood(&(&x - &means[g]))
                        * weights[g]
                        * priors[(voxel, classes[g])]
                })
                .collect();
            let normalizer = row.iter().sum::<f64>() + EPS;
            for value in &mut row {
                *value /= normalizer;
            }
            (row, normalizer)
        })
        .collect();

    let min_log_likelihood = -rows.iter().map(|(_, normalizer)| normalizer.ln()).sum::<f64>();
    let posteriors = DMatrix::from_fn(rows.len(), gaussians, |voxel, g| rows[voxel].0[g]);
    Ok(EStep {
        posteriors,
        min_log_likelihood,
    })
}

/// Per-class intensity likelihood `Σ_{g∈c} w_g·N(x_v; μ_g, Σ_g)` of every
/// voxel, without spatial priors. One row per voxel, one column per class.
///
/// # Errors
///
/// Fails on a contrast count mismatch or if a covariance is not positive
/// definite.
pub fn class_likelihoods(data: &DMatrix<f64>, mixture: &GaussianMixture) -> MixtureResult<DMatrix<f64>> {
    check("data columns", mixture.contrast_count(), data.ncols())?;
    let whitenings = mixture
        .covariances()
        .iter()
        .enumerate()
        .map(|(component, covariance)| Whitening::new(component, covariance))
        .collect::<MixtureResult<Vec<_>>>()?;
    let layout = mixture.layout();
    let means: Vec<DVector<f64>> = (0..mixture.gaussian_count()).map(|g| mixture.mean(g)).collect();
    let weights = mixture.weights();

    let rows: Vec<Vec<f64>> = (0..data.nrows())
        .into_par_iter()
        .map(|voxel| {
            let x = data.row(voxel).transpose();
            (0..layout.class_count())
                .map(|class| {
                    layout
                        .components(class)
                        .map(|g| whitenings[g].likelihood(&(&x - &means[g])) * weights[g])
                        .sum()
                })
                .collect()
        })
        .collect();
    Ok(DMatrix::from_fn(rows.len(), layout.class_count(), |voxel, class| {
        rows[voxel][class]
    }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::mixture::ComponentLayout;
    use approx::assert_relative_eq;

    fn two_class_mixture() -> GaussianMixture {
        GaussianMixture::from_parameters(
            ComponentLayout::new(vec![1, 2]),
            DMatrix::from_column_slice(3, 1, &[0.0, 10.0, 12.0]),
            vec![DMatrix::from_element(1, 1, 4.0); 3],
            DVector::from_vec(vec![1.0, 0.25, 0.75]),
        )
        .unwrap()
    }

    #[test]
    fn test_rows_sum_to_one() {
        let data = DMatrix::from_column_slice(5, 1, &[-1.0, 0.5, 6.0, 11.0, 30.0]);
        let priors = DMatrix::from_row_slice(
            5,
            2,
            &[0.9, 0.1, 0.5, 0.5, 0.2, 0.8, 0.0, 1.0, 0.5, 0.5],
        );
        let result = e_step(&data, &priors, &two_class_mixture()).unwrap();
        for row in result.posteriors.row_iter() {
            assert_relative_eq!(row.sum(), 1.0, epsilon = 1e-9);
        }
        assert!(result.min_log_likelihood.is_finite());
    }

    #[test]
    fn test_single_gaussian_likelihood() {
        let mixture = GaussianMixture::from_parameters(
            ComponentLayout::new(vec![1]),
            DMatrix::from_element(1, 1, 1.0),
            vec![DMatrix::from_element(1, 1, 4.0)],
            DVector::from_element(1, 1.0),
        )
        .unwrap();
        let data = DMatrix::from_element(1, 1, 3.0);
        let priors = DMatrix::from_element(1, 1, 1.0);
        let result = e_step(&data, &priors, &mixture).unwrap();
        let density = (-0.5_f64).exp() / (2.0 * (2.0 * PI).sqrt());
        assert_relative_eq!(result.min_log_likelihood, -(density + EPS).ln(), epsilon = 1e-12);
        assert_relative_eq!(result.posteriors[(0, 0)], density / (density + EPS), epsilon = 1e-12);
    }

    #[test]
    fn test_zero_prior_excludes_class() {
        let data = DMatrix::from_element(1, 1, 10.0);
        let priors = DMatrix::from_row_slice(1, 2, &[1.0, 0.0]);
        let result = e_step(&data, &priors, &two_class_mixture()).unwrap();
        assert_relative_eq!(result.posteriors[(0, 0)], 1.0, epsilon = 1e-9);
        assert_relative_eq!(result.posteriors[(0, 1)], 0.0);
    }

    #[test]
    fn test_multivariate_matches_closed_form() {
        let covariance = DMatrix::from_row_slice(2, 2, &[2.0, 0.6, 0.6, 1.0]);
        let mixture = GaussianMixture::from_parameters(
            ComponentLayout::new(vec![1]),
            DMatrix::from_row_slice(1, 2, &[1.0, -1.0]),
            vec![covariance.clone()],
            DVector::from_element(1, 1.0),
        )
        .unwrap();
        let data = DMatrix::from_row_slice(1, 2, &[2.0, 0.5]);
        let priors = DMatrix::from_element(1, 1, 1.0);
        let result = e_step(&data, &priors, &mixture).unwrap();

        let d = DVector::from_vec(vec![1.0, 1.5]);
        let inverse = covariance.clone().try_inverse().unwrap();
        let mahalanobis = (d.transpose() * inverse * &d)[(0, 0)];
        let density = (-0.5 * mahalanobis).exp() / (2.0 * PI * covariance.determinant().sqrt());
        assert_relative_eq!(result.min_log_likelihood, -(density + EPS).ln(), epsilon = 1e-10);
    }

    #[test]
    fn test_class_likelihoods_match_unit_prior_posteriors() {
        let data = DMatrix::from_column_slice(3, 1, &[0.5, 9.0, 12.5]);
        let mixture = two_class_mixture();
        let likelihoods = class_likelihoods(&data, &mixture).unwrap();
        let priors = DMatrix::from_element(3, 2, 1.0);
        let result = e_step(&data, &priors, &mixture).unwrap();
        for voxel in 0..3 {
            let total = likelihoods.row(voxel).sum();
            let class_one = result.posteriors[(voxel, 1)] + result.posteriors[(voxel, 2)];
            assert_relative_eq!(likelihoods[(voxel, 1)] / total, class_one, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_dimension_checks() {
        let data = DMatrix::from_element(2, 1, 0.0);
        let priors = DMatrix::from_element(3, 2, 0.5);
        assert!(matches!(
            e_step(&data, &priors, &two_class_mixture()),
            Err(MixtureError::DimensionMismatch { .. })
        ));
    }
}
