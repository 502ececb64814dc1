//! Conjugate prior on component covariances.

// Voxel counts fit in f64
#![allow(clippy::cast_precision_loss)]

use nalgebra::DMatrix;

use crate::error::{MixtureError, MixtureResult};
use crate::mixture::GaussianMixture;

/// Unnormalized Wishart prior on component precisions.
///
/// The prior has scale matrix `(ν·ψ·I)⁻¹` and `ν + D + 1` degrees of
/// freedom, so its mode in the absence of data is the covariance `ψ·I`.
/// Its negative log density contributes
/// `ν/2 · ψ · tr(Σ⁻¹) + ν/2 · log det Σ` per component.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WishartPrior {
    /// Pseudo-variance `ψ`.
    pub pseudo_variance: f64,
    /// Number of pseudo-measurements `ν`.
    pub pseudo_count: f64,
}

impl WishartPrior {
    /// A prior with one pseudo-measurement whose pseudo-variance is the
    /// variance of all entries of `data` (every voxel and contrast pooled).
    #[must_use]
    pub fn from_data(data: &DMatrix<f64>) -> Self {
        let pseudo_count = 1.0;
        Self {
            pseudo_variance: pooled_variance(data) / pseudo_count,
            pseudo_count,
        }
    }

    /// Negative log prior of one covariance.
    ///
    /// # Errors
    ///
    /// Returns [`MixtureError::NotPositiveDefinite`] (tagged with
    /// `component`) if the covariance has no Cholesky factor.
    pub fn penalty(&self, component: usize, covariance: &DMatrix<f64>) -> MixtureResult<f64> {
        let chol = covariance
            .clone()
            .cholesky()
            .ok_or(MixtureError::NotPositiveDefinite { component })?;
        let log_det: f64 = chol.l_dirty().diagonal().iter().map(|d| 2.0 * d.ln()).sum();
        let trace = chol.inverse().trace();
        let half = self.pseudo_count / 2.0;
        Ok(half * self.pseudo_variance * trace + half * log_det)
    }

    /// Sum of [`WishartPrior::penalty`] over every component.
    ///
    /// # Errors
    ///
    /// Fails if a covariance is not positive definite.
    pub fn parameter_cost(&self, mixture: &GaussianMixture) -> MixtureResult<f64> {
        mixture
            .covariances()
            .iter()
            .enumerate()
            .map(|(component, covariance)| self.penalty(component, covariance))
            .sum()
    }
}

/// Population variance of every entry of `data`; zero when empty.
#[must_use]
pub fn pooled_variance(data: &DMatrix<f64>) -> f64 {
    let n = data.len();
    if n == 0 {
        return 0.0;
    }
    let mean = data.sum() / n as f64;
    data.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64
}
