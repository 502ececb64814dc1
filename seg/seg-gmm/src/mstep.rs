//! Maximization step: posterior-weighted parameter updates.

// Voxel counts fit in f64
#![allow(clippy::cast_precision_loss)]

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use seg_types::EPS;

use crate::error::MixtureResult;
use crate::mixture::{GaussianMixture, check};
use crate::wishart::WishartPrior;

/// Re-estimates means, covariances and weights from `posteriors`.
///
/// - mean: posterior-weighted mean of `data` (kept unchanged when the
///   component has no posterior mass)
/// - covariance: `(S + ν·ψ·I) / (N + ν)` with `S` the weighted scatter and
///   `N` the posterior mass, made diagonal when `diagonal` is set
/// - weight: `Σ_v (posterior + EPS)`, renormalized within each class
///
/// Components are updated in parallel.
///
/// # Errors
///
/// Fails on dimension mismatches.
pub fn m_step(
    data: &DMatrix<f64>,
    posteriors: &DMatrix<f64>,
    mixture: &mut GaussianMixture,
    prior: &WishartPrior,
    diagonal: bool,
) -> MixtureResult<()> {
    check("posterior rows", data.nrows(), posteriors.nrows())?;
    check("posterior columns", mixture.gaussian_count(), posteriors.ncols())?;
    check("data columns", mixture.contrast_count(), data.ncols())?;

    let contrasts = data.ncols();
    let shrinkage = DMatrix::<f64>::identity(contrasts, contrasts) * (prior.pseudo_count * prior.pseudo_variance);
    let current: &GaussianMixture = mixture;
    let updates: Vec<(DVector<f64>, DMatrix<f64>)> = (0..current.gaussian_count())
        .into_par_iter()
        .map(|g| {
            let posterior = posteriors.column(g);
            let mass = posterior.sum();
            let mean = if mass > EPS {
                data.transpose() * posterior / mass
            } else {
                current.mean(g)
            };

            let mut centered = data.clone();
            for mut row in centered.row_iter_mut() {
                row -= mean.transpose();
            }
            let weighted = DMatrix::from_fn(data.nrows(), contrasts, |r, c| {
                centered[(r, c)] * posterior[r]
            });
            let scatter = centered.transpose() * weighted;
            let mut covariance = (scatter + &shrinkage) / (mass + prior.pseudo_count);
            if diagonal {
                covariance = DMatrix::from_diagonal(&covariance.diagonal());
            }
            (mean, covariance)
        })
        .collect();

    for (g, (mean, covariance)) in updates.into_iter().enumerate() {
        mixture.means.row_mut(g).copy_from(&mean.transpose());
        mixture.covariances[g] = covariance;
    }

    let voxels = posteriors.nrows() as f64;
    let mut weights = DVector::from_fn(posteriors.ncols(), |g, _| {
        posteriors.column(g).sum() + voxels * EPS
    });
    let layout = mixture.layout().clone();
    for class in 0..layout.class_count() {
        let components = layout.components(class);
        let total: f64 = components.clone().map(|g| weights[g]).sum();
        for g in components {
            weights[g] /= total;
        }
    }
    mixture.weights = weights;
    Ok(())
}
