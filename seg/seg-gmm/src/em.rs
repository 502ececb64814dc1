//! The expectation-maximization loop.

// Voxel counts fit in f64
#![allow(clippy::cast_precision_loss)]

use nalgebra::DMatrix;
use tracing::{debug, warn};

use seg_types::EPS;

use crate::error::MixtureError;
use crate::estep::{EStep, e_step};
use crate::mixture::GaussianMixture;
use crate::mstep::m_step;
use crate::wishart::WishartPrior;

/// Settings of one EM run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmSettings {
    /// Iteration cap (default: 100).
    pub max_iterations: usize,
    /// Stop once the cost decreases by less than this per voxel
    /// (default: 1e-4).
    pub cost_decrease_threshold: f64,
    /// Force diagonal covariances in the M-step (default: false).
    pub diagonal_covariances: bool,
}

impl Default for EmSettings {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            cost_decrease_threshold: 1e-4,
            diagonal_covariances: false,
        }
    }
}

impl EmSettings {
    /// Default settings with the given per-voxel threshold.
    #[must_use]
    pub fn with_threshold(cost_decrease_threshold: f64) -> Self {
        Self {
            cost_decrease_threshold,
            ..Self::default()
        }
    }

    /// Sets the diagonal-covariance flag.
    #[must_use]
    pub const fn with_diagonal_covariances(mut self, diagonal: bool) -> Self {
        self.diagonal_covariances = diagonal;
        self
    }
}

/// Hook run after every M-step to refresh the data the next E-step sees.
///
/// The bias field estimator implements this to re-fit the bias field and
/// rewrite the bias-corrected intensities in place.
pub trait DataRefresh {
    /// Error type of the refresh; must absorb mixture errors.
    type Error: From<MixtureError>;

    /// Updates `data` given the latest posteriors and parameters.
    ///
    /// # Errors
    ///
    /// Implementation specific.
    fn refresh(
        &mut self,
        posteriors: &DMatrix<f64>,
        mixture: &GaussianMixture,
        data: &mut DMatrix<f64>,
    ) -> Result<(), Self::Error>;
}

/// A refresh that leaves the data unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRefresh;

impl DataRefresh for NoRefresh {
    type Error = MixtureError;

    fn refresh(
        &mut self,
        _posteriors: &DMatrix<f64>,
        _mixture: &GaussianMixture,
        _data: &mut DMatrix<f64>,
    ) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Result of an EM run.
#[derive(Debug, Clone, PartialEq)]
pub struct EmOutcome {
    /// Number of E-steps performed.
    pub iterations: usize,
    /// Whether the per-voxel threshold fired before the cap.
    pub converged: bool,
    /// Posteriors of the last E-step.
    pub posteriors: DMatrix<f64>,
    /// Negative log-likelihood of the last E-step.
    pub min_log_likelihood: f64,
    /// Wishart penalty of the parameters evaluated by the last E-step.
    pub parameter_cost: f64,
    /// Total cost of every E-step, in order.
    pub cost_history: Vec<f64>,
}

impl EmOutcome {
    /// Final total cost.
    #[must_use]
    pub fn cost(&self) -> f64 {
        self.min_log_likelihood + self.parameter_cost
    }
}

/// Runs EM until the per-voxel cost decrease drops below the threshold or
/// the iteration cap is reached.
///
/// Each iteration performs an E-step, evaluates
/// `cost = -log-likelihood + Wishart penalty`, checks convergence against
/// the previous cost (starting from `1/EPS`), then runs the M-step followed
/// by `refresh`. Reaching the cap is not an error: the outcome reports
/// `converged = false`.
///
/// # Errors
///
/// Fails if `data` has no rows, on dimension mismatches, on a covariance
/// that is not positive definite, or when `refresh` fails.
///
/// # Example
///
/// ```
/// use nalgebra::DMatrix;
/// use seg_gmm::{ComponentLayout, EmSettings, GaussianMixture, NoRefresh, WishartPrior, run_em};
///
/// let mut data = DMatrix::from_fn(40, 1, |r, _| if r < 20 { r as f64 * 0.1 } else { 50.0 + r as f64 * 0.1 });
/// let priors = DMatrix::from_fn(40, 2, |r, c| if (r < 20) == (c == 0) { 0.9 } else { 0.1 });
/// let mut mixture =
///     GaussianMixture::initialize(&data, &priors, ComponentLayout::new(vec![1, 1]), false).unwrap();
/// let prior = WishartPrior::from_data(&data);
///
/// let outcome = run_em(&mut data, &priors, &mut mixture, &prior, &EmSettings::default(), &mut NoRefresh)
///     .unwrap();
/// assert!(outcome.converged);
/// assert!(mixture.means()[(0, 0)] < 5.0);
/// assert!(mixture.means()[(1, 0)] > 50.0);
/// ```
pub fn run_em<R: DataRefresh>(
    data: &mut DMatrix<f64>,
    priors: &DMatrix<f64>,
    mixture: &mut GaussianMixture,
    prior: &WishartPrior,
    settings: &EmSettings,
    refresh: &mut R,
) -> Result<EmOutcome, R::Error> {
    let voxels = data.nrows();
    if voxels == 0 {
        return Err(MixtureError::NoActiveVoxels.into());
    }

    let mut previous = 1.0 / EPS;
    let mut cost_history = Vec::new();
    let mut last: Option<(EStep, f64)> = None;
    let mut converged = false;

    for iteration in 0..settings.max_iterations {
        let estep = e_step(data, priors, mixture)?;
        let parameter_cost = prior.parameter_cost(mixture)?;
        let cost = estep.min_log_likelihood + parameter_cost;
        cost_history.push(cost);
        let decrease_per_voxel = (previous - cost) / voxels as f64;
        previous = cost;
        debug!(
            iteration,
            cost,
            min_log_likelihood = estep.min_log_likelihood,
            parameter_cost,
            "EM iteration"
        );

        if decrease_per_voxel < settings.cost_decrease_threshold {
            converged = true;
            last = Some((estep, parameter_cost));
            break;
        }

        m_step(data, &estep.posteriors, mixture, prior, settings.diagonal_covariances)?;
        refresh.refresh(&estep.posteriors, mixture, data)?;
        last = Some((estep, parameter_cost));
    }

    let iterations = cost_history.len();
    let Some((estep, parameter_cost)) = last else {
        // a zero iteration cap still yields the posteriors of the current parameters
        let estep = e_step(data, priors, mixture)?;
        let parameter_cost = prior.parameter_cost(mixture)?;
        return Ok(EmOutcome {
            iterations: 0,
            converged: false,
            posteriors: estep.posteriors,
            min_log_likelihood: estep.min_log_likelihood,
            parameter_cost,
            cost_history,
        });
    };

    if converged {
        debug!(iterations, cost = previous, "EM converged");
    } else {
        warn!(
            iterations,
            cost = previous,
            "EM reached its iteration cap before converging"
        );
    }

    Ok(EmOutcome {
        iterations,
        converged,
        posteriors: estep.posteriors,
        min_log_likelihood: estep.min_log_likelihood,
        parameter_cost,
        cost_history,
    })
}
