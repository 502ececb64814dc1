//! Mixture parameters, their layout over classes and their initialization.

// Component counts are small integers
#![allow(clippy::cast_precision_loss)]

use std::ops::Range;

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use seg_types::ModelSpecification;

use crate::error::{MixtureError, MixtureResult};

/// How Gaussian components are grouped into classes.
///
/// Components are numbered class by class: the components of class `c`
/// occupy a contiguous [`Range`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentLayout {
    gaussians_per_class: Vec<usize>,
    offsets: Vec<usize>,
}

impl ComponentLayout {
    /// Builds a layout from the number of components of each class.
    #[must_use]
    pub fn new(gaussians_per_class: Vec<usize>) -> Self {
        let offsets = gaussians_per_class
            .iter()
            .scan(0, |offset, &count| {
                let start = *offset;
                *offset += count;
                Some(start)
            })
            .collect();
        Self {
            gaussians_per_class,
            offsets,
        }
    }

    /// Layout of a model specification.
    #[must_use]
    pub fn from_model(model: &ModelSpecification) -> Self {
        Self::new(model.gaussians_per_class())
    }

    /// Number of classes.
    #[must_use]
    pub fn class_count(&self) -> usize {
        self.gaussians_per_class.len()
    }

    /// Total number of components.
    #[must_use]
    pub fn gaussian_count(&self) -> usize {
        self.gaussians_per_class.iter().sum()
    }

    /// Number of components of each class.
    #[must_use]
    pub fn gaussians_per_class(&self) -> &[usize] {
        &self.gaussians_per_class
    }

    /// Component indices of `class`.
    #[must_use]
    pub fn components(&self, class: usize) -> Range<usize> {
        let start = self.offsets[class];
        start..start + self.gaussians_per_class[class]
    }

    /// Class owning component `gaussian`.
    #[must_use]
    pub fn class_of(&self, gaussian: usize) -> usize {
        self.offsets
            .iter()
            .rposition(|&offset| offset <= gaussian)
            .unwrap_or(0)
    }
}

/// Parameters of a class-structured Gaussian mixture.
///
/// Invariants maintained by the estimator: weights of the components of
/// each class sum to one, and every covariance is symmetric positive
/// definite.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianMixture {
    layout: ComponentLayout,
    /// Component means, one row per component.
    pub(crate) means: DMatrix<f64>,
    /// Component covariances.
    pub(crate) covariances: Vec<DMatrix<f64>>,
    /// Component weights.
    pub(crate) weights: DVector<f64>,
}

impl GaussianMixture {
    /// Assembles a mixture from explicit parameters.
    ///
    /// # Errors
    ///
    /// Fails if the parameter arrays disagree with the layout or with each
    /// other on the number of contrasts.
    pub fn from_parameters(
        layout: ComponentLayout,
        means: DMatrix<f64>,
        covariances: Vec<DMatrix<f64>>,
        weights: DVector<f64>,
    ) -> MixtureResult<Self> {
        let gaussians = layout.gaussian_count();
        check("component means", gaussians, means.nrows())?;
        check("component covariances", gaussians, covariances.len())?;
        check("component weights", gaussians, weights.len())?;
        let contrasts = means.ncols();
        for covariance in &covariances {
            check("covariance rows", contrasts, covariance.nrows())?;
            check("covariance columns", contrasts, covariance.ncols())?;
        }
        Ok(Self {
            layout,
            means,
            covariances,
            weights,
        })
    }

    /// Moment-matched initialization from prior-weighted data.
    ///
    /// Each class's prior-weighted mean and covariance are computed over the
    /// rows of `data`; the `n` components of the class then share that
    /// covariance, get weight `1/n`, and have their means at the centres of
    /// `n` equal sub-intervals of `mean ± sd` (per contrast).
    ///
    /// # Errors
    ///
    /// Fails on dimension mismatches or if a class has zero prior mass.
    pub fn initialize(
        data: &DMatrix<f64>,
        priors: &DMatrix<f64>,
        layout: ComponentLayout,
        diagonal: bool,
    ) -> MixtureResult<Self> {
        check("prior rows", data.nrows(), priors.nrows())?;
        check("prior columns", layout.class_count(), priors.ncols())?;
        let contrasts = data.ncols();
        let gaussians = layout.gaussian_count();

        let mut means = DMatrix::zeros(gaussians, contrasts);
        let mut covariances = Vec::with_capacity(gaussians);
        let mut weights = DVector::zeros(gaussians);

        for class in 0..layout.class_count() {
            let prior = priors.column(class);
            let mass = prior.sum();
            if mass.is_nan() || mass <= 0.0 {
                return Err(MixtureError::EmptyClassPrior { class });
            }
            let mean = data.transpose() * prior / mass;
            let mut centered = data.clone();
            for mut row in centered.row_iter_mut() {
                row -= mean.transpose();
            }
            let weighted = DMatrix::from_fn(data.nrows(), contrasts, |r, c| {
                centered[(r, c)] * prior[r]
            });
            let mut covariance = centered.transpose() * weighted / mass;
            if diagonal {
                covariance = DMatrix::from_diagonal(&covariance.diagonal());
            }

            let components = layout.components(class);
            let n = components.len() as f64;
            let sd = covariance.diagonal().map(f64::sqrt);
            let interval = &sd * (2.0 / n);
            for (k, gaussian) in components.enumerate() {
                let centre = &mean - &sd + &interval * (0.5 + k as f64);
                means.row_mut(gaussian).copy_from(&centre.transpose());
                covariances.push(covariance.clone());
                weights[gaussian] = 1.0 / n;
            }
        }
        debug!(
            classes = layout.class_count(),
            gaussians, contrasts, "initialized mixture from class priors"
        );

        Ok(Self {
            layout,
            means,
            covariances,
            weights,
        })
    }

    /// Component layout.
    #[must_use]
    pub const fn layout(&self) -> &ComponentLayout {
        &self.layout
    }

    /// Number of contrasts.
    #[must_use]
    pub fn contrast_count(&self) -> usize {
        self.means.ncols()
    }

    /// Number of components.
    #[must_use]
    pub fn gaussian_count(&self) -> usize {
        self.means.nrows()
    }

    /// Component means, one row per component.
    #[must_use]
    pub const fn means(&self) -> &DMatrix<f64> {
        &self.means
    }

    /// Mean of component `gaussian`.
    #[must_use]
    pub fn mean(&self, gaussian: usize) -> DVector<f64> {
        self.means.row(gaussian).transpose()
    }

    /// Component covariances.
    #[must_use]
    pub fn covariances(&self) -> &[DMatrix<f64>] {
        &self.covariances
    }

    /// Component weights.
    #[must_use]
    pub const fn weights(&self) -> &DVector<f64> {
        &self.weights
    }

    /// Sum of the weights of each class's components.
    #[must_use]
    pub fn class_weight_sums(&self) -> Vec<f64> {
        (0..self.layout.class_count())
            .map(|class| self.layout.components(class).map(|g| self.weights[g]).sum())
            .collect()
    }

    /// Precision (inverse covariance) of every component.
    ///
    /// # Errors
    ///
    /// Fails if a covariance is not positive definite.
    pub fn precisions(&self) -> MixtureResult<Vec<DMatrix<f64>>> {
        self.covariances
            .iter()
            .enumerate()
            .map(|(component, covariance)| {
                covariance
                    .clone()
                    .cholesky()
                    .map(|chol| chol.inverse())
                    .ok_or(MixtureError::NotPositiveDefinite { component })
            })
            .collect()
    }
}

/// Whether the mixture has been initialized yet.
///
/// The mixture is moment-matched to the class priors exactly once, the
/// first time it is needed; afterwards every level warm-starts from the
/// previous estimate.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum MixtureState {
    /// No parameters yet.
    #[default]
    Uninitialized,
    /// Parameters estimated so far.
    Initialized(GaussianMixture),
}

impl MixtureState {
    /// Whether parameters exist.
    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        matches!(self, Self::Initialized(_))
    }

    /// The current parameters, if any.
    #[must_use]
    pub const fn mixture(&self) -> Option<&GaussianMixture> {
        match self {
            Self::Uninitialized => None,
            Self::Initialized(mixture) => Some(mixture),
        }
    }

    /// Consumes the state, returning the parameters if any.
    #[must_use]
    pub fn into_mixture(self) -> Option<GaussianMixture> {
        match self {
            Self::Uninitialized => None,
            Self::Initialized(mixture) => Some(mixture),
        }
    }

    /// Initializes from `data` and `priors` when uninitialized and returns
    /// the current parameters.
    ///
    /// # Errors
    ///
    /// Propagates [`GaussianMixture::initialize`] failures.
    pub fn ensure_initialized(
        &mut self,
        data: &DMatrix<f64>,
        priors: &DMatrix<f64>,
        layout: &ComponentLayout,
        diagonal: bool,
    ) -> MixtureResult<&mut GaussianMixture> {
        if matches!(self, Self::Uninitialized) {
            let mixture = GaussianMixture::initialize(data, priors, layout.clone(), diagonal)?;
            *self = Self::Initialized(mixture);
        }
        match self {
            Self::Initialized(mixture) => Ok(mixture),
            Self::Uninitialized => Err(MixtureError::NoActiveVoxels),
        }
    }
}

pub(crate) const fn check(what: &'static str, expected: usize, actual: usize) -> MixtureResult<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(MixtureError::DimensionMismatch {
            what,
            expected,
            actual,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_layout_ranges() {
        let layout = ComponentLayout::new(vec![1, 3, 2]);
        assert_eq!(layout.gaussian_count(), 6);
        assert_eq!(layout.components(1), 1..4);
        assert_eq!(layout.components(2), 4..6);
        assert_eq!(layout.class_of(0), 0);
        assert_eq!(layout.class_of(3), 1);
        assert_eq!(layout.class_of(5), 2);
    }

    #[test]
    fn test_initialize_splits_class_into_intervals() {
        // one class, data 0..=10, uniform prior
        let data = DMatrix::from_fn(11, 1, |r, _| r as f64);
        let priors = DMatrix::from_element(11, 1, 1.0);
        let mixture =
            GaussianMixture::initialize(&data, &priors, ComponentLayout::new(vec![2]), false).unwrap();
        let variance = 10.0; // population variance of 0..=10
        let sd = f64::sqrt(variance);
        assert_relative_eq!(mixture.means()[(0, 0)], 5.0 - sd / 2.0, epsilon = 1e-12);
        assert_relative_eq!(mixture.means()[(1, 0)], 5.0 + sd / 2.0, epsilon = 1e-12);
        assert_relative_eq!(mixture.covariances()[1][(0, 0)], variance, epsilon = 1e-12);
        assert_relative_eq!(mixture.weights()[0], 0.5);
    }

    #[test]
    fn test_initialize_single_component_uses_class_mean() {
        let data = DMatrix::from_row_slice(4, 2, &[0.0, 1.0, 2.0, 1.0, 4.0, 5.0, 6.0, 5.0]);
        let priors = DMatrix::from_row_slice(4, 2, &[1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0]);
        let mixture =
            GaussianMixture::initialize(&data, &priors, ComponentLayout::new(vec![1, 1]), true).unwrap();
        assert_relative_eq!(mixture.mean(0), DVector::from_vec(vec![1.0, 1.0]), epsilon = 1e-12);
        assert_relative_eq!(mixture.mean(1), DVector::from_vec(vec![5.0, 5.0]), epsilon = 1e-12);
        assert_relative_eq!(mixture.covariances()[0][(0, 1)], 0.0);
        assert_eq!(mixture.class_weight_sums(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_initialize_rejects_empty_class() {
        let data = DMatrix::from_element(3, 1, 1.0);
        let priors = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 1.0, 0.0, 1.0, 0.0]);
        let result = GaussianMixture::initialize(&data, &priors, ComponentLayout::new(vec![1, 1]), false);
        assert!(matches!(result, Err(MixtureError::EmptyClassPrior { class: 1 })));
    }

    #[test]
    fn test_state_initializes_once() {
        let data = DMatrix::from_fn(6, 1, |r, _| r as f64);
        let priors = DMatrix::from_element(6, 1, 1.0);
        let layout = ComponentLayout::new(vec![1]);
        let mut state = MixtureState::default();
        assert!(!state.is_initialized());

        state.ensure_initialized(&data, &priors, &layout, false).unwrap().means[(0, 0)] = 42.0;
        assert!(state.is_initialized());

        let other = DMatrix::from_element(6, 1, -1.0);
        let mixture = state.ensure_initialized(&other, &priors, &layout, false).unwrap();
        assert_relative_eq!(mixture.means()[(0, 0)], 42.0);
    }

    #[test]
    fn test_from_parameters_checks_shapes() {
        let layout = ComponentLayout::new(vec![2]);
        let result = GaussianMixture::from_parameters(
            layout,
            DMatrix::zeros(2, 1),
            vec![DMatrix::identity(1, 1)],
            DVector::from_element(2, 0.5),
        );
        assert!(matches!(result, Err(MixtureError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_precisions_invert_covariances() {
        let layout = ComponentLayout::new(vec![1]);
        let covariance = DMatrix::from_row_slice(2, 2, &[2.0, 0.5, 0.5, 1.0]);
        let mixture = GaussianMixture::from_parameters(
            layout,
            DMatrix::zeros(1, 2),
            vec![covariance.clone()],
            DVector::from_element(1, 1.0),
        )
        .unwrap();
        let precision = &mixture.precisions().unwrap()[0];
        assert_relative_eq!(precision * covariance, DMatrix::identity(2, 2), epsilon = 1e-12);
    }
}
