//! Configuration records for a segmentation run.
//!
//! Every record is immutable once a run starts and exposes a `validate`
//! method that the controller calls before any numerical work.

use std::path::{Path, PathBuf};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{ConfigError, ConfigResult};

/// A tissue class of the mixture model.
///
/// A class groups one or more atlas labels whose priors are summed, and is
/// modelled by `gaussian_count` Gaussian components that share the class
/// prior.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ClassSpec {
    /// Human-readable class name.
    pub name: String,
    /// Atlas label names merged into this class.
    pub label_names: Vec<String>,
    /// Number of Gaussian components modelling this class.
    pub gaussian_count: usize,
}

impl ClassSpec {
    /// Creates a class from its name, member labels and component count.
    #[must_use]
    pub fn new<S: Into<String>>(
        name: impl Into<String>,
        label_names: impl IntoIterator<Item = S>,
        gaussian_count: usize,
    ) -> Self {
        Self {
            name: name.into(),
            label_names: label_names.into_iter().map(Into::into).collect(),
            gaussian_count,
        }
    }
}

/// Structure of the intensity and deformation model.
///
/// # Example
///
/// ```
/// use seg_types::{ClassSpec, ModelSpecification};
///
/// let model = ModelSpecification::new(vec![
///     ClassSpec::new("background", ["Unknown"], 1),
///     ClassSpec::new("tissue", ["White", "Gray"], 2),
/// ]);
/// assert_eq!(model.class_count(), 2);
/// assert_eq!(model.gaussians_per_class(), vec![1, 2]);
/// assert_eq!(model.gaussian_count(), 3);
/// assert!(model.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ModelSpecification {
    /// Classes in mixture order.
    pub classes: Vec<ClassSpec>,
    /// Force every covariance matrix to be diagonal (default: false).
    #[cfg_attr(feature = "serde", serde(default))]
    pub diagonal_covariances: bool,
    /// Atlas mesh stiffness K (default: 0.1).
    #[cfg_attr(feature = "serde", serde(default = "default_stiffness"))]
    pub stiffness: f64,
}

const fn default_stiffness() -> f64 {
    0.1
}

impl ModelSpecification {
    /// Creates a model with full covariances and the default stiffness.
    #[must_use]
    pub fn new(classes: Vec<ClassSpec>) -> Self {
        Self {
            classes,
            diagonal_covariances: false,
            stiffness: default_stiffness(),
        }
    }

    /// Sets the diagonal-covariance flag.
    #[must_use]
    pub const fn with_diagonal_covariances(mut self, diagonal: bool) -> Self {
        self.diagonal_covariances = diagonal;
        self
    }

    /// Sets the mesh stiffness K.
    #[must_use]
    pub const fn with_stiffness(mut self, stiffness: f64) -> Self {
        self.stiffness = stiffness;
        self
    }

    /// Number of classes.
    #[must_use]
    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// Number of Gaussian components of each class, in class order.
    #[must_use]
    pub fn gaussians_per_class(&self) -> Vec<usize> {
        self.classes.iter().map(|c| c.gaussian_count).collect()
    }

    /// Total number of Gaussian components.
    #[must_use]
    pub fn gaussian_count(&self) -> usize {
        self.classes.iter().map(|c| c.gaussian_count).sum()
    }

    /// Checks the model for structural errors.
    ///
    /// # Errors
    ///
    /// Fails if there are no classes, a class has no components or labels,
    /// or the stiffness is not strictly positive and finite.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.classes.is_empty() {
            return Err(ConfigError::invalid("model needs at least one class"));
        }
        for class in &self.classes {
            if class.gaussian_count == 0 {
                return Err(ConfigError::invalid(format!(
                    "class '{}' needs at least one Gaussian component",
                    class.name
                )));
            }
            if class.label_names.is_empty() {
                return Err(ConfigError::invalid(format!(
                    "class '{}' does not map any atlas label",
                    class.name
                )));
            }
        }
        if !(self.stiffness.is_finite() && self.stiffness > 0.0) {
            return Err(ConfigError::invalid(format!(
                "stiffness must be positive, got {}",
                self.stiffness
            )));
        }
        Ok(())
    }

    /// Parses and validates a model from JSON.
    ///
    /// # Errors
    ///
    /// Fails on malformed JSON or an invalid model.
    #[cfg(feature = "serde")]
    pub fn from_json_str(json: &str) -> ConfigResult<Self> {
        let model: Self = serde_json::from_str(json)?;
        model.validate()?;
        Ok(model)
    }
}

/// One level of the coarse-to-fine schedule.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MultiResolutionLevelSpec {
    /// Target voxel spacing in millimetres after downsampling.
    pub target_spacing: f64,
    /// Atlas mesh collection used at this level.
    pub atlas_path: PathBuf,
    /// Cap on outer EM + deformation iterations (default: 100).
    #[cfg_attr(feature = "serde", serde(default = "default_level_iterations"))]
    pub max_iterations: usize,
    /// Whether the bias field is re-estimated at this level (default: true).
    #[cfg_attr(feature = "serde", serde(default = "default_true"))]
    pub estimate_bias_field: bool,
}

const fn default_level_iterations() -> usize {
    100
}

const fn default_true() -> bool {
    true
}

impl MultiResolutionLevelSpec {
    /// Creates a level with the default iteration cap and bias estimation on.
    #[must_use]
    pub fn new(atlas_path: impl AsRef<Path>, target_spacing: f64) -> Self {
        Self {
            target_spacing,
            atlas_path: atlas_path.as_ref().to_path_buf(),
            max_iterations: default_level_iterations(),
            estimate_bias_field: true,
        }
    }

    /// Sets the outer iteration cap.
    #[must_use]
    pub const fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Enables or disables bias field estimation.
    #[must_use]
    pub const fn with_bias_field(mut self, enabled: bool) -> Self {
        self.estimate_bias_field = enabled;
        self
    }
}

/// Parameters handed to the mesh optimizer.
///
/// Defaults: `verbose = false`, `max_deformation_stop = 0.001`,
/// `line_search_interval_stop = 0.001`, `max_iterations = 20`,
/// `memory_length = 12`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct OptimizerParams {
    /// Emit per-step diagnostics from the optimizer itself.
    pub verbose: bool,
    /// Stop once a step moves no node further than this (voxels).
    pub max_deformation_stop: f64,
    /// Stop once the line-search bracket, measured as maximal node
    /// displacement, is narrower than this (voxels).
    pub line_search_interval_stop: f64,
    /// Cap on optimizer iterations per deformation pass.
    pub max_iterations: usize,
    /// Number of correction pairs kept by the quasi-Newton update.
    pub memory_length: usize,
}

impl Default for OptimizerParams {
    fn default() -> Self {
        Self {
            verbose: false,
            max_deformation_stop: 0.001,
            line_search_interval_stop: 0.001,
            max_iterations: 20,
            memory_length: 12,
        }
    }
}

impl OptimizerParams {
    /// Checks the parameters.
    ///
    /// # Errors
    ///
    /// Fails if a threshold is negative or not finite, or the memory length is zero.
    pub fn validate(&self) -> ConfigResult<()> {
        for (name, value) in [
            ("max_deformation_stop", self.max_deformation_stop),
            ("line_search_interval_stop", self.line_search_interval_stop),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(ConfigError::invalid(format!(
                    "{name} must be non-negative, got {value}"
                )));
            }
        }
        if self.memory_length == 0 {
            return Err(ConfigError::invalid("memory_length must be at least 1"));
        }
        Ok(())
    }
}

/// Options driving the multi-resolution optimization.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OptimizationOptions {
    /// Resolution levels, coarse to fine.
    pub levels: Vec<MultiResolutionLevelSpec>,
    /// Minimum acceptable cost decrease per active voxel (default: 1e-4).
    #[cfg_attr(feature = "serde", serde(default = "default_cost_threshold"))]
    pub cost_decrease_threshold: f64,
    /// Mesh optimizer parameters.
    #[cfg_attr(feature = "serde", serde(default))]
    pub optimizer: OptimizerParams,
}

const fn default_cost_threshold() -> f64 {
    1e-4
}

impl OptimizationOptions {
    /// Creates options for the given schedule with default thresholds.
    #[must_use]
    pub fn new(levels: Vec<MultiResolutionLevelSpec>) -> Self {
        Self {
            levels,
            cost_decrease_threshold: default_cost_threshold(),
            optimizer: OptimizerParams::default(),
        }
    }

    /// Sets the per-voxel cost decrease threshold.
    #[must_use]
    pub const fn with_cost_decrease_threshold(mut self, threshold: f64) -> Self {
        self.cost_decrease_threshold = threshold;
        self
    }

    /// Sets the optimizer parameters.
    #[must_use]
    pub const fn with_optimizer(mut self, optimizer: OptimizerParams) -> Self {
        self.optimizer = optimizer;
        self
    }

    /// Checks the schedule and thresholds.
    ///
    /// # Errors
    ///
    /// Fails if the schedule is empty, a target spacing is not positive, the
    /// threshold is not finite, or the optimizer parameters are invalid.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.levels.is_empty() {
            return Err(ConfigError::invalid(
                "at least one resolution level is required",
            ));
        }
        for (index, level) in self.levels.iter().enumerate() {
            if !(level.target_spacing.is_finite() && level.target_spacing > 0.0) {
                return Err(ConfigError::invalid(format!(
                    "level {index}: target spacing must be positive, got {}",
                    level.target_spacing
                )));
            }
        }
        if !self.cost_decrease_threshold.is_finite() {
            return Err(ConfigError::invalid(
                "cost decrease threshold must be finite",
            ));
        }
        self.optimizer.validate()
    }

    /// Parses and validates options from JSON.
    ///
    /// # Errors
    ///
    /// Fails on malformed JSON or invalid options.
    #[cfg(feature = "serde")]
    pub fn from_json_str(json: &str) -> ConfigResult<Self> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }
}
