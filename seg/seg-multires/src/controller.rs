//! The multi-resolution segmentation loop.

// Voxel counts fit in f64
#![allow(clippy::cast_precision_loss)]

use nalgebra::{DMatrix, Point3, Vector3};
use tracing::{debug, info};

use seg_atlas::{AtlasMesh, MeshEngine, merge_alphas};
use seg_basis::KroneckerBasis;
use seg_bias::{BiasField, BiasFieldEstimator, BiasFieldRefresh};
use seg_deform::{
    BoundaryCondition, CostFunctionalFactory, CostFunctionalRequest, OptimizerFactory,
    drive_deformation,
};
use seg_gmm::{
    ComponentLayout, EmOutcome, EmSettings, GaussianMixture, MixtureState, NoRefresh,
    WishartPrior, run_em,
};
use seg_types::{
    AffineTransform, EPS, ModelSpecification, MultiResolutionLevelSpec, OptimizationOptions,
    VolumeState,
};

use crate::error::{SegmentationError, SegmentationResult};
use crate::level::{LevelGrid, downsampling_factors};
use crate::observer::{StageEvent, StageObserver};
use crate::report::{LevelReport, StopReason};

/// The external capabilities the segmenter drives.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    /// Atlas loading, transforming, rasterizing and warping.
    pub mesh_engine: &'a dyn MeshEngine,
    /// Builds the deformation objective.
    pub functional_factory: &'a dyn CostFunctionalFactory,
    /// Builds the mesh optimizer.
    pub optimizer_factory: &'a dyn OptimizerFactory,
}

impl<'a> Collaborators<'a> {
    /// Bundles the three collaborators.
    #[must_use]
    pub const fn new(
        mesh_engine: &'a dyn MeshEngine,
        functional_factory: &'a dyn CostFunctionalFactory,
        optimizer_factory: &'a dyn OptimizerFactory,
    ) -> Self {
        Self {
            mesh_engine,
            functional_factory,
            optimizer_factory,
        }
    }
}

impl std::fmt::Debug for Collaborators<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Everything a segmentation run consumes.
#[derive(Debug, Clone)]
pub struct SegmentationInput {
    /// Full-resolution images, mask, spacing and registration.
    pub volume: VolumeState,
    /// Bias field basis on the full-resolution grid.
    pub basis: KroneckerBasis,
    /// Starting bias coefficients (basis functions × contrasts).
    pub bias_coefficients: DMatrix<f64>,
    /// Class structure and deformation stiffness.
    pub model: ModelSpecification,
    /// Resolution schedule and thresholds.
    pub options: OptimizationOptions,
}

/// Result of a segmentation run.
#[derive(Debug, Clone)]
pub struct SegmentationOutput {
    /// Final mixture parameters.
    pub mixture: GaussianMixture,
    /// Final bias field.
    pub bias_field: BiasField,
    /// Template-space node deformation of the last level.
    pub deformation: Vec<Vector3<f64>>,
    /// Template-to-working-frame transform of the last level.
    pub transform: AffineTransform,
    /// Deformed mesh of the last level, in its working frame, with merged
    /// class alphas.
    pub mesh: AtlasMesh,
    /// One report per level.
    pub levels: Vec<LevelReport>,
}

/// Runs the coarse-to-fine EM, bias field and deformation schedule.
#[derive(Debug, Clone, Copy)]
pub struct MultiResolutionSegmenter<'a> {
    collaborators: Collaborators<'a>,
}

/// State handed from one level to the next.
struct Carry {
    /// The previous level's atlas, in template space.
    template_mesh: AtlasMesh,
    /// Its template-space node deformation.
    deformation: Vec<Vector3<f64>>,
}

/// Result of a single level.
struct LevelResult {
    report: LevelReport,
    carry: Carry,
    transform: AffineTransform,
    mesh: AtlasMesh,
}

impl<'a> MultiResolutionSegmenter<'a> {
    /// Creates a segmenter driving `collaborators`.
    #[must_use]
    pub const fn new(collaborators: Collaborators<'a>) -> Self {
        Self { collaborators }
    }

    /// Runs every level of `input.options` in order.
    ///
    /// # Errors
    ///
    /// Fails before any numerical work on invalid configuration or
    /// mismatched dimensions, and aborts on numerical singularities,
    /// degenerate optimizer steps or collaborator failures. Hitting an
    /// iteration cap is not an error.
    pub fn run(
        &self,
        input: SegmentationInput,
        observer: &mut dyn StageObserver,
    ) -> SegmentationResult<SegmentationOutput> {
        let SegmentationInput {
            volume,
            basis,
            bias_coefficients,
            model,
            options,
        } = input;
        model.validate()?;
        options.validate()?;
        check("bias basis functions", basis.basis_count(), bias_coefficients.nrows())?;
        check("bias contrasts", volume.contrast_count(), bias_coefficients.ncols())?;
        check("basis voxels", volume.mask().len(), basis.voxel_count())?;
        if basis.dims() != volume.dims() {
            return Err(seg_types::ConfigError::ShapeMismatch {
                expected: volume.dims(),
                actual: basis.dims(),
            }
            .into());
        }

        let layout = ComponentLayout::from_model(&model);
        let mut state = MixtureState::Uninitialized;
        let mut bias = BiasField::from_coefficients(bias_coefficients);
        let mut carry: Option<Carry> = None;
        let mut levels = Vec::with_capacity(options.levels.len());
        let mut last: Option<(AffineTransform, AtlasMesh, Vec<Vector3<f64>>)> = None;

        for (index, spec) in options.levels.iter().enumerate() {
            let context = LevelContext {
                index,
                spec,
                volume: &volume,
                basis: &basis,
                model: &model,
                options: &options,
                layout: &layout,
            };
            let result = self.run_level(&context, carry.take(), &mut state, &mut bias, observer)?;
            observer.on_stage(&StageEvent::LevelFinished {
                report: &result.report,
            });
            last = Some((result.transform, result.mesh, result.carry.deformation.clone()));
            levels.push(result.report);
            carry = Some(result.carry);
        }

        let mixture = state.into_mixture().ok_or(SegmentationError::NotEstimated)?;
        let (transform, mesh, deformation) = last.ok_or(SegmentationError::NotEstimated)?;
        Ok(SegmentationOutput {
            mixture,
            bias_field: bias,
            deformation,
            transform,
            mesh,
            levels,
        })
    }

    fn run_level(
        &self,
        context: &LevelContext<'_>,
        carry: Option<Carry>,
        state: &mut MixtureState,
        bias: &mut BiasField,
        observer: &mut dyn StageObserver,
    ) -> SegmentationResult<LevelResult> {
        let level = context.index;
        let engine = self.collaborators.mesh_engine;
        let factors = downsampling_factors(context.spec.target_spacing, context.volume.spacing());
        let grid = LevelGrid::new(context.volume, context.basis, factors);
        let active_voxels = grid.active.len();
        if active_voxels == 0 {
            return Err(SegmentationError::NoActiveVoxels { level });
        }
        info!(level, ?factors, active_voxels, "starting resolution level");
        observer.on_stage(&StageEvent::LevelStarted {
            level,
            factors,
            active_voxels,
        });

        // Mesh pose: atlas → downsampled voxel frame, plus the carried warp
        let total = AffineTransform::downsampling(factors).compose(context.volume.transform());
        let inverse = total.try_inverse()?;
        let mut collection = engine.load_collection(&context.spec.atlas_path)?;
        collection.set_stiffness(context.model.stiffness);
        let template_mesh = collection.reference().clone();
        engine.transform(&mut collection, &total);
        let stiffness = collection.stiffness();
        let mut mesh = collection.into_reference();
        let initial_template = inverse.transform_points(mesh.points());

        if let Some(carry) = carry {
            let warp = engine.warp_deformation(&carry.template_mesh, &carry.deformation, &template_mesh)?;
            debug!(
                level,
                average_distance = warp.average_distance,
                max_distance = warp.max_distance,
                "carried deformation from previous level"
            );
            observer.on_stage(&StageEvent::MeshWarped {
                level,
                average_distance: warp.average_distance,
                max_distance: warp.max_distance,
            });
            let desired: Vec<Point3<f64>> = initial_template
                .iter()
                .zip(&warp.deformation)
                .map(|(p, d)| p + d)
                .collect();
            mesh.set_points(total.transform_points(&desired))?;
        }

        let merged = merge_alphas(mesh.alphas(), mesh.label_names(), context.model)?;
        mesh.set_alphas(merged.alphas, merged.class_names)?;
        observer.on_stage(&StageEvent::PriorsMerged {
            level,
            classes: mesh.label_names(),
        });

        let estimator = BiasFieldEstimator::new(&grid.basis, &grid.active, &grid.raw)?;
        let mut data = grid.raw.clone();
        estimator.apply(bias, &mut data)?;
        let wishart = WishartPrior::from_data(&grid.raw);
        let settings = EmSettings::with_threshold(context.options.cost_decrease_threshold)
            .with_diagonal_covariances(context.model.diagonal_covariances);

        let mut previous = 1.0 / EPS;
        let mut report = LevelReport {
            level,
            factors,
            active_voxels,
            iterations: 0,
            stop_reason: StopReason::IterationCap,
            cost_history: Vec::new(),
            em_iterations: Vec::new(),
            deformation_steps: Vec::new(),
        };

        for iteration in 0..context.spec.max_iterations {
            report.iterations += 1;

            // Intensity model and bias field
            let priors = engine.rasterize_priors(&mesh, grid.dims())?.probabilities(&grid.active);
            let mixture = state.ensure_initialized(
                &grid.raw,
                &priors,
                context.layout,
                context.model.diagonal_covariances,
            )?;
            let refresh_bias = context.spec.estimate_bias_field && iteration > 0;
            let em: EmOutcome = if refresh_bias {
                let mut refresh = BiasFieldRefresh::new(estimator, bias);
                run_em(&mut data, &priors, mixture, &wishart, &settings, &mut refresh)?
            } else {
                run_em(&mut data, &priors, mixture, &wishart, &settings, &mut NoRefresh)?
            };
            report.em_iterations.push(em.iterations);
            observer.on_stage(&StageEvent::EmFinished {
                level,
                iteration,
                em_iterations: em.iterations,
                converged: em.converged,
                cost: em.cost(),
            });
            if refresh_bias && em.iterations > 1 {
                observer.on_stage(&StageEvent::BiasFieldEstimated {
                    level,
                    iteration,
                    coefficients: bias.coefficients(),
                });
            }

            // Mesh deformation
            let corrected = bias.correct(&grid.basis, &grid.images, &grid.mask)?;
            let functional = self.collaborators.functional_factory.build(&CostFunctionalRequest {
                images: &corrected,
                mask: &grid.mask,
                boundary: BoundaryCondition::Sliding,
                transform: &total,
                mixture,
                stiffness,
            })?;
            let mut optimizer = self
                .collaborators
                .optimizer_factory
                .build(functional, &context.options.optimizer)?;
            let outcome = drive_deformation(optimizer.as_mut(), &mut mesh, |step| {
                observer.on_stage(&StageEvent::DeformationStep {
                    level,
                    iteration,
                    step: *step,
                });
            })?;
            report.deformation_steps.push(outcome.steps);
            observer.on_stage(&StageEvent::DeformationFinished {
                level,
                iteration,
                outcome: &outcome,
            });

            let cost = outcome.cost + em.parameter_cost;
            let per_voxel_decrease = (previous - cost) / active_voxels as f64;
            previous = cost;
            report.cost_history.push(cost);
            info!(
                level,
                iteration,
                cost,
                per_voxel_decrease,
                max_deformation = outcome.max_displacement_applied,
                "outer iteration finished"
            );
            observer.on_stage(&StageEvent::OuterIterationFinished {
                level,
                iteration,
                cost,
                per_voxel_decrease,
            });
            if per_voxel_decrease < context.options.cost_decrease_threshold {
                report.stop_reason = StopReason::Converged;
                break;
            }
        }

        let final_template = inverse.transform_points(mesh.points());
        let deformation: Vec<Vector3<f64>> = final_template
            .iter()
            .zip(&initial_template)
            .map(|(after, before)| after - before)
            .collect();
        info!(
            level,
            iterations = report.iterations,
            stop_reason = ?report.stop_reason,
            "resolution level finished"
        );

        Ok(LevelResult {
            report,
            carry: Carry {
                template_mesh,
                deformation,
            },
            transform: total,
            mesh,
        })
    }
}

/// Read-only inputs of one level.
struct LevelContext<'a> {
    index: usize,
    spec: &'a MultiResolutionLevelSpec,
    volume: &'a VolumeState,
    basis: &'a KroneckerBasis,
    model: &'a ModelSpecification,
    options: &'a OptimizationOptions,
    layout: &'a ComponentLayout,
}

fn check(what: &'static str, expected: usize, actual: usize) -> SegmentationResult<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(SegmentationError::DimensionMismatch {
            what,
            expected,
            actual,
        })
    }
}
