//! End-to-end segmentation tests.
//!
//! Every test runs on a synthetic 8×8×8 volume with a dark half (x < 4) and
//! a bright half, and a two-label atlas whose priors follow the same split.
//! The atlas mesh covers `-1..9` in every axis, so it extends beyond the
//! voxel grid.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::cast_precision_loss)]

use std::f64::consts::PI;
use std::path::Path;

use approx::assert_relative_eq;
use nalgebra::{DMatrix, Point3, Vector3};
use seg::prelude::*;
use seg::{
    atlas::{AtlasError, AtlasResult, rasterize_priors},
    deform::{CostFunctional, DeformResult, OptimizerStep},
    gmm::e_step,
    multires::downsampling_factors,
};

const DIMS: [usize; 3] = [8, 8, 8];
const DARK: f64 = 20.0;
const BRIGHT: f64 = 80.0;

// =============================================================================
// Fixtures
// =============================================================================

fn image() -> Volume<f64> {
    Volume::from_fn(DIMS, |i, j, k| {
        let base = if i < 4 { DARK } else { BRIGHT };
        base + ((i * 7 + j * 3 + k * 5) % 5) as f64 * 0.2
    })
}

/// A smooth additive bias along y, spanned by the first cosine of the basis.
fn injected_bias(j: usize) -> f64 {
    5.0 * (PI * (j as f64 + 0.5) / 8.0).cos()
}

fn biased_image() -> Volume<f64> {
    let clean = image();
    Volume::from_fn(DIMS, |i, j, k| clean.get(i, j, k) + injected_bias(j))
}

fn volume_with_mask(mask: Volume<bool>) -> VolumeState {
    VolumeState::new(
        vec![image()],
        mask,
        Vector3::new(1.0, 1.0, 1.0),
        AffineTransform::identity(),
    )
    .unwrap()
}

fn volume() -> VolumeState {
    volume_with_mask(Volume::filled(DIMS, true))
}

/// A `cells³` grid over `-1..9` whose alphas favour "dark" left of x = 3.5.
fn atlas(cells: usize) -> MeshCollection {
    let size = 10.0 / cells as f64;
    let mesh = AtlasMesh::regular_grid(
        Point3::new(-1.0, -1.0, -1.0),
        Vector3::new(size, size, size),
        [cells; 3],
        vec!["dark".to_string(), "bright".to_string()],
        |p| {
            if p.x < 3.5 {
                vec![0.8, 0.2]
            } else {
                vec![0.2, 0.8]
            }
        },
    )
    .unwrap();
    MeshCollection::new(mesh, 0.1)
}

fn engine() -> InMemoryMeshEngine {
    InMemoryMeshEngine::new()
        .with_collection("coarse", atlas(2))
        .with_collection("fine", atlas(4))
}

fn model() -> ModelSpecification {
    ModelSpecification::new(vec![
        ClassSpec::new("dark", ["dark"], 1),
        ClassSpec::new("bright", ["bright"], 1),
    ])
}

fn input(options: OptimizationOptions) -> SegmentationInput {
    SegmentationInput {
        volume: volume(),
        basis: KroneckerBasis::cosine(DIMS, [2, 2, 2]).unwrap(),
        bias_coefficients: DMatrix::zeros(8, 1),
        model: model(),
        options,
    }
}

fn single_level(max_iterations: usize) -> OptimizationOptions {
    OptimizationOptions::new(vec![MultiResolutionLevelSpec::new("fine", 1.0)
        .with_max_iterations(max_iterations)
        .with_bias_field(false)])
}

/// Evaluates the objective once and never moves the mesh.
struct Stationary {
    functional: Box<dyn CostFunctional>,
}

impl MeshOptimizer for Stationary {
    fn step(&mut self, mesh: &mut AtlasMesh) -> DeformResult<OptimizerStep> {
        let cost = self.functional.evaluate(mesh, mesh.points())?.cost;
        Ok(OptimizerStep {
            cost,
            max_displacement: 0.0,
        })
    }
}

struct StationaryFactory;

impl OptimizerFactory for StationaryFactory {
    fn build(
        &self,
        functional: Box<dyn CostFunctional>,
        _params: &OptimizerParams,
    ) -> DeformResult<Box<dyn MeshOptimizer>> {
        Ok(Box::new(Stationary { functional }))
    }
}

/// Records the kind of every event.
#[derive(Default)]
struct Recorder {
    events: Vec<&'static str>,
    deformation_steps: usize,
}

impl StageObserver for Recorder {
    fn on_stage(&mut self, event: &StageEvent<'_>) {
        let kind = match event {
            StageEvent::LevelStarted { .. } => "level_started",
            StageEvent::MeshWarped { .. } => "mesh_warped",
            StageEvent::PriorsMerged { .. } => "priors_merged",
            StageEvent::EmFinished { .. } => "em_finished",
            StageEvent::BiasFieldEstimated { .. } => "bias_field_estimated",
            StageEvent::DeformationStep { .. } => {
                self.deformation_steps += 1;
                "deformation_step"
            }
            StageEvent::DeformationFinished { .. } => "deformation_finished",
            StageEvent::OuterIterationFinished { .. } => "outer_iteration_finished",
            StageEvent::LevelFinished { .. } => "level_finished",
            _ => "other",
        };
        self.events.push(kind);
    }
}

impl Recorder {
    fn count(&self, kind: &str) -> usize {
        self.events.iter().filter(|e| **e == kind).count()
    }
}

// =============================================================================
// Tier 1: Configuration
// =============================================================================

mod tier1_configuration {
    use super::*;

    #[test]
    fn downsampling_factors_are_at_least_one() {
        let spacing = Vector3::new(1.0, 2.0, 4.0);
        assert_eq!(downsampling_factors(2.0, &spacing), [2, 1, 1]);
        assert_eq!(downsampling_factors(0.1, &spacing), [1, 1, 1]);
        assert_eq!(downsampling_factors(f64::NAN, &spacing), [1, 1, 1]);
    }

    #[test]
    fn transform_round_trip() {
        let total = AffineTransform::downsampling([2, 2, 2])
            .compose(&AffineTransform::from_translation(Vector3::new(1.0, -2.0, 0.5)));
        let inverse = total.try_inverse().unwrap();
        let points = vec![Point3::new(0.0, 0.0, 0.0), Point3::new(3.0, 7.0, -1.0)];
        let back = inverse.transform_points(&total.transform_points(&points));
        for (a, b) in points.iter().zip(&back) {
            assert_relative_eq!(*a, *b, epsilon = 1e-12);
        }
    }

    #[test]
    fn options_parse_from_json() {
        let options = OptimizationOptions::from_json_str(
            r#"{
                "levels": [
                    { "target_spacing": 2.0, "atlas_path": "coarse" },
                    { "target_spacing": 1.0, "atlas_path": "fine", "max_iterations": 3 }
                ],
                "optimizer": { "max_iterations": 5 }
            }"#,
        )
        .unwrap();
        assert_eq!(options.levels.len(), 2);
        assert_eq!(options.levels[0].max_iterations, 100);
        assert!(options.levels[0].estimate_bias_field);
        assert_eq!(options.levels[1].max_iterations, 3);
        assert_eq!(options.optimizer.max_iterations, 5);
        assert_eq!(options.optimizer.memory_length, 12);
        assert_relative_eq!(options.cost_decrease_threshold, 1e-4);
    }

    #[test]
    fn model_parses_from_json() {
        let model = ModelSpecification::from_json_str(
            r#"{
                "classes": [
                    { "name": "dark", "label_names": ["dark"], "gaussian_count": 1 },
                    { "name": "bright", "label_names": ["bright"], "gaussian_count": 2 }
                ],
                "stiffness": 0.5
            }"#,
        )
        .unwrap();
        assert_eq!(model.gaussian_count(), 3);
        assert!(!model.diagonal_covariances);
        assert_relative_eq!(model.stiffness, 0.5);
    }

    #[test]
    fn empty_schedule_is_rejected_before_any_work() {
        let engine = engine();
        let segmenter = MultiResolutionSegmenter::new(Collaborators::new(
            &engine,
            &AtlasLikelihoodFactory,
            &LbfgsFactory,
        ));
        let result = segmenter.run(input(OptimizationOptions::new(vec![])), &mut NoObserver);
        assert!(matches!(result, Err(SegmentationError::Config(_))));
    }

    #[test]
    fn mismatched_bias_coefficients_are_rejected() {
        let engine = engine();
        let segmenter = MultiResolutionSegmenter::new(Collaborators::new(
            &engine,
            &AtlasLikelihoodFactory,
            &LbfgsFactory,
        ));
        let mut input = input(single_level(2));
        input.bias_coefficients = DMatrix::zeros(4, 1);
        assert!(matches!(
            segmenter.run(input, &mut NoObserver),
            Err(SegmentationError::DimensionMismatch { expected: 8, actual: 4, .. })
        ));
    }
}

// =============================================================================
// Tier 2: Failure modes
// =============================================================================

mod tier2_failures {
    use super::*;

    #[test]
    fn unknown_atlas_path_is_reported() {
        let engine = engine();
        let segmenter = MultiResolutionSegmenter::new(Collaborators::new(
            &engine,
            &AtlasLikelihoodFactory,
            &LbfgsFactory,
        ));
        let options = OptimizationOptions::new(vec![MultiResolutionLevelSpec::new("missing", 1.0)]);
        assert!(matches!(
            segmenter.run(input(options), &mut NoObserver),
            Err(SegmentationError::Atlas(AtlasError::UnknownCollection(_)))
        ));
    }

    #[test]
    fn empty_mask_is_reported() {
        let engine = engine();
        let segmenter = MultiResolutionSegmenter::new(Collaborators::new(
            &engine,
            &AtlasLikelihoodFactory,
            &LbfgsFactory,
        ));
        let mut input = input(single_level(2));
        input.volume = volume_with_mask(Volume::filled(DIMS, false));
        assert!(matches!(
            segmenter.run(input, &mut NoObserver),
            Err(SegmentationError::NoActiveVoxels { level: 0 })
        ));
    }

    #[test]
    fn zero_iteration_cap_leaves_mixture_unestimated() {
        let engine = engine();
        let segmenter = MultiResolutionSegmenter::new(Collaborators::new(
            &engine,
            &AtlasLikelihoodFactory,
            &LbfgsFactory,
        ));
        assert!(matches!(
            segmenter.run(input(single_level(0)), &mut NoObserver),
            Err(SegmentationError::NotEstimated)
        ));
    }
}

// =============================================================================
// Tier 3: Full runs
// =============================================================================

mod tier3_runs {
    use super::*;

    #[test]
    fn stationary_optimizer_takes_one_step_per_iteration() {
        let engine = engine();
        let segmenter = MultiResolutionSegmenter::new(Collaborators::new(
            &engine,
            &AtlasLikelihoodFactory,
            &StationaryFactory,
        ));
        let mut recorder = Recorder::default();
        let output = segmenter.run(input(single_level(10)), &mut recorder).unwrap();

        let report = &output.levels[0];
        assert!(report.iterations >= 1);
        assert!(report.deformation_steps.iter().all(|&steps| steps == 1));
        assert_eq!(recorder.deformation_steps, report.iterations);
        assert!(output.deformation.iter().all(|d| d.norm() == 0.0));
        assert_eq!(recorder.count("bias_field_estimated"), 0);
    }

    #[test]
    fn single_level_separates_the_two_tissues() {
        let engine = engine();
        let segmenter = MultiResolutionSegmenter::new(Collaborators::new(
            &engine,
            &AtlasLikelihoodFactory,
            &LbfgsFactory,
        ));
        let mut recorder = Recorder::default();
        let output = segmenter.run(input(single_level(4)), &mut recorder).unwrap();

        let report = &output.levels[0];
        assert_eq!(report.factors, [1, 1, 1]);
        assert_eq!(report.active_voxels, 512);
        assert!(report.iterations <= 4);
        assert_eq!(report.cost_history.len(), report.iterations);
        assert!(report.final_cost().unwrap().is_finite());

        // Well-separated intensities: the means land on the two plateaus
        let dark = output.mixture.mean(0)[0];
        let bright = output.mixture.mean(1)[0];
        assert!((dark - DARK).abs() < 2.0, "dark mean {dark}");
        assert!((bright - BRIGHT).abs() < 2.0, "bright mean {bright}");

        // Posteriors under the deformed atlas are normalized and sensible
        let image = image();
        let data = DMatrix::from_column_slice(512, 1, image.as_slice());
        let all: Vec<usize> = (0..512).collect();
        let priors = rasterize_priors(&output.mesh, DIMS).probabilities(&all);
        let posteriors = e_step(&data, &priors, &output.mixture).unwrap().posteriors;
        for row in posteriors.row_iter() {
            assert_relative_eq!(row.sum(), 1.0, epsilon = 1e-6);
        }
        assert!(posteriors[(0, 0)] > 0.99);
        assert!(posteriors[(7, 1)] > 0.99);

        assert_eq!(output.mesh.label_names(), ["dark", "bright"]);
        assert_eq!(output.deformation.len(), output.mesh.node_count());
        assert_eq!(recorder.count("level_started"), 1);
        assert_eq!(recorder.count("level_finished"), 1);
        assert_eq!(recorder.count("mesh_warped"), 0);
        assert_eq!(recorder.count("em_finished"), report.iterations);
    }

    #[test]
    fn two_levels_carry_the_deformation() {
        let engine = engine();
        let segmenter = MultiResolutionSegmenter::new(Collaborators::new(
            &engine,
            &AtlasLikelihoodFactory,
            &LbfgsFactory,
        ));
        let options = OptimizationOptions::new(vec![
            MultiResolutionLevelSpec::new("coarse", 2.0)
                .with_max_iterations(3)
                .with_bias_field(false),
            MultiResolutionLevelSpec::new("fine", 1.0).with_max_iterations(3),
        ]);
        let mut recorder = Recorder::default();
        let output = segmenter.run(input(options), &mut recorder).unwrap();

        assert_eq!(output.levels.len(), 2);
        assert_eq!(output.levels[0].factors, [2, 2, 2]);
        assert_eq!(output.levels[0].active_voxels, 64);
        assert_eq!(output.levels[1].factors, [1, 1, 1]);
        assert_eq!(output.levels[1].active_voxels, 512);
        assert_eq!(recorder.count("level_started"), 2);
        assert_eq!(recorder.count("mesh_warped"), 1);

        // The final mesh is the fine atlas
        assert_eq!(output.mesh.node_count(), 125);
        assert_eq!(output.bias_field.basis_count(), 8);
        assert!(output.bias_field.coefficients().iter().all(|c| c.is_finite()));
        assert!(output.mixture.mean(0)[0] < output.mixture.mean(1)[0]);
        assert_relative_eq!(output.transform.determinant(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn stationary_mesh_converges_before_the_cap() {
        let engine = engine();
        let segmenter = MultiResolutionSegmenter::new(Collaborators::new(
            &engine,
            &AtlasLikelihoodFactory,
            &StationaryFactory,
        ));
        let output = segmenter.run(input(single_level(20)), &mut NoObserver).unwrap();

        let report = &output.levels[0];
        assert_eq!(report.stop_reason, StopReason::Converged);
        assert!(report.iterations >= 2);
        assert!(report.iterations < 20);
        assert_eq!(report.cost_history.len(), report.iterations);
    }

    #[test]
    fn single_iteration_stops_at_the_cap() {
        let engine = engine();
        let segmenter = MultiResolutionSegmenter::new(Collaborators::new(
            &engine,
            &AtlasLikelihoodFactory,
            &StationaryFactory,
        ));
        let output = segmenter.run(input(single_level(1)), &mut NoObserver).unwrap();

        let report = &output.levels[0];
        assert_eq!(report.iterations, 1);
        assert_eq!(report.stop_reason, StopReason::IterationCap);
    }

    #[test]
    fn bias_estimation_recovers_an_injected_field() {
        let engine = engine();
        let segmenter = MultiResolutionSegmenter::new(Collaborators::new(
            &engine,
            &AtlasLikelihoodFactory,
            &StationaryFactory,
        ));
        let basis = KroneckerBasis::cosine(DIMS, [2, 2, 2]).unwrap();
        let mut segmentation = input(OptimizationOptions::new(vec![
            MultiResolutionLevelSpec::new("fine", 1.0).with_max_iterations(6),
        ]));
        segmentation.volume = VolumeState::new(
            vec![biased_image()],
            Volume::filled(DIMS, true),
            Vector3::new(1.0, 1.0, 1.0),
            AffineTransform::identity(),
        )
        .unwrap();
        let mut recorder = Recorder::default();
        let output = segmenter.run(segmentation, &mut recorder).unwrap();

        assert!(recorder.count("bias_field_estimated") >= 1);

        // The constant part trades off against the class means
        let field = output.bias_field.field(&basis, 0).unwrap();
        let field_mean = field.iter().sum::<f64>() / field.len() as f64;
        let injected: Vec<f64> = (0..512).map(|index| injected_bias((index / 8) % 8)).collect();
        let injected_mean = injected.iter().sum::<f64>() / injected.len() as f64;
        for (recovered, expected) in field.iter().zip(&injected) {
            assert!(
                ((recovered - field_mean) - (expected - injected_mean)).abs() < 1.0,
                "recovered {recovered}, injected {expected}"
            );
        }

        // Noise pattern averages 0.4 on top of each plateau
        let dark = output.mixture.mean(0)[0] + field_mean;
        let bright = output.mixture.mean(1)[0] + field_mean;
        assert!((dark - (DARK + 0.4)).abs() < 1.5, "dark mean {dark}");
        assert!((bright - (BRIGHT + 0.4)).abs() < 1.5, "bright mean {bright}");
    }

    /// Serves collections from memory but rasterizes every mesh to flat priors.
    struct FlatPriorEngine {
        inner: InMemoryMeshEngine,
    }

    impl MeshEngine for FlatPriorEngine {
        fn load_collection(&self, path: &Path) -> AtlasResult<MeshCollection> {
            self.inner.load_collection(path)
        }

        fn transform(&self, collection: &mut MeshCollection, transform: &AffineTransform) {
            self.inner.transform(collection, transform);
        }

        fn rasterize_priors(
            &self,
            mesh: &AtlasMesh,
            dims: [usize; 3],
        ) -> AtlasResult<RasterizedPriors> {
            let labels = mesh.label_count();
            let voxels = dims.iter().product::<usize>();
            RasterizedPriors::from_raw(dims, labels, vec![32768; voxels * labels])
                .ok_or_else(|| AtlasError::InvalidMesh("prior buffer size".to_string()))
        }

        fn warp_deformation(
            &self,
            source: &AtlasMesh,
            deformation: &[Vector3<f64>],
            target: &AtlasMesh,
        ) -> AtlasResult<WarpResult> {
            self.inner.warp_deformation(source, deformation, target)
        }
    }

    #[test]
    fn external_engine_supplies_raw_priors() {
        let engine = FlatPriorEngine { inner: engine() };
        let segmenter = MultiResolutionSegmenter::new(Collaborators::new(
            &engine,
            &AtlasLikelihoodFactory,
            &StationaryFactory,
        ));
        let output = segmenter.run(input(single_level(3)), &mut NoObserver).unwrap();

        let report = &output.levels[0];
        assert!(report.iterations >= 1);
        assert!(report.final_cost().unwrap().is_finite());
        assert!(output.mixture.mean(0)[0].is_finite());
        assert!(output.mixture.mean(1)[0].is_finite());
    }
}
