//! Stage notifications for diagnostics and checkpointing.

use nalgebra::DMatrix;

use seg_deform::{DeformationOutcome, DeformationStep};

use crate::report::LevelReport;

/// A point in the pipeline at which observers are notified.
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub enum StageEvent<'a> {
    /// A level's grid has been set up.
    LevelStarted {
        /// Zero-based level index.
        level: usize,
        /// Per-axis downsampling factors.
        factors: [usize; 3],
        /// Number of masked voxels on the downsampled grid.
        active_voxels: usize,
    },
    /// The previous level's deformation was carried onto this level's mesh.
    MeshWarped {
        /// Level index.
        level: usize,
        /// Mean distance of unmatched nodes.
        average_distance: f64,
        /// Largest distance of an unmatched node.
        max_distance: f64,
    },
    /// Atlas labels were merged into classes.
    PriorsMerged {
        /// Level index.
        level: usize,
        /// Class names, in class order.
        classes: &'a [String],
    },
    /// The inner EM loop returned.
    EmFinished {
        /// Level index.
        level: usize,
        /// Outer iteration.
        iteration: usize,
        /// E-steps performed.
        em_iterations: usize,
        /// Whether EM met its threshold.
        converged: bool,
        /// Final EM cost.
        cost: f64,
    },
    /// The bias field was re-estimated during EM.
    BiasFieldEstimated {
        /// Level index.
        level: usize,
        /// Outer iteration.
        iteration: usize,
        /// Coefficients after the last refresh.
        coefficients: &'a DMatrix<f64>,
    },
    /// The mesh optimizer took a step.
    DeformationStep {
        /// Level index.
        level: usize,
        /// Outer iteration.
        iteration: usize,
        /// Step diagnostics.
        step: DeformationStep,
    },
    /// The mesh optimizer reported zero displacement.
    DeformationFinished {
        /// Level index.
        level: usize,
        /// Outer iteration.
        iteration: usize,
        /// Deformation result.
        outcome: &'a DeformationOutcome,
    },
    /// An outer EM + deformation iteration completed.
    OuterIterationFinished {
        /// Level index.
        level: usize,
        /// Outer iteration.
        iteration: usize,
        /// Deformation cost plus intensity model parameter cost.
        cost: f64,
        /// Cost decrease since the previous outer iteration, per active voxel.
        per_voxel_decrease: f64,
    },
    /// A level completed.
    LevelFinished {
        /// Level summary.
        report: &'a LevelReport,
    },
}

/// Receives [`StageEvent`]s; the default implementation ignores them.
pub trait StageObserver {
    /// Called at each stage.
    fn on_stage(&mut self, _event: &StageEvent<'_>) {}
}

/// Observer that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoObserver;

impl StageObserver for NoObserver {}
