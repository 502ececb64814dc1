//! Per-level summaries.

/// Why a level's outer loop ended. Neither reason is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The per-voxel cost decrease fell below the threshold.
    Converged,
    /// The level's iteration cap was reached first.
    IterationCap,
}

/// Summary of one resolution level.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelReport {
    /// Zero-based level index.
    pub level: usize,
    /// Per-axis downsampling factors.
    pub factors: [usize; 3],
    /// Masked voxels on the downsampled grid.
    pub active_voxels: usize,
    /// Outer iterations performed.
    pub iterations: usize,
    /// Why the outer loop ended.
    pub stop_reason: StopReason,
    /// Total cost after every outer iteration.
    pub cost_history: Vec<f64>,
    /// E-steps performed by each outer iteration.
    pub em_iterations: Vec<usize>,
    /// Optimizer steps taken by each outer iteration.
    pub deformation_steps: Vec<usize>,
}

impl LevelReport {
    /// Cost after the last outer iteration, if any ran.
    #[must_use]
    pub fn final_cost(&self) -> Option<f64> {
        self.cost_history.last().copied()
    }
}
