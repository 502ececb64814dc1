//! Gaussian mixture estimation for atlas-based segmentation.
//!
//! Every tissue class is modelled by one or more Gaussian components whose
//! weights sum to one within the class. Voxel posteriors combine the
//! component likelihoods with per-voxel class priors from the atlas.
//!
//! - [`GaussianMixture`] / [`ComponentLayout`] - parameters and their
//!   grouping into classes
//! - [`MixtureState`] - explicit `Uninitialized` / `Initialized` state
//! - [`e_step`] / [`m_step`] - the two halves of an EM iteration
//! - [`WishartPrior`] - conjugate covariance prior and its penalty
//! - [`run_em`] - the capped EM loop with a [`DataRefresh`] hook
//!
//! # Data layout
//!
//! Data matrices have one row per active voxel and one column per contrast;
//! prior matrices one row per active voxel and one column per class.

// Safety: Deny unwrap/expect in library code. Tests may use them (workspace warns).
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]

mod em;
mod error;
mod estep;
mod mixture;
mod mstep;
mod wishart;

pub use em::{DataRefresh, EmOutcome, EmSettings, NoRefresh, run_em};
pub use error::{MixtureError, MixtureResult};
pub use estep::{EStep, class_likelihoods, e_step};
pub use mixture::{ComponentLayout, GaussianMixture, MixtureState};
pub use mstep::m_step;
pub use wishart::{WishartPrior, pooled_variance};
