//! Smooth multiplicative bias field estimation.
//!
//! Intensities are modelled in the log domain, where the scanner's
//! multiplicative inhomogeneity becomes an additive field `B·x` expanded in a
//! separable [`seg_basis::KroneckerBasis`]. After every mixture M-step the
//! coefficients are re-fitted against the residual between the raw
//! intensities and the mixture means, and the corrected intensities are
//! rewritten for the next E-step.
//!
//! - [`BiasField`]: coefficients, backprojection and image correction
//! - [`BiasFieldEstimator`]: the weighted least-squares solve
//! - [`BiasFieldRefresh`]: plugs the estimator into [`seg_gmm::run_em`]

// Safety: Deny unwrap/expect in library code. Tests may use them (workspace warns).
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]

mod error;
mod estimator;

pub use error::{BiasFieldError, BiasFieldResult};
pub use estimator::{BiasField, BiasFieldEstimator, BiasFieldRefresh};
