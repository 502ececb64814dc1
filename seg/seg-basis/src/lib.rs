//! Separable basis functions for smooth bias field models.
//!
//! A bias field is modelled as a linear combination of smooth 3-D basis
//! functions, each the product of three 1-D functions. [`KroneckerBasis`]
//! stores one matrix per axis and offers the three primitives the bias
//! estimator needs:
//!
//! - [`KroneckerBasis::project`] - `Bᵀ·v`
//! - [`KroneckerBasis::backproject`] - `B·c`
//! - [`KroneckerBasis::precision`] - `Bᵀ·diag(w)·B`
//!
//! plus [`KroneckerBasis::subsample`] for coarse resolution levels.

// Safety: Deny unwrap/expect in library code. Tests may use them (workspace warns).
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]

mod error;
mod kronecker;

pub use error::{BasisError, BasisResult};
pub use kronecker::KroneckerBasis;
