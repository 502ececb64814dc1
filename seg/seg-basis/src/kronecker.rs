//! Separable 3-D basis built from one dense matrix per axis.

// Grid sizes stay far below 2^52
#![allow(clippy::cast_precision_loss)]

use std::f64::consts::PI;

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use crate::error::{BasisError, BasisResult};

/// A basis whose 3-D functions are products of per-axis functions.
///
/// Axis `d` is a matrix `B_d` of shape `samples_d × functions_d`. The
/// coefficient of function `(a, b, c)` lives at index
/// `a + b·m₀ + c·m₀·m₁`, and voxels are ordered column-major like
/// `Volume`. Every operation contracts one axis at a time, so
/// the full `N × M` basis matrix is never formed.
///
/// # Example
///
/// ```
/// use seg_basis::KroneckerBasis;
///
/// let basis = KroneckerBasis::cosine([8, 8, 4], [3, 3, 2]).unwrap();
/// assert_eq!(basis.basis_count(), 18);
///
/// let coefficients = vec![0.5; 18];
/// let field = basis.backproject(&coefficients).unwrap();
/// assert_eq!(field.len(), 8 * 8 * 4);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct KroneckerBasis {
    axes: [DMatrix<f64>; 3],
}

impl KroneckerBasis {
    /// Wraps three per-axis matrices.
    ///
    /// # Errors
    ///
    /// Fails if any axis has no rows or no columns.
    pub fn new(axes: [DMatrix<f64>; 3]) -> BasisResult<Self> {
        for (axis, matrix) in axes.iter().enumerate() {
            if matrix.nrows() == 0 || matrix.ncols() == 0 {
                return Err(BasisError::EmptyAxis {
                    axis,
                    samples: matrix.nrows(),
                    functions: matrix.ncols(),
                });
            }
        }
        Ok(Self { axes })
    }

    /// Orthonormal DCT-II basis with `counts[d]` low-frequency functions on
    /// an axis of `dims[d]` samples.
    ///
    /// # Errors
    ///
    /// Fails if an axis is empty or asks for more functions than samples.
    pub fn cosine(dims: [usize; 3], counts: [usize; 3]) -> BasisResult<Self> {
        Self::new([
            cosine_axis(0, dims[0], counts[0])?,
            cosine_axis(1, dims[1], counts[1])?,
            cosine_axis(2, dims[2], counts[2])?,
        ])
    }

    /// The per-axis matrices.
    #[must_use]
    pub const fn axes(&self) -> &[DMatrix<f64>; 3] {
        &self.axes
    }

    /// Number of samples along each axis.
    #[must_use]
    pub fn dims(&self) -> [usize; 3] {
        [self.axes[0].nrows(), self.axes[1].nrows(), self.axes[2].nrows()]
    }

    /// Number of functions along each axis.
    #[must_use]
    pub fn counts(&self) -> [usize; 3] {
        [self.axes[0].ncols(), self.axes[1].ncols(), self.axes[2].ncols()]
    }

    /// Number of voxels covered by the basis.
    #[must_use]
    pub fn voxel_count(&self) -> usize {
        self.dims().iter().product()
    }

    /// Total number of 3-D basis functions.
    #[must_use]
    pub fn basis_count(&self) -> usize {
        self.counts().iter().product()
    }

    /// Computes `Bᵀ·v` for a column-major voxel vector `v`.
    ///
    /// # Errors
    ///
    /// Fails if `values` does not hold one value per voxel.
    pub fn project(&self, values: &[f64]) -> BasisResult<DVector<f64>> {
        check_len(self.voxel_count(), values.len())?;
        let mut data = values.to_vec();
        let mut dims = self.dims();
        for axis in 0..3 {
            (data, dims) = contract_axis(&data, dims, axis, &self.axes[axis].transpose());
        }
        Ok(DVector::from_vec(data))
    }

    /// Computes `B·c`, the column-major voxel field of coefficients `c`.
    ///
    /// # Errors
    ///
    /// Fails if `coefficients` does not hold one value per basis function.
    pub fn backproject(&self, coefficients: &[f64]) -> BasisResult<Vec<f64>> {
        check_len(self.basis_count(), coefficients.len())?;
        let mut data = coefficients.to_vec();
        let mut dims = self.counts();
        for axis in 0..3 {
            (data, dims) = contract_axis(&data, dims, axis, &self.axes[axis]);
        }
        Ok(data)
    }

    /// Computes the weighted Gram matrix `Bᵀ·diag(w)·B`.
    ///
    /// # Errors
    ///
    /// Fails if `weights` does not hold one value per voxel.
    pub fn precision(&self, weights: &[f64]) -> BasisResult<DMatrix<f64>> {
        check_len(self.voxel_count(), weights.len())?;
        let counts = self.counts();

        // Q_d[(a + a'·m), i] = B_d[i, a]·B_d[i, a']
        let mut data = weights.to_vec();
        let mut dims = self.dims();
        for axis in 0..3 {
            let b = &self.axes[axis];
            let m = b.ncols();
            let products = DMatrix::from_fn(m * m, b.nrows(), |row, i| {
                b[(i, row % m)] * b[(i, row / m)]
            });
            (data, dims) = contract_axis(&data, dims, axis, &products);
        }

        let [m0, m1, m2] = counts;
        let total = m0 * m1 * m2;
        let paired = [m0 * m0, m1 * m1];
        Ok(DMatrix::from_fn(total, total, |p, q| {
            let (a, b, c) = (p % m0, (p / m0) % m1, p / (m0 * m1));
            let (a2, b2, c2) = (q % m0, (q / m0) % m1, q / (m0 * m1));
            let x = a + a2 * m0;
            let y = b + b2 * m1;
            let z = c + c2 * m2;
            data[x + y * paired[0] + z * paired[0] * paired[1]]
        }))
    }

    /// Keeps rows `0, f, 2f, ...` of each axis, matching
    /// `Volume::subsample`. Factors of zero are treated as one.
    #[must_use]
    pub fn subsample(&self, factors: [usize; 3]) -> Self {
        let axes = std::array::from_fn(|axis| {
            let b = &self.axes[axis];
            let f = factors[axis].max(1);
            let rows = b.nrows().div_ceil(f);
            DMatrix::from_fn(rows, b.ncols(), |i, a| b[(i * f, a)])
        });
        Self { axes }
    }
}

fn cosine_axis(axis: usize, samples: usize, functions: usize) -> BasisResult<DMatrix<f64>> {
    if samples == 0 || functions == 0 {
        return Err(BasisError::EmptyAxis {
            axis,
            samples,
            functions,
        });
    }
    if functions > samples {
        return Err(BasisError::TooManyFunctions {
            axis,
            samples,
            functions,
        });
    }
    let n = samples as f64;
    Ok(DMatrix::from_fn(samples, functions, |i, f| {
        if f == 0 {
            (1.0 / n).sqrt()
        } else {
            (2.0 / n).sqrt() * (PI * (2.0 * i as f64 + 1.0) * f as f64 / (2.0 * n)).cos()
        }
    }))
}

fn check_len(expected: usize, actual: usize) -> BasisResult<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(BasisError::LengthMismatch { expected, actual })
    }
}

/// Replaces axis `axis` of a column-major tensor by `matrix · tensor` along
/// that axis. `matrix` has `dims[axis]` columns.
fn contract_axis(
    data: &[f64],
    dims: [usize; 3],
    axis: usize,
    matrix: &DMatrix<f64>,
) -> (Vec<f64>, [usize; 3]) {
    let mut out_dims = dims;
    out_dims[axis] = matrix.nrows();
    let strides = [1, dims[0], dims[0] * dims[1]];
    let stride = strides[axis];
    let len = dims[axis];
    let total: usize = out_dims.iter().product();

    let out = (0..total)
        .into_par_iter()
        .map(|index| {
            let mut coords = [
                index % out_dims[0],
                (index / out_dims[0]) % out_dims[1],
                index / (out_dims[0] * out_dims[1]),
            ];
            let row = coords[axis];
            coords[axis] = 0;
            let base = coords[0] * strides[0] + coords[1] * strides[1] + coords[2] * strides[2];
            (0..len)
                .map(|l| matrix[(row, l)] * data[base + l * stride])
                .sum::<f64>()
        })
        .collect();
    (out, out_dims)
}
