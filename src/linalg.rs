//! ndarray ↔ faer interop for the dense factorizations used by the engine.
//!
//! The surrogate builder needs two factorizations that ndarray does not
//! provide: an LLT Cholesky of a symmetric positive-definite matrix and a
//! Householder QR of a tall matrix. Both are delegated to faer through
//! zero-copy views; results are converted back into ndarray containers.

use faer::diag::DiagRef;
use faer::linalg::solvers::{self, Llt as FaerLlt};
use faer::{MatRef, Side};
use ndarray::{Array1, Array2, ArrayBase, ArrayView2, Data, Ix2, s};
use std::marker::PhantomData;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinalgError {
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),
}

/// Borrowed view of an ndarray matrix usable as a faer `MatRef`.
///
/// Layouts with non-positive strides can alias or reverse memory traversal,
/// which violates assumptions in faer kernels; those are materialized into a
/// compact owned copy instead.
pub struct FaerArrayView<'a> {
    ptr: *const f64,
    rows: usize,
    cols: usize,
    row_stride: isize,
    col_stride: isize,
    owned: Option<Array2<f64>>,
    _marker: PhantomData<&'a f64>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let (rows, cols) = array.dim();
        let strides = array.strides();
        if strides[0] <= 0 || strides[1] <= 0 {
            let owned = array.to_owned();
            let owned_strides = owned.strides();
            return Self {
                ptr: owned.as_ptr(),
                rows,
                cols,
                row_stride: owned_strides[0],
                col_stride: owned_strides[1],
                owned: Some(owned),
                _marker: PhantomData,
            };
        }

        Self {
            ptr: array.as_ptr(),
            rows,
            cols,
            row_stride: strides[0],
            col_stride: strides[1],
            owned: None,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        let (ptr, rows, cols, row_stride, col_stride) = if let Some(owned) = &self.owned {
            let strides = owned.strides();
            (
                owned.as_ptr(),
                owned.nrows(),
                owned.ncols(),
                strides[0],
                strides[1],
            )
        } else {
            (
                self.ptr,
                self.rows,
                self.cols,
                self.row_stride,
                self.col_stride,
            )
        };
        // SAFETY: pointer/shape/strides either come directly from a live ndarray
        // view with positive strides, or from an owned compact copy stored inside
        // this wrapper, which guarantees validity for the returned view lifetime.
        unsafe { MatRef::from_raw_parts(ptr, rows, cols, row_stride, col_stride) }
    }
}

fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    let mut out = Array2::<f64>::zeros((mat.nrows(), mat.ncols()));
    for j in 0..mat.ncols() {
        for i in 0..mat.nrows() {
            out[[i, j]] = mat[(i, j)];
        }
    }
    out
}

fn diag_to_array(diag: DiagRef<'_, f64>) -> Array1<f64> {
    let mat = diag.column_vector().as_mat();
    let mut out = Array1::<f64>::zeros(mat.nrows());
    for i in 0..mat.nrows() {
        out[i] = mat[(i, 0)];
    }
    out
}

pub struct CholeskyFactor {
    factor: FaerLlt<f64>,
}

impl CholeskyFactor {
    pub fn diag(&self) -> Array1<f64> {
        diag_to_array(self.factor.L().diagonal())
    }

    pub fn lower_triangular(&self) -> Array2<f64> {
        let mut l = mat_to_array(self.factor.L());
        let n = l.nrows();
        for i in 0..n {
            for j in i + 1..n {
                l[[i, j]] = 0.0;
            }
        }
        l
    }

    /// Upper factor U with A = Uᵀ U.
    pub fn upper_triangular(&self) -> Array2<f64> {
        self.lower_triangular().reversed_axes()
    }
}

pub trait FaerCholesky {
    fn cholesky(&self, side: Side) -> Result<CholeskyFactor, LinalgError>;
}

impl<S: Data<Elem = f64>> FaerCholesky for ArrayBase<S, Ix2> {
    fn cholesky(&self, side: Side) -> Result<CholeskyFactor, LinalgError> {
        let faer_view = FaerArrayView::new(self);
        let factor = faer_view
            .as_ref()
            .llt(side)
            .map_err(LinalgError::Cholesky)?;
        Ok(CholeskyFactor { factor })
    }
}

pub trait FaerQr {
    fn thin_qr(&self) -> (Array2<f64>, Array2<f64>);
}

impl<S: Data<Elem = f64>> FaerQr for ArrayBase<S, Ix2> {
    /// Thin Householder QR: Q is n × min(n, p) orthonormal and R is
    /// min(n, p) × p upper trapezoidal.
    fn thin_qr(&self) -> (Array2<f64>, Array2<f64>) {
        let (n, p) = self.dim();
        let min_size = n.min(p);
        let faer_view = FaerArrayView::new(self);
        let qr = faer_view.as_ref().qr();
        let q = mat_to_array(qr.compute_Q().as_ref());
        let r = mat_to_array(qr.R());
        let q_thin = q.slice(s![.., ..min_size]).to_owned();
        let mut r_thin = r.slice(s![..min_size, ..]).to_owned();
        for i in 0..min_size {
            for j in 0..i.min(p) {
                r_thin[[i, j]] = 0.0;
            }
        }
        (q_thin, r_thin)
    }
}

/// Solve R X = B in place for an upper-triangular R, overwriting B with X.
///
/// Back-substitution over each column of B; R must have a non-zero diagonal.
pub fn solve_upper_triangular_in_place(r: &ArrayView2<'_, f64>, b: &mut Array2<f64>) {
    let m = r.nrows();
    debug_assert_eq!(r.ncols(), m, "triangular solve needs a square factor");
    debug_assert_eq!(b.nrows(), m, "right-hand side rows must match factor");
    let cols = b.ncols();
    for col in 0..cols {
        for i in (0..m).rev() {
            let mut sum = b[[i, col]];
            for j in i + 1..m {
                sum -= r[[i, j]] * b[[j, col]];
            }
            b[[i, col]] = sum / r[[i, i]];
        }
    }
}
