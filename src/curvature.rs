//! Curvature screening of L-BFGS update pairs and the running diagonal
//! scaling of the inverse-Hessian estimate.
//!
//! A pair (ΔY, ΔS) is usable as a quasi-Newton update only if it implies
//! positive curvature that is not absurdly eccentric. Accepted pairs refine
//! an elementwise diagonal estimate α of the inverse Hessian; rejected pairs
//! carry the previous α forward unchanged.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

/// Eccentricity cap on ‖ΔY‖² / (ΔY·ΔS) for admissible updates.
const CURVE_ECCENTRICITY_CAP: f64 = 1e12;

/// Screen every update column: positive inner product and bounded
/// eccentricity.
pub fn check_curve(yk: &ArrayView2<'_, f64>, sk: &ArrayView2<'_, f64>) -> Vec<bool> {
    let cols = yk.ncols();
    let mut out = Vec::with_capacity(cols);
    for t in 0..cols {
        let y = yk.column(t);
        let s = sk.column(t);
        let dk = y.dot(&s);
        let theta = (y.dot(&y) / dk).abs();
        out.push(dk > 0.0 && theta <= CURVE_ECCENTRICITY_CAP);
    }
    out
}

/// Refine the diagonal inverse-Hessian estimate with one accepted pair.
///
/// Gilbert & Lemaréchal (1989), eq. 4.9. Entries are
/// α'ᵢ = (Y·S) / (YᵀαY/αᵢ + Yᵢ² − (YᵀαY / Sᵀα⁻¹S)·(Sᵢ/αᵢ)²).
pub fn form_diag(
    alpha_prev: &ArrayView1<'_, f64>,
    yk: &ArrayView1<'_, f64>,
    sk: &ArrayView1<'_, f64>,
) -> Array1<f64> {
    let y_alpha_y: f64 = yk
        .iter()
        .zip(alpha_prev.iter())
        .map(|(&y, &a)| a * y * y)
        .sum();
    let y_s = yk.dot(sk);
    let s_inv_alpha_s: f64 = sk
        .iter()
        .zip(alpha_prev.iter())
        .map(|(&s, &a)| s * s / a)
        .sum();
    Array1::from_shape_fn(alpha_prev.len(), |i| {
        let a = alpha_prev[i];
        let denom =
            y_alpha_y / a + yk[i] * yk[i] - (y_alpha_y / s_inv_alpha_s) * (sk[i] / a).powi(2);
        y_s / denom
    })
}

fn diag_update_usable(alpha: &Array1<f64>) -> bool {
    alpha.iter().all(|&a| a.is_finite() && a > 0.0)
}

/// Build the per-iterate diagonal scaling matrix (one column per update).
///
/// Columns whose curvature flag is false, or whose `form_diag` result is
/// numerically unusable, repeat the previous column; unusable columns also
/// have their flag cleared in `mask` so they never enter a history window.
pub fn alpha_cascade(
    yk: &ArrayView2<'_, f64>,
    sk: &ArrayView2<'_, f64>,
    mask: &mut [bool],
) -> Array2<f64> {
    let (dims, cols) = yk.dim();
    let mut alpha_mat = Array2::<f64>::zeros((dims, cols));
    let ones = Array1::<f64>::ones(dims);
    for t in 0..cols {
        let prev = if t == 0 {
            ones.clone()
        } else {
            alpha_mat.column(t - 1).to_owned()
        };
        let next = if mask[t] {
            let candidate = form_diag(&prev.view(), &yk.column(t), &sk.column(t));
            if diag_update_usable(&candidate) {
                candidate
            } else {
                mask[t] = false;
                prev
            }
        } else {
            prev
        };
        alpha_mat.column_mut(t).assign(&next);
    }
    alpha_mat
}
