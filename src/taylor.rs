//! Local Gaussian surrogate built from the accepted L-BFGS history at one
//! iterate.
//!
//! The surrogate's covariance is the compact rank-corrected form of the
//! approximate inverse Hessian. It is assembled in one of two algebraically
//! equivalent factorizations: a *dense* explicit Cholesky of the full d × d
//! matrix, or a *sparse* low-rank-plus-diagonal form built from a thin QR,
//! which costs O(d·m²) instead of O(d³) and wins when d ≫ m. Selection is
//! purely dimensional: dense when 2m ≥ d.

use crate::linalg::{solve_upper_triangular_in_place, FaerCholesky, FaerQr, LinalgError};
use faer::Side;
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};

/// One local Gaussian surrogate q.
#[derive(Debug, Clone)]
pub struct TaylorApprox {
    /// Mean of the surrogate, x − H·g.
    pub x_center: Array1<f64>,
    /// Log determinant of the Cholesky factor of the covariance.
    pub log_det_chol_hk: f64,
    /// Upper-triangular Cholesky factor (d × d dense, m' × m' sparse).
    pub l_approx: Array2<f64>,
    /// Orthonormal basis of the low-rank correction; sparse form only.
    pub qk: Option<Array2<f64>>,
    pub use_full: bool,
}

/// Accepted history window feeding one surrogate: rows of `ykt` are the
/// gradient differences, newest first; `dk` their inner products with the
/// matching parameter differences; `ninv_rst` = −R⁻¹ΔSᵀ.
pub struct HistoryWindow {
    pub ykt: Array2<f64>,
    pub dk: Array1<f64>,
    pub ninv_rst: Array2<f64>,
}

/// Gather up to `history_size` curvature-accepted columns, walking backward
/// from `iter`, and precompute the shared window quantities.
pub fn assemble_window(
    ykt_diff: &ArrayView2<'_, f64>,
    skt_diff: &ArrayView2<'_, f64>,
    mask: &[bool],
    iter: usize,
    history_size: usize,
) -> HistoryWindow {
    let dims = ykt_diff.nrows();
    let mut cols = Vec::with_capacity(history_size);
    for t in (0..=iter).rev() {
        if mask[t] {
            cols.push(t);
        }
        if cols.len() == history_size {
            break;
        }
    }
    let m = cols.len();
    let mut ykt = Array2::<f64>::zeros((m, dims));
    let mut skt = Array2::<f64>::zeros((m, dims));
    for (i, &t) in cols.iter().enumerate() {
        ykt.row_mut(i).assign(&ykt_diff.column(t));
        skt.row_mut(i).assign(&skt_diff.column(t));
    }
    let dk = Array1::from_shape_fn(m, |i| ykt.row(i).dot(&skt.row(i)));
    let mut rk = Array2::<f64>::zeros((m, m));
    for j in 0..m {
        for i in 0..=j {
            rk[[i, j]] = skt.row(i).dot(&ykt.row(j));
        }
    }
    // R⁻¹ ΔSᵀ by back-substitution, then negated.
    solve_upper_triangular_in_place(&rk.view(), &mut skt);
    let ninv_rst = skt.mapv(|v| -v);
    HistoryWindow { ykt, dk, ninv_rst }
}

fn y_tcrossprod_alpha(window: &HistoryWindow, alpha: &ArrayView1<'_, f64>) -> Array2<f64> {
    let y_mul_sqrt_alpha = &window.ykt * &alpha.mapv(f64::sqrt);
    let mut out = y_mul_sqrt_alpha.dot(&y_mul_sqrt_alpha.t());
    for i in 0..window.dk.len() {
        out[[i, i]] += window.dk[i];
    }
    out
}

/// Dense form: explicit covariance H and its Cholesky.
pub(crate) fn construct_full(
    window: &HistoryWindow,
    alpha: &ArrayView1<'_, f64>,
    point_est: &ArrayView1<'_, f64>,
    grad_est: &ArrayView1<'_, f64>,
) -> Result<TaylorApprox, LinalgError> {
    let dims = alpha.len();
    let y_tcross = y_tcrossprod_alpha(window, alpha);
    let y_mul_alpha = &window.ykt * alpha;
    let mut hk = y_mul_alpha.t().dot(&window.ninv_rst)
        + window.ninv_rst.t().dot(&y_mul_alpha)
        + window
            .ninv_rst
            .t()
            .dot(&y_tcross.dot(&window.ninv_rst));
    for i in 0..dims {
        hk[[i, i]] += alpha[i];
    }
    let chol = hk.cholesky(Side::Lower)?;
    let l_approx = chol.upper_triangular();
    let log_det_chol_hk = chol.diag().mapv(|v| v.abs().ln()).sum();
    let x_center = point_est.to_owned() - hk.dot(grad_est);
    Ok(TaylorApprox {
        x_center,
        log_det_chol_hk,
        l_approx,
        qk: None,
        use_full: true,
    })
}

/// Sparse form: thin QR of the scaled update block and a small Cholesky.
pub(crate) fn construct_sparse(
    window: &HistoryWindow,
    alpha: &ArrayView1<'_, f64>,
    point_est: &ArrayView1<'_, f64>,
    grad_est: &ArrayView1<'_, f64>,
) -> Result<TaylorApprox, LinalgError> {
    let m = window.dk.len();
    let twice_m = 2 * m;
    let dims = alpha.len();
    let min_size = dims.min(twice_m);

    let y_mul_sqrt_alpha = &window.ykt * &alpha.mapv(f64::sqrt);
    let inv_sqrt_alpha = alpha.mapv(|a| 1.0 / a.sqrt());
    let mut wkbart = Array2::<f64>::zeros((twice_m, dims));
    wkbart.slice_mut(s![..m, ..]).assign(&y_mul_sqrt_alpha);
    wkbart
        .slice_mut(s![m.., ..])
        .assign(&(&window.ninv_rst * &inv_sqrt_alpha));

    let y_tcross = y_tcrossprod_alpha(window, alpha);
    let mut mkbar = Array2::<f64>::zeros((twice_m, twice_m));
    for i in 0..m {
        mkbar[[i, m + i]] = 1.0;
        mkbar[[m + i, i]] = 1.0;
    }
    mkbar.slice_mut(s![m.., m..]).assign(&y_tcross);

    let (qk, rkbar) = wkbart.reversed_axes().thin_qr();
    let mut inner = rkbar.dot(&mkbar).dot(&rkbar.t());
    for i in 0..min_size {
        inner[[i, i]] += 1.0;
    }
    let chol = inner.cholesky(Side::Lower)?;
    let l_approx = chol.upper_triangular();
    let log_det_chol_hk =
        chol.diag().mapv(|v| v.abs().ln()).sum() + 0.5 * alpha.mapv(f64::ln).sum();

    let ninv_rst_g = window.ninv_rst.dot(grad_est);
    let alpha_mul_grad = alpha.to_owned() * grad_est;
    let x_center = point_est.to_owned()
        - (&alpha_mul_grad
            + &(alpha.to_owned() * &window.ykt.t().dot(&ninv_rst_g))
            + &window.ninv_rst.t().dot(&window.ykt.dot(&alpha_mul_grad))
            + &window.ninv_rst.t().dot(&y_tcross.dot(&ninv_rst_g)));
    Ok(TaylorApprox {
        x_center,
        log_det_chol_hk,
        l_approx,
        qk: Some(qk),
        use_full: false,
    })
}

/// Build the surrogate for one iterate, picking the form by dimension.
pub fn construct_taylor(
    window: &HistoryWindow,
    alpha: &ArrayView1<'_, f64>,
    point_est: &ArrayView1<'_, f64>,
    grad_est: &ArrayView1<'_, f64>,
) -> Result<TaylorApprox, LinalgError> {
    if 2 * window.dk.len() >= alpha.len() {
        construct_full(window, alpha, point_est, grad_est)
    } else {
        construct_sparse(window, alpha, point_est, grad_est)
    }
}

/// Map a block of standard-normal columns through the surrogate.
pub fn gen_draws(
    u: &ArrayView2<'_, f64>,
    approx: &TaylorApprox,
    alpha: &ArrayView1<'_, f64>,
) -> Array2<f64> {
    let center = approx.x_center.view().insert_axis(Axis(1));
    if approx.use_full {
        approx.l_approx.t().dot(u) + &center
    } else {
        let qk = approx.qk.as_ref().expect("sparse surrogate carries Qk");
        let u1 = qk.t().dot(u);
        let corrected = qk.dot(&approx.l_approx.t().dot(&u1)) + (u.to_owned() - qk.dot(&u1));
        let sqrt_alpha = alpha.mapv(f64::sqrt);
        corrected * &sqrt_alpha.insert_axis(Axis(1)) + &center
    }
}

/// Map a single standard-normal vector through the surrogate.
pub fn gen_draw(
    u: &ArrayView1<'_, f64>,
    approx: &TaylorApprox,
    alpha: &ArrayView1<'_, f64>,
) -> Array1<f64> {
    if approx.use_full {
        approx.l_approx.t().dot(u) + &approx.x_center
    } else {
        let qk = approx.qk.as_ref().expect("sparse surrogate carries Qk");
        let u1 = qk.t().dot(u);
        let corrected = qk.dot(&approx.l_approx.t().dot(&u1)) + (u.to_owned() - qk.dot(&u1));
        let sqrt_alpha = alpha.mapv(f64::sqrt);
        corrected * &sqrt_alpha + &approx.x_center
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curvature::{alpha_cascade, check_curve};
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, StandardNormal};

    /// Synthetic optimizer trace on a well-conditioned quadratic bowl.
    fn synthetic_history(dims: usize, steps: usize, seed: u64) -> (Array2<f64>, Array2<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let scales: Vec<f64> = (0..dims).map(|i| 1.0 + i as f64 * 0.5).collect();
        let mut x = Array1::from_shape_fn(dims, |_| {
            let z: f64 = StandardNormal.sample(&mut rng);
            2.0 * z
        });
        let grad_of = |x: &Array1<f64>| Array1::from_shape_fn(dims, |i| x[i] / scales[i]);
        let mut ykt = Array2::<f64>::zeros((dims, steps));
        let mut skt = Array2::<f64>::zeros((dims, steps));
        let mut g = grad_of(&x);
        for t in 0..steps {
            let step = g.mapv(|v| -0.5 * v);
            let x_next = &x + &step;
            let g_next = grad_of(&x_next);
            ykt.column_mut(t).assign(&(&g_next - &g));
            skt.column_mut(t).assign(&step);
            x = x_next;
            g = g_next;
        }
        (ykt, skt)
    }

    fn implied_covariance(approx: &TaylorApprox, alpha: &ArrayView1<'_, f64>) -> Array2<f64> {
        let dims = approx.x_center.len();
        let eye = Array2::<f64>::eye(dims);
        let mapped = gen_draws(&eye.view(), approx, alpha);
        let centered = mapped - &approx.x_center.view().insert_axis(Axis(1));
        centered.dot(&centered.t())
    }

    #[test]
    fn dense_and_sparse_forms_agree() {
        let dims = 6;
        let steps = 2; // 2m = 4 < 6: the dispatcher would go sparse.
        let (ykt, skt) = synthetic_history(dims, steps, 99);
        let mut mask = check_curve(&ykt.view(), &skt.view());
        assert!(mask.iter().all(|&c| c), "quadratic history must pass screen");
        let alpha_mat = alpha_cascade(&ykt.view(), &skt.view(), &mut mask);
        let alpha = alpha_mat.column(steps - 1);
        let window = assemble_window(&ykt.view(), &skt.view(), &mask, steps - 1, 6);
        let point = Array1::from_elem(dims, 0.3);
        let grad = Array1::from_shape_fn(dims, |i| 0.1 * (i as f64 + 1.0));

        let full = construct_full(&window, &alpha, &point.view(), &grad.view()).unwrap();
        let sparse = construct_sparse(&window, &alpha, &point.view(), &grad.view()).unwrap();

        assert!(full.use_full && !sparse.use_full);
        assert!(
            (full.log_det_chol_hk - sparse.log_det_chol_hk).abs() < 1e-8,
            "log|L_H| mismatch: {} vs {}",
            full.log_det_chol_hk,
            sparse.log_det_chol_hk
        );
        for i in 0..dims {
            assert!(
                (full.x_center[i] - sparse.x_center[i]).abs() < 1e-8,
                "x_center[{i}] mismatch: {} vs {}",
                full.x_center[i],
                sparse.x_center[i]
            );
        }
        let cov_full = implied_covariance(&full, &alpha);
        let cov_sparse = implied_covariance(&sparse, &alpha);
        for i in 0..dims {
            for j in 0..dims {
                assert!(
                    (cov_full[[i, j]] - cov_sparse[[i, j]]).abs() < 1e-8,
                    "covariance mismatch at ({i},{j})"
                );
            }
        }
    }

    #[test]
    fn selection_threshold_is_inclusive_and_forms_match_there() {
        let dims = 4;
        let steps = 2; // 2m = 4 = d: dense by the inclusive rule.
        let (ykt, skt) = synthetic_history(dims, steps, 7);
        let mut mask = check_curve(&ykt.view(), &skt.view());
        let alpha_mat = alpha_cascade(&ykt.view(), &skt.view(), &mut mask);
        let alpha = alpha_mat.column(steps - 1);
        let window = assemble_window(&ykt.view(), &skt.view(), &mask, steps - 1, 6);
        let point = Array1::zeros(dims);
        let grad = Array1::from_elem(dims, 0.25);

        let chosen = construct_taylor(&window, &alpha, &point.view(), &grad.view()).unwrap();
        assert!(chosen.use_full, "2m = d must select the dense form");

        let sparse = construct_sparse(&window, &alpha, &point.view(), &grad.view()).unwrap();
        assert_abs_diff_eq!(
            chosen.log_det_chol_hk,
            sparse.log_det_chol_hk,
            epsilon = 1e-8
        );
        for i in 0..dims {
            assert_abs_diff_eq!(chosen.x_center[i], sparse.x_center[i], epsilon = 1e-8);
        }
    }

    #[test]
    fn dense_factor_is_upper_with_positive_diagonal() {
        let dims = 3;
        let (ykt, skt) = synthetic_history(dims, 2, 3);
        let mut mask = check_curve(&ykt.view(), &skt.view());
        let alpha_mat = alpha_cascade(&ykt.view(), &skt.view(), &mut mask);
        let alpha = alpha_mat.column(1);
        let window = assemble_window(&ykt.view(), &skt.view(), &mask, 1, 6);
        let point = Array1::zeros(dims);
        let grad = Array1::zeros(dims);
        let approx = construct_taylor(&window, &alpha, &point.view(), &grad.view()).unwrap();
        assert!(approx.use_full);
        let l = &approx.l_approx;
        let mut diag_log_sum = 0.0;
        for i in 0..dims {
            assert!(l[[i, i]] > 0.0);
            diag_log_sum += l[[i, i]].ln();
            for j in 0..i {
                assert_eq!(l[[i, j]], 0.0);
            }
        }
        assert!((diag_log_sum - approx.log_det_chol_hk).abs() < 1e-12);
    }

    #[test]
    fn window_respects_history_cap_and_mask() {
        let dims = 3;
        let (ykt, skt) = synthetic_history(dims, 5, 11);
        let mut mask = vec![true; 5];
        mask[3] = false;
        let window = assemble_window(&ykt.view(), &skt.view(), &mask, 4, 2);
        // Walking back from 4: takes 4, skips 3, takes 2, then hits the cap.
        assert_eq!(window.dk.len(), 2);
        assert!((window.dk[0] - ykt.column(4).dot(&skt.column(4))).abs() < 1e-14);
        assert!((window.dk[1] - ykt.column(2).dot(&skt.column(2))).abs() < 1e-14);
    }

    #[test]
    fn single_pair_window_matches_direct_formula() {
        // With one accepted pair, R = s·y and ninvRST = −sᵀ/(s·y).
        let ykt = array![[1.0], [2.0]];
        let skt = array![[0.5], [0.5]];
        let window = assemble_window(&ykt.view(), &skt.view(), &[true], 0, 6);
        let sy = 1.5;
        assert!((window.dk[0] - sy).abs() < 1e-14);
        assert!((window.ninv_rst[[0, 0]] - (-0.5 / sy)).abs() < 1e-14);
        assert!((window.ninv_rst[[0, 1]] - (-0.5 / sy)).abs() < 1e-14);
    }
}
