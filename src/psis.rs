//! Pareto-smoothed importance sampling weights.
//!
//! Raw importance ratios from a variational proposal can have a heavy right
//! tail. The stabilization fits a generalized Pareto distribution to the
//! largest log-ratios (Zhang & Stephens 2009 profile fit, with the
//! weakly-informative shape prior of Vehtari et al.), replaces those tail
//! values by their order-statistic expectations under the fit, and
//! self-normalizes. Degenerate inputs are clamped, never rejected: the
//! routine always returns a weight vector summing to one.

use ndarray::{Array1, ArrayView1};

/// Diagnostic threshold on the fitted Pareto shape.
const KHAT_WARN_THRESHOLD: f64 = 0.7;
/// Tails shorter than this carry too little information to fit.
const MIN_TAIL_LENGTH: usize = 5;

/// Profile posterior-mean fit of a generalized Pareto to exceedances.
///
/// `x` must be ascending and strictly positive at the top. Returns the shape
/// k̂ (prior-adjusted) and scale σ̂.
fn gpd_fit(x: &[f64]) -> (f64, f64) {
    let n = x.len();
    let n_f = n as f64;
    let m = 30 + (n_f.sqrt().floor() as usize);
    let quart_idx = ((n_f / 4.0 + 0.5).floor() as usize).max(1) - 1;
    let x_quart = x[quart_idx];
    let x_max = x[n - 1];
    if !(x_max > 0.0) || !(x_quart > 0.0) {
        return (f64::NAN, f64::NAN);
    }

    let theta: Vec<f64> = (1..=m)
        .map(|j| 1.0 / x_max + (1.0 - (m as f64 / (j as f64 - 0.5)).sqrt()) / (3.0 * x_quart))
        .collect();
    let shape_at = |t: f64| -> f64 { x.iter().map(|&v| (-t * v).ln_1p()).sum::<f64>() / n_f };
    let profile: Vec<f64> = theta
        .iter()
        .map(|&t| {
            let k = shape_at(t);
            n_f * ((-t / k).ln() + k - 1.0)
        })
        .collect();

    // Posterior-mean θ under the profile likelihood.
    let mut theta_hat = 0.0;
    let mut weight_sum = 0.0;
    for j in 0..m {
        let w = 1.0
            / profile
                .iter()
                .map(|&l| (l - profile[j]).exp())
                .sum::<f64>();
        if w.is_finite() {
            theta_hat += theta[j] * w;
            weight_sum += w;
        }
    }
    if !(weight_sum > 0.0) {
        return (f64::NAN, f64::NAN);
    }
    theta_hat /= weight_sum;

    let k_hat = shape_at(theta_hat);
    let sigma = -k_hat / theta_hat;
    // Weakly-informative prior pulls the shape toward 0.5.
    let k_adjusted = (n_f * k_hat + 5.0) / (n_f + 10.0);
    (k_adjusted, sigma)
}

/// Inverse CDF of the generalized Pareto with location zero.
fn gpd_quantile(p: f64, k: f64, sigma: f64) -> f64 {
    if k.abs() < 1e-12 {
        -sigma * (1.0 - p).ln()
    } else {
        sigma * ((-k) * (1.0 - p).ln()).exp_m1() / k
    }
}

fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values
        .iter()
        .cloned()
        .filter(|v| v.is_finite())
        .fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return f64::NEG_INFINITY;
    }
    max + values
        .iter()
        .map(|&v| (v - max).exp())
        .sum::<f64>()
        .ln()
}

/// Normalized PSIS weights for a vector of log importance ratios.
///
/// `tail_len` values from the upper tail are smoothed when there are enough
/// of them and the tail has positive spread; otherwise the ratios are simply
/// exponentiated and normalized.
pub fn psis_weights(log_ratios: &ArrayView1<'_, f64>, tail_len: usize) -> Array1<f64> {
    let n = log_ratios.len();
    if n == 0 {
        return Array1::zeros(0);
    }
    let max_lr = log_ratios
        .iter()
        .cloned()
        .filter(|v| v.is_finite())
        .fold(f64::NEG_INFINITY, f64::max);
    if !max_lr.is_finite() {
        // Nothing usable: fall back to uniform resampling.
        log::warn!("PSIS: no finite log ratios, falling back to uniform weights");
        return Array1::from_elem(n, 1.0 / n as f64);
    }

    let mut lw: Vec<f64> = log_ratios.iter().map(|&v| v - max_lr).collect();

    if tail_len >= MIN_TAIL_LENGTH && tail_len < n {
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| lw[a].total_cmp(&lw[b]));
        let tail_start = n - tail_len;
        let cutoff = lw[order[tail_start - 1]];
        if cutoff.is_finite() {
            let exp_cutoff = cutoff.exp();
            let exceedances: Vec<f64> = order[tail_start..]
                .iter()
                .map(|&i| lw[i].exp() - exp_cutoff)
                .collect();
            let spread = exceedances[tail_len - 1] > 0.0;
            if spread {
                let (k_hat, sigma) = gpd_fit(&exceedances);
                if k_hat.is_finite() && sigma.is_finite() && sigma > 0.0 {
                    if k_hat > KHAT_WARN_THRESHOLD {
                        log::warn!(
                            "PSIS: Pareto shape k = {k_hat:.2} exceeds {KHAT_WARN_THRESHOLD}; \
                             importance sampling estimates are likely unstable"
                        );
                    }
                    for (j, &idx) in order[tail_start..].iter().enumerate() {
                        let p = (j as f64 + 0.5) / tail_len as f64;
                        let smoothed = (gpd_quantile(p, k_hat, sigma) + exp_cutoff).ln();
                        // Truncate at the observed maximum (zero after centering).
                        lw[idx] = smoothed.min(0.0);
                    }
                }
            }
        }
    }

    let lse = log_sum_exp(&lw);
    Array1::from_iter(lw.into_iter().map(|v| (v - lse).exp()))
}
