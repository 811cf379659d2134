//! Monte Carlo ELBO scoring and draw generation for one surrogate.
//!
//! Pathological constrained-to-unconstrained transforms produce isolated
//! non-finite log densities; throwing away a whole surrogate over a handful
//! of them would waste optimizer work, so every candidate draw gets its own
//! bounded retry budget and only exhausted samples are dropped.

use crate::model::ModelError;
use crate::taylor::{gen_draw, gen_draws, TaylorApprox};
use ndarray::{Array1, Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ElboError {
    #[error(
        "{iter_msg}approximate sampling produced no draw with a finite log density \
         after {attempts} attempts per sample"
    )]
    AllDrawsRejected {
        iter_msg: String,
        attempts: usize,
        fn_calls: usize,
    },
    #[error("{iter_msg}approximate sampling failed to evaluate any draw: {source}")]
    ProbeFailed {
        iter_msg: String,
        source: ModelError,
        fn_calls: usize,
    },
}

impl ElboError {
    /// Log-density invocations spent before the failure surfaced.
    pub fn fn_calls(&self) -> usize {
        match self {
            ElboError::AllDrawsRejected { fn_calls, .. }
            | ElboError::ProbeFailed { fn_calls, .. } => *fn_calls,
        }
    }
}

/// Result of scoring one surrogate with K draws.
#[derive(Debug, Clone)]
pub struct ElboEstimate {
    /// Mean of `lp_ratio`, or −∞ when the ELBO was not requested.
    pub elbo: f64,
    /// Every log-density invocation, including failed retries and the probe.
    pub fn_calls: usize,
    /// Surviving draws, one column each (d × K').
    pub repeat_draws: Array2<f64>,
    /// Per-draw (log q, log p) rows (K' × 2).
    pub lp_mat: Array2<f64>,
    /// log p − log q per surviving draw.
    pub lp_ratio: Array1<f64>,
}

impl Default for ElboEstimate {
    fn default() -> Self {
        Self {
            elbo: f64::NEG_INFINITY,
            fn_calls: 0,
            repeat_draws: Array2::zeros((0, 0)),
            lp_mat: Array2::zeros((0, 2)),
            lp_ratio: Array1::zeros(0),
        }
    }
}

fn fill_standard_normal(rng: &mut StdRng, len: usize) -> Array1<f64> {
    Array1::from_shape_fn(len, |_| rng.sample(StandardNormal))
}

/// Draw `num_samples` candidates from the surrogate, evaluate the target log
/// density with per-sample retries, and compact to the finite subset.
///
/// With `return_elbo` the mean log ratio is reported; the final top-up call
/// leaves it at −∞.
#[allow(clippy::too_many_arguments)]
pub fn estimate_approx_draws<F>(
    lp_fun: &F,
    rng: &mut StdRng,
    approx: &TaylorApprox,
    num_samples: usize,
    alpha: &ArrayView1<'_, f64>,
    num_eval_attempts: usize,
    iter_msg: &str,
    return_elbo: bool,
) -> Result<ElboEstimate, ElboError>
where
    F: Fn(&ArrayView1<'_, f64>) -> Result<f64, ModelError>,
{
    let dims = approx.x_center.len();
    let mut fn_calls = 0usize;
    let mut u_mat = Array2::from_shape_fn((dims, num_samples), |_| rng.sample(StandardNormal));
    let mut draws = gen_draws(&u_mat.view(), approx, alpha);
    let mut lp_vals = Array1::from_elem(num_samples, f64::NEG_INFINITY);
    let mut at_least_one_failed = false;
    let mut last_error: Option<ModelError> = None;

    for i in 0..num_samples {
        for attempt in 0..=num_eval_attempts {
            fn_calls += 1;
            let outcome = lp_fun(&draws.column(i));
            match outcome {
                Ok(lp) if lp.is_finite() => {
                    lp_vals[i] = lp;
                    break;
                }
                Ok(_) => {}
                Err(e) => last_error = Some(e),
            }
            if attempt == num_eval_attempts {
                at_least_one_failed = true;
            } else {
                let fresh = fill_standard_normal(rng, dims);
                draws
                    .column_mut(i)
                    .assign(&gen_draw(&fresh.view(), approx, alpha));
                u_mat.column_mut(i).assign(&fresh);
            }
        }
    }

    let (u_kept, draws_kept, lp_kept) = if at_least_one_failed {
        let success: Vec<usize> = (0..num_samples).filter(|&i| lp_vals[i].is_finite()).collect();
        if success.is_empty() {
            // One probe decides between an empty estimate and a hard failure
            // for this iterate.
            fn_calls += 1;
            match lp_fun(&draws.column(0)) {
                Ok(lp) if lp.is_finite() => {}
                Ok(_) => {
                    return Err(ElboError::AllDrawsRejected {
                        iter_msg: iter_msg.to_string(),
                        attempts: num_eval_attempts,
                        fn_calls,
                    });
                }
                Err(e) => {
                    return Err(ElboError::ProbeFailed {
                        iter_msg: iter_msg.to_string(),
                        source: last_error.unwrap_or(e),
                        fn_calls,
                    });
                }
            }
            (
                Array2::zeros((dims, 0)),
                Array2::zeros((dims, 0)),
                Array1::zeros(0),
            )
        } else {
            let kept = success.len();
            let mut u_kept = Array2::zeros((dims, kept));
            let mut draws_kept = Array2::zeros((dims, kept));
            let mut lp_kept = Array1::zeros(kept);
            for (j, &i) in success.iter().enumerate() {
                u_kept.column_mut(j).assign(&u_mat.column(i));
                draws_kept.column_mut(j).assign(&draws.column(i));
                lp_kept[j] = lp_vals[i];
            }
            (u_kept, draws_kept, lp_kept)
        }
    } else {
        (u_mat, draws, lp_vals)
    };

    let kept = lp_kept.len();
    let log_two_pi = (2.0 * std::f64::consts::PI).ln();
    let mut lp_mat = Array2::<f64>::zeros((kept, 2));
    for i in 0..kept {
        let u_sq = u_kept.column(i).dot(&u_kept.column(i));
        lp_mat[[i, 0]] = -approx.log_det_chol_hk - 0.5 * (u_sq + dims as f64 * log_two_pi);
        lp_mat[[i, 1]] = lp_kept[i];
    }
    let lp_ratio = Array1::from_shape_fn(kept, |i| lp_mat[[i, 1]] - lp_mat[[i, 0]]);
    let elbo = if return_elbo && kept > 0 {
        lp_ratio.sum() / kept as f64
    } else {
        f64::NEG_INFINITY
    };
    Ok(ElboEstimate {
        elbo,
        fn_calls,
        repeat_draws: draws_kept,
        lp_mat,
        lp_ratio,
    })
}
