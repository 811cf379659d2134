//! One pathfinder trajectory: optimize, score every iterate's surrogate,
//! and draw from the best one.
//!
//! The trajectory owns everything it touches. Iterate and gradient histories
//! live for the duration of the path; each surrogate lives only for its ELBO
//! evaluation except the winner, which survives to feed the final draw
//! generation. Only the returned draws and log ratios cross the multi-path
//! boundary.

use crate::config::PathfinderConfig;
use crate::curvature::{alpha_cascade, check_curve};
use crate::elbo::{estimate_approx_draws, ElboEstimate};
use crate::lbfgs::{code_string, LbfgsDriver, LbfgsOptions, TERM_CONTINUE, TERM_LS_FAIL};
use crate::model::{ErrorCode, InitContext, Interrupt, LogDensityModel, ModelError};
use crate::output::OutputWriter;
use crate::rng::path_stream;
use crate::taylor::{assemble_window, construct_taylor, TaylorApprox};
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::Rng;
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use thiserror::Error;

const MAX_INIT_TRIES: usize = 100;

#[derive(Debug, Error)]
pub enum SinglePathError {
    #[error(
        "Path: [{path}] initialization failed: no finite log density and gradient \
         after {tries} attempts"
    )]
    Initialization { path: u32, tries: usize },
    #[error("Path: [{path}] optimization failed to start; the trajectory has no usable step")]
    OptimizationFailedToStart { path: u32 },
    #[error("Path: [{path}] no iteration produced a usable ELBO estimate")]
    NoViableIterate { path: u32 },
    #[error("Path: [{path}] constrain transform failed: {source}")]
    ConstrainFailed { path: u32, source: ModelError },
}

impl SinglePathError {
    pub fn error_code(&self) -> ErrorCode {
        ErrorCode::Software
    }
}

/// Survivor of one trajectory.
#[derive(Debug)]
pub struct SinglePathOutput {
    /// log p − log q per returned draw.
    pub lp_ratio: Array1<f64>,
    /// Constrained draws, one per column; the last two rows are log q and
    /// log p of the unconstrained draw.
    pub draws: Array2<f64>,
    /// Every log-density and gradient evaluation spent on this path.
    pub fn_calls: usize,
}

struct BestIterate {
    elbo_est: ElboEstimate,
    approx: TaylorApprox,
    iter: usize,
}

fn initialize<M, C>(
    model: &M,
    init: &C,
    rng: &mut StdRng,
    radius: f64,
    path: u32,
) -> Result<(Array1<f64>, Array1<f64>, f64), SinglePathError>
where
    M: LogDensityModel,
    C: InitContext,
{
    let dims = model.dims();
    let mut grad = Array1::zeros(dims);
    if let Some(x0) = init.unconstrained(dims) {
        if let Ok(lp) = model.log_prob_grad(&x0.view(), &mut grad) {
            if lp.is_finite() && grad.iter().all(|v| v.is_finite()) {
                return Ok((x0, grad, lp));
            }
        }
        return Err(SinglePathError::Initialization { path, tries: 1 });
    }
    for _ in 0..MAX_INIT_TRIES {
        let x0 = Array1::from_shape_fn(dims, |_| rng.random_range(-radius..=radius));
        match model.log_prob_grad(&x0.view(), &mut grad) {
            Ok(lp) if lp.is_finite() && grad.iter().all(|v| v.is_finite()) => {
                return Ok((x0, grad, lp));
            }
            Ok(_) => {}
            Err(e) => {
                log::debug!("Path: [{path}] rejected initial point: {e}");
            }
        }
    }
    Err(SinglePathError::Initialization {
        path,
        tries: MAX_INIT_TRIES,
    })
}

/// Objective surrogate for points the model cannot evaluate: a barrier cost
/// far above any real value plus a steering gradient that points the line
/// search back toward the feasible region.
fn invalid_objective_sample(x: &Array1<f64>) -> (f64, Array1<f64>) {
    const COST_BARRIER: f64 = 1e50;
    const GRAD_SCALE: f64 = 1e6;

    let mut grad = x.clone();
    for g in grad.iter_mut() {
        if !g.is_finite() || g.abs() < 1e-6 {
            *g = 1.0;
        }
    }
    grad *= GRAD_SCALE;
    (COST_BARRIER + 0.5 * x.dot(x), grad)
}

fn constrain_draws<M: LogDensityModel>(
    model: &M,
    rng: &mut StdRng,
    draws: &ArrayView2<'_, f64>,
    lp_mat: &ArrayView2<'_, f64>,
    num_rows: usize,
) -> Result<Array2<f64>, ModelError> {
    let num_constrained = num_rows - 2;
    let total = draws.ncols();
    let mut out = Array2::<f64>::zeros((num_rows, total));
    let mut constrained = Array1::<f64>::zeros(num_constrained);
    for i in 0..total {
        model.write_array(rng, &draws.column(i), &mut constrained)?;
        out.slice_mut(s![..num_constrained, i]).assign(&constrained);
        out[[num_rows - 2, i]] = lp_mat[[i, 0]];
        out[[num_rows - 1, i]] = lp_mat[[i, 1]];
    }
    Ok(out)
}

fn log_progress<F>(path_tag: &str, driver: &LbfgsDriver<F>)
where
    F: Fn(&Array1<f64>) -> (f64, Array1<f64>),
{
    log::info!(
        "{path_tag}    Iter      log prob        ||dx||      ||grad||       alpha      alpha0  # evals  Notes"
    );
    let g_norm = driver.curr_g().dot(driver.curr_g()).sqrt();
    log::info!(
        "{path_tag} {:>7} {:>13.6e} {:>13.6e} {:>13.6e} {:>11.4e} {:>11.4e} {:>8}  {}",
        driver.iter_num(),
        driver.logp(),
        driver.prev_step_size(),
        g_norm,
        driver.alpha(),
        driver.alpha0(),
        driver.grad_evals(),
        driver.note()
    );
}

/// Run one pathfinder trajectory.
///
/// Returns the surviving draws and their log ratios, or a SOFTWARE-class
/// error when the path produced nothing usable. Per-iterate failures inside
/// the ELBO search are logged and skipped, never fatal.
#[allow(clippy::too_many_arguments)]
pub fn pathfinder_single<M, C, I>(
    model: &M,
    init: &C,
    random_seed: u32,
    path: u32,
    config: &PathfinderConfig,
    interrupt: &I,
    init_writer: &mut dyn OutputWriter,
    parameter_writer: &mut dyn OutputWriter,
    diagnostic_writer: &mut dyn OutputWriter,
) -> Result<SinglePathOutput, SinglePathError>
where
    M: LogDensityModel,
    C: InitContext,
    I: Interrupt,
{
    let start_optim_time = Instant::now();
    let path_tag = format!("Path: [{path}] ");
    let dims = model.dims();
    let mut rng = path_stream(random_seed, u64::from(path));

    let (x0, _g0, lp0) = initialize(model, init, &mut rng, config.init_radius, path)?;
    init_writer.column(&x0.view());

    let mut names = model.constrained_param_names(true, true);
    names.push("lp_approx__".to_string());
    names.push("lp__".to_string());
    parameter_writer.names(&names);
    if config.refresh != 0 {
        log::info!("{path_tag}Initial log joint density = {lp0:.6}");
    }

    let obj_fn = |x: &Array1<f64>| -> (f64, Array1<f64>) {
        let mut grad = Array1::zeros(dims);
        match model.log_prob_grad(&x.view(), &mut grad) {
            Ok(lp) if lp.is_finite() && grad.iter().all(|v| v.is_finite()) => {
                (-lp, grad.mapv(|v| -v))
            }
            Ok(_) => invalid_objective_sample(x),
            Err(e) => {
                log::debug!("gradient evaluation rejected, steering back: {e}");
                invalid_objective_sample(x)
            }
        }
    };
    let lbfgs_opts = LbfgsOptions {
        init_alpha: config.init_alpha,
        max_iters: config.max_lbfgs_iters,
        tol_obj: config.tol_obj,
        tol_rel_obj: config.tol_rel_obj,
        tol_grad: config.tol_grad,
        tol_rel_grad: config.tol_rel_grad,
        tol_param: config.tol_param,
        history_size: config.history_size,
    };
    let mut driver = LbfgsDriver::new(x0.clone(), obj_fn, lbfgs_opts);

    let mut param_vecs: Vec<Array1<f64>> = Vec::with_capacity(config.max_lbfgs_iters + 1);
    let mut grad_vecs: Vec<Array1<f64>> = Vec::with_capacity(config.max_lbfgs_iters + 1);
    // Histories carry the gradient of the minimized objective -log p; the
    // curvature screen and the Newton recentering x - H·g both assume it.
    param_vecs.push(x0);
    grad_vecs.push(driver.curr_g().clone());
    if config.save_iterations {
        let mut record = param_vecs[0].to_vec();
        record.extend(grad_vecs[0].iter());
        diagnostic_writer.column(&Array1::from_vec(record).view());
    }

    let mut ret = TERM_CONTINUE;
    while ret == TERM_CONTINUE {
        if interrupt.interrupted() {
            log::info!("{path_tag}optimization interrupted, continuing with current trajectory");
            break;
        }
        ret = driver.step();
        if config.refresh > 0
            && (ret != TERM_CONTINUE
                || !driver.note().is_empty()
                || driver.iter_num() == 1
                || driver.iter_num() % config.refresh == 0)
        {
            log_progress(&path_tag, &driver);
        }
        // A hard line-search failure leaves the iterate unchanged; recording
        // it would duplicate the previous history entry.
        if ret != TERM_LS_FAIL {
            param_vecs.push(driver.curr_x().clone());
            grad_vecs.push(driver.curr_g().clone());
            if config.save_iterations {
                let mut record = driver.curr_x().to_vec();
                record.extend(driver.curr_g().iter());
                diagnostic_writer.column(&Array1::from_vec(record).view());
            }
        }
    }

    if ret >= 0 {
        log::info!(
            "{path_tag}optimization terminated normally: {}",
            code_string(ret)
        );
    } else {
        log::info!(
            "{path_tag}optimization terminated with error: {}",
            code_string(ret)
        );
        if param_vecs.len() == 1 {
            log::info!("{path_tag}optimization failed to start, the path cannot continue");
            return Err(SinglePathError::OptimizationFailedToStart { path });
        }
        log::info!(
            "{path_tag}continuing from the partial trajectory; results may be degraded"
        );
    }
    let diff_size = param_vecs.len() - 1;
    if diff_size == 0 {
        return Err(SinglePathError::OptimizationFailedToStart { path });
    }
    let optim_seconds = start_optim_time.elapsed().as_secs_f64();
    let start_pathfinder_time = Instant::now();

    let mut ykt_diff = Array2::<f64>::zeros((dims, diff_size));
    let mut skt_diff = Array2::<f64>::zeros((dims, diff_size));
    for i in 0..diff_size {
        ykt_diff
            .column_mut(i)
            .assign(&(&grad_vecs[i + 1] - &grad_vecs[i]));
        skt_diff
            .column_mut(i)
            .assign(&(&param_vecs[i + 1] - &param_vecs[i]));
    }
    let mut mask = check_curve(&ykt_diff.view(), &skt_diff.view());
    let alpha_mat = alpha_cascade(&ykt_diff.view(), &skt_diff.view(), &mut mask);
    // The first surrogate always participates in the search.
    mask[0] = true;

    let num_evals = AtomicUsize::new(driver.grad_evals());
    let best: Mutex<Option<BestIterate>> = Mutex::new(None);
    let lp_fun = |x: &ArrayView1<'_, f64>| model.log_prob(x);

    (0..diff_size).into_par_iter().for_each(|iter| {
        let iter_msg = format!("{path_tag}Iter: [{iter}] ");
        let alpha = alpha_mat.column(iter);
        let window = assemble_window(
            &ykt_diff.view(),
            &skt_diff.view(),
            &mask,
            iter,
            config.history_size,
        );
        let approx = match construct_taylor(
            &window,
            &alpha,
            &param_vecs[iter + 1].view(),
            &grad_vecs[iter + 1].view(),
        ) {
            Ok(approx) => approx,
            Err(e) => {
                log::warn!("{iter_msg}surrogate construction failed, skipping: {e}");
                return;
            }
        };
        let mut task_rng = path_stream(random_seed, u64::from(path) + 1 + iter as u64);
        match estimate_approx_draws(
            &lp_fun,
            &mut task_rng,
            &approx,
            config.num_elbo_draws,
            &alpha,
            config.num_eval_attempts,
            &iter_msg,
            true,
        ) {
            Ok(est) => {
                num_evals.fetch_add(est.fn_calls, Ordering::Relaxed);
                if config.refresh > 0 && (iter == 0 || iter % config.refresh == 0) {
                    log::info!("{iter_msg}ELBO ({:.5})", est.elbo);
                }
                let mut guard = match best.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                let improves = guard.as_ref().map_or(
                    est.elbo > f64::NEG_INFINITY,
                    |current| est.elbo > current.elbo_est.elbo,
                );
                if improves {
                    *guard = Some(BestIterate {
                        elbo_est: est,
                        approx,
                        iter,
                    });
                }
            }
            Err(e) => {
                num_evals.fetch_add(e.fn_calls(), Ordering::Relaxed);
                log::warn!("{iter_msg}ELBO estimation failed, skipping: {e}");
            }
        }
    });

    let best = match best.into_inner() {
        Ok(inner) => inner,
        Err(poisoned) => poisoned.into_inner(),
    };
    let best = match best {
        Some(best) => best,
        None => {
            log::warn!("{path_tag}none of the iterations completed successfully");
            return Err(SinglePathError::NoViableIterate { path });
        }
    };
    if config.refresh != 0 {
        log::info!(
            "{path_tag}Best Iter: [{}] ELBO ({:.5}) evaluations: ({})",
            best.iter,
            best.elbo_est.elbo,
            num_evals.load(Ordering::Relaxed)
        );
    }

    let alpha_best = alpha_mat.column(best.iter);
    let elbo_draws = &best.elbo_est.repeat_draws;
    let elbo_lp_mat = &best.elbo_est.lp_mat;
    let remaining = config.num_draws.saturating_sub(best.elbo_est.lp_ratio.len());

    let mut lp_ratio = best.elbo_est.lp_ratio.clone();
    let mut constrained: Option<Array2<f64>> = None;
    if remaining > 0 {
        // The path stream is threaded through the top-up so single- and
        // multi-threaded runs agree on the final draw block.
        let topped_up = estimate_approx_draws(
            &lp_fun,
            &mut rng,
            &best.approx,
            remaining,
            &alpha_best,
            config.num_eval_attempts,
            &path_tag,
            false,
        );
        match topped_up {
            Ok(est) => {
                num_evals.fetch_add(est.fn_calls, Ordering::Relaxed);
                let total = elbo_draws.ncols() + est.repeat_draws.ncols();
                let mut all_draws = Array2::<f64>::zeros((dims, total));
                all_draws
                    .slice_mut(s![.., ..elbo_draws.ncols()])
                    .assign(elbo_draws);
                all_draws
                    .slice_mut(s![.., elbo_draws.ncols()..])
                    .assign(&est.repeat_draws);
                let mut all_lp_mat = Array2::<f64>::zeros((total, 2));
                all_lp_mat
                    .slice_mut(s![..elbo_draws.ncols(), ..])
                    .assign(elbo_lp_mat);
                all_lp_mat
                    .slice_mut(s![elbo_draws.ncols().., ..])
                    .assign(&est.lp_mat);
                match constrain_draws(
                    model,
                    &mut rng,
                    &all_draws.view(),
                    &all_lp_mat.view(),
                    names.len(),
                ) {
                    Ok(mat) => {
                        let mut combined =
                            Array1::zeros(lp_ratio.len() + est.lp_ratio.len());
                        combined
                            .slice_mut(s![..lp_ratio.len()])
                            .assign(&lp_ratio);
                        combined
                            .slice_mut(s![lp_ratio.len()..])
                            .assign(&est.lp_ratio);
                        lp_ratio = combined;
                        constrained = Some(mat);
                    }
                    Err(e) => {
                        log::warn!("{path_tag}final draw constrain failed: {e}");
                        log::warn!(
                            "{path_tag}returning the approximate draws used for the ELBO \
                             calculation"
                        );
                    }
                }
            }
            Err(e) => {
                num_evals.fetch_add(e.fn_calls(), Ordering::Relaxed);
                log::warn!("{path_tag}final draw generation failed: {e}");
                log::warn!(
                    "{path_tag}returning the approximate draws used for the ELBO calculation"
                );
            }
        }
    }
    let constrained = match constrained {
        Some(mat) => mat,
        None => constrain_draws(
            model,
            &mut rng,
            &elbo_draws.view(),
            &elbo_lp_mat.view(),
            names.len(),
        )
        .map_err(|source| SinglePathError::ConstrainFailed { path, source })?,
    };

    parameter_writer.matrix(&constrained.view());
    let pathfinder_seconds = start_pathfinder_time.elapsed().as_secs_f64();
    let time_header = "Elapsed Time: ";
    parameter_writer.blank();
    parameter_writer.note(&format!("{time_header}{optim_seconds:.6} seconds (lbfgs)"));
    parameter_writer.note(&format!(
        "{}{pathfinder_seconds:.6} seconds (Pathfinder)",
        " ".repeat(time_header.len())
    ));
    parameter_writer.note(&format!(
        "{}{:.6} seconds (Total)",
        " ".repeat(time_header.len()),
        optim_seconds + pathfinder_seconds
    ));
    parameter_writer.blank();

    debug_assert_eq!(lp_ratio.len(), constrained.ncols());
    Ok(SinglePathOutput {
        lp_ratio,
        draws: constrained,
        fn_calls: num_evals.load(Ordering::Relaxed),
    })
}
