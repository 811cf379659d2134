//! Step-wise limited-memory BFGS driver with a Strong Wolfe line search.
//!
//! The driver minimizes f(x) = −log p(x) one `step()` at a time and exposes
//! the current iterate, gradient, and a termination code after every call,
//! so the caller can record the full trajectory. Line search follows
//! Nocedal & Wright (Algorithms 3.5/3.6): bracketing with doubling,
//! interpolation zoom, and a backtracking Armijo fallback. Model evaluation
//! failures surface as +∞ objective values, which the search treats as
//! non-finite territory and backs away from.

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Hard line-search failure; the iterate is unchanged.
pub const TERM_LS_FAIL: i32 = -1;
/// Keep stepping.
pub const TERM_CONTINUE: i32 = 0;
pub const TERM_ABS_PARAM: i32 = 1;
pub const TERM_ABS_OBJ: i32 = 2;
pub const TERM_REL_OBJ: i32 = 3;
pub const TERM_ABS_GRAD: i32 = 4;
pub const TERM_REL_GRAD: i32 = 5;
pub const TERM_MAX_ITERS: i32 = 6;

/// Human-readable form of a termination code.
pub fn code_string(code: i32) -> &'static str {
    match code {
        TERM_LS_FAIL => "line search failed to find a suitable step",
        TERM_CONTINUE => "optimization in progress",
        TERM_ABS_PARAM => "convergence: change in parameters below tolerance",
        TERM_ABS_OBJ => "convergence: absolute change in objective below tolerance",
        TERM_REL_OBJ => "convergence: relative change in objective below tolerance",
        TERM_ABS_GRAD => "convergence: gradient norm below tolerance",
        TERM_REL_GRAD => "convergence: relative gradient magnitude below tolerance",
        TERM_MAX_ITERS => "maximum number of iterations reached",
        _ => "unknown termination code",
    }
}

const WOLFE_C1: f64 = 1e-4;
const WOLFE_C2: f64 = 0.9;
const MAX_BRACKET_ATTEMPTS: usize = 20;
const MAX_ZOOM_ATTEMPTS: usize = 15;
const MAX_BACKTRACK_ATTEMPTS: usize = 40;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbfgsOptions {
    /// Step size tried on the very first iteration.
    pub init_alpha: f64,
    pub max_iters: usize,
    pub tol_obj: f64,
    pub tol_rel_obj: f64,
    pub tol_grad: f64,
    pub tol_rel_grad: f64,
    pub tol_param: f64,
    pub history_size: usize,
}

impl Default for LbfgsOptions {
    fn default() -> Self {
        Self {
            init_alpha: 0.001,
            max_iters: 1000,
            tol_obj: 1e-12,
            tol_rel_obj: 1e4,
            tol_grad: 1e-8,
            tol_rel_grad: 1e7,
            tol_param: 1e-8,
            history_size: 6,
        }
    }
}

struct LineSearchResult {
    alpha: f64,
    f_new: f64,
    g_new: Array1<f64>,
    x_new: Array1<f64>,
}

pub struct LbfgsDriver<F>
where
    F: Fn(&Array1<f64>) -> (f64, Array1<f64>),
{
    obj_fn: F,
    opts: LbfgsOptions,
    x: Array1<f64>,
    g: Array1<f64>,
    f: f64,
    s_hist: VecDeque<Array1<f64>>,
    y_hist: VecDeque<Array1<f64>>,
    rho_hist: VecDeque<f64>,
    iter: usize,
    grad_evals: usize,
    prev_step_size: f64,
    alpha: f64,
    alpha0: f64,
    note: String,
}

impl<F> LbfgsDriver<F>
where
    F: Fn(&Array1<f64>) -> (f64, Array1<f64>),
{
    /// Evaluate the objective at `x0` and prime the driver.
    pub fn new(x0: Array1<f64>, obj_fn: F, opts: LbfgsOptions) -> Self {
        let (f, g) = obj_fn(&x0);
        Self {
            obj_fn,
            opts,
            x: x0,
            g,
            f,
            s_hist: VecDeque::new(),
            y_hist: VecDeque::new(),
            rho_hist: VecDeque::new(),
            iter: 0,
            grad_evals: 1,
            prev_step_size: 0.0,
            alpha: 0.0,
            alpha0: 0.0,
            note: String::new(),
        }
    }

    pub fn curr_x(&self) -> &Array1<f64> {
        &self.x
    }

    pub fn curr_g(&self) -> &Array1<f64> {
        &self.g
    }

    /// log p at the current iterate (the driver minimizes −log p).
    pub fn logp(&self) -> f64 {
        -self.f
    }

    pub fn prev_step_size(&self) -> f64 {
        self.prev_step_size
    }

    /// Step multiplier accepted by the last line search.
    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Step multiplier the last line search started from.
    pub fn alpha0(&self) -> f64 {
        self.alpha0
    }

    pub fn grad_evals(&self) -> usize {
        self.grad_evals
    }

    pub fn iter_num(&self) -> usize {
        self.iter
    }

    pub fn note(&self) -> &str {
        &self.note
    }

    fn eval(&mut self, x: &Array1<f64>) -> (f64, Array1<f64>) {
        self.grad_evals += 1;
        (self.obj_fn)(x)
    }

    fn reset_history(&mut self) {
        self.s_hist.clear();
        self.y_hist.clear();
        self.rho_hist.clear();
    }

    /// Two-loop recursion with a γ-scaled initial inverse Hessian.
    fn search_direction(&self) -> Array1<f64> {
        if self.s_hist.is_empty() {
            return self.g.mapv(|v| -v);
        }
        let k = self.s_hist.len();
        let mut q = self.g.clone();
        let mut coeffs = vec![0.0; k];
        for i in (0..k).rev() {
            let a = self.rho_hist[i] * self.s_hist[i].dot(&q);
            coeffs[i] = a;
            q.scaled_add(-a, &self.y_hist[i]);
        }
        let y_last = &self.y_hist[k - 1];
        let gamma = self.s_hist[k - 1].dot(y_last) / y_last.dot(y_last);
        q.mapv_inplace(|v| v * gamma);
        for i in 0..k {
            let b = self.rho_hist[i] * self.y_hist[i].dot(&q);
            q.scaled_add(coeffs[i] - b, &self.s_hist[i]);
        }
        q.mapv(|v| -v)
    }

    /// Advance one iteration. Returns 0 to continue, a positive code on
    /// convergence, or −1 when even the fallback line search failed (the
    /// iterate is left unchanged).
    pub fn step(&mut self) -> i32 {
        self.note.clear();
        let mut direction = self.search_direction();
        let mut gdotd = self.g.dot(&direction);
        if !(gdotd < 0.0) {
            self.reset_history();
            direction = self.g.mapv(|v| -v);
            gdotd = -self.g.dot(&self.g);
            self.note.push_str("non-descent direction, reset to gradient; ");
        }
        self.alpha0 = if self.iter == 0 {
            self.opts.init_alpha
        } else {
            1.0
        };

        let searched = match self.wolfe_search(&direction, gdotd) {
            Ok(found) => Ok(found),
            Err(()) => {
                // One retry along the raw gradient with fresh curvature.
                if !self.s_hist.is_empty() {
                    self.reset_history();
                    direction = self.g.mapv(|v| -v);
                    gdotd = -self.g.dot(&self.g);
                }
                self.note.push_str("Wolfe search failed, backtracking; ");
                self.backtracking_search(&direction, gdotd)
            }
        };
        let found = match searched {
            Ok(found) => found,
            Err(()) => {
                self.note.push_str(code_string(TERM_LS_FAIL));
                return TERM_LS_FAIL;
            }
        };

        let s = &found.x_new - &self.x;
        let y = &found.g_new - &self.g;
        self.prev_step_size = s.dot(&s).sqrt();
        self.alpha = found.alpha;
        let sy = s.dot(&y);
        if sy > 1e-10 * self.prev_step_size * y.dot(&y).sqrt() {
            self.s_hist.push_back(s);
            self.y_hist.push_back(y);
            self.rho_hist.push_back(1.0 / sy);
            if self.s_hist.len() > self.opts.history_size {
                self.s_hist.pop_front();
                self.y_hist.pop_front();
                self.rho_hist.pop_front();
            }
        }

        let f_prev = self.f;
        self.x = found.x_new;
        self.f = found.f_new;
        self.g = found.g_new;
        self.iter += 1;

        self.convergence_code(f_prev, found.alpha * gdotd)
    }

    fn convergence_code(&self, f_prev: f64, directional_step: f64) -> i32 {
        let eps = f64::EPSILON;
        let g_norm = self.g.dot(&self.g).sqrt();
        let f_scale = self.f.abs().max(f_prev.abs()).max(1.0);
        if g_norm < self.opts.tol_grad {
            return TERM_ABS_GRAD;
        }
        if directional_step.abs() / self.f.abs().max(1.0) < self.opts.tol_rel_grad * eps {
            return TERM_REL_GRAD;
        }
        if (self.f - f_prev).abs() < self.opts.tol_obj {
            return TERM_ABS_OBJ;
        }
        if (self.f - f_prev).abs() / f_scale < self.opts.tol_rel_obj * eps {
            return TERM_REL_OBJ;
        }
        if self.prev_step_size < self.opts.tol_param {
            return TERM_ABS_PARAM;
        }
        if self.iter >= self.opts.max_iters {
            return TERM_MAX_ITERS;
        }
        TERM_CONTINUE
    }

    /// Bracketing phase of the Strong Wolfe search.
    fn wolfe_search(
        &mut self,
        direction: &Array1<f64>,
        gdotd: f64,
    ) -> Result<LineSearchResult, ()> {
        let f0 = self.f;
        let mut alpha_prev = 0.0;
        let mut f_prev = f0;
        let mut alpha_i = self.alpha0;
        let mut first = true;
        for _ in 0..MAX_BRACKET_ATTEMPTS {
            let x_new = &self.x + &direction.mapv(|v| v * alpha_i);
            let (f_i, g_i) = self.eval(&x_new);
            if !f_i.is_finite() || g_i.iter().any(|v| !v.is_finite()) {
                // Shrink back toward the last finite point.
                let next = 0.5 * (alpha_prev + alpha_i);
                if (next - alpha_prev).abs() < 1e-16 {
                    return Err(());
                }
                alpha_i = next;
                continue;
            }
            let armijo_violated = f_i > f0 + WOLFE_C1 * alpha_i * gdotd;
            if armijo_violated || (!first && f_i >= f_prev) {
                return self.zoom(direction, gdotd, alpha_prev, f_prev, alpha_i, f_i);
            }
            let gi_dot = g_i.dot(direction);
            if gi_dot.abs() <= -WOLFE_C2 * gdotd {
                return Ok(LineSearchResult {
                    alpha: alpha_i,
                    f_new: f_i,
                    g_new: g_i,
                    x_new,
                });
            }
            if gi_dot >= 0.0 {
                return self.zoom(direction, gdotd, alpha_i, f_i, alpha_prev, f_prev);
            }
            alpha_prev = alpha_i;
            f_prev = f_i;
            alpha_i *= 2.0;
            first = false;
        }
        Err(())
    }

    /// Interval refinement (zoom) with quadratic interpolation and a
    /// bisection fallback.
    fn zoom(
        &mut self,
        direction: &Array1<f64>,
        gdotd: f64,
        mut alpha_lo: f64,
        mut f_lo: f64,
        mut alpha_hi: f64,
        mut f_hi: f64,
    ) -> Result<LineSearchResult, ()> {
        let f0 = self.f;
        let mut g_lo_dot = gdotd;
        let mut best: Option<LineSearchResult> = None;
        for _ in 0..MAX_ZOOM_ATTEMPTS {
            let width = alpha_hi - alpha_lo;
            if width.abs() < 1e-14 * alpha_lo.abs().max(1.0) {
                break;
            }
            let mut alpha_j = {
                let denom = f_hi - f_lo - g_lo_dot * width;
                let trial = alpha_lo - 0.5 * g_lo_dot * width * width / denom;
                if trial.is_finite()
                    && trial > alpha_lo.min(alpha_hi)
                    && trial < alpha_lo.max(alpha_hi)
                {
                    trial
                } else {
                    alpha_lo + 0.5 * width
                }
            };
            if alpha_j <= f64::EPSILON {
                alpha_j = alpha_lo + 0.5 * width;
            }
            let x_j = &self.x + &direction.mapv(|v| v * alpha_j);
            let (f_j, g_j) = self.eval(&x_j);
            if !f_j.is_finite() || g_j.iter().any(|v| !v.is_finite()) {
                alpha_hi = alpha_j;
                f_hi = f64::INFINITY;
                continue;
            }
            if f_j > f0 + WOLFE_C1 * alpha_j * gdotd || f_j >= f_lo {
                alpha_hi = alpha_j;
                f_hi = f_j;
            } else {
                let gj_dot = g_j.dot(direction);
                let candidate = LineSearchResult {
                    alpha: alpha_j,
                    f_new: f_j,
                    g_new: g_j,
                    x_new: x_j,
                };
                if gj_dot.abs() <= -WOLFE_C2 * gdotd {
                    return Ok(candidate);
                }
                if gj_dot * (alpha_hi - alpha_lo) >= 0.0 {
                    alpha_hi = alpha_lo;
                    f_hi = f_lo;
                }
                alpha_lo = alpha_j;
                f_lo = f_j;
                g_lo_dot = gj_dot;
                best = Some(candidate);
            }
        }
        // Exhausted the bracket: settle for sufficient decrease if any point
        // achieved it.
        if let Some(candidate) = best {
            if candidate.f_new < f0 + WOLFE_C1 * candidate.alpha * gdotd {
                self.note.push_str("accepted sufficient-decrease step; ");
                return Ok(candidate);
            }
        }
        Err(())
    }

    /// Armijo backtracking, used after the Strong Wolfe search gives up.
    fn backtracking_search(
        &mut self,
        direction: &Array1<f64>,
        gdotd: f64,
    ) -> Result<LineSearchResult, ()> {
        let f0 = self.f;
        let d_norm = direction.dot(direction).sqrt();
        let x_norm = self.x.dot(&self.x).sqrt();
        let mut alpha = self.alpha0;
        for _ in 0..MAX_BACKTRACK_ATTEMPTS {
            let x_new = &self.x + &direction.mapv(|v| v * alpha);
            let (f_new, g_new) = self.eval(&x_new);
            let finite = f_new.is_finite() && g_new.iter().all(|v| v.is_finite());
            if finite && f_new <= f0 + WOLFE_C1 * alpha * gdotd {
                return Ok(LineSearchResult {
                    alpha,
                    f_new,
                    g_new,
                    x_new,
                });
            }
            alpha *= 0.5;
            if alpha * d_norm <= 1e-16 * (1.0 + x_norm) {
                return Err(());
            }
        }
        Err(())
    }
}
