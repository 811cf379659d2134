//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Knobs for one pathfinder trajectory.
///
/// Defaults mirror the reference settings for the algorithm: short L-BFGS
/// history, loose relative tolerances (scaled by machine epsilon at the
/// comparison site), and a small Monte Carlo budget for the ELBO scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathfinderConfig {
    /// Radius of the uniform random initialization box in unconstrained space.
    pub init_radius: f64,
    /// J: maximum number of (Δx, Δg) pairs per surrogate.
    pub history_size: usize,
    /// Line search step size for the first optimizer iteration.
    pub init_alpha: f64,
    /// Absolute tolerance on objective change.
    pub tol_obj: f64,
    /// Relative tolerance on objective change.
    pub tol_rel_obj: f64,
    /// Absolute tolerance on the gradient norm.
    pub tol_grad: f64,
    /// Relative tolerance on the directional derivative.
    pub tol_rel_grad: f64,
    /// Absolute tolerance on the step size.
    pub tol_param: f64,
    /// L: maximum number of L-BFGS iterations.
    pub max_lbfgs_iters: usize,
    /// Write every accepted iterate and gradient to the diagnostic writer.
    pub save_iterations: bool,
    /// Emit a progress line every this many iterations; 0 silences progress.
    pub refresh: usize,
    /// K: Monte Carlo draws used to score each surrogate's ELBO.
    pub num_elbo_draws: usize,
    /// M: approximate posterior draws returned per path.
    pub num_draws: usize,
    /// Retry budget for non-finite log densities at a candidate draw.
    pub num_eval_attempts: usize,
}

impl Default for PathfinderConfig {
    fn default() -> Self {
        Self {
            init_radius: 2.0,
            history_size: 6,
            init_alpha: 0.001,
            tol_obj: 1e-12,
            tol_rel_obj: 1e4,
            tol_grad: 1e-8,
            tol_rel_grad: 1e7,
            tol_param: 1e-8,
            max_lbfgs_iters: 1000,
            save_iterations: false,
            refresh: 100,
            num_elbo_draws: 25,
            num_draws: 1000,
            num_eval_attempts: 10,
        }
    }
}

/// Knobs for the multi-path driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiConfig {
    /// N: number of independent pathfinder trajectories.
    pub num_paths: usize,
    /// M': number of PSIS-resampled draws written to the unified output.
    pub num_multi_draws: usize,
}

impl Default for MultiConfig {
    fn default() -> Self {
        Self {
            num_paths: 4,
            num_multi_draws: 1000,
        }
    }
}
