//! Interfaces consumed by the engine: the target model, the initialization
//! context, and the cooperative interrupt probe.
//!
//! The engine never constructs models; it only evaluates them. A model is any
//! twice-differentiable log density on an unconstrained space together with a
//! transform to the constrained reporting space. Diagnostic messages from
//! model internals go through the `log` facade rather than a threaded sink.

use ndarray::{Array1, ArrayView1};
use rand::rngs::StdRng;
use thiserror::Error;

/// Process-level result classification for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Ok = 0,
    /// Unrecoverable internal failure (sysexits EX_SOFTWARE).
    Software = 70,
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("log density evaluation failed: {0}")]
    Evaluation(String),
    #[error("constrain transform failed: {0}")]
    Constrain(String),
}

/// Target posterior seen by the engine.
///
/// `log_prob` and `log_prob_grad` operate on the unconstrained scale and may
/// return non-finite values or errors anywhere; the engine retries or skips
/// around both. The discrete-parameter block is always empty.
pub trait LogDensityModel: Sync {
    /// Dimension of the unconstrained parameter vector.
    fn dims(&self) -> usize;

    fn log_prob(&self, x: &ArrayView1<'_, f64>) -> Result<f64, ModelError>;

    /// Log density and its gradient; `grad` has length `dims()`.
    fn log_prob_grad(
        &self,
        x: &ArrayView1<'_, f64>,
        grad: &mut Array1<f64>,
    ) -> Result<f64, ModelError>;

    /// Ordered names of the constrained outputs, optionally including
    /// transformed parameters and generated quantities.
    fn constrained_param_names(&self, include_tparams: bool, include_gqs: bool) -> Vec<String>;

    /// Map one unconstrained draw to the constrained reporting space.
    /// Generated quantities may consume `rng`.
    fn write_array(
        &self,
        rng: &mut StdRng,
        unconstrained: &ArrayView1<'_, f64>,
        constrained: &mut Array1<f64>,
    ) -> Result<(), ModelError>;

    fn constrained_dims(&self) -> usize {
        self.constrained_param_names(true, true).len()
    }
}

/// Supplier of initial unconstrained values.
///
/// An empty context returns `None` and the initializer falls back to a
/// uniform fill on `[-radius, radius]` in the unconstrained space.
pub trait InitContext: Sync {
    fn unconstrained(&self, dims: usize) -> Option<Array1<f64>>;
}

/// The empty context: always random initialization.
pub struct EmptyInit;

impl InitContext for EmptyInit {
    fn unconstrained(&self, _dims: usize) -> Option<Array1<f64>> {
        None
    }
}

/// Cooperative cancellation, polled at the top of every optimizer step.
pub trait Interrupt: Sync {
    fn interrupted(&self) -> bool;
}

/// Interrupt that never fires.
pub struct NeverInterrupt;

impl Interrupt for NeverInterrupt {
    fn interrupted(&self) -> bool {
        false
    }
}
