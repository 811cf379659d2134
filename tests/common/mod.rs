#![allow(dead_code)]

use ndarray::{Array1, ArrayView1};
use pathfinder_vi::{LogDensityModel, ModelError};
use rand::rngs::StdRng;
use std::sync::atomic::{AtomicUsize, Ordering};

const LOG_TWO_PI: f64 = 1.8378770664093453;

fn coordinate_names(dims: usize) -> Vec<String> {
    (1..=dims).map(|i| format!("x.{i}")).collect()
}

fn copy_through(
    unconstrained: &ArrayView1<'_, f64>,
    constrained: &mut Array1<f64>,
) -> Result<(), ModelError> {
    constrained.assign(unconstrained);
    Ok(())
}

/// Standard normal target in `dims` dimensions.
pub struct StdNormalModel {
    pub dims: usize,
}

impl LogDensityModel for StdNormalModel {
    fn dims(&self) -> usize {
        self.dims
    }

    fn log_prob(&self, x: &ArrayView1<'_, f64>) -> Result<f64, ModelError> {
        Ok(-0.5 * x.dot(x) - 0.5 * self.dims as f64 * LOG_TWO_PI)
    }

    fn log_prob_grad(
        &self,
        x: &ArrayView1<'_, f64>,
        grad: &mut Array1<f64>,
    ) -> Result<f64, ModelError> {
        grad.assign(&x.mapv(|v| -v));
        self.log_prob(x)
    }

    fn constrained_param_names(&self, _include_tparams: bool, _include_gqs: bool) -> Vec<String> {
        coordinate_names(self.dims)
    }

    fn write_array(
        &self,
        _rng: &mut StdRng,
        unconstrained: &ArrayView1<'_, f64>,
        constrained: &mut Array1<f64>,
    ) -> Result<(), ModelError> {
        copy_through(unconstrained, constrained)
    }
}

/// Independent Gaussian target with per-coordinate variances.
pub struct DiagGaussianModel {
    pub variances: Vec<f64>,
}

impl LogDensityModel for DiagGaussianModel {
    fn dims(&self) -> usize {
        self.variances.len()
    }

    fn log_prob(&self, x: &ArrayView1<'_, f64>) -> Result<f64, ModelError> {
        let mut lp = 0.0;
        for (i, &v) in x.iter().enumerate() {
            lp -= 0.5 * (v * v / self.variances[i] + self.variances[i].ln() + LOG_TWO_PI);
        }
        Ok(lp)
    }

    fn log_prob_grad(
        &self,
        x: &ArrayView1<'_, f64>,
        grad: &mut Array1<f64>,
    ) -> Result<f64, ModelError> {
        for (i, &v) in x.iter().enumerate() {
            grad[i] = -v / self.variances[i];
        }
        self.log_prob(x)
    }

    fn constrained_param_names(&self, _include_tparams: bool, _include_gqs: bool) -> Vec<String> {
        coordinate_names(self.variances.len())
    }

    fn write_array(
        &self,
        _rng: &mut StdRng,
        unconstrained: &ArrayView1<'_, f64>,
        constrained: &mut Array1<f64>,
    ) -> Result<(), ModelError> {
        copy_through(unconstrained, constrained)
    }
}

/// Curved two-dimensional target: log p(x, y) = −½(x² + (y − x²)²/4).
pub struct BananaModel;

impl LogDensityModel for BananaModel {
    fn dims(&self) -> usize {
        2
    }

    fn log_prob(&self, x: &ArrayView1<'_, f64>) -> Result<f64, ModelError> {
        let (a, b) = (x[0], x[1]);
        Ok(-0.5 * (a * a + (b - a * a).powi(2) / 4.0))
    }

    fn log_prob_grad(
        &self,
        x: &ArrayView1<'_, f64>,
        grad: &mut Array1<f64>,
    ) -> Result<f64, ModelError> {
        let (a, b) = (x[0], x[1]);
        let resid = b - a * a;
        grad[0] = -a + a * resid / 2.0;
        grad[1] = -resid / 4.0;
        self.log_prob(x)
    }

    fn constrained_param_names(&self, _include_tparams: bool, _include_gqs: bool) -> Vec<String> {
        vec!["x".to_string(), "y".to_string()]
    }

    fn write_array(
        &self,
        _rng: &mut StdRng,
        unconstrained: &ArrayView1<'_, f64>,
        constrained: &mut Array1<f64>,
    ) -> Result<(), ModelError> {
        copy_through(unconstrained, constrained)
    }
}

/// A target whose log density is −∞ everywhere: initialization must fail.
pub struct NowhereFiniteModel {
    pub dims: usize,
}

impl LogDensityModel for NowhereFiniteModel {
    fn dims(&self) -> usize {
        self.dims
    }

    fn log_prob(&self, _x: &ArrayView1<'_, f64>) -> Result<f64, ModelError> {
        Ok(f64::NEG_INFINITY)
    }

    fn log_prob_grad(
        &self,
        _x: &ArrayView1<'_, f64>,
        grad: &mut Array1<f64>,
    ) -> Result<f64, ModelError> {
        grad.fill(0.0);
        Ok(f64::NEG_INFINITY)
    }

    fn constrained_param_names(&self, _include_tparams: bool, _include_gqs: bool) -> Vec<String> {
        coordinate_names(self.dims)
    }

    fn write_array(
        &self,
        _rng: &mut StdRng,
        unconstrained: &ArrayView1<'_, f64>,
        constrained: &mut Array1<f64>,
    ) -> Result<(), ModelError> {
        copy_through(unconstrained, constrained)
    }
}

/// Standard normal whose plain log density returns NaN on half of all
/// inputs, keyed deterministically off the input bits. Gradients stay clean,
/// so the optimizer runs normally and only the ELBO scan sees failures.
pub struct FlakyLpModel {
    pub dims: usize,
}

fn bit_parity(x: &ArrayView1<'_, f64>) -> bool {
    let mut acc = 0u64;
    for &v in x.iter() {
        acc ^= v.to_bits();
    }
    acc.count_ones() % 2 == 0
}

impl LogDensityModel for FlakyLpModel {
    fn dims(&self) -> usize {
        self.dims
    }

    fn log_prob(&self, x: &ArrayView1<'_, f64>) -> Result<f64, ModelError> {
        if bit_parity(x) {
            Ok(f64::NAN)
        } else {
            Ok(-0.5 * x.dot(x) - 0.5 * self.dims as f64 * LOG_TWO_PI)
        }
    }

    fn log_prob_grad(
        &self,
        x: &ArrayView1<'_, f64>,
        grad: &mut Array1<f64>,
    ) -> Result<f64, ModelError> {
        grad.assign(&x.mapv(|v| -v));
        Ok(-0.5 * x.dot(x) - 0.5 * self.dims as f64 * LOG_TWO_PI)
    }

    fn constrained_param_names(&self, _include_tparams: bool, _include_gqs: bool) -> Vec<String> {
        coordinate_names(self.dims)
    }

    fn write_array(
        &self,
        _rng: &mut StdRng,
        unconstrained: &ArrayView1<'_, f64>,
        constrained: &mut Array1<f64>,
    ) -> Result<(), ModelError> {
        copy_through(unconstrained, constrained)
    }
}

/// Wrapper counting every evaluation of the inner model.
pub struct CountingModel<M: LogDensityModel> {
    pub inner: M,
    pub lp_calls: AtomicUsize,
    pub grad_calls: AtomicUsize,
}

impl<M: LogDensityModel> CountingModel<M> {
    pub fn new(inner: M) -> Self {
        Self {
            inner,
            lp_calls: AtomicUsize::new(0),
            grad_calls: AtomicUsize::new(0),
        }
    }
}

impl<M: LogDensityModel> LogDensityModel for CountingModel<M> {
    fn dims(&self) -> usize {
        self.inner.dims()
    }

    fn log_prob(&self, x: &ArrayView1<'_, f64>) -> Result<f64, ModelError> {
        self.lp_calls.fetch_add(1, Ordering::Relaxed);
        self.inner.log_prob(x)
    }

    fn log_prob_grad(
        &self,
        x: &ArrayView1<'_, f64>,
        grad: &mut Array1<f64>,
    ) -> Result<f64, ModelError> {
        self.grad_calls.fetch_add(1, Ordering::Relaxed);
        self.inner.log_prob_grad(x, grad)
    }

    fn constrained_param_names(&self, include_tparams: bool, include_gqs: bool) -> Vec<String> {
        self.inner.constrained_param_names(include_tparams, include_gqs)
    }

    fn write_array(
        &self,
        rng: &mut StdRng,
        unconstrained: &ArrayView1<'_, f64>,
        constrained: &mut Array1<f64>,
    ) -> Result<(), ModelError> {
        self.inner.write_array(rng, unconstrained, constrained)
    }
}

/// Column-wise mean of a draw matrix row.
pub fn row_mean(row: ndarray::ArrayView1<'_, f64>) -> f64 {
    row.sum() / row.len() as f64
}

/// Sample standard deviation of a draw matrix row.
pub fn row_sd(row: ndarray::ArrayView1<'_, f64>) -> f64 {
    let mean = row_mean(row);
    let ss: f64 = row.iter().map(|&v| (v - mean).powi(2)).sum();
    (ss / (row.len() as f64 - 1.0)).sqrt()
}

/// Pearson correlation of two equally long slices.
pub fn correlation(xs: &[f64], ys: &[f64]) -> f64 {
    let n = xs.len() as f64;
    let mx = xs.iter().sum::<f64>() / n;
    let my = ys.iter().sum::<f64>() / n;
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    let mut syy = 0.0;
    for i in 0..xs.len() {
        let dx = xs[i] - mx;
        let dy = ys[i] - my;
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    sxy / (sxx.sqrt() * syy.sqrt())
}
