//! Deterministic construction of independent pseudo-random streams.
//!
//! Every unit of concurrent work (a path, an ELBO search task, the resampling
//! step) owns its own generator, keyed by `(seed, offset)`. Distinct offsets
//! seed distinct ChaCha keys, so streams do not overlap within any realistic
//! number of draws and results are reproducible independent of thread count.

use rand::rngs::StdRng;
use rand::SeedableRng;

/// Build the stream for one unit of work.
///
/// Offsets are allocated as `path_base + path_index` for paths and
/// `path_base + path_index + 1 + iteration` for per-iteration ELBO tasks.
pub fn path_stream(seed: u32, offset: u64) -> StdRng {
    StdRng::seed_from_u64(u64::from(seed).wrapping_add(offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn same_key_reproduces_the_stream() {
        let mut a = path_stream(1234, 7);
        let mut b = path_stream(1234, 7);
        for _ in 0..1000 {
            assert_eq!(a.random::<u64>(), b.random::<u64>());
        }
    }

    #[test]
    fn distinct_offsets_decorrelate_streams() {
        let n = 1_000_000;
        let mut a = path_stream(42, 0);
        let mut b = path_stream(42, 1);
        let xs: Vec<f64> = (0..n).map(|_| a.random::<f64>()).collect();
        let ys: Vec<f64> = (0..n).map(|_| b.random::<f64>()).collect();
        let mean = |v: &[f64]| v.iter().sum::<f64>() / v.len() as f64;
        let (mx, my) = (mean(&xs), mean(&ys));
        let mut sxy = 0.0;
        let mut sxx = 0.0;
        let mut syy = 0.0;
        for i in 0..n {
            let dx = xs[i] - mx;
            let dy = ys[i] - my;
            sxy += dx * dy;
            sxx += dx * dx;
            syy += dy * dy;
        }
        let r = sxy / (sxx.sqrt() * syy.sqrt());
        assert!(r.abs() < 0.01, "streams correlated: r = {r}");
    }

    #[test]
    fn distinct_offsets_produce_distinct_draws() {
        let mut a = path_stream(7, 3);
        let mut b = path_stream(7, 4);
        let xs: Vec<u64> = (0..16).map(|_| a.random()).collect();
        let ys: Vec<u64> = (0..16).map(|_| b.random()).collect();
        assert_ne!(xs, ys);
    }
}
