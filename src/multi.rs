//! Multi-path driver: run independent trajectories in parallel, pool their
//! draws, and resample by PSIS weight.
//!
//! Paths never talk to each other. Each one gets its own random stream and
//! its own writer set; failed paths are dropped with a warning and only a
//! total wipeout is fatal. Pooled draws keep path-index order, so output is
//! reproducible for a fixed seed regardless of scheduling.

use crate::config::{MultiConfig, PathfinderConfig};
use crate::model::{ErrorCode, InitContext, Interrupt, LogDensityModel};
use crate::output::{NullWriter, OutputWriter};
use crate::psis::psis_weights;
use crate::rng::path_stream;
use crate::single::pathfinder_single;
use ndarray::{Array1, Array2};
use rand::distr::Distribution;
use rayon::iter::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MultiPathError {
    #[error("no path finished successfully")]
    AllPathsFailed,
    #[error("expected {expected} per-path writer sets, got {got}")]
    SinkCountMismatch { expected: usize, got: usize },
    #[error("resampling weights were degenerate: {0}")]
    DegenerateWeights(String),
}

impl MultiPathError {
    pub fn error_code(&self) -> ErrorCode {
        ErrorCode::Software
    }
}

/// Writer set owned by one path.
pub struct PathSinks<W1, W2, W3>
where
    W1: OutputWriter + Send,
    W2: OutputWriter + Send,
    W3: OutputWriter + Send,
{
    pub init_writer: W1,
    pub parameter_writer: W2,
    pub diagnostic_writer: W3,
}

impl PathSinks<NullWriter, NullWriter, NullWriter> {
    /// Discard all per-path output.
    pub fn null(num_paths: usize) -> Vec<Self> {
        (0..num_paths)
            .map(|_| Self {
                init_writer: NullWriter,
                parameter_writer: NullWriter,
                diagnostic_writer: NullWriter,
            })
            .collect()
    }
}

/// PSIS-resampled pooled output.
#[derive(Debug)]
pub struct MultiPathOutput {
    /// Resampled constrained draws, one per column, `num_multi_draws` of
    /// them; the last two rows are log q and log p.
    pub draws: Array2<f64>,
    /// Log-density evaluations summed over all successful paths.
    pub fn_calls: usize,
}

/// Run `num_paths` pathfinder trajectories and resample the pooled draws.
#[allow(clippy::too_many_arguments)]
pub fn pathfinder_multi<M, C, I, W1, W2, W3>(
    model: &M,
    init: &C,
    random_seed: u32,
    path_base: u32,
    config: &PathfinderConfig,
    multi: &MultiConfig,
    interrupt: &I,
    path_sinks: Vec<PathSinks<W1, W2, W3>>,
    parameter_writer: &mut dyn OutputWriter,
    diagnostic_writer: &mut dyn OutputWriter,
) -> Result<MultiPathOutput, MultiPathError>
where
    M: LogDensityModel,
    C: InitContext,
    I: Interrupt,
    W1: OutputWriter + Send,
    W2: OutputWriter + Send,
    W3: OutputWriter + Send,
{
    if path_sinks.len() != multi.num_paths {
        return Err(MultiPathError::SinkCountMismatch {
            expected: multi.num_paths,
            got: path_sinks.len(),
        });
    }
    let mut names = model.constrained_param_names(true, true);
    names.push("lp_approx__".to_string());
    names.push("lp__".to_string());
    parameter_writer.names(&names);
    diagnostic_writer.names(&names);

    let start_pathfinders_time = Instant::now();
    let results: Vec<Option<(Array1<f64>, Array2<f64>, usize)>> = path_sinks
        .into_par_iter()
        .enumerate()
        .map(|(i, mut sinks)| {
            let path = path_base + i as u32;
            match pathfinder_single(
                model,
                init,
                random_seed,
                path,
                config,
                interrupt,
                &mut sinks.init_writer,
                &mut sinks.parameter_writer,
                &mut sinks.diagnostic_writer,
            ) {
                Ok(out) => Some((out.lp_ratio, out.draws, out.fn_calls)),
                Err(e) => {
                    log::warn!("Path: [{path}] dropped: {e}");
                    None
                }
            }
        })
        .collect();
    let pathfinders_seconds = start_pathfinders_time.elapsed().as_secs_f64();

    let successes: Vec<(Array1<f64>, Array2<f64>, usize)> =
        results.into_iter().flatten().collect();
    if successes.is_empty() {
        log::warn!("no pathfinder ran successfully");
        return Err(MultiPathError::AllPathsFailed);
    }
    let fn_calls: usize = successes.iter().map(|(_, _, calls)| calls).sum();
    if config.refresh != 0 {
        log::info!("Total log density evaluations: ({fn_calls})");
    }

    let start_psis_time = Instant::now();
    // Per-sample failures can leave paths with different draw counts.
    let num_returned: usize = successes.iter().map(|(lp, _, _)| lp.len()).sum();
    let num_rows = successes[0].1.nrows();
    let mut lp_ratios = Array1::<f64>::zeros(num_returned);
    let mut samples = Array2::<f64>::zeros((num_rows, num_returned));
    let mut filled = 0;
    for (lp, draws, _) in &successes {
        let width = lp.len();
        lp_ratios.slice_mut(ndarray::s![filled..filled + width]).assign(lp);
        samples
            .slice_mut(ndarray::s![.., filled..filled + width])
            .assign(draws);
        filled += width;
    }

    let tail_len = (0.2 * num_returned as f64).min(3.0 * (num_returned as f64).sqrt()) as usize;
    let weights = psis_weights(&lp_ratios.view(), tail_len);
    let weighted = rand::distr::weighted::WeightedIndex::new(weights.iter().cloned())
        .map_err(|e| MultiPathError::DegenerateWeights(e.to_string()))?;
    let mut rng = path_stream(random_seed, u64::from(path_base));
    let mut resampled = Array2::<f64>::zeros((num_rows, multi.num_multi_draws));
    for j in 0..multi.num_multi_draws {
        let idx = weighted.sample(&mut rng);
        let column = samples.column(idx);
        parameter_writer.column(&column);
        resampled.column_mut(j).assign(&column);
    }
    let psis_seconds = start_psis_time.elapsed().as_secs_f64();

    let time_header = "Elapsed Time: ";
    parameter_writer.blank();
    parameter_writer.note(&format!(
        "{time_header}{pathfinders_seconds:.6} seconds (Pathfinders)"
    ));
    parameter_writer.note(&format!(
        "{}{psis_seconds:.6} seconds (PSIS)",
        " ".repeat(time_header.len())
    ));
    parameter_writer.note(&format!(
        "{}{:.6} seconds (Total)",
        " ".repeat(time_header.len()),
        pathfinders_seconds + psis_seconds
    ));
    parameter_writer.blank();

    Ok(MultiPathOutput {
        draws: resampled,
        fn_calls,
    })
}
