#![deny(dead_code)]
#![deny(unused_imports)]

//! Multi-path Pathfinder variational inference.
//!
//! Approximates the posterior of a twice-differentiable model by running
//! quasi-Newton trajectories from randomized starts, fitting a local
//! Gaussian surrogate at every iterate, scoring surrogates by their ELBO,
//! and combining the pooled draws of all trajectories with Pareto-smoothed
//! importance resampling.

pub mod config;
pub mod curvature;
pub mod elbo;
pub mod lbfgs;
pub mod linalg;
pub mod model;
pub mod multi;
pub mod output;
pub mod psis;
pub mod rng;
pub mod single;
pub mod taylor;

pub use config::{MultiConfig, PathfinderConfig};
pub use elbo::{estimate_approx_draws, ElboError, ElboEstimate};
pub use lbfgs::{code_string, LbfgsDriver, LbfgsOptions};
pub use model::{
    EmptyInit, ErrorCode, InitContext, Interrupt, LogDensityModel, ModelError, NeverInterrupt,
};
pub use multi::{pathfinder_multi, MultiPathError, MultiPathOutput, PathSinks};
pub use output::{
    prettify_name, CsvWriter, InterchangeMetadata, NullWriter, OutputWriter, VecWriter,
};
pub use psis::psis_weights;
pub use rng::path_stream;
pub use single::{pathfinder_single, SinglePathError, SinglePathOutput};
pub use taylor::{construct_taylor, gen_draw, gen_draws, TaylorApprox};
