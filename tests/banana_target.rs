mod common;

use common::{correlation, BananaModel};
use pathfinder_vi::{
    pathfinder_multi, EmptyInit, MultiConfig, NeverInterrupt, NullWriter, PathSinks,
    PathfinderConfig,
};

/// The banana's ridge y ≈ x² is invisible to any single Gaussian surrogate,
/// but eight surrogates pooled through PSIS recover the curved dependence.
#[test]
fn multi_path_recovers_the_curved_ridge() {
    let model = BananaModel;
    let config = PathfinderConfig {
        refresh: 0,
        num_elbo_draws: 100,
        num_draws: 1000,
        ..PathfinderConfig::default()
    };
    let multi = MultiConfig {
        num_paths: 8,
        num_multi_draws: 8000,
    };

    let mut correlations = Vec::new();
    for seed in 0..10u32 {
        let out = pathfinder_multi(
            &model,
            &EmptyInit,
            9000 + seed,
            0,
            &config,
            &multi,
            &NeverInterrupt,
            PathSinks::null(8),
            &mut NullWriter,
            &mut NullWriter,
        )
        .expect("banana run must succeed");
        assert_eq!(out.draws.ncols(), 8000);
        let x_sq: Vec<f64> = out.draws.row(0).iter().map(|&v| v * v).collect();
        let y: Vec<f64> = out.draws.row(1).to_vec();
        correlations.push(correlation(&x_sq, &y));
    }
    correlations.sort_by(f64::total_cmp);
    let median = 0.5 * (correlations[4] + correlations[5]);
    assert!(
        (0.7..=0.95).contains(&median),
        "median corr(x², y) = {median}, all = {correlations:?}"
    );
}
