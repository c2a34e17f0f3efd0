//! # Expectation-maximization over components and permutations
//!
//! Every trial draws `K` samples as initial means, then alternates:
//!
//! 1.  **E-step:** [`score_block_samples`] gives the joint log posterior over
//!     `(component, permutation)` for every sample.
//! 2.  **M-step:** weights from the marginal posterior mass, means pooled over
//!     every alignment consistent with each permutation, and the covariance
//!     update delegated to the active [`Covariances`] policy.
//!
//! Trials run sequentially from one seeded generator. The best trial (the first
//! one unconditionally) becomes the fitted model.

use crate::config::{ConfigError, PermutationGmmConfig};
use crate::covariance::{Covariances, Regularization, ScatterInputs};
use crate::data::ShapeError;
use crate::linalg::{FaerLinalgError, empirical_covariance};
use crate::model::MixtureParameters;
use crate::permutation::PermutationTable;
use crate::progress::{FitProgressObserver, IterationReport, TrialOutcome, TrialSummary};
use crate::score::{BlockScores, max_posterior_histogram, score_block_samples};
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis, s};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index;
use std::time::Instant;
use thiserror::Error;

/// Lower bound for every mixing weight; the upper bound is `1 - WEIGHT_FLOOR`.
pub const WEIGHT_FLOOR: f64 = 1e-4;

#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Invalid observation tensor: {0}")]
    Shape(#[from] ShapeError),
    #[error("Covariance factorization failed: {0}")]
    Linalg(#[from] FaerLinalgError),
    #[error("Cannot draw {components} initial means from only {samples} samples")]
    TooFewSamples { samples: usize, components: usize },
    #[error("The model has not been fitted")]
    NotFitted,
    #[error("Parameters do not match the configuration: {0}")]
    ParameterMismatch(String),
}

/// Best parameters across trials plus the per-trial diagnostics.
#[derive(Debug, Clone)]
pub struct FitResult {
    pub params: MixtureParameters,
    pub trials: Vec<TrialSummary>,
}

/// Runs `n_init` EM trials on `x` and keeps the highest-likelihood solution.
///
/// `x` must already be validated against the permutation table.
pub fn fit_em(
    config: &PermutationGmmConfig,
    table: &PermutationTable,
    x: ArrayView3<'_, f64>,
    observer: &mut dyn FitProgressObserver,
) -> Result<FitResult, EstimationError> {
    let (n_samples, n_permutations, n_features) = x.dim();
    if config.n_components > n_samples {
        return Err(EstimationError::TooFewSamples {
            samples: n_samples,
            components: config.n_components,
        });
    }
    log::info!(
        "Fitting {} components over {} permutations: {} samples, {} features, {} covariance",
        config.n_components,
        n_permutations,
        n_samples,
        n_features,
        config.covariance_type
    );

    let pooled = pooled_views(x);
    let background = empirical_covariance(pooled.view());

    let mut rng = StdRng::seed_from_u64(config.random_state);
    let mut best: Option<MixtureParameters> = None;
    let mut trials = Vec::with_capacity(config.n_init);

    for trial in 0..config.n_init {
        observer.on_trial_start(trial, config.n_init);
        let mut params = initialize_trial(config, x, background.view(), &mut rng);
        let summary = run_trial(
            config,
            table,
            x,
            background.view(),
            &mut params,
            trial,
            observer,
        )?;

        let improved = is_improvement(best.as_ref(), &params);
        observer.on_trial_finish(&summary, improved);
        if improved {
            best = Some(params);
        }
        trials.push(summary);
    }

    let params = best.ok_or(EstimationError::Config(ConfigError::ZeroCount {
        field: "n_init",
    }))?;
    Ok(FitResult { params, trials })
}

/// All `N·P` views stacked as rows, `(N·P, D)`.
fn pooled_views(x: ArrayView3<'_, f64>) -> Array2<f64> {
    let (n, p, d) = x.dim();
    Array2::from_shape_fn((n * p, d), |(row, f)| x[(row / p, row % p, f)])
}

/// Fresh parameters for one trial: `K` distinct samples as means, uniform
/// weights, and the policy's initial covariance.
pub fn initialize_trial(
    config: &PermutationGmmConfig,
    x: ArrayView3<'_, f64>,
    pooled_covariance: ArrayView2<'_, f64>,
    rng: &mut StdRng,
) -> MixtureParameters {
    let (n_samples, n_permutations, _) = x.dim();
    let n_components = config.n_components;
    let picks = index::sample(rng, n_samples, n_components).into_vec();
    let means = x.select(Axis(0), &picks);
    let weights = Array2::from_elem(
        (n_components, n_permutations),
        1.0 / (n_components * n_permutations) as f64,
    );
    let covariances = Covariances::init(
        config.covariance_type,
        pooled_covariance,
        n_components,
        n_permutations,
        config.min_covar,
    );
    MixtureParameters {
        weights,
        means,
        covariances,
        converged: false,
        log_likelihood: f64::NEG_INFINITY,
    }
}

fn run_trial(
    config: &PermutationGmmConfig,
    table: &PermutationTable,
    x: ArrayView3<'_, f64>,
    background: ArrayView2<'_, f64>,
    params: &mut MixtureParameters,
    trial: usize,
    observer: &mut dyn FitProgressObserver,
) -> Result<TrialSummary, EstimationError> {
    let mut history: Vec<f64> = Vec::with_capacity(config.n_iter);
    let mut outcome = TrialOutcome::MaxIterReached;

    for iteration in 0..config.n_iter {
        let start = Instant::now();

        let scores = score_block_samples(params, table, x)?;
        let confidence = max_posterior_histogram(scores.log_resp.view());
        m_step(config, table, x, background, params, &scores)?;

        let log_likelihood = scores.logprob.sum();
        history.push(log_likelihood);
        params.log_likelihood = log_likelihood;

        observer.on_iteration(&IterationReport {
            trial,
            n_trials: config.n_init,
            iteration,
            elapsed: start.elapsed(),
            log_likelihood,
            confidence,
        });

        if let [.., previous, current] = history.as_slice() {
            if has_converged(*previous, *current, config.thresh) {
                outcome = TrialOutcome::Converged;
                break;
            }
        }
    }

    let summary = TrialSummary {
        trial,
        iterations: history.len(),
        outcome,
        log_likelihood: params.log_likelihood,
        history,
    };
    params.converged = summary.converged();
    Ok(summary)
}

/// Updates weights, means and covariances in place from one E-step.
pub fn m_step(
    config: &PermutationGmmConfig,
    table: &PermutationTable,
    x: ArrayView3<'_, f64>,
    background: ArrayView2<'_, f64>,
    params: &mut MixtureParameters,
    scores: &BlockScores,
) -> Result<(), EstimationError> {
    let n_samples = x.shape()[0];
    let resp = scores.log_resp.mapv(f64::exp);

    let slot_mass = resp.sum_axis(Axis(0));
    params.weights = floor_weights(&(slot_mass / n_samples as f64));

    update_means(table, x, resp.view(), &mut params.means);

    let n_cov = config
        .covar_limit
        .map_or(n_samples, |limit| limit.min(n_samples));
    let inputs = ScatterInputs {
        data: x.slice(s![..n_cov, .., ..]),
        means: params.means.view(),
        resp: resp.slice(s![..n_cov, .., ..]),
        table,
    };
    let reg = Regularization {
        min_covar: config.min_covar,
        reg_covar: config.reg_covar,
        background,
    };
    params.covariances.update(&inputs, &reg)?;
    Ok(())
}

/// `means[k, p] = Σ_shift Σ_n resp[n, k, shift] · x[n, table[shift, p]]`, divided
/// by the component's total mass. A component with no mass keeps its means.
pub fn update_means(
    table: &PermutationTable,
    x: ArrayView3<'_, f64>,
    resp: ArrayView3<'_, f64>,
    means: &mut Array3<f64>,
) {
    let (n_components, n_permutations, _) = means.dim();
    let component_mass = resp.sum_axis(Axis(2)).sum_axis(Axis(0));

    for p in 0..n_permutations {
        let mut acc = Array2::<f64>::zeros((n_components, x.shape()[2]));
        for shift in 0..n_permutations {
            let view = x.index_axis(Axis(1), table.source(shift, p));
            let weights = resp.index_axis(Axis(2), shift);
            acc += &weights.t().dot(&view);
        }
        for k in 0..n_components {
            let mass = component_mass[k];
            if mass > f64::EPSILON {
                means
                    .slice_mut(s![k, p, ..])
                    .assign(&(&acc.row(k) / mass));
            }
        }
    }
}

/// Normalizes `mass` into mixing weights with every entry in
/// `[WEIGHT_FLOOR, 1 - WEIGHT_FLOOR]` and a total of exactly one.
pub fn floor_weights(mass: &Array2<f64>) -> Array2<f64> {
    let slots = mass.len();
    if slots == 1 {
        return Array2::ones(mass.raw_dim());
    }
    let uniform = Array2::from_elem(mass.raw_dim(), 1.0 / slots as f64);
    let spread = 1.0 - slots as f64 * WEIGHT_FLOOR;
    let total: f64 = mass.iter().map(|m| m.max(0.0)).sum();
    if spread <= 0.0 || !(total.is_finite() && total > 0.0) {
        return uniform;
    }
    mass.mapv(|m| WEIGHT_FLOOR + spread * m.max(0.0) / total)
}

/// Relative change test between consecutive log-likelihoods.
pub fn has_converged(previous: f64, current: f64, thresh: f64) -> bool {
    let diff = (current - previous).abs();
    diff == 0.0 || diff / previous.abs() < thresh
}

/// A trial replaces the incumbent when none exists yet or its log-likelihood
/// is strictly higher.
fn is_improvement(best: Option<&MixtureParameters>, candidate: &MixtureParameters) -> bool {
    match best {
        None => true,
        Some(incumbent) => candidate.log_likelihood > incumbent.log_likelihood,
    }
}
