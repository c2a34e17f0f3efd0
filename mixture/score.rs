//! Log-domain E-step.
//!
//! Slot `(k, p)` explains a whole sample: view `table[shift, p]` is scored
//! against mean block `means[k, shift]` for every `shift`, and the per-view
//! log-densities add up with the prior `ln weights[k, p]`.

use crate::linalg::FaerLinalgError;
use crate::model::MixtureParameters;
use crate::permutation::PermutationTable;
use ndarray::{Array1, Array3, ArrayView3, Axis, s};
use rayon::prelude::*;

/// Lower clip for normalized log responsibilities.
pub const LOG_RESP_FLOOR: f64 = -500.0;

/// Number of bins in the max-posterior confidence histogram.
pub const CONFIDENCE_BINS: usize = 10;

#[derive(Debug, Clone)]
pub struct BlockScores {
    /// Total log-likelihood of each sample, `(N,)`.
    pub logprob: Array1<f64>,
    /// Normalized log posterior over `(component, permutation)`, `(N, K, P)`.
    pub log_resp: Array3<f64>,
}

/// Unnormalized joint log-evidence, `(N, K, P)`.
pub fn joint_log_evidence(
    params: &MixtureParameters,
    table: &PermutationTable,
    x: ArrayView3<'_, f64>,
) -> Result<Array3<f64>, FaerLinalgError> {
    let n = x.shape()[0];
    let (n_components, n_permutations, _) = params.means.dim();
    let factors = params
        .covariances
        .factorize(n_components, n_permutations)?;

    let log_weights = params.weights.mapv(f64::ln);
    let mut joint = Array3::from_shape_fn((n, n_components, n_permutations), |(_, k, p)| {
        log_weights[(k, p)]
    });

    for p in 0..n_permutations {
        for shift in 0..n_permutations {
            let view = x.index_axis(Axis(1), table.source(shift, p));
            for k in 0..n_components {
                let density = factors
                    .slot(k, p)
                    .log_density_rows(view, params.means.slice(s![k, shift, ..]));
                let mut slot = joint.slice_mut(s![.., k, p]);
                slot += &density;
            }
        }
    }
    Ok(joint)
}

/// Scores complete samples (all views at once) under the full model.
pub fn score_block_samples(
    params: &MixtureParameters,
    table: &PermutationTable,
    x: ArrayView3<'_, f64>,
) -> Result<BlockScores, FaerLinalgError> {
    let joint = joint_log_evidence(params, table, x)?;
    let logprob: Array1<f64> = joint
        .axis_iter(Axis(0))
        .into_par_iter()
        .map(|slab| logsumexp(slab.iter().copied()))
        .collect::<Vec<_>>()
        .into();

    let mut log_resp = joint;
    for (mut slab, &total) in log_resp.outer_iter_mut().zip(logprob.iter()) {
        // -inf - -inf is NaN; f64::max discards it in favor of the floor.
        slab.mapv_inplace(|v| (v - total).max(LOG_RESP_FLOOR));
    }
    Ok(BlockScores { logprob, log_resp })
}

/// Numerically stable `ln Σ exp(v)`.
pub fn logsumexp(values: impl Iterator<Item = f64> + Clone) -> f64 {
    let max = values.clone().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// Index into the flattened `(K, P)` axes with the largest posterior, lowest
/// index on ties.
pub fn argmax_flat(log_resp: ArrayView3<'_, f64>) -> Array1<usize> {
    log_resp
        .outer_iter()
        .map(|slab| {
            slab.iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |(best, best_v), (i, &v)| {
                    if v > best_v { (i, v) } else { (best, best_v) }
                })
                .0
        })
        .collect()
}

/// Histogram of each sample's largest posterior over `[0, 1]`.
pub fn max_posterior_histogram(log_resp: ArrayView3<'_, f64>) -> [usize; CONFIDENCE_BINS] {
    let mut bins = [0usize; CONFIDENCE_BINS];
    for slab in log_resp.outer_iter() {
        let best = slab.fold(f64::NEG_INFINITY, |m, &v| m.max(v)).exp();
        let idx = ((best * CONFIDENCE_BINS as f64) as usize).min(CONFIDENCE_BINS - 1);
        bins[idx] += 1;
    }
    bins
}
