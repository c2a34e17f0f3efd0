use ndarray::ArrayView3;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ShapeError {
    #[error("Observation tensor has no samples")]
    NoSamples,
    #[error("Observation tensor has no feature dimensions")]
    NoFeatures,
    #[error("Observation tensor has {found} permuted views, but the permutation table has {expected}")]
    PermutationMismatch { found: usize, expected: usize },
    #[error("Observation tensor has {found} features, but the model was fitted on {expected}")]
    FeatureMismatch { found: usize, expected: usize },
    #[error("Observation tensor contains a non-finite value at sample {sample}, view {view}, feature {feature}")]
    NonFinite {
        sample: usize,
        view: usize,
        feature: usize,
    },
}

/// Checks an `(N, P, D)` observation tensor against the configured number of
/// views and, once fitted, the feature count.
pub fn validate_block_samples(
    x: ArrayView3<'_, f64>,
    n_permutations: usize,
    n_features: Option<usize>,
) -> Result<(), ShapeError> {
    let (n, p, d) = x.dim();
    if n == 0 {
        return Err(ShapeError::NoSamples);
    }
    if p != n_permutations {
        return Err(ShapeError::PermutationMismatch {
            found: p,
            expected: n_permutations,
        });
    }
    if d == 0 {
        return Err(ShapeError::NoFeatures);
    }
    if let Some(expected) = n_features {
        if d != expected {
            return Err(ShapeError::FeatureMismatch { found: d, expected });
        }
    }
    if let Some(((sample, view, feature), _)) = x.indexed_iter().find(|(_, v)| !v.is_finite()) {
        return Err(ShapeError::NonFinite {
            sample,
            view,
            feature,
        });
    }
    Ok(())
}
