use crate::config::{ConfigError, PermutationGmmConfig};
use crate::covariance::Covariances;
use crate::data::validate_block_samples;
use crate::estimate::{EstimationError, FitResult, fit_em};
use crate::permutation::PermutationTable;
use crate::progress::{FitProgressObserver, LogFitProgress, TrialSummary};
use crate::score::{self, BlockScores};
use ndarray::{Array1, Array2, Array3, ArrayView3};
use serde::{Deserialize, Serialize};

/// Parameters of one mixture solution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixtureParameters {
    /// Mixing proportions `(K, P)`, summing to one.
    pub weights: Array2<f64>,
    /// Mean block `(k, p)` for every component and permutation, `(K, P, D)`.
    pub means: Array3<f64>,
    pub covariances: Covariances,
    pub converged: bool,
    /// Total log-likelihood from the final E-step of the trial.
    pub log_likelihood: f64,
}

impl MixtureParameters {
    pub fn n_components(&self) -> usize {
        self.means.shape()[0]
    }

    pub fn n_permutations(&self) -> usize {
        self.means.shape()[1]
    }

    pub fn n_features(&self) -> usize {
        self.means.shape()[2]
    }
}

#[derive(Debug, Clone)]
struct FittedState {
    params: MixtureParameters,
    trials: Vec<TrialSummary>,
}

/// Gaussian mixture over samples observed in `P` permuted views.
#[derive(Debug, Clone)]
pub struct PermutationGmm {
    config: PermutationGmmConfig,
    table: PermutationTable,
    fitted: Option<FittedState>,
}

impl PermutationGmm {
    pub fn new(config: PermutationGmmConfig) -> Result<Self, ConfigError> {
        let table = config.validate()?;
        Ok(Self {
            config,
            table,
            fitted: None,
        })
    }

    /// Rebuilds a fitted model from stored parameters.
    pub fn from_parameters(
        config: PermutationGmmConfig,
        params: MixtureParameters,
    ) -> Result<Self, EstimationError> {
        let mut model = Self::new(config)?;
        model.check_parameters(&params)?;
        model.fitted = Some(FittedState {
            params,
            trials: Vec::new(),
        });
        Ok(model)
    }

    pub fn config(&self) -> &PermutationGmmConfig {
        &self.config
    }

    pub fn permutations(&self) -> &PermutationTable {
        &self.table
    }

    /// Fitted parameters, `None` before [`Self::fit`].
    pub fn parameters(&self) -> Option<&MixtureParameters> {
        self.fitted.as_ref().map(|state| &state.params)
    }

    pub fn converged(&self) -> Option<bool> {
        self.parameters().map(|params| params.converged)
    }

    /// Per-trial summaries from the last fit.
    pub fn trials(&self) -> &[TrialSummary] {
        match &self.fitted {
            Some(state) => &state.trials,
            None => &[],
        }
    }

    /// Fits the model with progress reported through `log`.
    pub fn fit(&mut self, x: ArrayView3<'_, f64>) -> Result<&MixtureParameters, EstimationError> {
        self.fit_with_progress(x, &mut LogFitProgress)
    }

    pub fn fit_with_progress(
        &mut self,
        x: ArrayView3<'_, f64>,
        observer: &mut dyn FitProgressObserver,
    ) -> Result<&MixtureParameters, EstimationError> {
        validate_block_samples(x, self.table.len(), None)?;
        let FitResult { params, trials } = fit_em(&self.config, &self.table, x, observer)?;
        let state = self.fitted.insert(FittedState { params, trials });
        Ok(&state.params)
    }

    /// Per-sample log-likelihood and `(N, K, P)` log responsibilities.
    pub fn score_block_samples(&self, x: ArrayView3<'_, f64>) -> Result<BlockScores, EstimationError> {
        let params = self.parameters().ok_or(EstimationError::NotFitted)?;
        validate_block_samples(x, self.table.len(), Some(params.n_features()))?;
        Ok(score::score_block_samples(params, &self.table, x)?)
    }

    pub fn score_samples(&self, x: ArrayView3<'_, f64>) -> Result<Array1<f64>, EstimationError> {
        Ok(self.score_block_samples(x)?.logprob)
    }

    /// Mean per-sample log-likelihood.
    pub fn score(&self, x: ArrayView3<'_, f64>) -> Result<f64, EstimationError> {
        let logprob = self.score_samples(x)?;
        Ok(logprob.sum() / logprob.len() as f64)
    }

    /// Most probable `(component, permutation)` per sample, flattened to
    /// `k * P + p`.
    pub fn predict_flat(&self, x: ArrayView3<'_, f64>) -> Result<Array1<usize>, EstimationError> {
        let scores = self.score_block_samples(x)?;
        Ok(score::argmax_flat(scores.log_resp.view()))
    }

    /// Most probable `[component, permutation]` pair per sample, `(N, 2)`.
    pub fn predict(&self, x: ArrayView3<'_, f64>) -> Result<Array2<usize>, EstimationError> {
        let flat = self.predict_flat(x)?;
        let n_permutations = self.table.len();
        Ok(Array2::from_shape_fn((flat.len(), 2), |(i, j)| match j {
            0 => flat[i] / n_permutations,
            _ => flat[i] % n_permutations,
        }))
    }

    fn check_parameters(&self, params: &MixtureParameters) -> Result<(), EstimationError> {
        let k = self.config.n_components;
        let p = self.table.len();
        let d = params.n_features();
        if params.weights.dim() != (k, p) {
            return Err(EstimationError::ParameterMismatch(format!(
                "weights have shape {:?}, expected ({k}, {p})",
                params.weights.dim()
            )));
        }
        if params.n_components() != k || params.n_permutations() != p || d == 0 {
            return Err(EstimationError::ParameterMismatch(format!(
                "means have shape {:?}, expected ({k}, {p}, D)",
                params.means.dim()
            )));
        }
        let kind = params.covariances.covariance_type();
        if kind != self.config.covariance_type {
            return Err(EstimationError::ParameterMismatch(format!(
                "covariances are '{kind}', configuration expects '{}'",
                self.config.covariance_type
            )));
        }
        let expected = kind.shape(k, p, d);
        let found = params.covariances.shape();
        if found != expected {
            return Err(EstimationError::ParameterMismatch(format!(
                "covariances have shape {found:?}, expected {expected:?}"
            )));
        }
        Ok(())
    }
}
