//! Covariance sharing policies.
//!
//! Each policy decides how many distinct covariance matrices the mixture carries
//! and which `(component, permutation)` slots share them. The policy is picked
//! once from configuration; the scorer only sees the per-slot [`GaussianFactor`]s
//! built by [`Covariances::factorize`].

use crate::config::ConfigError;
use crate::linalg::{
    FaerCholesky, FaerCholeskyFactor, FaerLinalgError, clamp_spectrum, log_two_pi_term,
    symmetrize,
};
use crate::permutation::PermutationTable;
use faer::Side;
use itertools::iproduct;
use ndarray::{
    Array1, Array2, Array3, Array4, ArrayView1, ArrayView2, ArrayView3, Axis, Zip, s,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The seven supported covariance structures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CovarianceType {
    /// Unit diagonal `(D,)`, never updated.
    Ones,
    /// One full `(D, D)` matrix for every slot.
    Tied,
    /// A diagonal per `(k, p)`, shape `(K, P, D)`.
    Diag,
    /// A diagonal per permutation shared across components, `(P, D)`.
    DiagPerm,
    /// A full matrix per component shared across permutations, `(K, D, D)`.
    Full,
    /// A full matrix per permutation shared across components, `(P, D, D)`.
    FullPerm,
    /// A full matrix per `(k, p)`, `(K, P, D, D)`.
    FullFull,
}

impl CovarianceType {
    pub const ALL: [CovarianceType; 7] = [
        CovarianceType::Ones,
        CovarianceType::Tied,
        CovarianceType::Diag,
        CovarianceType::DiagPerm,
        CovarianceType::Full,
        CovarianceType::FullPerm,
        CovarianceType::FullFull,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Ones => "ones",
            Self::Tied => "tied",
            Self::Diag => "diag",
            Self::DiagPerm => "diag-perm",
            Self::Full => "full",
            Self::FullPerm => "full-perm",
            Self::FullFull => "full-full",
        }
    }

    /// Number of distinct covariances for `K` components and `P` permutations.
    pub fn n_groups(self, n_components: usize, n_permutations: usize) -> usize {
        match self {
            Self::Ones | Self::Tied => 1,
            Self::Diag | Self::FullFull => n_components * n_permutations,
            Self::DiagPerm | Self::FullPerm => n_permutations,
            Self::Full => n_components,
        }
    }

    /// Storage shape for `K` components, `P` permutations and `D` features.
    pub fn shape(self, n_components: usize, n_permutations: usize, d: usize) -> Vec<usize> {
        let (k, p) = (n_components, n_permutations);
        match self {
            Self::Ones => vec![d],
            Self::Tied => vec![d, d],
            Self::Diag => vec![k, p, d],
            Self::DiagPerm => vec![p, d],
            Self::Full => vec![k, d, d],
            Self::FullPerm => vec![p, d, d],
            Self::FullFull => vec![k, p, d, d],
        }
    }

    /// Covariance group used by slot `(k, p)`.
    #[inline]
    pub fn group_of(self, k: usize, p: usize, n_permutations: usize) -> usize {
        match self {
            Self::Ones | Self::Tied => 0,
            Self::Diag | Self::FullFull => k * n_permutations + p,
            Self::DiagPerm | Self::FullPerm => p,
            Self::Full => k,
        }
    }
}

impl fmt::Display for CovarianceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CovarianceType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| ConfigError::UnknownCovarianceType(s.to_string()))
    }
}

/// Inputs for a covariance M-step. `resp` is in the probability domain.
pub struct ScatterInputs<'a> {
    pub data: ArrayView3<'a, f64>,
    pub means: ArrayView3<'a, f64>,
    pub resp: ArrayView3<'a, f64>,
    pub table: &'a PermutationTable,
}

pub struct Regularization<'a> {
    pub min_covar: f64,
    /// Blend factor toward `background`; only `full-full` uses it.
    pub reg_covar: f64,
    pub background: ArrayView2<'a, f64>,
}

/// Covariance state, one variant per [`CovarianceType`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Covariances {
    Ones(Array1<f64>),
    Tied(Array2<f64>),
    Diag(Array3<f64>),
    DiagPerm(Array2<f64>),
    Full(Array3<f64>),
    FullPerm(Array3<f64>),
    FullFull(Array4<f64>),
}

impl Covariances {
    /// Initial covariances from the pooled empirical covariance of every view.
    pub fn init(
        kind: CovarianceType,
        pooled: ArrayView2<'_, f64>,
        n_components: usize,
        n_permutations: usize,
        min_covar: f64,
    ) -> Self {
        let d = pooled.nrows();
        let mut cv = pooled.to_owned();
        cv.diag_mut().mapv_inplace(|v| v + min_covar);
        let diag = cv.diag().to_owned();
        let (k, p) = (n_components, n_permutations);
        match kind {
            CovarianceType::Ones => Covariances::Ones(Array1::ones(d)),
            CovarianceType::Tied => Covariances::Tied(cv),
            CovarianceType::Diag => {
                Covariances::Diag(Array3::from_shape_fn((k, p, d), |(_, _, i)| diag[i]))
            }
            CovarianceType::DiagPerm => {
                Covariances::DiagPerm(Array2::from_shape_fn((p, d), |(_, i)| diag[i]))
            }
            CovarianceType::Full => {
                Covariances::Full(Array3::from_shape_fn((k, d, d), |(_, i, j)| cv[(i, j)]))
            }
            CovarianceType::FullPerm => {
                Covariances::FullPerm(Array3::from_shape_fn((p, d, d), |(_, i, j)| cv[(i, j)]))
            }
            CovarianceType::FullFull => Covariances::FullFull(Array4::from_shape_fn(
                (k, p, d, d),
                |(_, _, i, j)| cv[(i, j)],
            )),
        }
    }

    pub fn covariance_type(&self) -> CovarianceType {
        match self {
            Covariances::Ones(_) => CovarianceType::Ones,
            Covariances::Tied(_) => CovarianceType::Tied,
            Covariances::Diag(_) => CovarianceType::Diag,
            Covariances::DiagPerm(_) => CovarianceType::DiagPerm,
            Covariances::Full(_) => CovarianceType::Full,
            Covariances::FullPerm(_) => CovarianceType::FullPerm,
            Covariances::FullFull(_) => CovarianceType::FullFull,
        }
    }

    pub fn shape(&self) -> Vec<usize> {
        match self {
            Covariances::Ones(a) => a.shape().to_vec(),
            Covariances::Tied(a) | Covariances::DiagPerm(a) => a.shape().to_vec(),
            Covariances::Diag(a) | Covariances::Full(a) | Covariances::FullPerm(a) => {
                a.shape().to_vec()
            }
            Covariances::FullFull(a) => a.shape().to_vec(),
        }
    }

    /// Re-estimates the covariances from responsibilities and the updated means,
    /// then regularizes them. `ones` is left untouched.
    pub fn update(
        &mut self,
        inputs: &ScatterInputs<'_>,
        reg: &Regularization<'_>,
    ) -> Result<(), FaerLinalgError> {
        let kind = self.covariance_type();
        let (n_components, n_permutations, _) = inputs.means.dim();
        let n_groups = kind.n_groups(n_components, n_permutations);
        let group_of = |k: usize, p: usize| kind.group_of(k, p, n_permutations);

        match self {
            Covariances::Ones(_) => return Ok(()),
            Covariances::Tied(cov) => {
                let groups = weighted_full_scatter(inputs, n_groups, group_of);
                cov.assign(&groups[0]);
            }
            Covariances::Full(covs) | Covariances::FullPerm(covs) => {
                let groups = weighted_full_scatter(inputs, n_groups, group_of);
                for (g, scatter) in groups.iter().enumerate() {
                    covs.index_axis_mut(Axis(0), g).assign(scatter);
                }
            }
            Covariances::FullFull(covs) => {
                let groups = weighted_full_scatter(inputs, n_groups, group_of);
                for (k, p) in iproduct!(0..n_components, 0..n_permutations) {
                    covs.slice_mut(s![k, p, .., ..])
                        .assign(&groups[group_of(k, p)]);
                }
            }
            Covariances::Diag(vars) => {
                let groups = weighted_diag_scatter(inputs, n_groups, group_of);
                for (k, p) in iproduct!(0..n_components, 0..n_permutations) {
                    vars.slice_mut(s![k, p, ..]).assign(&groups[group_of(k, p)]);
                }
            }
            Covariances::DiagPerm(vars) => {
                let groups = weighted_diag_scatter(inputs, n_groups, group_of);
                for (g, scatter) in groups.iter().enumerate() {
                    vars.index_axis_mut(Axis(0), g).assign(scatter);
                }
            }
        }
        self.regularize(reg)
    }

    /// Floors every covariance so its eigenvalues (or diagonal entries) are at
    /// least `min_covar`.
    pub fn regularize(&mut self, reg: &Regularization<'_>) -> Result<(), FaerLinalgError> {
        let floor = reg.min_covar;
        match self {
            Covariances::Ones(_) => {}
            Covariances::Tied(cov) => {
                symmetrize(cov);
                cov.diag_mut().mapv_inplace(|v| v + floor);
            }
            Covariances::Diag(vars) => vars.mapv_inplace(|v| floor_variance(v, floor)),
            Covariances::DiagPerm(vars) => vars.mapv_inplace(|v| floor_variance(v, floor)),
            Covariances::Full(covs) | Covariances::FullPerm(covs) => {
                for mut cov in covs.outer_iter_mut() {
                    let clamped = clamp_spectrum(&cov.to_owned(), floor)?;
                    cov.assign(&clamped);
                }
            }
            Covariances::FullFull(covs) => {
                let blend = reg.reg_covar;
                let (n_components, n_permutations, _, _) = covs.dim();
                for (k, p) in iproduct!(0..n_components, 0..n_permutations) {
                    let mut cov = covs.slice(s![k, p, .., ..]).to_owned();
                    if blend > 0.0 {
                        cov *= 1.0 - blend;
                        cov.scaled_add(blend, &reg.background);
                    }
                    symmetrize(&mut cov);
                    cov.diag_mut().mapv_inplace(|v| v + floor);
                    covs.slice_mut(s![k, p, .., ..]).assign(&cov);
                }
            }
        }
        Ok(())
    }

    /// Dense covariance matrix used by slot `(k, p)`.
    pub fn slot_matrix(&self, k: usize, p: usize) -> Array2<f64> {
        match self {
            Covariances::Ones(vars) => Array2::from_diag(vars),
            Covariances::Tied(cov) => cov.clone(),
            Covariances::Diag(vars) => Array2::from_diag(&vars.slice(s![k, p, ..])),
            Covariances::DiagPerm(vars) => Array2::from_diag(&vars.row(p)),
            Covariances::Full(covs) => covs.index_axis(Axis(0), k).to_owned(),
            Covariances::FullPerm(covs) => covs.index_axis(Axis(0), p).to_owned(),
            Covariances::FullFull(covs) => covs.slice(s![k, p, .., ..]).to_owned(),
        }
    }

    /// Builds one log-density evaluator per distinct covariance.
    pub fn factorize(
        &self,
        n_components: usize,
        n_permutations: usize,
    ) -> Result<CovarianceFactors, FaerLinalgError> {
        let kind = self.covariance_type();
        let factors = match self {
            Covariances::Ones(vars) => vec![GaussianFactor::diagonal(vars.view())],
            Covariances::DiagPerm(vars) => vars
                .outer_iter()
                .map(GaussianFactor::diagonal)
                .collect(),
            Covariances::Diag(vars) => iproduct!(0..n_components, 0..n_permutations)
                .map(|(k, p)| GaussianFactor::diagonal(vars.slice(s![k, p, ..])))
                .collect(),
            Covariances::Tied(cov) => vec![GaussianFactor::full(cov.view())?],
            Covariances::Full(covs) | Covariances::FullPerm(covs) => covs
                .outer_iter()
                .map(GaussianFactor::full)
                .collect::<Result<Vec<_>, _>>()?,
            Covariances::FullFull(covs) => iproduct!(0..n_components, 0..n_permutations)
                .map(|(k, p)| GaussianFactor::full(covs.slice(s![k, p, .., ..])))
                .collect::<Result<Vec<_>, _>>()?,
        };
        Ok(CovarianceFactors {
            kind,
            n_permutations,
            factors,
        })
    }
}

#[inline]
fn floor_variance(v: f64, floor: f64) -> f64 {
    if v.is_finite() { v.max(floor) } else { floor }
}

/// `Σ_{slots in g} Σ_shift Σ_n resp[n,k,p] r rᵀ / (P · Σ_{slots in g} mass)` for
/// residuals `r = data[n, table[shift, p]] − means[k, shift]`.
fn weighted_full_scatter(
    inputs: &ScatterInputs<'_>,
    n_groups: usize,
    group_of: impl Fn(usize, usize) -> usize,
) -> Vec<Array2<f64>> {
    let (n_components, n_permutations, d) = inputs.means.dim();
    let mut scatter = vec![Array2::<f64>::zeros((d, d)); n_groups];
    let mut mass = vec![0.0_f64; n_groups];

    for (k, p) in iproduct!(0..n_components, 0..n_permutations) {
        let g = group_of(k, p);
        let w = inputs.resp.slice(s![.., k, p]);
        mass[g] += w.sum();
        for shift in 0..n_permutations {
            let resid = residuals(inputs, k, p, shift);
            let weighted = &resid * &w.insert_axis(Axis(1));
            scatter[g] += &weighted.t().dot(&resid);
        }
    }

    scatter
        .into_iter()
        .zip(mass)
        .map(|(acc, m)| acc / (n_permutations as f64 * m.max(f64::EPSILON)))
        .collect()
}

/// Diagonal counterpart of [`weighted_full_scatter`].
fn weighted_diag_scatter(
    inputs: &ScatterInputs<'_>,
    n_groups: usize,
    group_of: impl Fn(usize, usize) -> usize,
) -> Vec<Array1<f64>> {
    let (n_components, n_permutations, d) = inputs.means.dim();
    let mut scatter = vec![Array1::<f64>::zeros(d); n_groups];
    let mut mass = vec![0.0_f64; n_groups];

    for (k, p) in iproduct!(0..n_components, 0..n_permutations) {
        let g = group_of(k, p);
        let w = inputs.resp.slice(s![.., k, p]);
        mass[g] += w.sum();
        for shift in 0..n_permutations {
            let squared = residuals(inputs, k, p, shift).mapv(|r| r * r);
            scatter[g] += &squared.t().dot(&w);
        }
    }

    scatter
        .into_iter()
        .zip(mass)
        .map(|(acc, m)| acc / (n_permutations as f64 * m.max(f64::EPSILON)))
        .collect()
}

fn residuals(inputs: &ScatterInputs<'_>, k: usize, p: usize, shift: usize) -> Array2<f64> {
    let view = inputs
        .data
        .index_axis(Axis(1), inputs.table.source(shift, p));
    &view - &inputs.means.slice(s![k, shift, ..])
}

/// Precomputed Gaussian normalizer and whitening data for one covariance.
pub enum GaussianFactor {
    Diagonal {
        inv_var: Array1<f64>,
        log_norm: f64,
    },
    Full {
        factor: FaerCholeskyFactor,
        log_norm: f64,
    },
}

impl GaussianFactor {
    fn diagonal(vars: ArrayView1<'_, f64>) -> Self {
        let log_det: f64 = vars.iter().map(|v| v.ln()).sum();
        GaussianFactor::Diagonal {
            inv_var: vars.mapv(|v| 1.0 / v),
            log_norm: -0.5 * (log_two_pi_term(vars.len()) + log_det),
        }
    }

    fn full(cov: ArrayView2<'_, f64>) -> Result<Self, FaerLinalgError> {
        let factor = cov.cholesky(Side::Lower)?;
        let log_norm = -0.5 * (log_two_pi_term(cov.nrows()) + factor.log_det());
        Ok(GaussianFactor::Full { factor, log_norm })
    }

    /// Gaussian log-density of each row of `rows` around `mean`.
    pub fn log_density_rows(
        &self,
        rows: ArrayView2<'_, f64>,
        mean: ArrayView1<'_, f64>,
    ) -> Array1<f64> {
        match self {
            GaussianFactor::Diagonal { inv_var, log_norm } => {
                let mut out = Array1::zeros(rows.nrows());
                Zip::from(&mut out)
                    .and(rows.rows())
                    .par_for_each(|o, row| {
                        let quad: f64 = row
                            .iter()
                            .zip(mean.iter())
                            .zip(inv_var.iter())
                            .map(|((x, m), iv)| (x - m) * (x - m) * iv)
                            .sum();
                        *o = log_norm - 0.5 * quad;
                    });
                out
            }
            GaussianFactor::Full { factor, log_norm } => {
                let resid = &rows - &mean;
                factor
                    .mahalanobis_rows(resid.view())
                    .mapv(|quad| log_norm - 0.5 * quad)
            }
        }
    }
}

/// Per-slot lookup into the distinct covariance factors.
pub struct CovarianceFactors {
    kind: CovarianceType,
    n_permutations: usize,
    factors: Vec<GaussianFactor>,
}

impl CovarianceFactors {
    #[inline]
    pub fn slot(&self, k: usize, p: usize) -> &GaussianFactor {
        &self.factors[self.kind.group_of(k, p, self.n_permutations)]
    }
}
