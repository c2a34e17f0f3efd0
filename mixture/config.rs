use crate::covariance::CovarianceType;
use crate::permutation::{PermutationSpec, PermutationTable};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_MIN_COVAR: f64 = 1e-3;
pub const DEFAULT_N_ITER: usize = 20;
pub const DEFAULT_THRESH: f64 = 1e-2;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Covariance type '{0}' is not supported")]
    UnknownCovarianceType(String),
    #[error("Permutation table must contain at least one permutation")]
    EmptyPermutationTable,
    #[error("Permutation table must be square, found {rows} rows and {cols} columns")]
    NonSquarePermutationTable { rows: usize, cols: usize },
    #[error(
        "Permutation table entry ({shift}, {target}) = {value} is outside [0, {size})"
    )]
    PermutationIndexOutOfRange {
        shift: usize,
        target: usize,
        value: usize,
        size: usize,
    },
    #[error("{field} must be at least 1")]
    ZeroCount { field: &'static str },
    #[error("min_covar must be positive and finite, got {0}")]
    InvalidMinCovar(f64),
    #[error("min_covar {0} exceeds the unit variances of the 'ones' covariance type")]
    MinCovarAboveUnitVariance(f64),
    #[error("thresh must be non-negative and finite, got {0}")]
    InvalidThreshold(f64),
    #[error("reg_covar must lie in [0, 1], got {0}")]
    InvalidRegCovar(f64),
    #[error("covar_limit must be at least 1 when set")]
    InvalidCovarLimit,
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParse(#[from] toml::de::Error),
}

/// Estimator settings, fixed once a [`crate::model::PermutationGmm`] is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermutationGmmConfig {
    pub n_components: usize,
    pub permutations: PermutationSpec,
    pub covariance_type: CovarianceType,
    /// Variance floor applied to every covariance after initialization and update.
    pub min_covar: f64,
    pub n_iter: usize,
    pub n_init: usize,
    pub random_state: u64,
    /// Relative log-likelihood change below which a trial counts as converged.
    pub thresh: f64,
    /// Only the first `covar_limit` samples feed the covariance update.
    pub covar_limit: Option<usize>,
    /// Blend toward the background covariance, `full-full` only.
    pub reg_covar: f64,
}

impl Default for PermutationGmmConfig {
    fn default() -> Self {
        Self {
            n_components: 1,
            permutations: PermutationSpec::default(),
            covariance_type: CovarianceType::Tied,
            min_covar: DEFAULT_MIN_COVAR,
            n_iter: DEFAULT_N_ITER,
            n_init: 1,
            random_state: 0,
            thresh: DEFAULT_THRESH,
            covar_limit: None,
            reg_covar: 0.0,
        }
    }
}

impl PermutationGmmConfig {
    pub fn new(n_components: usize, permutations: PermutationSpec) -> Self {
        Self {
            n_components,
            permutations,
            ..Default::default()
        }
    }

    pub fn with_covariance_type(mut self, covariance_type: CovarianceType) -> Self {
        self.covariance_type = covariance_type;
        self
    }

    pub fn with_min_covar(mut self, min_covar: f64) -> Self {
        self.min_covar = min_covar;
        self
    }

    pub fn with_n_iter(mut self, n_iter: usize) -> Self {
        self.n_iter = n_iter;
        self
    }

    pub fn with_n_init(mut self, n_init: usize) -> Self {
        self.n_init = n_init;
        self
    }

    pub fn with_random_state(mut self, seed: u64) -> Self {
        self.random_state = seed;
        self
    }

    pub fn with_thresh(mut self, thresh: f64) -> Self {
        self.thresh = thresh;
        self
    }

    pub fn with_covar_limit(mut self, limit: usize) -> Self {
        self.covar_limit = Some(limit);
        self
    }

    pub fn with_reg_covar(mut self, reg_covar: f64) -> Self {
        self.reg_covar = reg_covar;
        self
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Checks every field and builds the permutation table.
    pub fn validate(&self) -> Result<PermutationTable, ConfigError> {
        if self.n_components == 0 {
            return Err(ConfigError::ZeroCount {
                field: "n_components",
            });
        }
        if self.n_iter == 0 {
            return Err(ConfigError::ZeroCount { field: "n_iter" });
        }
        if self.n_init == 0 {
            return Err(ConfigError::ZeroCount { field: "n_init" });
        }
        if !(self.min_covar.is_finite() && self.min_covar > 0.0) {
            return Err(ConfigError::InvalidMinCovar(self.min_covar));
        }
        if self.covariance_type == CovarianceType::Ones && self.min_covar > 1.0 {
            return Err(ConfigError::MinCovarAboveUnitVariance(self.min_covar));
        }
        if !(self.thresh.is_finite() && self.thresh >= 0.0) {
            return Err(ConfigError::InvalidThreshold(self.thresh));
        }
        if !(0.0..=1.0).contains(&self.reg_covar) {
            return Err(ConfigError::InvalidRegCovar(self.reg_covar));
        }
        if self.covar_limit == Some(0) {
            return Err(ConfigError::InvalidCovarLimit);
        }
        PermutationTable::from_spec(&self.permutations)
    }
}
