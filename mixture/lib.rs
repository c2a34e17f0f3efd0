#![deny(unused_imports)]
#![deny(unused_variables)]
#![deny(dead_code)]

pub mod config;
pub mod covariance;
pub mod data;
pub mod estimate;
pub mod linalg;
pub mod model;
pub mod permutation;
pub mod progress;
pub mod score;

pub use config::{ConfigError, PermutationGmmConfig};
pub use covariance::{CovarianceType, Covariances};
pub use data::ShapeError;
pub use estimate::{EstimationError, FitResult};
pub use model::{MixtureParameters, PermutationGmm};
pub use permutation::{PermutationSpec, PermutationTable};
pub use progress::{
    FitProgressObserver, IterationReport, LogFitProgress, NoopFitProgress, TrialOutcome,
    TrialSummary,
};
pub use score::BlockScores;
