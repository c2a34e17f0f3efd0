use crate::score::CONFIDENCE_BINS;
use std::fmt;
use std::time::Duration;

/// How an EM trial stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrialOutcome {
    Converged,
    MaxIterReached,
}

impl TrialOutcome {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Converged => "converged",
            Self::MaxIterReached => "reached the iteration cap",
        }
    }
}

impl fmt::Display for TrialOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Diagnostics for one completed EM iteration.
#[derive(Clone, Debug)]
pub struct IterationReport {
    /// Zero-based trial index.
    pub trial: usize,
    pub n_trials: usize,
    /// Zero-based iteration index within the trial.
    pub iteration: usize,
    pub elapsed: Duration,
    /// Total log-likelihood from this iteration's E-step.
    pub log_likelihood: f64,
    /// Samples binned by their largest posterior over `[0, 1]`.
    pub confidence: [usize; CONFIDENCE_BINS],
}

/// Final state of one EM trial.
#[derive(Clone, Debug, PartialEq)]
pub struct TrialSummary {
    pub trial: usize,
    pub iterations: usize,
    pub outcome: TrialOutcome,
    pub log_likelihood: f64,
    /// Per-iteration log-likelihoods, in order.
    pub history: Vec<f64>,
}

impl TrialSummary {
    pub fn converged(&self) -> bool {
        self.outcome == TrialOutcome::Converged
    }
}

/// Observer for reporting progress while fitting a mixture.
pub trait FitProgressObserver {
    fn on_trial_start(&mut self, trial: usize, n_trials: usize) {
        let _ = (trial, n_trials);
    }
    fn on_iteration(&mut self, report: &IterationReport) {
        let _ = report;
    }
    fn on_trial_finish(&mut self, summary: &TrialSummary, improved: bool) {
        let _ = (summary, improved);
    }
}

#[derive(Default)]
pub struct NoopFitProgress;

impl FitProgressObserver for NoopFitProgress {}

/// Reports progress through the `log` facade.
#[derive(Default)]
pub struct LogFitProgress;

impl FitProgressObserver for LogFitProgress {
    fn on_trial_start(&mut self, trial: usize, n_trials: usize) {
        log::debug!("Starting EM trial {}/{}", trial + 1, n_trials);
    }

    fn on_iteration(&mut self, report: &IterationReport) {
        log::debug!("Max-posterior histogram: {:?}", report.confidence);
        log::info!(
            "Trial {}/{}  Iteration {}  Time {:.2}s  Log-likelihood {}",
            report.trial + 1,
            report.n_trials,
            report.iteration + 1,
            report.elapsed.as_secs_f64(),
            report.log_likelihood
        );
    }

    fn on_trial_finish(&mut self, summary: &TrialSummary, improved: bool) {
        if improved {
            log::info!(
                "Trial {} {} after {} iterations; updated best log-likelihood to {}",
                summary.trial + 1,
                summary.outcome,
                summary.iterations,
                summary.log_likelihood
            );
        } else {
            log::info!(
                "Trial {} {} after {} iterations; log-likelihood {} did not improve the best",
                summary.trial + 1,
                summary.outcome,
                summary.iterations,
                summary.log_likelihood
            );
        }
    }
}
