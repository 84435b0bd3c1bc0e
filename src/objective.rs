//! Coefficients in, one scalar out.
//!
//! Each call runs the full lifecycle in a fresh workspace: write the model
//! instance, run the solver, parse and align its output, score it against
//! the experiment, append to the run log, delete the workspace. Recoverable
//! failures come back as the configured penalty; fatal ones are returned as
//! errors and end the session.

use crate::align::{self, AlignedPair};
use crate::coefficients::CoefficientVector;
use crate::config;
use crate::error::{CalibrationError, Result};
use crate::metric::ErrorMetric;
use crate::model::{ModelMutator, ModelTemplate};
use crate::runlog::{ErrorRecord, RunLogger, Status};
use crate::runner::{self, CancelToken, Solver, SolverJob};
use crate::series::{self, OutputSpec, TimeSeries};
use crate::workspace::Workspace;
use chrono::Utc;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const DIAGNOSTIC_LINES: usize = 10;

/// Per-evaluation settings that do not change during a session.
#[derive(Clone, Debug)]
pub struct Settings {
    pub penalty: f64,
    pub timeout: Duration,
    pub model_file: String,
    pub output_file: String,
    /// Solver log inside the workspace, tailed on failure
    pub solver_log: Option<String>,
    pub workspace_root: Option<PathBuf>,
    pub keep_failed_workspaces: bool,
}

impl Settings {
    pub fn from_config(cfg: &config::Root) -> Self {
        Self {
            penalty: cfg.objective.penalty,
            // out-of-range values are refused by the runner's deadline check
            timeout: Duration::try_from_secs_f64(cfg.solver.timeout_secs).unwrap_or(Duration::MAX),
            model_file: cfg.solver.model_file.clone(),
            output_file: cfg.output.file.clone(),
            solver_log: cfg.solver.log_file.clone(),
            workspace_root: cfg.session.workspace_root.clone(),
            keep_failed_workspaces: cfg.session.keep_failed_workspaces,
        }
    }
}

/// Everything an objective is built from.
pub struct Parts {
    pub template: ModelTemplate,
    pub mutator: ModelMutator,
    pub solver: Box<dyn Solver>,
    pub output: OutputSpec,
    pub experimental: TimeSeries,
    pub alignment: config::Alignment,
    pub metric: Box<dyn ErrorMetric>,
    pub logger: RunLogger,
    pub settings: Settings,
}

/// Result of one call to [`ObjectiveFunction::evaluate`].
#[derive(Clone, Debug, PartialEq)]
pub struct Evaluation {
    pub evaluation: usize,
    pub score: f64,
    /// Why the score is the penalty
    pub failure: Option<String>,
}

impl Evaluation {
    pub fn is_penalized(&self) -> bool {
        self.failure.is_some()
    }
}

pub struct ObjectiveFunction {
    template: ModelTemplate,
    mutator: ModelMutator,
    solver: Box<dyn Solver>,
    output: OutputSpec,
    experimental: TimeSeries,
    alignment: config::Alignment,
    metric: Box<dyn ErrorMetric>,
    logger: RunLogger,
    settings: Settings,
    cancel: CancelToken,
    evaluations: usize,
    penalized: usize,
    log_failures: usize,
}

impl ObjectiveFunction {
    pub fn new(parts: Parts) -> Self {
        Self {
            template: parts.template,
            mutator: parts.mutator,
            solver: parts.solver,
            output: parts.output,
            experimental: parts.experimental,
            alignment: parts.alignment,
            metric: parts.metric,
            logger: parts.logger,
            settings: parts.settings,
            cancel: CancelToken::new(),
            evaluations: 0,
            penalized: 0,
            log_failures: 0,
        }
    }

    /// Handle for aborting the session from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn evaluations(&self) -> usize {
        self.evaluations
    }

    pub fn penalized(&self) -> usize {
        self.penalized
    }

    /// Run log appends that failed.
    pub fn log_failures(&self) -> usize {
        self.log_failures
    }

    pub fn penalty(&self) -> f64 {
        self.settings.penalty
    }

    pub fn metric_name(&self) -> &'static str {
        self.metric.name()
    }

    pub fn run_log(&self) -> &RunLogger {
        &self.logger
    }

    pub fn evaluate(&mut self, coefficients: &CoefficientVector) -> Result<Evaluation> {
        if self.cancel.is_cancelled() {
            return Err(CalibrationError::Cancelled);
        }
        self.evaluations += 1;
        let evaluation = self.evaluations;
        let start = Instant::now();

        let outcome = match Workspace::acquire(self.settings.workspace_root.as_deref(), evaluation) {
            Ok(workspace) => {
                let outcome = self.run_in(&workspace, coefficients);
                if let Err(e) = &outcome {
                    self.report_diagnostics(&workspace, e);
                }
                self.finish(workspace, outcome.is_err());
                outcome
            }
            Err(e) => Err(e),
        };
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok(score) => {
                info!(evaluation, %coefficients, score, elapsed_ms, "evaluation complete");
                self.record(evaluation, coefficients, score, Status::Ok, None);
                Ok(Evaluation {
                    evaluation,
                    score,
                    failure: None,
                })
            }
            Err(e) if e.is_fatal() => {
                warn!(evaluation, %coefficients, error = %e, "evaluation aborted the session");
                let reason = format!("{}: {}", e.kind(), e);
                self.record(evaluation, coefficients, self.settings.penalty, Status::Aborted, Some(reason));
                Err(e)
            }
            Err(e) => {
                self.penalized += 1;
                let reason = format!("{}: {}", e.kind(), e);
                warn!(
                    evaluation,
                    %coefficients,
                    penalty = self.settings.penalty,
                    elapsed_ms,
                    reason = %reason,
                    "evaluation failed"
                );
                self.record(
                    evaluation,
                    coefficients,
                    self.settings.penalty,
                    Status::Penalized,
                    Some(reason.clone()),
                );
                Ok(Evaluation {
                    evaluation,
                    score: self.settings.penalty,
                    failure: Some(reason),
                })
            }
        }
    }

    /// Mutate, run, parse, align and score inside `workspace`.
    fn run_in(&self, workspace: &Workspace, coefficients: &CoefficientVector) -> Result<f64> {
        let instance = self.mutator.mutate(&self.template, coefficients)?;
        let input = workspace.join(&self.settings.model_file);
        instance.write_to(&input)?;

        let job = SolverJob {
            input,
            workdir: workspace.path().to_path_buf(),
            output: workspace.join(&self.settings.output_file),
            timeout: self.settings.timeout,
        };
        let result = self.solver.run(&job, &self.cancel)?;
        debug!(
            elapsed_ms = result.elapsed.as_secs_f64() * 1000.0,
            "solver finished"
        );

        let simulated = series::parse_simulated(&result, &self.output).inspect_err(|_| {
            if !result.stderr.trim().is_empty() {
                warn!(stderr = %runner::tail_lines(&result.stderr, DIAGNOSTIC_LINES), "solver stderr");
            }
        })?;
        let pair: AlignedPair = align::align(&simulated, &self.experimental, &self.alignment)?;
        debug!(
            points = pair.len(),
            coverage = pair.coverage(),
            first = ?pair.indices().first(),
            last = ?pair.indices().last(),
            "aligned"
        );
        self.metric.score(&pair)
    }

    /// Tail of the solver's own log when the run or its output went wrong.
    fn report_diagnostics(&self, workspace: &Workspace, error: &CalibrationError) {
        if !matches!(
            error,
            CalibrationError::ExecutionFailure { .. }
                | CalibrationError::Timeout(_)
                | CalibrationError::OutputParse(_)
        ) {
            return;
        }
        let Some(name) = &self.settings.solver_log else {
            return;
        };
        match fs::read_to_string(workspace.join(name)) {
            Ok(text) => warn!(
                log = %name,
                tail = %runner::tail_lines(&text, DIAGNOSTIC_LINES),
                "solver log"
            ),
            Err(e) => debug!(log = %name, error = %e, "solver log unavailable"),
        }
    }

    fn finish(&self, workspace: Workspace, failed: bool) {
        if failed && self.settings.keep_failed_workspaces {
            let path = workspace.persist();
            warn!(path = %path.display(), "kept failed workspace");
            return;
        }
        if let Err(e) = workspace.release() {
            warn!(error = %e, "failed to delete workspace");
        }
    }

    /// Logging problems are reported and counted, never returned.
    fn record(
        &mut self,
        evaluation: usize,
        coefficients: &CoefficientVector,
        error: f64,
        status: Status,
        reason: Option<String>,
    ) {
        let record = ErrorRecord {
            evaluation,
            timestamp: Utc::now(),
            coefficients: coefficients.clone(),
            error,
            status,
            reason,
        };
        if let Err(e) = self.logger.append(&record) {
            self.log_failures += 1;
            warn!(evaluation, error = %e, "run log append failed");
        }
    }
}
