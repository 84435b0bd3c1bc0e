//! Session setup and the calibration driver.
//!
//! Setup performs every check that can fail before the first solver run:
//! template scan, coefficient names, output node selection, experimental
//! data, solver availability and the run log. Any failure here aborts the
//! session with zero evaluations.

use crate::coefficients::{CoefficientVector, SearchSpace};
use crate::config::{self, Method};
use crate::error::Result;
use crate::metric;
use crate::model::{ModelInstance, ModelMutator, ModelTemplate};
use crate::objective::{Evaluation, ObjectiveFunction, Parts, Settings};
use crate::optimizer::{Brent, BrentConfig, NelderMead, NelderMeadConfig, OptimizationResult};
use crate::runlog::RunLogger;
use crate::runner::{CancelToken, ExternalSolver, Solver};
use crate::series::{self, OutputSpec, TimeSeries};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// What setup found, reported by `validate`.
#[derive(Clone, Debug)]
pub struct SetupSummary {
    pub material_id: String,
    pub material_fields: Vec<String>,
    /// Value each calibrated coefficient has in the template, if numeric
    pub template_values: Vec<(String, Option<f64>)>,
    pub experimental_points: usize,
    pub experimental_span: Option<(f64, f64)>,
    /// `None` when every output row is kept
    pub selected_nodes: Option<usize>,
}

#[derive(Clone, Debug)]
pub struct CalibrationReport {
    pub method: Method,
    pub coefficients: CoefficientVector,
    pub error: f64,
    pub evaluations: usize,
    pub penalized_evaluations: usize,
    /// Run log appends that failed
    pub log_failures: usize,
    pub iterations: usize,
    pub converged: bool,
    pub metric: String,
    pub elapsed: Duration,
}

/// Checked pieces from which an objective is assembled.
struct Prepared {
    template: ModelTemplate,
    mutator: ModelMutator,
    output: OutputSpec,
    experimental: TimeSeries,
    space: SearchSpace,
}

/// Load and cross-check everything except the run log.
fn prepare(cfg: &config::Root, solver: &dyn Solver) -> Result<Prepared> {
    let template = ModelTemplate::load(&cfg.template.path, &cfg.template.material_id)?;
    let mutator = match &cfg.output.redirect {
        Some(redirect) => ModelMutator::with_redirect(&template, redirect, &cfg.output.file)?,
        None => ModelMutator::new(),
    };

    let space = SearchSpace::new(cfg.coefficients.clone());
    // a dry mutation surfaces unknown coefficient names now
    mutator.mutate(&template, &space.initial_coefficients())?;

    let output = OutputSpec::from_config(&cfg.output, &template)?;
    let experimental = series::load_experimental(&cfg.experiment)?;
    solver.verify()?;

    Ok(Prepared {
        template,
        mutator,
        output,
        experimental,
        space,
    })
}

/// Run the setup checks without opening the run log or invoking the solver.
pub fn validate(cfg: &config::Root) -> Result<SetupSummary> {
    let solver = external_solver(cfg);
    let prepared = prepare(cfg, &solver)?;
    Ok(SetupSummary {
        material_id: prepared.template.material_id().to_string(),
        material_fields: prepared.template.field_names().map(String::from).collect(),
        template_values: prepared
            .space
            .names()
            .into_iter()
            .map(|name| {
                let value = prepared.template.default_value(&name);
                (name, value)
            })
            .collect(),
        experimental_points: prepared.experimental.len(),
        experimental_span: prepared.experimental.span(),
        selected_nodes: prepared.output.node_ids.as_ref().map(|ids| ids.len()),
    })
}

/// Model instance for `coefficients`, with output redirection applied.
pub fn instance(cfg: &config::Root, coefficients: &CoefficientVector) -> Result<ModelInstance> {
    let template = ModelTemplate::load(&cfg.template.path, &cfg.template.material_id)?;
    let mutator = match &cfg.output.redirect {
        Some(redirect) => ModelMutator::with_redirect(&template, redirect, &cfg.output.file)?,
        None => ModelMutator::new(),
    };
    mutator.mutate(&template, coefficients)
}

fn external_solver(cfg: &config::Root) -> ExternalSolver {
    ExternalSolver::new(cfg.solver.program.clone(), cfg.solver.args.clone())
}

pub struct CalibrationSession {
    cfg: config::Root,
    space: SearchSpace,
    objective: ObjectiveFunction,
}

impl CalibrationSession {
    /// Set up with the configured external solver.
    pub fn setup(cfg: &config::Root) -> Result<Self> {
        Self::with_solver(cfg, Box::new(external_solver(cfg)))
    }

    pub fn with_solver(cfg: &config::Root, solver: Box<dyn Solver>) -> Result<Self> {
        let prepared = prepare(cfg, solver.as_ref())?;
        let logger = RunLogger::open(&cfg.run_log.path, prepared.space.names())?;
        info!(
            session = %cfg.session.name,
            template = %prepared.template.path().display(),
            experimental_points = prepared.experimental.len(),
            run_log = %logger.path().display(),
            "session ready"
        );

        let objective = ObjectiveFunction::new(Parts {
            template: prepared.template,
            mutator: prepared.mutator,
            solver,
            output: prepared.output,
            experimental: prepared.experimental,
            alignment: cfg.alignment.clone(),
            metric: metric::from_config(&cfg.metric),
            logger,
            settings: Settings::from_config(cfg),
        });
        Ok(Self {
            cfg: cfg.clone(),
            space: prepared.space,
            objective,
        })
    }

    pub fn objective(&self) -> &ObjectiveFunction {
        &self.objective
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.objective.cancel_token()
    }

    /// One evaluation at explicit coefficients.
    pub fn evaluate(&mut self, coefficients: &CoefficientVector) -> Result<Evaluation> {
        self.objective.evaluate(coefficients)
    }

    /// Search the coefficient space for the smallest error.
    pub fn calibrate(&mut self) -> Result<CalibrationReport> {
        let start = Instant::now();
        let method = self.cfg.method();
        let opt = &self.cfg.optimizer;
        let space = &self.space;
        let objective = &mut self.objective;
        let bounds = space.bounds();

        info!(?method, coefficients = ?space.names(), max_iter = opt.max_iter, "calibration started");

        let result: OptimizationResult = match method {
            Method::BoundedScalar => {
                let (lower, upper) = bounds[0];
                Brent::new(BrentConfig {
                    lower,
                    upper,
                    xatol: opt.xatol,
                    // the first evaluation happens before iteration one
                    max_iter: opt.max_iter.saturating_sub(1).max(1) as u64,
                })
                .minimize(|x| {
                    objective
                        .evaluate(&space.to_coefficients(&[x]))
                        .map(|e| e.score)
                })?
            }
            Method::NelderMead => NelderMead::new(NelderMeadConfig {
                max_iter: opt.max_iter as u64,
                fatol: opt.fatol,
                bounds,
                ..Default::default()
            })
            .minimize(&space.initial_point(), |x| {
                objective.evaluate(&space.to_coefficients(x)).map(|e| e.score)
            })?,
        };

        let coefficients = space.to_coefficients(&result.x);
        if objective.penalized() == objective.evaluations() {
            warn!(
                evaluations = objective.evaluations(),
                run_log = %objective.run_log().path().display(),
                "every evaluation failed"
            );
        }

        let report = CalibrationReport {
            method,
            coefficients,
            error: result.fun,
            evaluations: objective.evaluations(),
            penalized_evaluations: objective.penalized(),
            log_failures: objective.log_failures(),
            iterations: result.iterations,
            converged: result.converged,
            metric: objective.metric_name().to_string(),
            elapsed: start.elapsed(),
        };
        info!(
            coefficients = %report.coefficients,
            error = report.error,
            evaluations = report.evaluations,
            penalized = report.penalized_evaluations,
            logged = objective.run_log().written(),
            converged = report.converged,
            "calibration finished"
        );
        Ok(report)
    }
}
