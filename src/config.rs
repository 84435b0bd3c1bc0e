use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Root {
    #[serde(default)]
    pub session: Session,
    pub template: Template,
    pub solver: Solver,
    pub experiment: Experiment,
    pub output: Output,
    #[serde(default)]
    pub alignment: Alignment,
    #[serde(default)]
    pub metric: Metric,
    #[serde(default)]
    pub objective: Objective,
    #[serde(default)]
    pub run_log: RunLog,
    #[serde(default)]
    pub optimizer: Optimizer,
    pub coefficients: Vec<CoefficientSpec>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Session {
    #[serde(default = "default_session_name")]
    pub name: String,
    /// Parent directory for per-evaluation workspaces (system temp if unset)
    pub workspace_root: Option<PathBuf>,
    /// Persist a failed evaluation's workspace for inspection
    #[serde(default)]
    pub keep_failed_workspaces: bool,
}

fn default_session_name() -> String {
    "calibration".to_string()
}

impl Default for Session {
    fn default() -> Self {
        Self {
            name: default_session_name(),
            workspace_root: None,
            keep_failed_workspaces: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Template {
    pub path: PathBuf,
    /// Value of the `id` attribute on the material block to calibrate
    #[serde(default = "default_material_id")]
    pub material_id: String,
}

fn default_material_id() -> String {
    "1".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Solver {
    pub program: String,
    /// Arguments; `{input}`, `{workdir}` and `{output}` are substituted
    #[serde(default = "default_solver_args")]
    pub args: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
    /// File name of the model instance inside the workspace
    #[serde(default = "default_model_file")]
    pub model_file: String,
    /// Solver log whose tail is reported when a run fails
    pub log_file: Option<String>,
}

fn default_solver_args() -> Vec<String> {
    vec!["-i".to_string(), "{input}".to_string()]
}
fn default_timeout_secs() -> f64 { 120.0 }

/// One week.
pub const MAX_TIMEOUT_SECS: f64 = 604_800.0;
fn default_model_file() -> String {
    "model.feb".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Experiment {
    pub path: PathBuf,
    pub index_column: String,
    /// Terms summed into the measured quantity
    pub value: Vec<ValueTerm>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ValueTerm {
    pub column: String,
    #[serde(default = "default_one")]
    pub scale: f64,
}

fn default_one() -> f64 { 1.0 }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    FebioLog,
    Csv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum IndexKind {
    Step,
    Time,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Aggregate {
    Sum,
    Mean,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Output {
    /// Artifact name inside the workspace
    pub file: String,
    #[serde(default = "default_output_format")]
    pub format: OutputFormat,
    #[serde(default = "default_index_kind")]
    pub index: IndexKind,
    /// Log-data element whose `file` attribute is pointed at `file`
    pub redirect: Option<Redirect>,
    pub node_ids: Option<Vec<u64>>,
    /// Surface in the template whose nodes are kept
    pub surface: Option<String>,
    #[serde(default = "default_aggregate")]
    pub aggregate: Aggregate,
    #[serde(default = "default_true")]
    pub drop_initial_step: bool,
    /// Column names for csv output
    pub index_column: Option<String>,
    pub value_column: Option<String>,
}

fn default_output_format() -> OutputFormat { OutputFormat::FebioLog }
fn default_index_kind() -> IndexKind { IndexKind::Step }
fn default_aggregate() -> Aggregate { Aggregate::Sum }
fn default_true() -> bool { true }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Redirect {
    /// Element tag, e.g. `node_data`
    pub tag: String,
    /// Value of its `data` attribute, e.g. `Rx`
    pub data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlignPolicy {
    /// Exact index match, else linear interpolation of the simulated series
    Index,
    /// Resample the experimental series over normalized progress
    Progress,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Alignment {
    #[serde(default = "default_align_policy")]
    pub policy: AlignPolicy,
    #[serde(default = "default_min_coverage")]
    pub min_coverage: f64,
}

fn default_align_policy() -> AlignPolicy { AlignPolicy::Index }
fn default_min_coverage() -> f64 { 0.5 }

impl Default for Alignment {
    fn default() -> Self {
        Self {
            policy: default_align_policy(),
            min_coverage: default_min_coverage(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MetricKind {
    Percent,
    Rms,
    Nrmse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ZeroPolicy {
    /// Leave zero-valued experimental points out of the mean
    Exclude,
    /// Use the absolute error (denominator 1) at zero-valued points
    Absolute,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Metric {
    #[serde(default = "default_metric_kind")]
    pub kind: MetricKind,
    #[serde(default = "default_zero_policy")]
    pub zero_policy: ZeroPolicy,
    #[serde(default = "default_zero_tolerance")]
    pub zero_tolerance: f64,
}

fn default_metric_kind() -> MetricKind { MetricKind::Percent }
fn default_zero_policy() -> ZeroPolicy { ZeroPolicy::Exclude }
fn default_zero_tolerance() -> f64 { 1e-12 }

impl Default for Metric {
    fn default() -> Self {
        Self {
            kind: default_metric_kind(),
            zero_policy: default_zero_policy(),
            zero_tolerance: default_zero_tolerance(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Objective {
    /// Score returned for a failed evaluation
    #[serde(default = "default_penalty")]
    pub penalty: f64,
}

fn default_penalty() -> f64 { 1e9 }

impl Default for Objective {
    fn default() -> Self {
        Self { penalty: default_penalty() }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunLog {
    #[serde(default = "default_run_log_path")]
    pub path: PathBuf,
}

fn default_run_log_path() -> PathBuf {
    PathBuf::from("run_log.csv")
}

impl Default for RunLog {
    fn default() -> Self {
        Self { path: default_run_log_path() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Method {
    BoundedScalar,
    NelderMead,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Optimizer {
    /// Defaults to bounded-scalar for one coefficient, nelder-mead otherwise
    pub method: Option<Method>,
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,
    #[serde(default = "default_xatol")]
    pub xatol: f64,
    #[serde(default = "default_fatol")]
    pub fatol: f64,
}

fn default_max_iter() -> usize { 40 }
fn default_xatol() -> f64 { 1e-3 }
fn default_fatol() -> f64 { 1e-4 }

impl Default for Optimizer {
    fn default() -> Self {
        Self {
            method: None,
            max_iter: default_max_iter(),
            xatol: default_xatol(),
            fatol: default_fatol(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoefficientSpec {
    pub name: String,
    pub initial: f64,
    pub lower: f64,
    pub upper: f64,
    /// Search in log10 space
    #[serde(default)]
    pub log_scale: bool,
}

impl Root {
    /// Read, parse and validate a config file. Relative paths inside it are
    /// resolved against the file's directory. Returns the raw text as well
    /// for hashing into result manifests.
    pub fn load(path: &Path) -> Result<(Self, String)> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        let mut cfg: Root = toml::from_str(&text)
            .with_context(|| format!("failed to parse config: {}", path.display()))?;
        cfg.validate()?;
        if let Some(base) = path.parent() {
            cfg.resolve_paths(base);
        }
        Ok((cfg, text))
    }

    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.template.path);
        resolve(&mut self.experiment.path);
        resolve(&mut self.run_log.path);
        if let Some(root) = self.session.workspace_root.as_mut() {
            resolve(root);
        }
    }

    pub fn method(&self) -> Method {
        self.optimizer.method.unwrap_or(if self.coefficients.len() == 1 {
            Method::BoundedScalar
        } else {
            Method::NelderMead
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.template.material_id.trim().is_empty() {
            bail!("template.material_id must not be empty");
        }
        if self.solver.program.trim().is_empty() {
            bail!("solver.program must not be empty");
        }
        if !(self.solver.timeout_secs > 0.0 && self.solver.timeout_secs <= MAX_TIMEOUT_SECS) {
            bail!("solver.timeout_secs must be in (0, {}]", MAX_TIMEOUT_SECS);
        }
        if self.solver.model_file.contains(['/', '\\']) {
            bail!("solver.model_file must be a bare file name");
        }
        if self.output.file.contains(['/', '\\']) {
            bail!("output.file must be a bare file name");
        }
        if self.experiment.value.is_empty() {
            bail!("experiment.value needs at least one column term");
        }
        if self.output.format == OutputFormat::Csv
            && (self.output.index_column.is_none() || self.output.value_column.is_none())
        {
            bail!("output.index_column and output.value_column are required for csv output");
        }
        if self.output.node_ids.is_some() && self.output.surface.is_some() {
            bail!("output.node_ids and output.surface are mutually exclusive");
        }
        if !(0.0..=1.0).contains(&self.alignment.min_coverage) {
            bail!("alignment.min_coverage must be in [0, 1]");
        }
        if !(self.metric.zero_tolerance >= 0.0) {
            bail!("metric.zero_tolerance must be non-negative");
        }
        if !(self.objective.penalty.is_finite() && self.objective.penalty > 0.0) {
            bail!("objective.penalty must be finite and positive");
        }
        if self.optimizer.max_iter == 0 || self.optimizer.max_iter > 10_000 {
            bail!("optimizer.max_iter must be in [1, 10000]");
        }
        if !(self.optimizer.xatol > 0.0) || !(self.optimizer.fatol > 0.0) {
            bail!("optimizer.xatol and optimizer.fatol must be positive");
        }

        if self.coefficients.is_empty() {
            bail!("at least one [[coefficients]] entry is required");
        }
        for (i, c) in self.coefficients.iter().enumerate() {
            if c.name.trim().is_empty() {
                bail!("coefficients[{}].name must not be empty", i);
            }
            if self.coefficients[..i].iter().any(|o| o.name == c.name) {
                bail!("coefficient '{}' listed twice", c.name);
            }
            if !(c.lower < c.upper) {
                bail!("coefficient '{}': lower must be < upper", c.name);
            }
            if !(c.lower..=c.upper).contains(&c.initial) {
                bail!("coefficient '{}': initial must lie within [lower, upper]", c.name);
            }
            if c.log_scale && c.lower <= 0.0 {
                bail!("coefficient '{}': log_scale needs a positive lower bound", c.name);
            }
        }
        if self.method() == Method::BoundedScalar && self.coefficients.len() != 1 {
            bail!("optimizer.method = bounded-scalar needs exactly one coefficient");
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) const SAMPLE: &str = r#"
[session]
name = "shear-cube"

[template]
path = "cube.feb"
material_id = "1"

[solver]
program = "febio4"
timeout_secs = 60

[experiment]
path = "shear.csv"
index_column = "Step"
value = [
    { column = "Force_Up_X (N)", scale = 0.5 },
    { column = "Force_Down_X (N)", scale = -0.5 },
]

[output]
file = "node_rx force.txt"
redirect = { tag = "node_data", data = "Rx" }
surface = "PrescribedDisplacement4"

[[coefficients]]
name = "c1"
initial = 1e-3
lower = 1e-10
upper = 1.0
log_scale = true
"#;
