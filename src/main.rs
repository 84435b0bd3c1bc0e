mod align;
mod coefficients;
mod config;
mod error;
mod metric;
mod model;
mod objective;
mod optimizer;
mod runlog;
mod runner;
mod series;
mod session;
mod workspace;


use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use coefficients::CoefficientVector;
use runner::CancelToken;
use serde::Serialize;
use session::{CalibrationReport, CalibrationSession};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const SCHEMA_VERSION: &str = "1.0.0";

#[derive(Parser, Debug)]
#[command(name = "febcal")]
#[command(version)]
#[command(about = "Calibrate material coefficients of a finite-element model against experimental data")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Path to TOML session configuration
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output path (file)
    #[arg(short, long, global = true)]
    out: Option<PathBuf>,

    /// More log output (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Search for the coefficients that best reproduce the experiment
    Calibrate {
        /// Write a JSON result bundle
        #[arg(long)]
        json: bool,
    },
    /// Run one evaluation at the initial guess
    Evaluate {
        /// Override a coefficient, `name=value`
        #[arg(long = "set", value_name = "NAME=VALUE")]
        set: Vec<String>,
    },
    /// Write a model instance without running the solver
    Mutate {
        #[arg(long = "set", value_name = "NAME=VALUE")]
        set: Vec<String>,
    },
    /// Run all session-setup checks without invoking the solver
    Validate,
    /// Print version information
    Version,
}

// ============================================================================
// JSON Output Structures
// ============================================================================

#[derive(Serialize)]
struct Manifest {
    schema_version: String,
    febcal_version: String,
    session: String,
    timestamp_utc: DateTime<Utc>,
    platform: String,
    config_hash: String,
    config_snapshot: config::Root,
}

#[derive(Serialize)]
struct Summary {
    coefficients: Vec<CoefficientValue>,
    error: f64,
    metric: String,
    method: config::Method,
    evaluations: usize,
    penalized_evaluations: usize,
    iterations: usize,
    converged: bool,
    wall_time_ms: f64,
    run_log: PathBuf,
}

#[derive(Serialize)]
struct CoefficientValue {
    name: String,
    value: f64,
}

#[derive(Serialize)]
struct ResultBundle {
    manifest: Manifest,
    summary: Summary,
}

// ============================================================================
// Helper Functions
// ============================================================================

fn compute_hash(data: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    data.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

fn create_manifest(cfg: &config::Root, cfg_text: &str) -> Manifest {
    Manifest {
        schema_version: SCHEMA_VERSION.to_string(),
        febcal_version: VERSION.to_string(),
        session: cfg.session.name.clone(),
        timestamp_utc: Utc::now(),
        platform: std::env::consts::OS.to_string(),
        config_hash: compute_hash(cfg_text),
        config_snapshot: cfg.clone(),
    }
}

fn create_summary(cfg: &config::Root, report: &CalibrationReport) -> Summary {
    Summary {
        coefficients: report
            .coefficients
            .iter()
            .map(|(name, value)| CoefficientValue {
                name: name.to_string(),
                value,
            })
            .collect(),
        error: report.error,
        metric: report.metric.clone(),
        method: report.method,
        evaluations: report.evaluations,
        penalized_evaluations: report.penalized_evaluations,
        iterations: report.iterations,
        converged: report.converged,
        wall_time_ms: report.elapsed.as_secs_f64() * 1000.0,
        run_log: cfg.run_log.path.clone(),
    }
}

/// Initial guess with `name=value` overrides applied.
fn coefficients_with_overrides(cfg: &config::Root, overrides: &[String]) -> Result<CoefficientVector> {
    let mut coefficients = coefficients::SearchSpace::new(cfg.coefficients.clone()).initial_coefficients();
    for item in overrides {
        let (name, value) = item
            .split_once('=')
            .with_context(|| format!("--set expects NAME=VALUE, got '{}'", item))?;
        let name = name.trim();
        let value: f64 = value
            .trim()
            .parse()
            .with_context(|| format!("--set {}: '{}' is not a number", name, value))?;
        if coefficients.get(name).is_none() {
            bail!("--set {}: not a configured coefficient", name);
        }
        coefficients.set(name, value);
    }
    Ok(coefficients)
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "febcal=info",
        1 => "febcal=debug",
        _ => "febcal=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Ctrl-C cancels the running evaluation. The solver is killed and its
/// workspace removed before the session returns.
fn cancel_on_interrupt(token: CancelToken) -> Result<()> {
    ctrlc::set_handler(move || {
        tracing::warn!("interrupt received, stopping the session");
        token.cancel();
    })
    .context("failed to install Ctrl-C handler")
}

fn load_config(path: Option<PathBuf>) -> Result<(config::Root, String)> {
    let path = path.context("--config required")?;
    config::Root::load(&path)
}

// ============================================================================
// Run Modes
// ============================================================================

fn run_calibrate(cfg: &config::Root, cfg_text: &str, out_path: &Path, json_output: bool) -> Result<()> {
    let mut session = CalibrationSession::setup(cfg).context("session setup failed")?;
    cancel_on_interrupt(session.cancel_token())?;
    let report = session.calibrate().context("calibration aborted")?;

    println!("coefficients: {}", report.coefficients);
    println!(
        "error: {:.6} ({}) after {} evaluations ({} penalized)",
        report.error, report.metric, report.evaluations, report.penalized_evaluations
    );

    if report.log_failures > 0 {
        tracing::warn!(
            failures = report.log_failures,
            path = %cfg.run_log.path.display(),
            "some run log records were not written"
        );
    }

    if json_output {
        if let Some(parent) = out_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let bundle = ResultBundle {
            manifest: create_manifest(cfg, cfg_text),
            summary: create_summary(cfg, &report),
        };
        let json = serde_json::to_string_pretty(&bundle)?;
        fs::write(out_path, json)
            .with_context(|| format!("failed to write {}", out_path.display()))?;
        tracing::info!(path = %out_path.display(), "JSON bundle written");
    }

    if report.penalized_evaluations == report.evaluations {
        bail!(
            "no evaluation succeeded; see {}",
            cfg.run_log.path.display()
        );
    }
    Ok(())
}

fn run_evaluate(cfg: &config::Root, overrides: &[String]) -> Result<()> {
    let coefficients = coefficients_with_overrides(cfg, overrides)?;
    let mut session = CalibrationSession::setup(cfg).context("session setup failed")?;
    cancel_on_interrupt(session.cancel_token())?;
    let evaluation = session.evaluate(&coefficients)?;

    println!("coefficients: {}", coefficients);
    match &evaluation.failure {
        None => println!("error: {:.6} ({})", evaluation.score, session.objective().metric_name()),
        Some(reason) => println!("error: {:e} (penalty: {})", evaluation.score, reason),
    }
    Ok(())
}

fn run_mutate(cfg: &config::Root, overrides: &[String], out_path: &Path) -> Result<()> {
    let coefficients = coefficients_with_overrides(cfg, overrides)?;
    let instance = session::instance(cfg, &coefficients)?;
    instance.write_to(out_path)?;
    println!("{}", out_path.display());
    Ok(())
}

fn validate_config(cfg_path: Option<PathBuf>) -> Result<()> {
    let (cfg, _) = load_config(cfg_path)?;
    let summary = session::validate(&cfg).context("session setup failed")?;

    println!("config valid: {}", cfg.session.name);
    println!(
        "  material {}: {}",
        summary.material_id,
        summary.material_fields.join(", ")
    );
    for (name, value) in &summary.template_values {
        match value {
            Some(v) => println!("  coefficient {}: template value {}", name, v),
            None => println!("  coefficient {}: template value not numeric", name),
        }
    }
    match summary.experimental_span {
        Some((lo, hi)) => println!(
            "  experiment: {} points over [{}, {}]",
            summary.experimental_points, lo, hi
        ),
        None => println!("  experiment: {} points", summary.experimental_points),
    }
    match summary.selected_nodes {
        Some(n) => println!("  output: {} selected nodes", n),
        None => println!("  output: all nodes"),
    }
    println!("  method: {:?}", cfg.method());
    Ok(())
}

fn print_version() {
    println!("febcal {}", VERSION);
    println!("  schema version: {}", SCHEMA_VERSION);
    println!("  platform:       {}/{}", std::env::consts::OS, std::env::consts::ARCH);
    println!("  metrics:        percent, rms, nrmse");
    println!("  methods:        bounded-scalar, nelder-mead");
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    match args.command {
        Commands::Version => {
            print_version();
            Ok(())
        }
        Commands::Validate => validate_config(args.config),
        Commands::Calibrate { json } => {
            let (cfg, cfg_text) = load_config(args.config)?;
            let out_path = args
                .out
                .unwrap_or_else(|| PathBuf::from("results/calibration.json"));
            run_calibrate(&cfg, &cfg_text, &out_path, json)
        }
        Commands::Evaluate { set } => {
            let (cfg, _) = load_config(args.config)?;
            run_evaluate(&cfg, &set)
        }
        Commands::Mutate { set } => {
            let (cfg, _) = load_config(args.config)?;
            let out_path = args.out.unwrap_or_else(|| PathBuf::from("instance.feb"));
            run_mutate(&cfg, &set, &out_path)
        }
    }
}
