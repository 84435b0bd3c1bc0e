//! Error taxonomy for a calibration session.
//!
//! Errors fall in two classes. Session-setup errors (bad template, unknown
//! coefficient, unusable experimental data, missing solver) are fatal and
//! abort before or during optimization. Per-evaluation errors (solver crash,
//! timeout, unparsable output, poor alignment) are recoverable: the
//! objective turns them into a penalty value and the search continues.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, CalibrationError>;

#[derive(Error, Debug)]
pub enum CalibrationError {
    /// Template is malformed or the material block is missing
    #[error("template parse error in {}: {}", .path.display(), .message)]
    TemplateParse { path: PathBuf, message: String },

    /// Coefficient name not found in the material block
    #[error("unknown parameter '{name}' in material block '{material_id}'")]
    UnknownParameter { name: String, material_id: String },

    /// Solver binary cannot be found or started
    #[error("solver not available: {0}")]
    SolverMissing(String),

    /// Solver exited with a non-zero status
    #[error("solver failed with exit code {exit_code}: {stderr_excerpt}")]
    ExecutionFailure { exit_code: i32, stderr_excerpt: String },

    /// Solver exceeded its time budget and was killed
    #[error("solver timed out after {:.1}s", .0.as_secs_f64())]
    Timeout(Duration),

    /// Expected output artifact absent or unparsable
    #[error("output parse error: {0}")]
    OutputParse(String),

    /// Experimental data file is malformed
    #[error("experimental data error: {0}")]
    ExperimentalData(String),

    /// Simulated and experimental series do not overlap enough
    #[error("alignment error: {0}")]
    Alignment(String),

    /// Metric cannot be computed from the aligned points
    #[error("metric error: {0}")]
    Metric(String),

    /// Run log could not be opened or written
    #[error("run log error: {0}")]
    Logging(String),

    /// Session aborted by the caller
    #[error("evaluation cancelled")]
    Cancelled,

    /// Minimizer rejected its setup or failed internally
    #[error("optimizer error: {0}")]
    Optimizer(String),

    /// Invalid configuration value
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CalibrationError {
    /// Fatal errors abort the session; the rest are penalized per evaluation.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::TemplateParse { .. }
                | Self::UnknownParameter { .. }
                | Self::SolverMissing(_)
                | Self::Cancelled
                | Self::Optimizer(_)
                | Self::Config(_)
        )
    }

    /// Short machine-readable tag written to the run log.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TemplateParse { .. } => "template_parse",
            Self::UnknownParameter { .. } => "unknown_parameter",
            Self::SolverMissing(_) => "solver_missing",
            Self::ExecutionFailure { .. } => "execution_failure",
            Self::Timeout(_) => "timeout",
            Self::OutputParse(_) => "output_parse",
            Self::ExperimentalData(_) => "experimental_data",
            Self::Alignment(_) => "alignment",
            Self::Metric(_) => "metric",
            Self::Logging(_) => "logging",
            Self::Cancelled => "cancelled",
            Self::Optimizer(_) => "optimizer",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let template = CalibrationError::TemplateParse {
            path: PathBuf::from("model.feb"),
            message: "no material".to_string(),
        };
        assert!(template.is_fatal());
        assert!(CalibrationError::Cancelled.is_fatal());
        assert!(CalibrationError::Optimizer("bad simplex".to_string()).is_fatal());

        assert!(!CalibrationError::Timeout(Duration::from_secs(3)).is_fatal());
        assert!(!CalibrationError::OutputParse("missing".to_string()).is_fatal());
        assert!(!CalibrationError::Alignment("empty".to_string()).is_fatal());
        assert!(!CalibrationError::ExecutionFailure {
            exit_code: 1,
            stderr_excerpt: String::new()
        }
        .is_fatal());
    }

    #[test]
    fn test_messages() {
        let err = CalibrationError::Timeout(Duration::from_millis(2500));
        assert_eq!(err.to_string(), "solver timed out after 2.5s");
        assert_eq!(err.kind(), "timeout");

        let err = CalibrationError::UnknownParameter {
            name: "k9".to_string(),
            material_id: "1".to_string(),
        };
        assert!(err.to_string().contains("'k9'"));
    }
}
