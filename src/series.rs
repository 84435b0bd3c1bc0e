//! Indexed series, experimental data loading and solver output parsing.

use crate::config::{self, Aggregate, IndexKind, OutputFormat};
use crate::error::{CalibrationError, Result};
use crate::model::ModelTemplate;
use crate::runner::ExecutionResult;
use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

/// Ordered `(index, value)` pairs with a strictly increasing index.
#[derive(Clone, Debug, PartialEq)]
pub struct TimeSeries {
    points: Vec<(f64, f64)>,
}

impl TimeSeries {
    pub fn new(points: Vec<(f64, f64)>) -> std::result::Result<Self, String> {
        for (i, &(x, y)) in points.iter().enumerate() {
            if !x.is_finite() || !y.is_finite() {
                return Err(format!("point {} is not finite ({}, {})", i, x, y));
            }
            if i > 0 && x <= points[i - 1].0 {
                return Err(format!(
                    "index not strictly increasing at point {} ({} after {})",
                    i,
                    x,
                    points[i - 1].0
                ));
            }
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[(f64, f64)] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Index range covered, `None` when empty.
    pub fn span(&self) -> Option<(f64, f64)> {
        Some((self.points.first()?.0, self.points.last()?.0))
    }

    /// Value at `x`: exact when an index matches, linear between the
    /// bracketing points otherwise, `None` outside the span.
    pub fn value_at(&self, x: f64) -> Option<f64> {
        let (lo, hi) = self.span()?;
        if x < lo || x > hi {
            return None;
        }
        let i = self.points.partition_point(|p| p.0 < x);
        let (x1, y1) = self.points[i];
        if x1 == x {
            return Some(y1);
        }
        let (x0, y0) = self.points[i - 1];
        Some(y0 + (y1 - y0) * (x - x0) / (x1 - x0))
    }
}

/// Load the measured series. Columns are found by header name; the value
/// is the configured linear combination of columns.
pub fn load_experimental(cfg: &config::Experiment) -> Result<TimeSeries> {
    let terms: Vec<(&str, f64)> = cfg
        .value
        .iter()
        .map(|t| (t.column.as_str(), t.scale))
        .collect();
    let points = read_columns(&cfg.path, &cfg.index_column, &terms)
        .map_err(CalibrationError::ExperimentalData)?;
    if points.len() < 2 {
        return Err(CalibrationError::ExperimentalData(format!(
            "{}: need at least two rows, found {}",
            cfg.path.display(),
            points.len()
        )));
    }
    TimeSeries::new(points)
        .map_err(|e| CalibrationError::ExperimentalData(format!("{}: {}", cfg.path.display(), e)))
}

fn read_columns(
    path: &Path,
    index_column: &str,
    terms: &[(&str, f64)],
) -> std::result::Result<Vec<(f64, f64)>, String> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| format!("{}: {}", path.display(), e))?;
    let headers = reader
        .headers()
        .map_err(|e| format!("{}: {}", path.display(), e))?
        .clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| format!("{}: missing required column '{}'", path.display(), name))
    };

    let index_col = column(index_column)?;
    let term_cols = terms
        .iter()
        .map(|&(name, scale)| Ok((column(name)?, name, scale)))
        .collect::<std::result::Result<Vec<_>, String>>()?;

    let mut points = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let row = i + 2;
        let record = record.map_err(|e| format!("{}: row {}: {}", path.display(), row, e))?;
        let number = |col: usize, name: &str| {
            record
                .get(col)
                .and_then(|s| s.parse::<f64>().ok())
                .filter(|v| v.is_finite())
                .ok_or_else(|| {
                    format!("{}: row {}: column '{}' is not a number", path.display(), row, name)
                })
        };
        let x = number(index_col, index_column)?;
        let mut y = 0.0;
        for &(col, name, scale) in &term_cols {
            y += scale * number(col, name)?;
        }
        points.push((x, y));
    }
    Ok(points)
}

/// How to turn the solver's artifact into a series.
#[derive(Clone, Debug)]
pub struct OutputSpec {
    pub format: OutputFormat,
    pub index: IndexKind,
    /// Rows from other ids are ignored; `None` keeps every row
    pub node_ids: Option<BTreeSet<u64>>,
    pub aggregate: Aggregate,
    pub drop_initial_step: bool,
    pub index_column: Option<String>,
    pub value_column: Option<String>,
}

impl OutputSpec {
    /// Resolve the configured node filter, reading surface nodes from the
    /// template when a surface is named.
    pub fn from_config(cfg: &config::Output, template: &ModelTemplate) -> Result<Self> {
        let node_ids = match (&cfg.node_ids, &cfg.surface) {
            (Some(ids), _) => Some(ids.iter().copied().collect()),
            (None, Some(surface)) => Some(template.surface_node_ids(surface)?.into_iter().collect()),
            (None, None) => None,
        };
        Ok(Self {
            format: cfg.format,
            index: cfg.index,
            node_ids,
            aggregate: cfg.aggregate,
            drop_initial_step: cfg.drop_initial_step,
            index_column: cfg.index_column.clone(),
            value_column: cfg.value_column.clone(),
        })
    }
}

/// Parse the artifact a successful run produced.
pub fn parse_simulated(result: &ExecutionResult, spec: &OutputSpec) -> Result<TimeSeries> {
    let path = &result.output_path;
    let points = match spec.format {
        OutputFormat::FebioLog => {
            let text = fs::read_to_string(path).map_err(|e| match e.kind() {
                ErrorKind::NotFound => CalibrationError::OutputParse(format!(
                    "expected output artifact not found: {}",
                    path.display()
                )),
                _ => CalibrationError::OutputParse(format!("{}: {}", path.display(), e)),
            })?;
            parse_febio_log(&text, spec).map_err(CalibrationError::OutputParse)?
        }
        OutputFormat::Csv => {
            if !path.is_file() {
                return Err(CalibrationError::OutputParse(format!(
                    "expected output artifact not found: {}",
                    path.display()
                )));
            }
            let index_column = spec.index_column.as_deref().unwrap_or("step");
            let value_column = spec.value_column.as_deref().unwrap_or("value");
            let mut points = read_columns(path, index_column, &[(value_column, 1.0)])
                .map_err(CalibrationError::OutputParse)?;
            if spec.drop_initial_step {
                points.retain(|p| p.0 != 0.0);
            }
            points
        }
    };

    if points.is_empty() {
        return Err(CalibrationError::OutputParse(format!(
            "no data for the selected nodes in {}",
            path.display()
        )));
    }
    TimeSeries::new(points)
        .map_err(|e| CalibrationError::OutputParse(format!("{}: {}", path.display(), e)))
}

struct StepBlock {
    step: u64,
    time: Option<f64>,
    values: Vec<f64>,
}

/// Logfile layout: `*Step = N`, `*Time = t` and `*Data = ...` headers, then
/// `id value` rows. Rows before the first step header are ignored, as are
/// rows that do not start with two numbers.
fn parse_febio_log(text: &str, spec: &OutputSpec) -> std::result::Result<Vec<(f64, f64)>, String> {
    let mut blocks: Vec<StepBlock> = Vec::new();
    let mut current: Option<usize> = None;

    for (n, line) in text.lines().enumerate() {
        let s = line.trim();
        if s.is_empty() {
            continue;
        }
        if let Some(header) = s.strip_prefix('*') {
            let Some((key, value)) = header.split_once('=') else {
                continue;
            };
            match key.trim().to_ascii_lowercase().as_str() {
                "step" => {
                    let step = value
                        .trim()
                        .parse::<f64>()
                        .ok()
                        .filter(|v| *v >= 0.0 && v.fract() == 0.0)
                        .ok_or_else(|| format!("line {}: bad step header '{}'", n + 1, s))?
                        as u64;
                    let idx = match blocks.iter().position(|b| b.step == step) {
                        Some(idx) => idx,
                        None => {
                            blocks.push(StepBlock { step, time: None, values: Vec::new() });
                            blocks.len() - 1
                        }
                    };
                    current = Some(idx);
                }
                "time" => {
                    if let Some(idx) = current {
                        blocks[idx].time = value.trim().parse::<f64>().ok();
                    }
                }
                _ => {}
            }
            continue;
        }

        let Some(idx) = current else {
            continue;
        };
        let mut tokens = s
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|t| !t.is_empty());
        let (Some(id), Some(value)) = (tokens.next(), tokens.next()) else {
            continue;
        };
        let (Ok(id), Ok(value)) = (id.parse::<f64>(), value.parse::<f64>()) else {
            continue;
        };
        if id < 0.0 || id.fract() != 0.0 {
            continue;
        }
        let keep = spec
            .node_ids
            .as_ref()
            .map_or(true, |ids| ids.contains(&(id as u64)));
        if keep {
            blocks[idx].values.push(value);
        }
    }

    let mut points = Vec::new();
    for block in blocks {
        if block.values.is_empty() || (spec.drop_initial_step && block.step == 0) {
            continue;
        }
        let sum: f64 = block.values.iter().sum();
        let value = match spec.aggregate {
            Aggregate::Sum => sum,
            Aggregate::Mean => sum / block.values.len() as f64,
        };
        let index = match spec.index {
            IndexKind::Step => block.step as f64,
            IndexKind::Time => block
                .time
                .ok_or_else(|| format!("step {} has no *Time header", block.step))?,
        };
        points.push((index, value));
    }
    points.sort_by(|a, b| a.0.total_cmp(&b.0));
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValueTerm;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;

    const LOG: &str = "\
Data Record #1
===========================================================================
*Step  = 0
*Time  = 0
*Data  = Rx
5 0.0
35 0.0
99 7.0
*Step  = 1
*Time  = 0.1
*Data  = Rx
5 2.5
35 2.75
99 100.0
*Step  = 2
*Time  = 0.2
*Data  = Rx
5 5.0
35 5.5
";

    fn spec() -> OutputSpec {
        OutputSpec {
            format: OutputFormat::FebioLog,
            index: IndexKind::Step,
            node_ids: Some([5, 35].into_iter().collect()),
            aggregate: Aggregate::Sum,
            drop_initial_step: false,
            index_column: None,
            value_column: None,
        }
    }

    fn result_for(path: PathBuf) -> ExecutionResult {
        ExecutionResult {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            output_path: path,
            elapsed: Duration::ZERO,
        }
    }

    #[test]
    fn test_series_rejects_non_monotonic() {
        assert!(TimeSeries::new(vec![(0.0, 1.0), (1.0, 2.0)]).is_ok());
        assert!(TimeSeries::new(vec![(0.0, 1.0), (0.0, 2.0)]).is_err());
        assert!(TimeSeries::new(vec![(1.0, 1.0), (0.5, 2.0)]).is_err());
        assert!(TimeSeries::new(vec![(0.0, f64::NAN)]).is_err());
    }

    #[test]
    fn test_value_at() {
        let s = TimeSeries::new(vec![(0.0, 0.0), (1.0, 10.0), (3.0, 30.0)]).unwrap();
        assert_eq!(s.value_at(1.0), Some(10.0));
        assert_eq!(s.value_at(2.0), Some(20.0));
        assert_eq!(s.value_at(0.0), Some(0.0));
        assert_eq!(s.value_at(3.0), Some(30.0));
        assert_eq!(s.value_at(3.5), None);
        assert_eq!(s.value_at(-0.1), None);
    }

    #[test]
    fn test_parse_febio_log_filters_and_sums() {
        let points = parse_febio_log(LOG, &spec()).unwrap();
        assert_eq!(points, vec![(0.0, 0.0), (1.0, 5.25), (2.0, 10.5)]);
    }

    #[test]
    fn test_parse_febio_log_mean_time_index() {
        let mut spec = spec();
        spec.aggregate = Aggregate::Mean;
        spec.index = IndexKind::Time;
        spec.drop_initial_step = true;
        let points = parse_febio_log(LOG, &spec).unwrap();
        assert_eq!(points, vec![(0.1, 2.625), (0.2, 5.25)]);
    }

    #[test]
    fn test_parse_febio_log_all_nodes() {
        let mut spec = spec();
        spec.node_ids = None;
        let points = parse_febio_log(LOG, &spec).unwrap();
        assert_eq!(points[0], (0.0, 7.0));
        assert_eq!(points[1], (1.0, 105.25));
    }

    #[test]
    fn test_missing_artifact() {
        let dir = TempDir::new().unwrap();
        let err = parse_simulated(&result_for(dir.path().join("absent.txt")), &spec()).unwrap_err();
        assert!(matches!(err, CalibrationError::OutputParse(ref m) if m.contains("not found")));
    }

    #[test]
    fn test_no_selected_nodes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rx.txt");
        fs::write(&path, LOG).unwrap();
        let mut spec = spec();
        spec.node_ids = Some([12345].into_iter().collect());
        let err = parse_simulated(&result_for(path), &spec).unwrap_err();
        assert!(matches!(err, CalibrationError::OutputParse(_)));
    }

    #[test]
    fn test_parse_csv_output() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.csv");
        fs::write(&path, "step,force\n0,0\n1,1.5\n2,3.0\n").unwrap();
        let spec = OutputSpec {
            format: OutputFormat::Csv,
            index_column: Some("step".into()),
            value_column: Some("force".into()),
            drop_initial_step: true,
            ..spec()
        };
        let series = parse_simulated(&result_for(path), &spec).unwrap();
        assert_eq!(series.points(), &[(1.0, 1.5), (2.0, 3.0)]);
    }

    fn experiment(dir: &TempDir, body: &str) -> config::Experiment {
        let path = dir.path().join("shear.csv");
        fs::write(&path, body).unwrap();
        config::Experiment {
            path,
            index_column: "Step".into(),
            value: vec![
                ValueTerm { column: "Up".into(), scale: 0.5 },
                ValueTerm { column: "Down".into(), scale: -0.5 },
            ],
        }
    }

    #[test]
    fn test_load_experimental_combines_columns() {
        let dir = TempDir::new().unwrap();
        let cfg = experiment(&dir, "Down, Step, Up\n0,0,0\n-5,1,15\n-10,2,30\n");
        let series = load_experimental(&cfg).unwrap();
        assert_eq!(series.points(), &[(0.0, 0.0), (1.0, 10.0), (2.0, 20.0)]);
    }

    #[test]
    fn test_load_experimental_missing_column() {
        let dir = TempDir::new().unwrap();
        let cfg = experiment(&dir, "Step,Up\n0,0\n1,1\n");
        let err = load_experimental(&cfg).unwrap_err();
        assert!(matches!(err, CalibrationError::ExperimentalData(ref m) if m.contains("'Down'")));
    }

    #[test]
    fn test_load_experimental_bad_rows() {
        let dir = TempDir::new().unwrap();
        let cfg = experiment(&dir, "Step,Up,Down\n0,0,0\n1,abc,0\n");
        let err = load_experimental(&cfg).unwrap_err();
        assert!(matches!(err, CalibrationError::ExperimentalData(ref m) if m.contains("row 3")));

        let cfg = experiment(&dir, "Step,Up,Down\n0,0,0\n2,1,0\n1,2,0\n");
        assert!(matches!(
            load_experimental(&cfg),
            Err(CalibrationError::ExperimentalData(_))
        ));
    }

    #[test]
    fn test_load_experimental_missing_file() {
        let cfg = config::Experiment {
            path: PathBuf::from("/no/such/shear.csv"),
            index_column: "Step".into(),
            value: vec![ValueTerm { column: "Up".into(), scale: 1.0 }],
        };
        assert!(matches!(
            load_experimental(&cfg),
            Err(CalibrationError::ExperimentalData(_))
        ));
    }
}
