//! Matching simulated and experimental series point by point.

use crate::config::{AlignPolicy, Alignment};
use crate::error::{CalibrationError, Result};
use crate::series::TimeSeries;

/// Simulated and experimental values at common indices.
#[derive(Clone, Debug, PartialEq)]
pub struct AlignedPair {
    indices: Vec<f64>,
    simulated: Vec<f64>,
    experimental: Vec<f64>,
    /// Fraction of experimental points that took part
    coverage: f64,
}

impl AlignedPair {
    /// Full-coverage pair from equally long columns.
    #[cfg(test)]
    pub(crate) fn new(indices: Vec<f64>, simulated: Vec<f64>, experimental: Vec<f64>) -> Self {
        assert_eq!(indices.len(), simulated.len());
        assert_eq!(indices.len(), experimental.len());
        Self {
            indices,
            simulated,
            experimental,
            coverage: 1.0,
        }
    }

    pub fn indices(&self) -> &[f64] {
        &self.indices
    }

    pub fn simulated(&self) -> &[f64] {
        &self.simulated
    }

    pub fn experimental(&self) -> &[f64] {
        &self.experimental
    }

    pub fn coverage(&self) -> f64 {
        self.coverage
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// `(simulated, experimental)` per aligned point.
    pub fn pairs(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.simulated.iter().copied().zip(self.experimental.iter().copied())
    }
}

pub fn align(simulated: &TimeSeries, experimental: &TimeSeries, cfg: &Alignment) -> Result<AlignedPair> {
    match cfg.policy {
        AlignPolicy::Index => align_by_index(simulated, experimental, cfg.min_coverage),
        AlignPolicy::Progress => align_by_progress(simulated, experimental),
    }
}

/// Every experimental point inside the simulated span is compared against
/// the simulated value at the same index (interpolated when no step
/// matches exactly).
fn align_by_index(sim: &TimeSeries, exp: &TimeSeries, min_coverage: f64) -> Result<AlignedPair> {
    let mut indices = Vec::new();
    let mut simulated = Vec::new();
    let mut experimental = Vec::new();
    for &(x, e) in exp.points() {
        if let Some(s) = sim.value_at(x) {
            indices.push(x);
            simulated.push(s);
            experimental.push(e);
        }
    }

    if indices.is_empty() {
        return Err(CalibrationError::Alignment(format!(
            "no overlap between simulated span {} and experimental span {}",
            span_text(sim),
            span_text(exp)
        )));
    }
    let coverage = indices.len() as f64 / exp.len() as f64;
    if coverage < min_coverage {
        return Err(CalibrationError::Alignment(format!(
            "coverage {:.1}% below minimum {:.1}% ({} of {} experimental points)",
            coverage * 100.0,
            min_coverage * 100.0,
            indices.len(),
            exp.len()
        )));
    }

    Ok(AlignedPair {
        indices,
        simulated,
        experimental,
        coverage,
    })
}

/// Resample the experimental series onto as many points as the simulation
/// produced, interpolating over normalized progress 0..1.
fn align_by_progress(sim: &TimeSeries, exp: &TimeSeries) -> Result<AlignedPair> {
    let n = sim.len();
    let m = exp.len();
    if n < 2 || m < 2 {
        return Err(CalibrationError::Alignment(format!(
            "progress alignment needs two points per series (simulated {}, experimental {})",
            n, m
        )));
    }

    let exp_values: Vec<f64> = exp.points().iter().map(|p| p.1).collect();
    let experimental = (0..n)
        .map(|k| {
            let t = k as f64 / (n - 1) as f64 * (m - 1) as f64;
            let i = (t.floor() as usize).min(m - 2);
            let frac = t - i as f64;
            exp_values[i] + (exp_values[i + 1] - exp_values[i]) * frac
        })
        .collect();

    Ok(AlignedPair {
        indices: sim.points().iter().map(|p| p.0).collect(),
        simulated: sim.points().iter().map(|p| p.1).collect(),
        experimental,
        coverage: 1.0,
    })
}

fn span_text(series: &TimeSeries) -> String {
    match series.span() {
        Some((lo, hi)) => format!("[{}, {}]", lo, hi),
        None => "(empty)".to_string(),
    }
}
