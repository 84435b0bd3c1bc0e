//! Scalar discrepancy between aligned simulated and experimental values.
//!
//! `ErrorMetric` is the only contract the objective depends on, so a new
//! metric is one more implementation of the trait.

use crate::align::AlignedPair;
use crate::config::{self, MetricKind, ZeroPolicy};
use crate::error::{CalibrationError, Result};

pub trait ErrorMetric {
    fn name(&self) -> &'static str;

    /// Reduce the aligned pair to one non-negative finite number.
    fn score(&self, pair: &AlignedPair) -> Result<f64>;
}

/// Build the configured metric.
pub fn from_config(cfg: &config::Metric) -> Box<dyn ErrorMetric> {
    match cfg.kind {
        MetricKind::Percent => Box::new(PercentError {
            zero_policy: cfg.zero_policy,
            zero_tolerance: cfg.zero_tolerance,
        }),
        MetricKind::Rms => Box::new(RmsError),
        MetricKind::Nrmse => Box::new(Nrmse),
    }
}

/// Mean of `|sim - exp| / |exp| * 100` over aligned points.
///
/// Points with `|exp| <= zero_tolerance` are either left out of the mean
/// (`Exclude`) or contribute `|sim - exp| * 100` (`Absolute`).
#[derive(Clone, Copy, Debug)]
pub struct PercentError {
    pub zero_policy: ZeroPolicy,
    pub zero_tolerance: f64,
}

impl Default for PercentError {
    fn default() -> Self {
        Self {
            zero_policy: ZeroPolicy::Exclude,
            zero_tolerance: 1e-12,
        }
    }
}

impl ErrorMetric for PercentError {
    fn name(&self) -> &'static str {
        "percent"
    }

    fn score(&self, pair: &AlignedPair) -> Result<f64> {
        let mut total = 0.0;
        let mut count = 0usize;
        for (sim, exp) in pair.pairs() {
            let diff = (sim - exp).abs();
            if exp.abs() <= self.zero_tolerance {
                match self.zero_policy {
                    ZeroPolicy::Exclude => continue,
                    ZeroPolicy::Absolute => total += diff * 100.0,
                }
            } else {
                total += diff / exp.abs() * 100.0;
            }
            count += 1;
        }
        if count == 0 {
            return Err(CalibrationError::Metric(format!(
                "all {} aligned experimental values are zero",
                pair.len()
            )));
        }
        finite(total / count as f64)
    }
}

/// Root-mean-square difference, in the units of the measured quantity.
#[derive(Clone, Copy, Debug, Default)]
pub struct RmsError;

impl ErrorMetric for RmsError {
    fn name(&self) -> &'static str {
        "rms"
    }

    fn score(&self, pair: &AlignedPair) -> Result<f64> {
        finite(rmse(pair)?)
    }
}

/// RMSE normalized by the peak experimental magnitude, in percent.
#[derive(Clone, Copy, Debug, Default)]
pub struct Nrmse;

impl ErrorMetric for Nrmse {
    fn name(&self) -> &'static str {
        "nrmse"
    }

    fn score(&self, pair: &AlignedPair) -> Result<f64> {
        let peak = pair
            .experimental()
            .iter()
            .fold(0.0f64, |acc, v| acc.max(v.abs()))
            .max(1e-12);
        finite(100.0 * rmse(pair)? / peak)
    }
}

fn rmse(pair: &AlignedPair) -> Result<f64> {
    if pair.is_empty() {
        return Err(CalibrationError::Metric("no aligned points".to_string()));
    }
    let sum_sq: f64 = pair.pairs().map(|(s, e)| (s - e) * (s - e)).sum();
    Ok((sum_sq / pair.len() as f64).sqrt())
}

fn finite(value: f64) -> Result<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(CalibrationError::Metric(format!("non-finite score {}", value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(sim: &[f64], exp: &[f64]) -> AlignedPair {
        let idx = (0..sim.len()).map(|i| i as f64).collect();
        AlignedPair::new(idx, sim.to_vec(), exp.to_vec())
    }

    #[test]
    fn test_percent_excludes_zero() {
        let p = pair(&[0.0, 10.5, 21.0], &[0.0, 10.0, 20.0]);
        let score = PercentError::default().score(&p).unwrap();
        assert!((score - 5.0).abs() < 1e-9, "got {}", score);
    }

    #[test]
    fn test_percent_absolute_fallback() {
        let metric = PercentError {
            zero_policy: ZeroPolicy::Absolute,
            zero_tolerance: 1e-12,
        };
        let p = pair(&[0.02, 10.5, 21.0], &[0.0, 10.0, 20.0]);
        let score = metric.score(&p).unwrap();
        // (2.0 + 5.0 + 5.0) / 3
        assert!((score - 4.0).abs() < 1e-9, "got {}", score);
    }

    #[test]
    fn test_percent_all_zero() {
        let p = pair(&[1.0, 2.0], &[0.0, 0.0]);
        let err = PercentError::default().score(&p).unwrap_err();
        assert!(matches!(err, CalibrationError::Metric(_)));
    }

    #[test]
    fn test_identical_is_zero() {
        let p = pair(&[1.0, -2.0, 3.5], &[1.0, -2.0, 3.5]);
        assert_eq!(PercentError::default().score(&p).unwrap(), 0.0);
        assert_eq!(RmsError.score(&p).unwrap(), 0.0);
        assert_eq!(Nrmse.score(&p).unwrap(), 0.0);
    }

    #[test]
    fn test_rms_and_nrmse() {
        let p = pair(&[1.0, 3.0], &[2.0, 4.0]);
        assert!((RmsError.score(&p).unwrap() - 1.0).abs() < 1e-12);
        assert!((Nrmse.score(&p).unwrap() - 25.0).abs() < 1e-12);
    }

    #[test]
    fn test_from_config() {
        let cfg = config::Metric {
            kind: MetricKind::Nrmse,
            zero_policy: ZeroPolicy::Exclude,
            zero_tolerance: 0.0,
        };
        assert_eq!(from_config(&cfg).name(), "nrmse");
        assert_eq!(from_config(&config::Metric::default()).name(), "percent");
    }
}
