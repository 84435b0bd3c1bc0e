//! Coefficient vectors and the optimizer's search space.

use crate::config::CoefficientSpec;
use crate::error::{CalibrationError, Result};
use std::fmt;

/// Ordered mapping from material parameter name to trial value.
#[derive(Clone, Debug, PartialEq)]
pub struct CoefficientVector {
    entries: Vec<(String, f64)>,
}

impl CoefficientVector {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Build from (name, value) pairs; a repeated name is rejected.
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let mut out = Self::new();
        for (name, value) in pairs {
            let name = name.into();
            if out.get(&name).is_some() {
                return Err(CalibrationError::Config(format!(
                    "coefficient '{}' given twice",
                    name
                )));
            }
            out.entries.push((name, value));
        }
        Ok(out)
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }

    /// Overwrite an existing entry or append a new one.
    pub fn set(&mut self, name: &str, value: f64) {
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name.to_string(), value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), *v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }
}

impl Default for CoefficientVector {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CoefficientVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={:.6e}", name, value)?;
        }
        Ok(())
    }
}

/// Maps between the optimizer's unconstrained-looking coordinates and
/// physical coefficient values. Log-scale coefficients are searched in
/// log10 space.
#[derive(Clone, Debug)]
pub struct SearchSpace {
    specs: Vec<CoefficientSpec>,
}

impl SearchSpace {
    pub fn new(specs: Vec<CoefficientSpec>) -> Self {
        Self { specs }
    }

    pub fn dim(&self) -> usize {
        self.specs.len()
    }

    pub fn names(&self) -> Vec<String> {
        self.specs.iter().map(|s| s.name.clone()).collect()
    }

    /// Search-space bounds, one pair per coefficient.
    pub fn bounds(&self) -> Vec<(f64, f64)> {
        self.specs
            .iter()
            .map(|s| (to_search(s, s.lower), to_search(s, s.upper)))
            .collect()
    }

    /// Initial guess in search coordinates.
    pub fn initial_point(&self) -> Vec<f64> {
        self.specs.iter().map(|s| to_search(s, s.initial)).collect()
    }

    pub fn initial_coefficients(&self) -> CoefficientVector {
        CoefficientVector {
            entries: self
                .specs
                .iter()
                .map(|s| (s.name.clone(), s.initial))
                .collect(),
        }
    }

    /// Convert a search point to physical coefficients, clamped to bounds.
    pub fn to_coefficients(&self, x: &[f64]) -> CoefficientVector {
        let entries = self
            .specs
            .iter()
            .zip(x.iter())
            .map(|(s, &xi)| {
                let value = if s.log_scale { 10f64.powf(xi) } else { xi };
                (s.name.clone(), value.max(s.lower).min(s.upper))
            })
            .collect();
        CoefficientVector { entries }
    }
}

fn to_search(spec: &CoefficientSpec, value: f64) -> f64 {
    if spec.log_scale {
        value.log10()
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, initial: f64, lower: f64, upper: f64, log_scale: bool) -> CoefficientSpec {
        CoefficientSpec {
            name: name.to_string(),
            initial,
            lower,
            upper,
            log_scale,
        }
    }

    #[test]
    fn test_vector_keeps_order() {
        let v = CoefficientVector::from_pairs([("m1", 3.0), ("c1", 1.0)]).unwrap();
        let names: Vec<&str> = v.names().collect();
        assert_eq!(names, vec!["m1", "c1"]);
        assert_eq!(v.get("c1"), Some(1.0));
        assert_eq!(v.get("c2"), None);
    }

    #[test]
    fn test_duplicate_rejected() {
        let result = CoefficientVector::from_pairs([("c1", 1.0), ("c1", 2.0)]);
        assert!(matches!(result, Err(CalibrationError::Config(_))));
    }

    #[test]
    fn test_log_scale_round_trip() {
        let space = SearchSpace::new(vec![
            spec("c1", 1e-3, 1e-10, 1.0, true),
            spec("m1", 2.0, 0.0, 50.0, false),
        ]);

        let bounds = space.bounds();
        assert!((bounds[0].0 + 10.0).abs() < 1e-12);
        assert!(bounds[0].1.abs() < 1e-12);
        assert_eq!(bounds[1], (0.0, 50.0));

        let x0 = space.initial_point();
        let coeffs = space.to_coefficients(&x0);
        assert!((coeffs.get("c1").unwrap() - 1e-3).abs() < 1e-15);
        assert_eq!(coeffs.get("m1"), Some(2.0));
    }

    #[test]
    fn test_to_coefficients_clamps() {
        let space = SearchSpace::new(vec![spec("m1", 2.0, 0.0, 50.0, false)]);
        let coeffs = space.to_coefficients(&[75.0]);
        assert_eq!(coeffs.get("m1"), Some(50.0));
    }
}
