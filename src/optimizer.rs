//! Bounded minimizers driving the calibration, run through argmin.
//!
//! Both methods take a fallible objective. The first `Err` it returns stops
//! the executor and is handed back unchanged, which is how fatal evaluation
//! errors end a session. Nelder-Mead has no notion of bounds, so every
//! vertex is clamped into the box before the objective sees it.

use crate::error::{CalibrationError, Result};
use argmin::core::{CostFunction, Error, Executor, State, TerminationReason, TerminationStatus};
use argmin::solver::brent::BrentOpt;
use argmin::solver::neldermead::NelderMead as Simplex;
use std::cell::{Cell, RefCell};

/// Outcome of a minimization
#[derive(Clone, Debug)]
pub struct OptimizationResult {
    /// Best point found
    pub x: Vec<f64>,
    /// Objective value at `x`
    pub fun: f64,
    /// Objective calls made
    pub evaluations: usize,
    pub iterations: usize,
    /// Tolerances met before the iteration cap
    pub converged: bool,
}

// ============================================================================
// Objective adapter
// ============================================================================

/// Wraps a fallible `FnMut` objective for argmin's `&self` cost interface.
/// Keeps the best clamped point seen and parks the first objective error so
/// it can be returned with its original type.
struct Objective<F> {
    f: RefCell<F>,
    bounds: Vec<(f64, f64)>,
    calls: Cell<usize>,
    best: RefCell<Option<(Vec<f64>, f64)>>,
    failure: RefCell<Option<CalibrationError>>,
}

impl<F> Objective<F>
where
    F: FnMut(&[f64]) -> Result<f64>,
{
    fn new(f: F, bounds: Vec<(f64, f64)>) -> Self {
        Self {
            f: RefCell::new(f),
            bounds,
            calls: Cell::new(0),
            best: RefCell::new(None),
            failure: RefCell::new(None),
        }
    }

    fn call(&self, x: &[f64]) -> std::result::Result<f64, Error> {
        let x: Vec<f64> = x
            .iter()
            .zip(&self.bounds)
            .map(|(v, &(lo, hi))| v.clamp(lo, hi))
            .collect();
        self.calls.set(self.calls.get() + 1);

        let value = {
            let mut f = self.f.borrow_mut();
            (&mut *f)(&x)
        };
        match value {
            Ok(fx) => {
                let mut best = self.best.borrow_mut();
                if best.as_ref().map_or(true, |(_, b)| fx < *b) {
                    *best = Some((x, fx));
                }
                Ok(fx)
            }
            Err(e) => {
                let message = e.to_string();
                *self.failure.borrow_mut() = Some(e);
                Err(Error::msg(message))
            }
        }
    }

    /// Fold the executor outcome (iterations, converged) into a result.
    fn finish(self, run: std::result::Result<(u64, bool), Error>) -> Result<OptimizationResult> {
        if let Some(e) = self.failure.into_inner() {
            return Err(e);
        }
        let (iterations, converged) =
            run.map_err(|e| CalibrationError::Optimizer(e.to_string()))?;
        let (x, fun) = self
            .best
            .into_inner()
            .ok_or_else(|| CalibrationError::Optimizer("objective never evaluated".into()))?;
        Ok(OptimizationResult {
            x,
            fun,
            evaluations: self.calls.get(),
            iterations: iterations as usize,
            converged,
        })
    }
}

struct ScalarCost<'a, F>(&'a Objective<F>);

impl<F> CostFunction for ScalarCost<'_, F>
where
    F: FnMut(&[f64]) -> Result<f64>,
{
    type Param = f64;
    type Output = f64;

    fn cost(&self, x: &Self::Param) -> std::result::Result<Self::Output, Error> {
        self.0.call(&[*x])
    }
}

struct VectorCost<'a, F>(&'a Objective<F>);

impl<F> CostFunction for VectorCost<'_, F>
where
    F: FnMut(&[f64]) -> Result<f64>,
{
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, x: &Self::Param) -> std::result::Result<Self::Output, Error> {
        self.0.call(x)
    }
}

fn converged(status: &TerminationStatus) -> bool {
    matches!(
        status,
        TerminationStatus::Terminated(TerminationReason::SolverConverged)
    )
}

// ============================================================================
// Bounded scalar
// ============================================================================

/// Bounded scalar minimization configuration
#[derive(Clone, Debug)]
pub struct BrentConfig {
    pub lower: f64,
    pub upper: f64,
    /// Absolute tolerance on the minimizer location
    pub xatol: f64,
    pub max_iter: u64,
}

impl Default for BrentConfig {
    fn default() -> Self {
        Self {
            lower: 0.0,
            upper: 1.0,
            xatol: 1e-5,
            max_iter: 500,
        }
    }
}

/// Brent's method restricted to `[lower, upper]`.
pub struct Brent {
    config: BrentConfig,
}

impl Brent {
    pub fn new(config: BrentConfig) -> Self {
        Self { config }
    }

    pub fn minimize<F>(&self, mut f: F) -> Result<OptimizationResult>
    where
        F: FnMut(f64) -> Result<f64>,
    {
        let BrentConfig {
            lower,
            upper,
            xatol,
            max_iter,
        } = self.config;
        let objective = Objective::new(move |x: &[f64]| f(x[0]), vec![(lower, upper)]);

        let solver = BrentOpt::new(lower, upper).set_tolerance(f64::EPSILON.sqrt(), xatol);
        let run = Executor::new(ScalarCost(&objective), solver)
            .configure(|state| state.max_iters(max_iter))
            .run()
            .map(|res| (res.state.get_iter(), converged(res.state.get_termination_status())));
        objective.finish(run)
    }
}

// ============================================================================
// Nelder-Mead
// ============================================================================

/// Simplex search configuration
#[derive(Clone, Debug)]
pub struct NelderMeadConfig {
    /// One `(lower, upper)` pair per variable
    pub bounds: Vec<(f64, f64)>,
    pub max_iter: u64,
    /// Stop once the standard deviation of the simplex values drops below
    pub fatol: f64,
    /// Initial edge length as a fraction of each variable's range
    pub initial_step: f64,
}

impl Default for NelderMeadConfig {
    fn default() -> Self {
        Self {
            bounds: Vec::new(),
            max_iter: 200,
            fatol: 1e-4,
            initial_step: 0.05,
        }
    }
}

/// Downhill simplex in a box.
pub struct NelderMead {
    config: NelderMeadConfig,
}

impl NelderMead {
    pub fn new(config: NelderMeadConfig) -> Self {
        Self { config }
    }

    /// Starting simplex: `x0` plus one vertex per axis, stepped towards the
    /// interior when `x0` sits near the upper bound.
    fn initial_simplex(&self, x0: &[f64]) -> Vec<Vec<f64>> {
        let bounds = &self.config.bounds;
        let origin: Vec<f64> = x0
            .iter()
            .zip(bounds)
            .map(|(v, &(lo, hi))| v.clamp(lo, hi))
            .collect();

        let mut simplex = vec![origin.clone()];
        for (axis, &(lo, hi)) in bounds.iter().enumerate() {
            let step = self.config.initial_step * (hi - lo);
            let mut v = origin.clone();
            v[axis] = if v[axis] + step <= hi { v[axis] + step } else { v[axis] - step };
            simplex.push(v);
        }
        simplex
    }

    pub fn minimize<F>(&self, x0: &[f64], f: F) -> Result<OptimizationResult>
    where
        F: FnMut(&[f64]) -> Result<f64>,
    {
        if x0.len() != self.config.bounds.len() {
            return Err(CalibrationError::Optimizer(format!(
                "{} starting values for {} bounds",
                x0.len(),
                self.config.bounds.len()
            )));
        }
        let max_iter = self.config.max_iter;
        let solver: Simplex<Vec<f64>, f64> = Simplex::new(self.initial_simplex(x0))
            .with_sd_tolerance(self.config.fatol)
            .map_err(|e| CalibrationError::Optimizer(e.to_string()))?;

        let objective = Objective::new(f, self.config.bounds.clone());
        let run = Executor::new(VectorCost(&objective), solver)
            .configure(|state| state.max_iters(max_iter))
            .run()
            .map(|res| (res.state.get_iter(), converged(res.state.get_termination_status())));
        objective.finish(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_brent_quadratic() {
        let brent = Brent::new(BrentConfig {
            lower: 0.0,
            upper: 5.0,
            xatol: 1e-6,
            ..Default::default()
        });
        let res = brent.minimize(|x| Ok((x - 2.0) * (x - 2.0) + 1.0)).unwrap();
        assert!(res.converged);
        assert!((res.x[0] - 2.0).abs() < 1e-4, "x = {}", res.x[0]);
        assert!((res.fun - 1.0).abs() < 1e-8);
    }

    #[test]
    fn test_brent_minimum_on_bound() {
        let brent = Brent::new(BrentConfig {
            lower: -3.0,
            upper: 0.0,
            xatol: 1e-3,
            max_iter: 40,
        });
        let res = brent.minimize(|x| Ok((x - 1.0).powi(2))).unwrap();
        assert!(res.x[0] <= 0.0 && res.x[0] > -0.01, "x = {}", res.x[0]);
        assert!(res.evaluations <= 41);
    }

    #[test]
    fn test_brent_iteration_cap() {
        let brent = Brent::new(BrentConfig {
            lower: 0.0,
            upper: 10.0,
            xatol: 1e-12,
            max_iter: 5,
        });
        let res = brent.minimize(|x| Ok((x - 7.3).powi(2))).unwrap();
        assert!(!res.converged);
        assert_eq!(res.iterations, 5);
        assert!(res.evaluations <= 6);
    }

    #[test]
    fn test_brent_error_stops_search() {
        let brent = Brent::new(BrentConfig::default());
        let mut calls = 0;
        let res = brent.minimize(|x| {
            calls += 1;
            if calls == 3 {
                Err(CalibrationError::Cancelled)
            } else {
                Ok(x * x)
            }
        });
        assert!(matches!(res, Err(CalibrationError::Cancelled)));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_nelder_mead_quadratic() {
        let nm = NelderMead::new(NelderMeadConfig {
            bounds: vec![(-5.0, 5.0), (-5.0, 5.0)],
            max_iter: 500,
            fatol: 1e-10,
            ..Default::default()
        });
        let res = nm
            .minimize(&[0.0, 0.0], |x| {
                Ok((x[0] - 1.0).powi(2) + 10.0 * (x[1] + 0.5).powi(2))
            })
            .unwrap();
        assert!(res.converged);
        assert!((res.x[0] - 1.0).abs() < 1e-3, "x = {:?}", res.x);
        assert!((res.x[1] + 0.5).abs() < 1e-3, "x = {:?}", res.x);
    }

    #[test]
    fn test_nelder_mead_respects_bounds() {
        let nm = NelderMead::new(NelderMeadConfig {
            bounds: vec![(0.0, 2.0), (0.0, 2.0)],
            max_iter: 500,
            fatol: 1e-10,
            ..Default::default()
        });
        let mut outside = false;
        let res = nm
            .minimize(&[1.0, 2.0], |x| {
                outside |= x.iter().any(|v| !(0.0..=2.0).contains(v));
                Ok((x[0] - 5.0).powi(2) + (x[1] - 1.0).powi(2))
            })
            .unwrap();
        assert!(!outside, "objective called outside the box");
        assert!((res.x[0] - 2.0).abs() < 1e-3, "x = {:?}", res.x);
        assert!((res.x[1] - 1.0).abs() < 1e-2, "x = {:?}", res.x);
    }

    #[test]
    fn test_nelder_mead_iteration_cap() {
        let nm = NelderMead::new(NelderMeadConfig {
            bounds: vec![(-1.0, 1.0), (-1.0, 1.0), (-1.0, 1.0)],
            max_iter: 3,
            fatol: 1e-12,
            ..Default::default()
        });
        let res = nm
            .minimize(&[0.9, 0.9, 0.9], |x| Ok(x.iter().map(|v| v * v).sum()))
            .unwrap();
        assert!(!res.converged);
        assert_eq!(res.iterations, 3);
    }

    #[test]
    fn test_nelder_mead_error_keeps_its_kind() {
        let nm = NelderMead::new(NelderMeadConfig {
            bounds: vec![(0.0, 1.0), (0.0, 1.0)],
            ..Default::default()
        });
        let err = nm
            .minimize(&[0.5, 0.5], |_| {
                Err(CalibrationError::UnknownParameter {
                    name: "k9".into(),
                    material_id: "1".into(),
                })
            })
            .unwrap_err();
        assert!(matches!(err, CalibrationError::UnknownParameter { .. }));
    }

    #[test]
    fn test_nelder_mead_dimension_mismatch() {
        let nm = NelderMead::new(NelderMeadConfig {
            bounds: vec![(0.0, 1.0)],
            ..Default::default()
        });
        let err = nm.minimize(&[0.5, 0.5], |_| Ok(0.0)).unwrap_err();
        assert!(matches!(err, CalibrationError::Optimizer(_)));
    }
}
