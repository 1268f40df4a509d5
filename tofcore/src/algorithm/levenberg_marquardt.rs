use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{TofError, TofResult};

/// A model `f(x; p)` with analytic partial derivatives.
pub trait FitModel {
    fn n_params(&self) -> usize;
    fn value(&self, x: f64, p: &[f64]) -> f64;
    /// Writes `df/dp_i` into `grad`, which has length `n_params()`.
    fn gradient(&self, x: f64, p: &[f64], grad: &mut [f64]);
}

/// One measured point `(x, y)` with its uncertainty on `y`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DataPoint {
    pub x: f64,
    pub y: f64,
    pub sigma: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LmSettings {
    pub max_iterations: usize,
    pub lambda_init: f64,
    pub lambda_factor: f64,
    pub lambda_max: f64,
    /// relative chi2 decrease below which an accepted step ends the fit
    pub ftol: f64,
    /// relative parameter change below which an accepted step ends the fit
    pub xtol: f64,
}

impl Default for LmSettings {
    fn default() -> Self {
        LmSettings {
            max_iterations: 500,
            lambda_init: 1e-3,
            lambda_factor: 10.0,
            lambda_max: 1e14,
            ftol: 1e-12,
            xtol: 1e-12,
        }
    }
}

/// Converged fit: parameters, their errors and goodness of fit.
#[derive(Clone, Debug)]
pub struct LmOutcome {
    pub parameters: Vec<f64>,
    /// sqrt of the covariance diagonal; 0 for fixed parameters
    pub errors: Vec<f64>,
    pub covariance: DMatrix<f64>,
    pub chi2: f64,
    pub ndf: usize,
    pub iterations: usize,
    /// True if the fit ended because no damped step lowered chi2, rather than
    /// on the chi2 or parameter tolerance
    pub stalled: bool,
}

fn chi2<M: FitModel>(model: &M, points: &[DataPoint], p: &[f64]) -> f64 {
    points.iter().map(|pt| ((pt.y - model.value(pt.x, p)) / pt.sigma).powi(2)).sum()
}

/// Curvature matrix `J^T W J` and gradient vector `J^T W r` over the free parameters.
fn normal_equations<M: FitModel>(model: &M, points: &[DataPoint], p: &[f64], free: &[usize]) -> (DMatrix<f64>, DVector<f64>) {
    let n = free.len();
    let mut a = DMatrix::<f64>::zeros(n, n);
    let mut g = DVector::<f64>::zeros(n);
    let mut grad = vec![0.0; model.n_params()];

    for pt in points {
        model.gradient(pt.x, p, &mut grad);
        let w = 1.0 / (pt.sigma * pt.sigma);
        let r = pt.y - model.value(pt.x, p);
        for (i, &pi) in free.iter().enumerate() {
            g[i] += w * grad[pi] * r;
            for (j, &pj) in free.iter().enumerate().take(i + 1) {
                a[(i, j)] += w * grad[pi] * grad[pj];
            }
        }
    }
    for i in 0..n {
        for j in 0..i {
            a[(j, i)] = a[(i, j)];
        }
    }
    (a, g)
}

fn solve(m: DMatrix<f64>, rhs: &DVector<f64>) -> Option<DVector<f64>> {
    match m.clone().cholesky() {
        Some(chol) => Some(chol.solve(rhs)),
        None => m.lu().solve(rhs),
    }
}

/// Minimizes chi2 of `model` against `points` with the Levenberg-Marquardt method.
///
/// # Arguments
///
/// * `model` - function and derivatives to fit
/// * `points` - data with strictly positive uncertainties
/// * `initial` - starting parameter vector
/// * `fixed` - parameters held at their initial value (same length as `initial`)
/// * `settings` - iteration and damping control
/// * `interval` - fit domain, reported on failure
///
/// # Returns
///
/// * `LmOutcome` or `TofError::FitConvergence` carrying the last parameter vector
///
pub fn levenberg_marquardt<M: FitModel>(
    model: &M,
    points: &[DataPoint],
    initial: &[f64],
    fixed: &[bool],
    settings: &LmSettings,
    interval: (f64, f64),
) -> TofResult<LmOutcome> {
    debug_assert_eq!(initial.len(), model.n_params());
    let free: Vec<usize> = (0..initial.len()).filter(|&i| !fixed.get(i).copied().unwrap_or(false)).collect();

    if points.len() < free.len() || free.is_empty() {
        return Err(TofError::convergence(
            interval,
            initial,
            format!("{} points for {} free parameters", points.len(), free.len()),
        ));
    }
    if points.iter().any(|pt| !(pt.sigma > 0.0) || !pt.y.is_finite()) {
        return Err(TofError::convergence(interval, initial, "data point with non-positive uncertainty"));
    }

    let mut p = initial.to_vec();
    let mut current = chi2(model, points, &p);
    if !current.is_finite() {
        return Err(TofError::convergence(interval, &p, "non-finite chi2 at start"));
    }

    let mut lambda = settings.lambda_init;
    let mut converged = false;
    let mut stalled = false;
    let mut iterations = 0;

    'outer: while iterations < settings.max_iterations {
        iterations += 1;
        let (a, g) = normal_equations(model, points, &p, &free);
        let max_diag = (0..a.nrows()).map(|i| a[(i, i)]).fold(0.0, f64::max).max(f64::MIN_POSITIVE);

        loop {
            let mut damped = a.clone();
            for i in 0..damped.nrows() {
                damped[(i, i)] += lambda * a[(i, i)].max(1e-12 * max_diag);
            }

            if let Some(delta) = solve(damped, &g) {
                let mut trial = p.clone();
                for (i, &pi) in free.iter().enumerate() {
                    trial[pi] += delta[i];
                }
                let trial_chi2 = chi2(model, points, &trial);

                if trial_chi2.is_finite() && trial_chi2 <= current {
                    let decrease = current - trial_chi2;
                    let step = free
                        .iter()
                        .map(|&pi| (trial[pi] - p[pi]).abs() / (p[pi].abs() + 1e-300))
                        .fold(0.0, f64::max);
                    p = trial;
                    current = trial_chi2;
                    lambda = (lambda / settings.lambda_factor).max(1e-15);

                    if decrease <= settings.ftol * current || step <= settings.xtol || current == 0.0 {
                        converged = true;
                        break 'outer;
                    }
                    break;
                }
            }

            lambda *= settings.lambda_factor;
            if lambda > settings.lambda_max {
                // no damped step lowers chi2 any further
                debug!(iterations, chi2 = current, ?interval, "lm stalled at lambda limit");
                converged = true;
                stalled = true;
                break 'outer;
            }
        }
        trace!(iteration = iterations, chi2 = current, lambda, "lm step");
    }

    if !converged {
        return Err(TofError::convergence(
            interval,
            &p,
            format!("no convergence within {} iterations", settings.max_iterations),
        ));
    }

    let (a, _) = normal_equations(model, points, &p, &free);
    let covariance = a.try_inverse().ok_or_else(|| TofError::convergence(interval, &p, "singular curvature matrix"))?;

    let mut errors = vec![0.0; p.len()];
    for (i, &pi) in free.iter().enumerate() {
        errors[pi] = covariance[(i, i)].max(0.0).sqrt();
    }

    Ok(LmOutcome {
        parameters: p,
        errors,
        covariance,
        chi2: current,
        ndf: points.len() - free.len(),
        iterations,
        stalled,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Line;

    impl FitModel for Line {
        fn n_params(&self) -> usize { 2 }
        fn value(&self, x: f64, p: &[f64]) -> f64 { p[0] + p[1] * x }
        fn gradient(&self, x: f64, _p: &[f64], grad: &mut [f64]) {
            grad[0] = 1.0;
            grad[1] = x;
        }
    }

    struct Exponential;

    impl FitModel for Exponential {
        fn n_params(&self) -> usize { 2 }
        fn value(&self, x: f64, p: &[f64]) -> f64 { p[0] * (-p[1] * x).exp() }
        fn gradient(&self, x: f64, p: &[f64], grad: &mut [f64]) {
            let e = (-p[1] * x).exp();
            grad[0] = e;
            grad[1] = -p[0] * x * e;
        }
    }

    // reports the gradient with the wrong sign, so every step goes uphill
    struct UphillLine;

    impl FitModel for UphillLine {
        fn n_params(&self) -> usize { 2 }
        fn value(&self, x: f64, p: &[f64]) -> f64 { p[0] + p[1] * x }
        fn gradient(&self, x: f64, _p: &[f64], grad: &mut [f64]) {
            grad[0] = -1.0;
            grad[1] = -x;
        }
    }

    #[test]
    fn test_stuck_fit_is_flagged() {
        let points: Vec<DataPoint> = (0..5).map(|i| DataPoint { x: i as f64, y: 1.0 + 2.0 * i as f64, sigma: 1.0 }).collect();
        let out = levenberg_marquardt(&UphillLine, &points, &[0.0, 0.0], &[false, false], &LmSettings::default(), (0.0, 4.0)).unwrap();
        assert!(out.stalled);
        assert_eq!(out.iterations, 1);
        assert_eq!(out.parameters, vec![0.0, 0.0]);
        assert!((out.chi2 - 165.0).abs() < 1e-9);
    }

    #[test]
    fn test_line_fit_errors_match_analytic() {
        let points: Vec<DataPoint> = (0..5).map(|i| DataPoint { x: i as f64, y: 1.0 + 2.0 * i as f64, sigma: 1.0 }).collect();
        let out = levenberg_marquardt(&Line, &points, &[0.0, 0.0], &[false, false], &LmSettings::default(), (0.0, 4.0)).unwrap();
        assert!((out.parameters[0] - 1.0).abs() < 1e-8);
        assert!((out.parameters[1] - 2.0).abs() < 1e-8);
        // var(slope) = 1 / sum (x - xbar)^2 = 1 / 10
        assert!((out.errors[1] - (0.1f64).sqrt()).abs() < 1e-8);
        assert_eq!(out.ndf, 3);
    }

    #[test]
    fn test_nonlinear_fit_recovers_parameters() {
        let points: Vec<DataPoint> = (0..30)
            .map(|i| {
                let x = i as f64 * 0.2;
                DataPoint { x, y: 7.0 * (-0.8 * x).exp(), sigma: 0.1 }
            })
            .collect();
        let out = levenberg_marquardt(&Exponential, &points, &[3.0, 0.2], &[false, false], &LmSettings::default(), (0.0, 6.0)).unwrap();
        assert!((out.parameters[0] - 7.0).abs() < 1e-6);
        assert!((out.parameters[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_fixed_parameter_is_untouched() {
        let points: Vec<DataPoint> = (0..5).map(|i| DataPoint { x: i as f64, y: 1.0 + 2.0 * i as f64, sigma: 1.0 }).collect();
        let out = levenberg_marquardt(&Line, &points, &[0.5, 0.0], &[true, false], &LmSettings::default(), (0.0, 4.0)).unwrap();
        assert_eq!(out.parameters[0], 0.5);
        assert_eq!(out.errors[0], 0.0);
        assert_eq!(out.ndf, 4);
    }

    #[test]
    fn test_too_few_points_reports_parameters() {
        let points = vec![DataPoint { x: 0.0, y: 1.0, sigma: 1.0 }];
        let err = levenberg_marquardt(&Line, &points, &[0.5, 0.1], &[false, false], &LmSettings::default(), (0.0, 1.0)).unwrap_err();
        match err {
            TofError::FitConvergence { parameters, interval, .. } => {
                assert_eq!(parameters, vec![0.5, 0.1]);
                assert_eq!(interval, (0.0, 1.0));
            }
            other => panic!("unexpected error {other}"),
        }
    }
}
