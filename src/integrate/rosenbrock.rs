//! Shampine's L-stable Rosenbrock (2,3) pair.
//!
//! A second order step with an embedded third order error estimate, the same
//! pair used by MATLAB's `ode23s`. Each step needs one LU factorization of
//! `W = I - h d J` and three right-hand side evaluations, one of which is reused
//! as the first evaluation of the next step.
//!
//! Models here are autonomous, so the `∂f/∂t` term of the method vanishes.

use std::f64::consts::SQRT_2;

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::errors::{IntegrationError, SolverError};
use crate::evaluator::Evaluator;

use super::IntegrationOptions;

const D: f64 = 1.0 / (2.0 + SQRT_2);
const E32: f64 = 6.0 + SQRT_2;

const SAFETY: f64 = 0.8;
const MAX_GROWTH: f64 = 5.0;
const MAX_SHRINK: f64 = 0.2;

/// Work counters for one integration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RosenbrockStats {
    pub steps: u64,
    pub rejected_steps: u64,
    pub rhs_evaluations: u64,
    pub jacobian_evaluations: u64,
    pub decompositions: u64,
}

/// Integrates `y' = f(y, p)` and records the state at each of `times`.
///
/// `times` must be non-empty and non-decreasing; `rtol` and `atol` hold one
/// entry per state. The first recorded state is `y0`.
pub fn integrate<E: Evaluator + ?Sized>(
    evaluator: &E,
    times: &[f64],
    y0: &[f64],
    params: &[f64],
    rtol: &[f64],
    atol: &[f64],
    options: &IntegrationOptions,
) -> Result<(Vec<Vec<f64>>, RosenbrockStats), IntegrationError> {
    let mut stepper = Stepper {
        evaluator,
        params,
        rtol,
        atol,
        stats: RosenbrockStats::default(),
    };
    let states = stepper.run(times, y0, options)?;
    Ok((states, stepper.stats))
}

struct Stepper<'a, E: ?Sized> {
    evaluator: &'a E,
    params: &'a [f64],
    rtol: &'a [f64],
    atol: &'a [f64],
    stats: RosenbrockStats,
}

impl<E: Evaluator + ?Sized> Stepper<'_, E> {
    fn run(
        &mut self,
        times: &[f64],
        y0: &[f64],
        options: &IntegrationOptions,
    ) -> Result<Vec<Vec<f64>>, IntegrationError> {
        let n = y0.len();
        let mut states = Vec::with_capacity(times.len());
        states.push(y0.to_vec());

        let (Some(&t0), Some(&t_end)) = (times.first(), times.last()) else {
            return Ok(states);
        };
        if t_end == t0 {
            states.resize(times.len(), y0.to_vec());
            return Ok(states);
        }

        let mut t = t0;
        let mut y = DVector::from_column_slice(y0);
        let mut f0 = self.rhs(&y)?;
        if !is_finite(&f0) {
            return Err(SolverError::NonFinite { t }.into());
        }
        let mut jac = self.jacobian(&y)?;

        let max_step = options.max_step.unwrap_or(f64::INFINITY);
        let mut h = options
            .first_step
            .unwrap_or_else(|| self.initial_step(&y, &f0))
            .min(t_end - t0)
            .min(max_step);
        let identity = DMatrix::<f64>::identity(n, n);

        for &t_out in &times[1..] {
            let mut attempts = 0;
            while t < t_out {
                if attempts >= options.max_steps {
                    return Err(SolverError::TooManySteps {
                        t,
                        max_steps: options.max_steps,
                    }
                    .into());
                }
                attempts += 1;

                let min_step = 16.0 * f64::EPSILON * t.abs().max(t_out.abs());
                let remaining = t_out - t;
                let proposed = h.min(max_step);
                let last = proposed >= remaining || remaining - proposed <= min_step;
                let h_step = if last { remaining } else { proposed };
                if !last && h_step < min_step {
                    return Err(SolverError::StepSizeTooSmall { t, h: h_step }.into());
                }

                let w = &identity - &jac * (h_step * D);
                let lu = w.lu();
                self.stats.decompositions += 1;
                let solve = |b: &DVector<f64>| {
                    lu.solve(b)
                        .ok_or(IntegrationError::Solver(SolverError::SingularMatrix { t }))
                };

                let k1 = solve(&f0)?;
                let f1 = self.rhs(&(&y + &k1 * (0.5 * h_step)))?;
                let k2 = solve(&(&f1 - &k1))? + &k1;
                let y_new = &y + &k2 * h_step;
                let f2 = self.rhs(&y_new)?;
                let k3 = solve(&(&f2 - (&k2 - &f1) * E32 - (&k1 - &f0) * 2.0))?;

                let err = if is_finite(&f1) && is_finite(&f2) && is_finite(&k3) {
                    let estimate = (&k1 - &k2 * 2.0 + &k3) * (h_step / 6.0);
                    self.error_norm(&estimate, &y, &y_new)
                } else {
                    f64::INFINITY
                };

                if err <= 1.0 {
                    t = if last { t_out } else { t + h_step };
                    y = y_new;
                    f0 = f2;
                    jac = self.jacobian(&y)?;
                    self.stats.steps += 1;

                    let growth = if err == 0.0 {
                        MAX_GROWTH
                    } else {
                        (SAFETY * err.powf(-1.0 / 3.0)).min(MAX_GROWTH)
                    };
                    // a step cut short to land on t_out does not shrink the next one
                    h = if last {
                        proposed.max(h_step * growth)
                    } else {
                        h_step * growth
                    };
                } else {
                    self.stats.rejected_steps += 1;
                    let shrink = if err.is_finite() {
                        (SAFETY * err.powf(-1.0 / 3.0)).max(MAX_SHRINK)
                    } else {
                        MAX_SHRINK
                    };
                    h = h_step * shrink;
                    if h < min_step {
                        return Err(SolverError::StepSizeTooSmall { t, h }.into());
                    }
                }
            }
            states.push(y.as_slice().to_vec());
        }

        debug!(stats = ?self.stats, "rosenbrock integration finished");
        Ok(states)
    }

    fn rhs(&mut self, y: &DVector<f64>) -> Result<DVector<f64>, IntegrationError> {
        let mut out = DVector::zeros(y.len());
        self.evaluator
            .eval_into(y.as_slice(), self.params, out.as_mut_slice())?;
        self.stats.rhs_evaluations += 1;
        Ok(out)
    }

    fn jacobian(&mut self, y: &DVector<f64>) -> Result<DMatrix<f64>, IntegrationError> {
        let n = y.len();
        let mut row_major = vec![0.0; n * n];
        self.evaluator
            .jacobian_into(y.as_slice(), self.params, &mut row_major)?;
        self.stats.jacobian_evaluations += 1;
        if !self.evaluator.has_jacobian() {
            self.stats.rhs_evaluations += n as u64;
        }
        Ok(DMatrix::from_row_slice(n, n, &row_major))
    }

    /// Weighted max norm of the local error estimate.
    fn error_norm(&self, err: &DVector<f64>, y: &DVector<f64>, y_new: &DVector<f64>) -> f64 {
        err.iter()
            .zip(y.iter().zip(y_new.iter()))
            .enumerate()
            .map(|(i, (e, (a, b)))| {
                let scale = self.atol[i] + self.rtol[i] * a.abs().max(b.abs());
                e.abs() / scale
            })
            .fold(0.0, f64::max)
    }

    /// Starting step from the scaled sizes of `y0` and `f(y0)`.
    fn initial_step(&self, y: &DVector<f64>, f: &DVector<f64>) -> f64 {
        let n = y.len().max(1) as f64;
        let (mut d0, mut d1) = (0.0, 0.0);
        for (i, (yi, fi)) in y.iter().zip(f.iter()).enumerate() {
            let scale = self.atol[i] + self.rtol[i] * yi.abs();
            d0 += (yi / scale).powi(2);
            d1 += (fi / scale).powi(2);
        }
        let (d0, d1) = ((d0 / n).sqrt(), (d1 / n).sqrt());
        if d0 < 1e-5 || d1 < 1e-5 {
            1e-6
        } else {
            0.01 * d0 / d1
        }
    }
}

fn is_finite(v: &DVector<f64>) -> bool {
    v.iter().all(|x| x.is_finite())
}
