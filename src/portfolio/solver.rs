//! # Constrained Solver
//!
//! $$
//! \min_{x} f(x)\quad\text{s.t.}\quad A x = b,\ \ l \le x \le u
//! $$
//!
//! Sequential quadratic programming over linear equality constraints and box
//! bounds. Every outer step solves
//!
//! $$
//! \min_d \tfrac12 d^\top B d + \nabla f^\top d\quad\text{s.t.}\quad A d = 0,\ \ l - x \le d \le u - x
//! $$
//!
//! with a primal active-set method, then backtracks along `d`. `B` is the
//! exact Hessian for quadratic objectives and a damped BFGS approximation
//! otherwise. Equalities hold exactly along every step since `A d = 0`, so the
//! start point must already be feasible.

use std::time::Instant;

use argmin::core::CostFunction;
use argmin::core::Gradient;
use nalgebra::DMatrix;
use nalgebra::DVector;
use tracing::debug;

use super::linalg::solve_or_lstsq;
use super::types::SolverConfig;
use super::types::SolverDiagnostics;
use super::types::SolverStatus;
use crate::error::PortfolioError;
use crate::error::Result;

const ARMIJO: f64 = 1e-4;
const MIN_STEP: f64 = 1e-12;
const FEASIBILITY_TOL: f64 = 1e-8;
const ACTIVE_TOL: f64 = 1e-12;
const MULTIPLIER_TOL: f64 = 1e-14;
const STATIONARY_SLOPE: f64 = 1e-12;

/// Smooth objective over a weight vector.
///
/// Cost and gradient come from argmin's traits; quadratic objectives also
/// expose their constant Hessian so the solver can skip quasi-Newton updates.
pub trait SmoothObjective:
  CostFunction<Param = Vec<f64>, Output = f64> + Gradient<Param = Vec<f64>, Gradient = Vec<f64>>
{
  /// Constant Hessian of a quadratic objective.
  fn constant_hessian(&self) -> Option<DMatrix<f64>> {
    None
  }
}

/// Linear equality constraints and box bounds on `n` variables.
#[derive(Clone, Debug)]
pub struct LinearConstraints {
  a_eq: DMatrix<f64>,
  b_eq: DVector<f64>,
  lower: DVector<f64>,
  upper: DVector<f64>,
}

impl LinearConstraints {
  /// No equalities and unbounded variables.
  pub fn new(n: usize) -> Self {
    Self {
      a_eq: DMatrix::zeros(0, n),
      b_eq: DVector::zeros(0),
      lower: DVector::from_element(n, f64::NEG_INFINITY),
      upper: DVector::from_element(n, f64::INFINITY),
    }
  }

  pub fn dim(&self) -> usize {
    self.lower.len()
  }

  /// Append the equality `row . x = rhs`.
  pub fn with_equality(mut self, row: &[f64], rhs: f64) -> Self {
    assert_eq!(row.len(), self.dim(), "equality row length must match dimension");
    let m = self.a_eq.nrows();
    self.a_eq = self.a_eq.insert_row(m, 0.0);
    for (j, v) in row.iter().enumerate() {
      self.a_eq[(m, j)] = *v;
    }
    self.b_eq = self.b_eq.push(rhs);
    self
  }

  /// Same bounds on every variable.
  pub fn with_bounds(mut self, lower: f64, upper: f64) -> Self {
    self.lower.fill(lower);
    self.upper.fill(upper);
    self
  }

  /// Largest equality residual or bound violation at `x`.
  pub fn violation(&self, x: &DVector<f64>) -> f64 {
    let eq = if self.a_eq.nrows() > 0 {
      (&self.a_eq * x - &self.b_eq).amax()
    } else {
      0.0
    };
    let bounds = x
      .iter()
      .zip(self.lower.iter().zip(self.upper.iter()))
      .map(|(v, (l, u))| (l - v).max(v - u).max(0.0))
      .fold(0.0, f64::max);
    eq.max(bounds)
  }

  fn clamp(&self, x: &mut DVector<f64>) {
    for i in 0..x.len() {
      x[i] = x[i].clamp(self.lower[i], self.upper[i]);
    }
  }
}

/// Weights and diagnostics returned by [`SqpSolver::minimize`].
#[derive(Clone, Debug)]
pub struct SolverOutcome {
  pub x: DVector<f64>,
  pub diagnostics: SolverDiagnostics,
}

/// SQP driver.
#[derive(Clone, Debug, Default)]
pub struct SqpSolver {
  config: SolverConfig,
}

fn eval_cost<O: SmoothObjective>(objective: &O, x: &DVector<f64>) -> Result<f64> {
  objective
    .cost(&x.as_slice().to_vec())
    .map_err(|e| PortfolioError::ObjectiveEvaluation(e.to_string()))
}

fn eval_gradient<O: SmoothObjective>(objective: &O, x: &DVector<f64>) -> Result<DVector<f64>> {
  objective
    .gradient(&x.as_slice().to_vec())
    .map(DVector::from_vec)
    .map_err(|e| PortfolioError::ObjectiveEvaluation(e.to_string()))
}

impl SqpSolver {
  pub fn new(config: SolverConfig) -> Self {
    Self { config }
  }

  pub fn config(&self) -> &SolverConfig {
    &self.config
  }

  /// Minimize `objective` from the feasible point `x0`.
  ///
  /// An infeasible `x0` is reported as [`SolverStatus::Infeasible`] without
  /// iterating. Objective callback failures are errors; every other
  /// termination is reported through the diagnostics.
  pub fn minimize<O: SmoothObjective>(
    &self,
    objective: &O,
    constraints: &LinearConstraints,
    x0: DVector<f64>,
  ) -> Result<SolverOutcome> {
    let n = constraints.dim();
    if x0.len() != n {
      return Err(PortfolioError::shape("solver start point", n, x0.len()));
    }

    let started = Instant::now();
    let mut x = x0;
    let mut f = eval_cost(objective, &x)?;

    let start_violation = constraints.violation(&x);
    if start_violation > FEASIBILITY_TOL {
      return Ok(SolverOutcome {
        diagnostics: SolverDiagnostics {
          status: SolverStatus::Infeasible,
          iterations: 0,
          objective: f,
          constraint_violation: start_violation,
          elapsed: started.elapsed(),
        },
        x,
      });
    }

    let exact = objective.constant_hessian();
    let mut b = exact.clone().unwrap_or_else(|| DMatrix::identity(n, n));
    let mut g = eval_gradient(objective, &x)?;
    let mut status = SolverStatus::MaxIterations;
    let mut iterations = 0;
    let mut scaled = false;

    while iterations < self.config.max_iters {
      if let Some(limit) = self.config.max_duration {
        if started.elapsed() > limit {
          status = SolverStatus::TimeLimit;
          break;
        }
      }
      iterations += 1;

      let lower = (&constraints.lower - &x).map(|v| v.min(0.0));
      let upper = (&constraints.upper - &x).map(|v| v.max(0.0));
      let d = solve_qp(&b, &g, &constraints.a_eq, &lower, &upper);

      if d.amax() <= self.config.tolerance {
        status = SolverStatus::Converged;
        break;
      }

      let slope = g.dot(&d);
      if slope >= 0.0 {
        if exact.is_some() {
          // The subproblem is exact, so no descent direction is left.
          status = SolverStatus::Converged;
          break;
        }
        b = DMatrix::identity(n, n);
        scaled = false;
        continue;
      }

      let mut alpha = 1.0;
      let mut trial = &x + &d;
      let mut f_trial = eval_cost(objective, &trial)?;
      while !(f_trial <= f + ARMIJO * alpha * slope) {
        alpha *= 0.5;
        if alpha < MIN_STEP {
          break;
        }
        trial = &x + &d * alpha;
        f_trial = eval_cost(objective, &trial)?;
      }
      if alpha < MIN_STEP {
        // Predicted decrease below working precision means stationarity.
        status = if -slope <= STATIONARY_SLOPE * (1.0 + f.abs()) {
          SolverStatus::Converged
        } else {
          SolverStatus::Stalled
        };
        break;
      }

      constraints.clamp(&mut trial);
      let g_trial = eval_gradient(objective, &trial)?;
      let s = &trial - &x;
      let y = &g_trial - &g;

      if exact.is_none() {
        if !scaled {
          // Rescale the identity to the observed curvature before the first update.
          let sy = s.dot(&y);
          if sy > f64::EPSILON {
            b = DMatrix::identity(n, n) * (y.dot(&y) / sy);
          }
          scaled = true;
        }
        bfgs_update(&mut b, &s, &y);
      }

      let f_change = (f - f_trial).abs();
      x = trial;
      f = f_trial;
      g = g_trial;

      if s.amax() <= self.config.tolerance && f_change <= 1e-15 * (1.0 + f.abs()) {
        status = SolverStatus::Converged;
        break;
      }
    }

    let f = eval_cost(objective, &x)?;
    let diagnostics = SolverDiagnostics {
      status,
      iterations,
      objective: f,
      constraint_violation: constraints.violation(&x),
      elapsed: started.elapsed(),
    };
    debug!(
      %status,
      iterations,
      objective = f,
      violation = diagnostics.constraint_violation,
      "sqp finished"
    );

    Ok(SolverOutcome { x, diagnostics })
  }
}

/// Damped BFGS update (Powell), keeps `b` positive definite.
fn bfgs_update(b: &mut DMatrix<f64>, s: &DVector<f64>, y: &DVector<f64>) {
  let bs = &*b * s;
  let sbs = s.dot(&bs);
  if sbs <= f64::EPSILON {
    return;
  }

  let sy = s.dot(y);
  let theta = if sy >= 0.2 * sbs {
    1.0
  } else {
    0.8 * sbs / (sbs - sy)
  };
  let r = y * theta + &bs * (1.0 - theta);
  let sr = s.dot(&r);
  if sr <= f64::EPSILON {
    return;
  }

  *b += &r * r.transpose() / sr - &bs * bs.transpose() / sbs;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Active {
  Lower,
  Upper,
}

/// Primal active-set solve of
/// `min 1/2 d'Hd + c'd  s.t.  A d = 0, lower <= d <= upper`
/// from the feasible point `d = 0`.
fn solve_qp(
  h: &DMatrix<f64>,
  c: &DVector<f64>,
  a: &DMatrix<f64>,
  lower: &DVector<f64>,
  upper: &DVector<f64>,
) -> DVector<f64> {
  let n = c.len();
  let m = a.nrows();
  let mut d = DVector::zeros(n);
  let mut working: Vec<Option<Active>> = (0..n)
    .map(|i| {
      if lower[i] >= -ACTIVE_TOL {
        Some(Active::Lower)
      } else if upper[i] <= ACTIVE_TOL {
        Some(Active::Upper)
      } else {
        None
      }
    })
    .collect();

  let max_iters = 50 + 10 * (n + m);
  for _ in 0..max_iters {
    let free: Vec<usize> = (0..n).filter(|&i| working[i].is_none()).collect();
    let q = h * &d + c;
    let (p, nu) = equality_step(h, &q, a, &free);

    if p.amax() <= ACTIVE_TOL {
      // Bound multipliers z_i = q_i + (A' nu)_i, sign-corrected for upper bounds.
      let at_nu = a.transpose() * &nu;
      let mut release: Option<(usize, f64)> = None;
      for i in 0..n {
        let z = match working[i] {
          Some(Active::Lower) => q[i] + at_nu[i],
          Some(Active::Upper) => -(q[i] + at_nu[i]),
          None => continue,
        };
        // A variable pinned between equal bounds never leaves the working set.
        if lower[i] >= -ACTIVE_TOL && upper[i] <= ACTIVE_TOL {
          continue;
        }
        if z < -MULTIPLIER_TOL && release.map_or(true, |(_, worst)| z < worst) {
          release = Some((i, z));
        }
      }

      match release {
        Some((i, _)) => working[i] = None,
        None => return d,
      }
      continue;
    }

    let mut alpha = 1.0;
    let mut blocking = None;
    for &i in &free {
      let (ratio, side) = if p[i] < 0.0 {
        ((lower[i] - d[i]) / p[i], Active::Lower)
      } else if p[i] > 0.0 {
        ((upper[i] - d[i]) / p[i], Active::Upper)
      } else {
        continue;
      };
      if ratio < alpha {
        alpha = ratio.max(0.0);
        blocking = Some((i, side));
      }
    }

    d += &p * alpha;
    if let Some((i, side)) = blocking {
      d[i] = match side {
        Active::Lower => lower[i],
        Active::Upper => upper[i],
      };
      working[i] = Some(side);
    }
  }

  d
}

/// Solve the equality-constrained step on the free variables:
///
/// `[H_FF A_F'; A_F 0] [p_F; nu] = [-q_F; 0]`.
fn equality_step(
  h: &DMatrix<f64>,
  q: &DVector<f64>,
  a: &DMatrix<f64>,
  free: &[usize],
) -> (DVector<f64>, DVector<f64>) {
  let n = q.len();
  let m = a.nrows();
  let nf = free.len();
  let mut p = DVector::zeros(n);

  if nf == 0 {
    // Every variable is pinned: pick nu minimizing ||q + A' nu||.
    let nu = if m > 0 {
      solve_or_lstsq(a * a.transpose(), &(-(a * q))).unwrap_or_else(|| DVector::zeros(m))
    } else {
      DVector::zeros(0)
    };
    return (p, nu);
  }

  let mut kkt = DMatrix::zeros(nf + m, nf + m);
  let mut rhs = DVector::zeros(nf + m);
  for (r, &i) in free.iter().enumerate() {
    for (col, &j) in free.iter().enumerate() {
      kkt[(r, col)] = h[(i, j)];
    }
    for k in 0..m {
      kkt[(r, nf + k)] = a[(k, i)];
      kkt[(nf + k, r)] = a[(k, i)];
    }
    rhs[r] = -q[i];
  }

  match solve_or_lstsq(kkt, &rhs) {
    Some(sol) => {
      for (r, &i) in free.iter().enumerate() {
        p[i] = sol[r];
      }
      (p, sol.rows(nf, m).into_owned())
    }
    None => (p, DVector::zeros(m)),
  }
}
