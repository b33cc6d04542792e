//! # Portfolio Optimizers
//!
//! $$
//! \min_{\mathbf{w}} \ \mathcal{L}(\mathbf{w})\quad\text{s.t.}\quad \mathbf 1^\top\mathbf w = 1,\ \ 0 \le w_i \le 1
//! $$
//!
//! Minimum-variance, maximum-Sharpe, target-return Markowitz and
//! Black-Litterman allocations over the budget simplex.

use argmin::core::CostFunction;
use argmin::core::Gradient;
use nalgebra::DMatrix;
use nalgebra::DVector;
use ndarray::Array1;
use ndarray::Array2;
use tracing::debug;
use tracing::warn;

use super::black_litterman::BlackLittermanConfig;
use super::black_litterman::BlackLittermanPosterior;
use super::black_litterman::PosteriorCovariance;
use super::black_litterman::ViewSpec;
use super::black_litterman::posterior;
use super::linalg::from_dvector;
use super::linalg::solve_or_lstsq;
use super::linalg::to_dmatrix;
use super::linalg::to_dvector;
use super::moments::Moments;
use super::solver::LinearConstraints;
use super::solver::SmoothObjective;
use super::solver::SolverOutcome;
use super::solver::SqpSolver;
use super::types::Objective;
use super::types::PortfolioResult;
use super::types::SolverConfig;
use super::types::SolverDiagnostics;
use super::types::SolverStatus;
use super::universe::AssetIndex;
use crate::error::PortfolioError;
use crate::error::Result;

/// Objective value returned when portfolio volatility vanishes.
const ZERO_VOL_PENALTY: f64 = 1e6;
const ZERO_VOL: f64 = 1e-12;
/// Largest absolute weight accepted from a short-selling solve.
const MAX_ABS_WEIGHT: f64 = 1e3;

/// Optimizer settings shared by every objective.
#[derive(Clone, Copy, Debug)]
pub struct OptimizerConfig {
  /// Risk-free rate per period of the moments.
  pub risk_free: f64,
  /// Drop the `[0, 1]` weight bounds.
  pub allow_short: bool,
  pub black_litterman: BlackLittermanConfig,
  pub solver: SolverConfig,
}

impl Default for OptimizerConfig {
  fn default() -> Self {
    Self {
      risk_free: 0.0,
      allow_short: false,
      black_litterman: BlackLittermanConfig::default(),
      solver: SolverConfig::default(),
    }
  }
}

/// `w' Sigma w`.
#[derive(Clone, Debug)]
pub struct VarianceObjective {
  cov: DMatrix<f64>,
}

impl VarianceObjective {
  pub fn new(cov: &Array2<f64>) -> Self {
    Self {
      cov: to_dmatrix(cov),
    }
  }
}

impl CostFunction for VarianceObjective {
  type Param = Vec<f64>;
  type Output = f64;

  fn cost(&self, x: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
    let w = DVector::from_column_slice(x);
    Ok(w.dot(&(&self.cov * &w)))
  }
}

impl Gradient for VarianceObjective {
  type Param = Vec<f64>;
  type Gradient = Vec<f64>;

  fn gradient(&self, x: &Self::Param) -> std::result::Result<Self::Gradient, argmin::core::Error> {
    let w = DVector::from_column_slice(x);
    Ok((&self.cov * &w * 2.0).as_slice().to_vec())
  }
}

impl SmoothObjective for VarianceObjective {
  fn constant_hessian(&self) -> Option<DMatrix<f64>> {
    Some(&self.cov * 2.0)
  }
}

/// `-(w' mu - r_f) / sqrt(w' Sigma w)`, a large finite penalty at zero volatility.
#[derive(Clone, Debug)]
pub struct NegativeSharpe {
  mu: DVector<f64>,
  cov: DMatrix<f64>,
  risk_free: f64,
}

impl NegativeSharpe {
  pub fn new(mu: &Array1<f64>, cov: &Array2<f64>, risk_free: f64) -> Self {
    Self {
      mu: to_dvector(mu.view()),
      cov: to_dmatrix(cov),
      risk_free,
    }
  }
}

impl CostFunction for NegativeSharpe {
  type Param = Vec<f64>;
  type Output = f64;

  fn cost(&self, x: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
    let w = DVector::from_column_slice(x);
    let vol = w.dot(&(&self.cov * &w)).max(0.0).sqrt();
    if vol <= ZERO_VOL {
      return Ok(ZERO_VOL_PENALTY);
    }
    Ok(-(w.dot(&self.mu) - self.risk_free) / vol)
  }
}

impl Gradient for NegativeSharpe {
  type Param = Vec<f64>;
  type Gradient = Vec<f64>;

  fn gradient(&self, x: &Self::Param) -> std::result::Result<Self::Gradient, argmin::core::Error> {
    let w = DVector::from_column_slice(x);
    let sigma_w = &self.cov * &w;
    let var = w.dot(&sigma_w).max(0.0);
    let vol = var.sqrt();
    if vol <= ZERO_VOL {
      return Ok(self.mu.iter().map(|m| -m).collect());
    }
    let excess = w.dot(&self.mu) - self.risk_free;
    let grad = -(&self.mu / vol - sigma_w * (excess / (var * vol)));
    Ok(grad.as_slice().to_vec())
  }
}

impl SmoothObjective for NegativeSharpe {}

fn budget_constraints(n: usize, allow_short: bool) -> LinearConstraints {
  let constraints = LinearConstraints::new(n).with_equality(&vec![1.0; n], 1.0);
  if allow_short {
    constraints
  } else {
    constraints.with_bounds(0.0, 1.0)
  }
}

fn equal_weights(n: usize) -> DVector<f64> {
  DVector::from_element(n, 1.0 / n as f64)
}

fn ensure_assets(moments: &Moments) -> Result<usize> {
  match moments.len() {
    0 => Err(PortfolioError::shape("optimizer universe", "at least one asset", 0)),
    n => Ok(n),
  }
}

/// Point on the segment from equal weights toward the highest (or lowest)
/// return asset with `w' mu = target`.
///
/// Returns the closest reachable portfolio and `false` when no point inside
/// the bounds meets the target.
fn target_start(mu: &DVector<f64>, target: f64, allow_short: bool) -> (DVector<f64>, bool) {
  let n = mu.len();
  let w0 = equal_weights(n);
  let r0 = w0.dot(mu);
  let scale = 1.0 + mu.amax();
  if (target - r0).abs() <= 1e-14 * scale {
    return (w0, true);
  }

  let k = if target > r0 { mu.imax() } else { mu.imin() };
  let reach = mu[k] - r0;
  if reach.abs() <= 1e-14 * scale {
    return (w0, false);
  }

  let t = (target - r0) / reach;
  let mut corner = DVector::zeros(n);
  corner[k] = 1.0;
  if !allow_short && t > 1.0 {
    return (corner, false);
  }
  (w0 * (1.0 - t) + corner * t, true)
}

/// Whether the fully invested tangency portfolio has no finite maximizer.
///
/// Without bounds the tangency is `z / 1'z` with `z = Sigma^{-1} (mu - rf)`;
/// when `1'z <= 0` the Sharpe ratio only approaches its supremum as the
/// weights diverge.
fn tangency_unbounded(moments: &Moments, risk_free: f64) -> bool {
  let excess = to_dvector(moments.mean().view()).add_scalar(-risk_free);
  match solve_or_lstsq(to_dmatrix(moments.covariance()), &excess) {
    Some(z) => {
      let scale: f64 = z.iter().map(|v| v.abs()).sum();
      scale > 0.0 && z.sum() <= 1e-12 * scale
    }
    None => false,
  }
}

fn summarize(
  assets: &AssetIndex,
  weights: DVector<f64>,
  mu: &Array1<f64>,
  cov: &Array2<f64>,
  risk_free: f64,
  diagnostics: SolverDiagnostics,
  posterior: Option<BlackLittermanPosterior>,
) -> PortfolioResult {
  let weights = from_dvector(&weights);
  let expected_return = weights.dot(mu);
  let volatility = weights.dot(&cov.dot(&weights)).max(0.0).sqrt();
  let sharpe = if volatility > 0.0 {
    (expected_return - risk_free) / volatility
  } else {
    f64::NAN
  };

  if !diagnostics.is_converged() {
    warn!(
      status = %diagnostics.status,
      iterations = diagnostics.iterations,
      "optimizer returned best-effort weights"
    );
  }

  PortfolioResult {
    assets: assets.clone(),
    weights,
    expected_return,
    volatility,
    sharpe,
    diagnostics,
    posterior,
  }
}

fn run<O: SmoothObjective>(
  objective: &O,
  constraints: &LinearConstraints,
  x0: DVector<f64>,
  config: &OptimizerConfig,
) -> Result<SolverOutcome> {
  SqpSolver::new(config.solver).minimize(objective, constraints, x0)
}

/// Global minimum-variance portfolio.
pub fn optimize_min_variance(moments: &Moments, config: &OptimizerConfig) -> Result<PortfolioResult> {
  let n = ensure_assets(moments)?;
  let objective = VarianceObjective::new(moments.covariance());
  let constraints = budget_constraints(n, config.allow_short);
  let outcome = run(&objective, &constraints, equal_weights(n), config)?;

  Ok(summarize(
    moments.assets(),
    outcome.x,
    moments.mean(),
    moments.covariance(),
    config.risk_free,
    outcome.diagnostics,
    None,
  ))
}

/// Tangency (maximum Sharpe ratio) portfolio.
pub fn optimize_max_sharpe(moments: &Moments, config: &OptimizerConfig) -> Result<PortfolioResult> {
  let n = ensure_assets(moments)?;
  let objective = NegativeSharpe::new(moments.mean(), moments.covariance(), config.risk_free);
  let constraints = budget_constraints(n, config.allow_short);
  let mut outcome = run(&objective, &constraints, equal_weights(n), config)?;

  if config.allow_short
    && (tangency_unbounded(moments, config.risk_free) || outcome.x.amax() > MAX_ABS_WEIGHT)
  {
    debug!(largest = outcome.x.amax(), "tangency portfolio diverges");
    outcome.diagnostics.status = SolverStatus::Unbounded;
  }

  Ok(summarize(
    moments.assets(),
    outcome.x,
    moments.mean(),
    moments.covariance(),
    config.risk_free,
    outcome.diagnostics,
    None,
  ))
}

fn solve_target(
  assets: &AssetIndex,
  mu: &Array1<f64>,
  cov: &Array2<f64>,
  target_return: Option<f64>,
  config: &OptimizerConfig,
  posterior: Option<BlackLittermanPosterior>,
) -> Result<PortfolioResult> {
  let n = mu.len();
  let target = target_return.unwrap_or_else(|| mu.mean().unwrap_or(0.0));
  let mu_d = to_dvector(mu.view());
  let objective = VarianceObjective::new(cov);
  let constraints =
    budget_constraints(n, config.allow_short).with_equality(mu_d.as_slice(), target);

  let (x0, reachable) = target_start(&mu_d, target, config.allow_short);
  debug!(target, reachable, "markowitz target");

  let outcome = if reachable {
    run(&objective, &constraints, x0, config)?
  } else {
    let objective_value = objective
      .cost(&x0.as_slice().to_vec())
      .map_err(|e| PortfolioError::ObjectiveEvaluation(e.to_string()))?;
    SolverOutcome {
      diagnostics: SolverDiagnostics {
        status: SolverStatus::Infeasible,
        iterations: 0,
        objective: objective_value,
        constraint_violation: constraints.violation(&x0),
        elapsed: std::time::Duration::ZERO,
      },
      x: x0,
    }
  };

  Ok(summarize(
    assets,
    outcome.x,
    mu,
    cov,
    config.risk_free,
    outcome.diagnostics,
    posterior,
  ))
}

/// Minimum variance at `target_return`, the cross-sectional mean of `mu`
/// when `None`.
pub fn optimize_markowitz(
  moments: &Moments,
  target_return: Option<f64>,
  config: &OptimizerConfig,
) -> Result<PortfolioResult> {
  ensure_assets(moments)?;
  solve_target(
    moments.assets(),
    moments.mean(),
    moments.covariance(),
    target_return,
    config,
    None,
  )
}

/// Markowitz target solve on the Black-Litterman posterior.
///
/// Expected return and Sharpe of the result are measured under the posterior
/// mean.
pub fn optimize_black_litterman(
  moments: &Moments,
  views: &ViewSpec,
  target_return: Option<f64>,
  config: &OptimizerConfig,
) -> Result<PortfolioResult> {
  ensure_assets(moments)?;
  let bl = posterior(moments, views, config.black_litterman.tau)?;
  let cov = match config.black_litterman.covariance {
    PosteriorCovariance::Posterior => bl.posterior_covariance.clone(),
    PosteriorCovariance::Prior => moments.covariance().clone(),
  };
  let mu = bl.posterior_mean.clone();

  solve_target(moments.assets(), &mu, &cov, target_return, config, Some(bl))
}

/// Dispatch to the optimizer selected by `objective`.
pub fn optimize_with_method(
  objective: &Objective,
  moments: &Moments,
  config: &OptimizerConfig,
) -> Result<PortfolioResult> {
  match objective {
    Objective::MinVariance => optimize_min_variance(moments, config),
    Objective::MaxSharpe => optimize_max_sharpe(moments, config),
    Objective::MarkowitzTarget { target_return } => {
      optimize_markowitz(moments, *target_return, config)
    }
    Objective::BlackLitterman {
      views,
      target_return,
    } => optimize_black_litterman(moments, views, *target_return, config),
  }
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;
  use ndarray::array;

  use super::*;
  use crate::portfolio::black_litterman::View;

  fn daily() -> Moments {
    Moments::from_parts(
      AssetIndex::new(["SPLG", "EWC", "EEM"]),
      array![0.0008, 0.0005, 0.0003],
      array![
        [4.0e-4, 1.0e-4, 5.0e-5],
        [1.0e-4, 2.5e-4, 4.0e-5],
        [5.0e-5, 4.0e-5, 1.0e-4]
      ],
    )
    .unwrap()
  }

  fn assert_budget(result: &PortfolioResult, long_only: bool) {
    assert_abs_diff_eq!(result.weights.sum(), 1.0, epsilon = 1e-9);
    if long_only {
      assert!(result.weights.iter().all(|w| *w >= -1e-12 && *w <= 1.0 + 1e-12));
    }
  }

  #[test]
  fn identity_covariance_gives_equal_weights() {
    let moments = Moments::from_parts(
      AssetIndex::new(["A", "B", "C"]),
      array![0.001, 0.001, 0.001],
      Array2::eye(3),
    )
    .unwrap();
    let result = optimize_min_variance(&moments, &OptimizerConfig::default()).unwrap();

    assert!(result.is_converged());
    for w in result.weights.iter() {
      assert_abs_diff_eq!(*w, 1.0 / 3.0, epsilon = 1e-8);
    }
  }

  #[test]
  fn min_variance_beats_equal_weight() {
    let moments = daily();
    let result = optimize_min_variance(&moments, &OptimizerConfig::default()).unwrap();
    let equal = Array1::from_elem(3, 1.0 / 3.0);

    assert!(result.is_converged());
    assert_budget(&result, true);
    assert!(result.volatility <= moments.portfolio_variance(equal.view()).sqrt() + 1e-12);
  }

  #[test]
  fn max_sharpe_dominates_min_variance() {
    let moments = daily();
    let config = OptimizerConfig::default();
    let gmv = optimize_min_variance(&moments, &config).unwrap();
    let tangency = optimize_max_sharpe(&moments, &config).unwrap();

    assert!(tangency.is_converged(), "{:?}", tangency.diagnostics);
    assert_budget(&tangency, true);
    assert!(tangency.sharpe >= gmv.sharpe - 1e-9);
  }

  #[test]
  fn markowitz_hits_feasible_target() {
    let moments = daily();
    let result = optimize_markowitz(&moments, Some(0.0006), &OptimizerConfig::default()).unwrap();

    assert!(result.is_converged());
    assert_budget(&result, true);
    assert_abs_diff_eq!(result.expected_return, 0.0006, epsilon = 1e-6);
  }

  #[test]
  fn markowitz_defaults_to_mean_target() {
    let moments = daily();
    let result = optimize_with_method(
      &Objective::MarkowitzTarget {
        target_return: None,
      },
      &moments,
      &OptimizerConfig::default(),
    )
    .unwrap();

    assert_abs_diff_eq!(
      result.expected_return,
      moments.mean().mean().unwrap(),
      epsilon = 1e-9
    );
  }

  #[test]
  fn unreachable_target_is_infeasible_not_silent() {
    let moments = daily();
    let result = optimize_markowitz(&moments, Some(0.002), &OptimizerConfig::default()).unwrap();

    assert_eq!(result.diagnostics.status, SolverStatus::Infeasible);
    assert_eq!(result.weight("SPLG"), Some(1.0));
    assert!(result.clone().ensure_converged().is_err());
  }

  #[test]
  fn shorting_reaches_targets_beyond_the_best_asset() {
    let moments = daily();
    let config = OptimizerConfig {
      allow_short: true,
      ..OptimizerConfig::default()
    };
    let result = optimize_markowitz(&moments, Some(0.001), &config).unwrap();

    assert!(result.is_converged());
    assert_budget(&result, false);
    assert_abs_diff_eq!(result.expected_return, 0.001, epsilon = 1e-6);
    assert!(result.weights.iter().any(|w| *w < 0.0));
  }

  #[test]
  fn black_litterman_tilts_toward_views() {
    let moments = daily();
    let config = OptimizerConfig::default();
    let views = ViewSpec::from_views(&[View::absolute("EEM", 0.0012, 0.99)], moments.assets()).unwrap();
    let neutral = optimize_black_litterman(
      &moments,
      &ViewSpec::empty(3),
      Some(0.0005),
      &config,
    )
    .unwrap();
    let tilted = optimize_black_litterman(&moments, &views, Some(0.0005), &config).unwrap();

    assert!(tilted.is_converged());
    let post = tilted.posterior.as_ref().unwrap();
    assert!(post.posterior_mean[2] > post.prior_mean[2]);
    assert!(tilted.weight("EEM").unwrap() > neutral.weight("EEM").unwrap());
  }

  #[test]
  fn black_litterman_prior_covariance_uses_sample_sigma() {
    let moments = daily();
    let views = ViewSpec::from_views(&[View::absolute("EEM", 0.0009, 0.999)], moments.assets()).unwrap();
    let mut config = OptimizerConfig::default();
    config.black_litterman.covariance = PosteriorCovariance::Prior;

    let prior = optimize_black_litterman(&moments, &views, Some(0.0006), &config).unwrap();
    let post = prior.posterior.clone().unwrap();
    let expected = solve_target(
      moments.assets(),
      &post.posterior_mean,
      moments.covariance(),
      Some(0.0006),
      &config,
      None,
    )
    .unwrap();

    assert!(prior.is_converged());
    for (a, b) in prior.weights.iter().zip(expected.weights.iter()) {
      assert_abs_diff_eq!(*a, *b, epsilon = 1e-9);
    }
    assert_abs_diff_eq!(prior.volatility, expected.volatility, epsilon = 1e-12);

    config.black_litterman.covariance = PosteriorCovariance::Posterior;
    let blended = optimize_black_litterman(&moments, &views, Some(0.0006), &config).unwrap();
    let gap = prior
      .weights
      .iter()
      .zip(blended.weights.iter())
      .map(|(a, b)| (a - b).abs())
      .fold(0.0, f64::max);
    assert!(gap > 1e-6, "covariance choice did not change the weights");
  }

  #[test]
  fn diverging_tangency_with_shorts_is_flagged() {
    let config = OptimizerConfig {
      allow_short: true,
      ..OptimizerConfig::default()
    };
    for mu in [array![0.001, -0.001], array![0.001, -0.003]] {
      let moments = Moments::from_parts(
        AssetIndex::new(["A", "B"]),
        mu,
        array![[1.0e-4, 0.0], [0.0, 1.0e-4]],
      )
      .unwrap();
      let result = optimize_max_sharpe(&moments, &config).unwrap();

      assert_eq!(result.diagnostics.status, SolverStatus::Unbounded);
      assert!(!result.is_converged());
    }
  }

  #[test]
  fn bounded_tangency_with_shorts_is_not_flagged() {
    let moments = daily();
    let config = OptimizerConfig {
      allow_short: true,
      ..OptimizerConfig::default()
    };
    let result = optimize_max_sharpe(&moments, &config).unwrap();

    assert!(!tangency_unbounded(&moments, 0.0));
    assert_ne!(result.diagnostics.status, SolverStatus::Unbounded);
    assert!(result.weights.iter().all(|w| w.abs() <= MAX_ABS_WEIGHT));
  }

  #[test]
  fn zero_volatility_is_penalized_not_divided() {
    let objective = NegativeSharpe::new(&array![0.01, 0.02], &Array2::zeros((2, 2)), 0.0);
    assert_eq!(objective.cost(&vec![0.5, 0.5]).unwrap(), ZERO_VOL_PENALTY);
    assert_eq!(objective.gradient(&vec![0.5, 0.5]).unwrap(), vec![-0.01, -0.02]);
  }

  #[test]
  fn sharpe_gradient_matches_finite_differences() {
    let m = daily();
    let objective = NegativeSharpe::new(m.mean(), m.covariance(), 0.0001);
    let x = vec![0.2, 0.5, 0.3];
    let grad = objective.gradient(&x).unwrap();
    let h = 1e-7;

    for i in 0..3 {
      let mut up = x.clone();
      let mut down = x.clone();
      up[i] += h;
      down[i] -= h;
      let fd = (objective.cost(&up).unwrap() - objective.cost(&down).unwrap()) / (2.0 * h);
      assert_abs_diff_eq!(grad[i], fd, epsilon = 1e-5);
    }
  }
}
