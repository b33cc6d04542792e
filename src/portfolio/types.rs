//! # Portfolio Types
//!
//! $$
//! \mathbf{w}^\*=\arg\max_{\mathbf{w}} \frac{\mathbb E[R_p]-r_f}{\sigma_p}
//! $$
//!
//! Shared enums, solver settings and result containers for portfolio optimization.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use ndarray::Array1;

use super::black_litterman::BlackLittermanPosterior;
use super::black_litterman::ViewSpec;
use super::universe::AssetIndex;
use crate::error::PortfolioError;
use crate::error::Result;

/// Supported portfolio optimization methods.
#[derive(Default, Clone, Copy, PartialEq, Eq, Debug)]
pub enum OptimizerMethod {
  /// Global minimum variance.
  #[default]
  MinVariance,
  /// Tangency portfolio (maximum Sharpe ratio).
  MaxSharpe,
  /// Minimum variance at a target expected return.
  MarkowitzTarget,
  /// Markowitz target solve on Black-Litterman posterior returns.
  BlackLitterman,
}

impl Display for OptimizerMethod {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      OptimizerMethod::MinVariance => write!(f, "min-variance"),
      OptimizerMethod::MaxSharpe => write!(f, "max-sharpe"),
      OptimizerMethod::MarkowitzTarget => write!(f, "markowitz"),
      OptimizerMethod::BlackLitterman => write!(f, "black-litterman"),
    }
  }
}

impl FromStr for OptimizerMethod {
  type Err = String;

  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "min-variance" | "minvariance" | "min-var" | "gmv" => Ok(Self::MinVariance),
      "max-sharpe" | "maxsharpe" | "sharpe" | "tangency" => Ok(Self::MaxSharpe),
      "markowitz" | "target" | "markowitz-target" => Ok(Self::MarkowitzTarget),
      "bl" | "black-litterman" | "blacklitterman" => Ok(Self::BlackLitterman),
      other => Err(format!("unknown optimizer method: {other}")),
    }
  }
}

/// Objective of one optimization request, with its objective-specific inputs.
#[derive(Clone, Debug)]
pub enum Objective {
  /// Minimize `w' Sigma w`.
  MinVariance,
  /// Minimize `-(w' mu - r_f) / sqrt(w' Sigma w)`.
  MaxSharpe,
  /// Minimize `w' Sigma w` subject to `w' mu = target`.
  /// `None` targets the cross-sectional mean of `mu`.
  MarkowitzTarget { target_return: Option<f64> },
  /// Markowitz target on the posterior returns implied by `views`.
  BlackLitterman {
    views: ViewSpec,
    target_return: Option<f64>,
  },
}

impl Objective {
  pub fn method(&self) -> OptimizerMethod {
    match self {
      Objective::MinVariance => OptimizerMethod::MinVariance,
      Objective::MaxSharpe => OptimizerMethod::MaxSharpe,
      Objective::MarkowitzTarget { .. } => OptimizerMethod::MarkowitzTarget,
      Objective::BlackLitterman { .. } => OptimizerMethod::BlackLitterman,
    }
  }
}

/// Iteration and time limits of the constrained solver.
#[derive(Clone, Copy, Debug)]
pub struct SolverConfig {
  /// Maximum outer (SQP) iterations.
  pub max_iters: usize,
  /// Step-size tolerance on the weight vector.
  pub tolerance: f64,
  /// Optional wall-clock budget for one solve.
  pub max_duration: Option<Duration>,
}

impl Default for SolverConfig {
  fn default() -> Self {
    Self {
      max_iters: 500,
      tolerance: 1e-10,
      max_duration: Some(Duration::from_secs(5)),
    }
  }
}

/// Termination status of a solve.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SolverStatus {
  /// KKT conditions met within tolerance.
  Converged,
  /// Iteration budget exhausted.
  MaxIterations,
  /// Time budget exhausted.
  TimeLimit,
  /// Line search could not decrease the objective.
  Stalled,
  /// No weight vector satisfies the constraints.
  Infeasible,
  /// The optimum is only approached as the weights diverge.
  Unbounded,
}

impl Display for SolverStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      SolverStatus::Converged => write!(f, "converged"),
      SolverStatus::MaxIterations => write!(f, "iteration limit reached"),
      SolverStatus::TimeLimit => write!(f, "time limit reached"),
      SolverStatus::Stalled => write!(f, "line search stalled"),
      SolverStatus::Infeasible => write!(f, "constraints infeasible"),
      SolverStatus::Unbounded => write!(f, "objective unbounded"),
    }
  }
}

/// What the solver reports alongside the weights.
#[derive(Clone, Copy, Debug)]
pub struct SolverDiagnostics {
  pub status: SolverStatus,
  /// Outer iterations performed.
  pub iterations: usize,
  /// Objective value at the returned weights.
  pub objective: f64,
  /// Largest violation of equality constraints or bounds.
  pub constraint_violation: f64,
  pub elapsed: Duration,
}

impl SolverDiagnostics {
  pub fn is_converged(&self) -> bool {
    self.status == SolverStatus::Converged
  }
}

/// Output of a portfolio optimization run.
#[derive(Clone, Debug)]
pub struct PortfolioResult {
  /// Assets the weights refer to.
  pub assets: AssetIndex,
  /// Final portfolio weights.
  pub weights: Array1<f64>,
  /// Model expected portfolio return (annualized if inputs are annualized).
  pub expected_return: f64,
  /// Model portfolio volatility.
  pub volatility: f64,
  /// `(expected_return - risk_free) / volatility`, `NaN` at zero volatility.
  pub sharpe: f64,
  pub diagnostics: SolverDiagnostics,
  /// Posterior moments when the objective was Black-Litterman.
  pub posterior: Option<BlackLittermanPosterior>,
}

impl PortfolioResult {
  pub fn is_converged(&self) -> bool {
    self.diagnostics.is_converged()
  }

  /// Weight of `ticker`, if it belongs to the result.
  pub fn weight(&self, ticker: &str) -> Option<f64> {
    self.assets.position(ticker).map(|i| self.weights[i])
  }

  /// `(ticker, weight)` pairs in asset order.
  pub fn allocations(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
    self
      .assets
      .tickers()
      .iter()
      .map(String::as_str)
      .zip(self.weights.iter().copied())
  }

  /// Turn a non-converged status into [`PortfolioError::SolverNonConvergence`].
  pub fn ensure_converged(self) -> Result<Self> {
    if self.is_converged() {
      Ok(self)
    } else {
      Err(PortfolioError::SolverNonConvergence {
        status: self.diagnostics.status,
        iterations: self.diagnostics.iterations,
      })
    }
  }
}
