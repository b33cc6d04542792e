//! # Portfolio Metrics
//!
//! $$
//! r_{p,t} = \sum_i w_i r_{t,i},\qquad
//! \mathrm{SR} = \frac{\bar r_p - r_f}{s_p},\qquad
//! \mathrm{MDD} = \min_t\left(\frac{V_t}{\max_{s\le t} V_s} - 1\right)
//! $$
//!
//! Risk and performance battery for a weight vector over historical returns.

use std::fmt::Display;

use ndarray::Array1;
use ndarray::ArrayView1;

use super::data::ReturnMatrix;
use crate::error::PortfolioError;
use crate::error::Result;

/// Tail probability for VaR and CVaR.
pub const TAIL_PROBABILITY: f64 = 0.05;

/// Fixed metric battery of one portfolio. `NaN` marks an undefined value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PortfolioMetrics {
  pub mean: f64,
  /// Sample standard deviation (`N - 1`).
  pub volatility: f64,
  pub sharpe: f64,
  /// Excess mean over the sample deviation of returns below `r_f`.
  pub sortino: f64,
  /// `mean - r_f`.
  pub alpha: f64,
  pub skewness: f64,
  /// Excess kurtosis.
  pub kurtosis: f64,
  pub max_drawdown: f64,
  pub var_95: f64,
  pub cvar_95: f64,
  pub beta: f64,
}

/// Metric identifiers in display order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum MetricKey {
  Mean,
  Volatility,
  Sharpe,
  Sortino,
  Alpha,
  Skewness,
  Kurtosis,
  MaxDrawdown,
  VaR95,
  CVaR95,
  Beta,
}

impl MetricKey {
  pub const ALL: [MetricKey; 11] = [
    MetricKey::Mean,
    MetricKey::Volatility,
    MetricKey::Sharpe,
    MetricKey::Sortino,
    MetricKey::Alpha,
    MetricKey::Skewness,
    MetricKey::Kurtosis,
    MetricKey::MaxDrawdown,
    MetricKey::VaR95,
    MetricKey::CVaR95,
    MetricKey::Beta,
  ];

  pub fn label(&self) -> &'static str {
    match self {
      MetricKey::Mean => "Mean",
      MetricKey::Volatility => "Volatility",
      MetricKey::Sharpe => "Sharpe",
      MetricKey::Sortino => "Sortino",
      MetricKey::Alpha => "Alpha (return - rf)",
      MetricKey::Skewness => "Skewness",
      MetricKey::Kurtosis => "Kurtosis",
      MetricKey::MaxDrawdown => "Max Drawdown",
      MetricKey::VaR95 => "VaR 95%",
      MetricKey::CVaR95 => "CVaR 95%",
      MetricKey::Beta => "Beta vs market",
    }
  }
}

impl Display for MetricKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.label())
  }
}

impl PortfolioMetrics {
  pub fn get(&self, key: MetricKey) -> f64 {
    match key {
      MetricKey::Mean => self.mean,
      MetricKey::Volatility => self.volatility,
      MetricKey::Sharpe => self.sharpe,
      MetricKey::Sortino => self.sortino,
      MetricKey::Alpha => self.alpha,
      MetricKey::Skewness => self.skewness,
      MetricKey::Kurtosis => self.kurtosis,
      MetricKey::MaxDrawdown => self.max_drawdown,
      MetricKey::VaR95 => self.var_95,
      MetricKey::CVaR95 => self.cvar_95,
      MetricKey::Beta => self.beta,
    }
  }

  /// `(key, value)` pairs in display order.
  pub fn entries(&self) -> [(MetricKey, f64); 11] {
    MetricKey::ALL.map(|key| (key, self.get(key)))
  }
}

/// Render a metric value, `N/A` when undefined.
pub fn format_metric(value: f64) -> String {
  if value.is_nan() {
    "N/A".to_string()
  } else {
    format!("{value:.6}")
  }
}

/// Scale weights to sum to one.
pub fn normalize_weights(weights: ArrayView1<'_, f64>) -> Result<Array1<f64>> {
  let total = weights.sum();
  if total == 0.0 {
    return Err(PortfolioError::ZeroWeightSum);
  }
  Ok(weights.mapv(|w| w / total))
}

/// Per-period returns of the normalized portfolio.
pub fn portfolio_returns(returns: &ReturnMatrix, weights: ArrayView1<'_, f64>) -> Result<Array1<f64>> {
  if weights.len() != returns.n_assets() {
    return Err(PortfolioError::shape(
      "portfolio weights",
      returns.n_assets(),
      weights.len(),
    ));
  }
  let w = normalize_weights(weights)?;
  Ok(returns.returns().dot(&w))
}

/// Metric battery of `weights` over `returns`.
///
/// Weights are normalized by their sum. Beta is measured against the
/// `market_proxy` column and is `NaN` when that column is absent.
pub fn compute_metrics(
  returns: &ReturnMatrix,
  weights: ArrayView1<'_, f64>,
  risk_free: f64,
  market_proxy: &str,
) -> Result<PortfolioMetrics> {
  if returns.n_periods() == 0 {
    return Err(PortfolioError::InsufficientData {
      required: 1,
      got: 0,
    });
  }
  let port = portfolio_returns(returns, weights)?;
  Ok(series_metrics(
    port.view(),
    returns.column(market_proxy),
    risk_free,
  ))
}

/// Metric battery of a portfolio return series.
pub fn series_metrics(
  port: ArrayView1<'_, f64>,
  market: Option<ArrayView1<'_, f64>>,
  risk_free: f64,
) -> PortfolioMetrics {
  let xs = port.to_vec();
  let mean = sample_mean(&xs);
  let volatility = sample_std(&xs);
  let sharpe = if volatility > 0.0 {
    (mean - risk_free) / volatility
  } else {
    f64::NAN
  };

  let downside: Vec<f64> = xs.iter().copied().filter(|r| *r < risk_free).collect();
  let downside_std = sample_std(&downside);
  let sortino = if downside_std > 0.0 {
    (mean - risk_free) / downside_std
  } else {
    f64::NAN
  };

  let q = quantile(&xs, TAIL_PROBABILITY);
  let tail: Vec<f64> = xs.iter().copied().filter(|r| *r <= q).collect();

  let beta = market.map_or(f64::NAN, |m| {
    let m = m.to_vec();
    let sd = sample_std(&m);
    if sd > 0.0 {
      sample_covariance(&xs, &m) / (sd * sd)
    } else {
      f64::NAN
    }
  });

  PortfolioMetrics {
    mean,
    volatility,
    sharpe,
    sortino,
    alpha: mean - risk_free,
    skewness: skewness(&xs),
    kurtosis: excess_kurtosis(&xs),
    max_drawdown: max_drawdown(&xs),
    var_95: -q,
    cvar_95: -sample_mean(&tail),
    beta,
  }
}

fn sample_mean(xs: &[f64]) -> f64 {
  if xs.is_empty() {
    return f64::NAN;
  }
  xs.iter().sum::<f64>() / xs.len() as f64
}

fn is_constant(xs: &[f64]) -> bool {
  xs.windows(2).all(|w| w[0] == w[1])
}

fn sample_covariance(xs: &[f64], ys: &[f64]) -> f64 {
  let n = xs.len();
  if n < 2 || ys.len() != n {
    return f64::NAN;
  }
  let (mx, my) = (sample_mean(xs), sample_mean(ys));
  xs.iter()
    .zip(ys)
    .map(|(x, y)| (x - mx) * (y - my))
    .sum::<f64>()
    / (n - 1) as f64
}

/// `N - 1` standard deviation; exactly zero for a constant series.
fn sample_std(xs: &[f64]) -> f64 {
  if xs.len() < 2 {
    return f64::NAN;
  }
  if is_constant(xs) {
    return 0.0;
  }
  sample_covariance(xs, xs).max(0.0).sqrt()
}

/// Biased central moments `(m2, m3, m4)`.
fn central_moments(xs: &[f64]) -> (f64, f64, f64) {
  let n = xs.len() as f64;
  let m = sample_mean(xs);
  xs.iter().fold((0.0, 0.0, 0.0), |(m2, m3, m4), x| {
    let d = x - m;
    let d2 = d * d;
    (m2 + d2 / n, m3 + d2 * d / n, m4 + d2 * d2 / n)
  })
}

/// Adjusted Fisher-Pearson skewness `G1`.
fn skewness(xs: &[f64]) -> f64 {
  let n = xs.len();
  if n < 3 {
    return f64::NAN;
  }
  if is_constant(xs) {
    return 0.0;
  }
  let (m2, m3, _) = central_moments(xs);
  let n = n as f64;
  (n * (n - 1.0)).sqrt() / (n - 2.0) * m3 / m2.powf(1.5)
}

/// Bias-corrected excess kurtosis `G2`.
fn excess_kurtosis(xs: &[f64]) -> f64 {
  let n = xs.len();
  if n < 4 {
    return f64::NAN;
  }
  if is_constant(xs) {
    return 0.0;
  }
  let (m2, _, m4) = central_moments(xs);
  let n = n as f64;
  let g2 = m4 / (m2 * m2) - 3.0;
  (n - 1.0) / ((n - 2.0) * (n - 3.0)) * ((n + 1.0) * g2 + 6.0)
}

/// Quantile with linear interpolation between order statistics.
fn quantile(xs: &[f64], p: f64) -> f64 {
  if xs.is_empty() {
    return f64::NAN;
  }
  let mut sorted = xs.to_vec();
  sorted.sort_by(|a, b| a.total_cmp(b));
  let pos = p.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
  let lo = pos.floor() as usize;
  let hi = (lo + 1).min(sorted.len() - 1);
  sorted[lo] + (pos - lo as f64) * (sorted[hi] - sorted[lo])
}

/// Most negative drop of the compounded growth curve below its running peak.
fn max_drawdown(xs: &[f64]) -> f64 {
  if xs.is_empty() {
    return f64::NAN;
  }
  let mut value = 1.0;
  let mut peak = f64::NEG_INFINITY;
  let mut worst: f64 = 0.0;
  for r in xs {
    value *= 1.0 + r;
    peak = peak.max(value);
    worst = worst.min(value / peak - 1.0);
  }
  worst
}
