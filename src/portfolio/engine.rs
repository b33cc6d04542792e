//! # Portfolio Engine
//!
//! $$
//! P \xrightarrow{\ \Delta\ } R \xrightarrow{\ \hat\mu,\hat\Sigma\ } \mathbf{w}^\* \xrightarrow{\ \mathcal M\ } \text{metrics}
//! $$
//!
//! Request-level orchestration: load prices, estimate moments, optimize and
//! score the resulting weights.

use std::collections::BTreeMap;

use approx::abs_diff_eq;
use ndarray::Array1;
use tracing::info;
use tracing::warn;

use super::black_litterman::BlackLittermanConfig;
use super::black_litterman::View;
use super::black_litterman::ViewSpec;
use super::data::DateRange;
use super::data::ReturnMatrix;
use super::data::load_return_matrix;
use super::metrics::PortfolioMetrics;
use super::metrics::compute_metrics;
use super::metrics::normalize_weights;
use super::moments::Moments;
use super::moments::TRADING_DAYS;
use super::optimizers::OptimizerConfig;
use super::optimizers::optimize_with_method;
use super::source::PriceSource;
use super::types::Objective;
use super::types::OptimizerMethod;
use super::types::PortfolioResult;
use super::types::SolverConfig;
use super::universe::AssetIndex;
use super::universe::DEFAULT_MARKET_PROXY;
use super::universe::Universe;
use crate::error::Result;

/// Absolute tolerance of the advisory "weights sum to 100%" check.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-5;

/// Runtime configuration for [`PortfolioEngine`].
#[derive(Clone, Debug)]
pub struct PortfolioEngineConfig {
  /// Risk-free rate in the units of the optimized moments (annual when
  /// `annualize` is set, per period otherwise).
  pub risk_free: f64,
  /// Drop the long-only bounds.
  pub allow_short: bool,
  /// Scale moments by `periods_per_year` before optimizing.
  pub annualize: bool,
  pub periods_per_year: f64,
  /// Column used for beta.
  pub market_proxy: String,
  /// Price history window.
  pub date_range: DateRange,
  pub black_litterman: BlackLittermanConfig,
  pub solver: SolverConfig,
}

impl Default for PortfolioEngineConfig {
  fn default() -> Self {
    Self {
      risk_free: 0.0,
      allow_short: false,
      annualize: false,
      periods_per_year: TRADING_DAYS,
      market_proxy: DEFAULT_MARKET_PROXY.to_string(),
      date_range: DateRange::default(),
      black_litterman: BlackLittermanConfig::default(),
      solver: SolverConfig::default(),
    }
  }
}

impl PortfolioEngineConfig {
  pub fn optimizer_config(&self) -> OptimizerConfig {
    OptimizerConfig {
      risk_free: self.risk_free,
      allow_short: self.allow_short,
      black_litterman: self.black_litterman,
      solver: self.solver,
    }
  }

  /// Risk-free rate per period of the raw returns, as the metrics expect it.
  pub fn per_period_risk_free(&self) -> f64 {
    if self.annualize {
      self.risk_free / self.periods_per_year
    } else {
      self.risk_free
    }
  }
}

/// One optimization request.
#[derive(Clone, Debug, Default)]
pub struct OptimizationRequest {
  pub universe: Universe,
  pub method: OptimizerMethod,
  /// Target for the return-constrained methods; mean of `mu` when `None`.
  pub target_return: Option<f64>,
  /// Views, used by [`OptimizerMethod::BlackLitterman`] only.
  pub views: Vec<View>,
}

/// Everything computed for an [`OptimizationRequest`].
#[derive(Clone, Debug)]
pub struct OptimizationReport {
  pub universe: Universe,
  pub returns: ReturnMatrix,
  /// Moments fed to the optimizer.
  pub moments: Moments,
  pub result: PortfolioResult,
  /// Historical metrics of the optimized weights on raw per-period returns.
  pub metrics: PortfolioMetrics,
}

/// User-weighted portfolio to analyze.
#[derive(Clone, Debug)]
pub struct ArbitraryPortfolioRequest {
  pub universe: Universe,
  /// Weight per ticker in percent. Missing tickers weigh zero.
  pub weights_pct: BTreeMap<String, f64>,
  /// Per-period risk-free rate; the engine's when `None`.
  pub risk_free: Option<f64>,
}

impl Default for ArbitraryPortfolioRequest {
  fn default() -> Self {
    Self {
      universe: Universe::All,
      weights_pct: BTreeMap::new(),
      risk_free: None,
    }
  }
}

/// Metrics of a user-weighted portfolio.
#[derive(Clone, Debug)]
pub struct ArbitraryPortfolioReport {
  pub assets: AssetIndex,
  /// Weights after normalization to unit sum.
  pub weights: Array1<f64>,
  /// Sum of the supplied weights as fractions.
  pub weight_sum: f64,
  /// Whether the supplied weights already summed to 100%.
  pub sums_to_one: bool,
  pub metrics: PortfolioMetrics,
}

/// Single entry point for optimization and portfolio analysis requests.
#[derive(Clone, Debug)]
pub struct PortfolioEngine<S> {
  source: S,
  config: PortfolioEngineConfig,
}

impl<S: PriceSource> PortfolioEngine<S> {
  /// Construct a new engine over a price source.
  pub fn new(source: S, config: PortfolioEngineConfig) -> Self {
    Self { source, config }
  }

  /// Borrow engine configuration.
  pub fn config(&self) -> &PortfolioEngineConfig {
    &self.config
  }

  pub fn source(&self) -> &S {
    &self.source
  }

  /// Synchronized returns of every ticker in `universe`.
  pub fn load_universe(&self, universe: Universe) -> Result<ReturnMatrix> {
    load_return_matrix(&self.source, &universe.tickers(), &self.config.date_range)
  }

  /// Moments of `returns`, annualized when configured.
  pub fn moments(&self, returns: &ReturnMatrix) -> Result<Moments> {
    let moments = Moments::estimate(returns)?;
    Ok(if self.config.annualize {
      moments.annualized(self.config.periods_per_year)
    } else {
      moments
    })
  }

  /// Run the full pipeline for `request`.
  pub fn optimize(&self, request: &OptimizationRequest) -> Result<OptimizationReport> {
    let returns = self.load_universe(request.universe)?;
    let moments = self.moments(&returns)?;

    let objective = match request.method {
      OptimizerMethod::MinVariance => Objective::MinVariance,
      OptimizerMethod::MaxSharpe => Objective::MaxSharpe,
      OptimizerMethod::MarkowitzTarget => Objective::MarkowitzTarget {
        target_return: request.target_return,
      },
      OptimizerMethod::BlackLitterman => Objective::BlackLitterman {
        views: ViewSpec::from_views(&request.views, moments.assets())?,
        target_return: request.target_return,
      },
    };
    if !request.views.is_empty() && request.method != OptimizerMethod::BlackLitterman {
      warn!(method = %request.method, views = request.views.len(), "views ignored");
    }

    let result = optimize_with_method(&objective, &moments, &self.config.optimizer_config())?;
    let metrics = compute_metrics(
      &returns,
      result.weights.view(),
      self.config.per_period_risk_free(),
      &self.config.market_proxy,
    )?;
    info!(
      universe = %request.universe,
      method = %request.method,
      status = %result.diagnostics.status,
      expected_return = result.expected_return,
      volatility = result.volatility,
      "optimization finished"
    );

    Ok(OptimizationReport {
      universe: request.universe,
      returns,
      moments,
      result,
      metrics,
    })
  }

  /// Metrics of user-supplied percentage weights.
  ///
  /// Weights that do not sum to 100% are normalized with a warning, not
  /// rejected.
  pub fn analyze_weights(
    &self,
    request: &ArbitraryPortfolioRequest,
  ) -> Result<ArbitraryPortfolioReport> {
    let assets = request.universe.asset_index();
    let mut raw: Array1<f64> = Array1::zeros(assets.len());
    for (ticker, pct) in &request.weights_pct {
      raw[assets.require(ticker)?] = pct / 100.0;
    }

    let weight_sum = raw.sum();
    let sums_to_one = abs_diff_eq!(weight_sum, 1.0, epsilon = WEIGHT_SUM_TOLERANCE);
    if !sums_to_one {
      warn!(weight_sum, "weights sum to {weight_sum:.2}, expected 1 (100%)");
    }
    let weights = normalize_weights(raw.view())?;

    let returns = self.load_universe(request.universe)?;
    let risk_free = request
      .risk_free
      .unwrap_or_else(|| self.config.per_period_risk_free());
    let metrics = compute_metrics(&returns, weights.view(), risk_free, &self.config.market_proxy)?;

    Ok(ArbitraryPortfolioReport {
      assets,
      weights,
      weight_sum,
      sums_to_one,
      metrics,
    })
  }
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;
  use chrono::Days;
  use chrono::NaiveDate;
  use rand::Rng;
  use rand::SeedableRng;
  use rand::rngs::StdRng;
  use tracing_test::traced_test;

  use super::*;
  use crate::error::PortfolioError;
  use crate::portfolio::data::PriceSeries;
  use crate::portfolio::source::InMemoryPriceSource;
  use crate::portfolio::types::SolverStatus;

  const DAYS: u64 = 300;

  fn start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2018, 1, 1).unwrap()
  }

  /// One-factor synthetic price panel for every catalogued ETF.
  fn synthetic_source(seed: u64) -> InMemoryPriceSource {
    let mut rng = StdRng::seed_from_u64(seed);
    let tickers = Universe::All.tickers();
    let loadings: Vec<f64> = tickers.iter().map(|_| rng.gen_range(0.5..1.5)).collect();
    let drifts: Vec<f64> = tickers.iter().map(|_| rng.gen_range(-0.0002..0.0008)).collect();
    let mut closes = vec![100.0; tickers.len()];
    let mut records: Vec<Vec<(NaiveDate, Option<f64>)>> = vec![Vec::new(); tickers.len()];

    for day in 0..DAYS {
      let date = start() + Days::new(day);
      let market: f64 = rng.gen_range(-0.01..0.01);
      for (i, close) in closes.iter_mut().enumerate() {
        if day > 0 {
          let noise: f64 = rng.gen_range(-0.008..0.008);
          *close *= 1.0 + drifts[i] + loadings[i] * market + noise;
        }
        records[i].push((date, Some(*close)));
      }
    }

    tickers
      .iter()
      .zip(records)
      .map(|(t, r)| PriceSeries::from_records(*t, r).unwrap())
      .collect()
  }

  fn engine() -> PortfolioEngine<InMemoryPriceSource> {
    PortfolioEngine::new(synthetic_source(42), PortfolioEngineConfig::default())
  }

  #[test]
  fn min_variance_pipeline_matches_historical_metrics() {
    let engine = engine();
    let report = engine
      .optimize(&OptimizationRequest {
        universe: Universe::Regions,
        method: OptimizerMethod::MinVariance,
        ..OptimizationRequest::default()
      })
      .unwrap();

    assert!(report.result.is_converged());
    assert_eq!(report.returns.n_periods(), DAYS as usize - 1);
    assert_abs_diff_eq!(report.result.weights.sum(), 1.0, epsilon = 1e-9);
    // Daily moments and N - 1 metrics describe the same portfolio.
    assert_abs_diff_eq!(report.metrics.mean, report.result.expected_return, epsilon = 1e-12);
    assert_abs_diff_eq!(report.metrics.volatility, report.result.volatility, epsilon = 1e-10);

    let equal = engine
      .analyze_weights(&ArbitraryPortfolioRequest {
        universe: Universe::Regions,
        weights_pct: Universe::Regions
          .tickers()
          .into_iter()
          .map(|t| (t.to_string(), 20.0))
          .collect(),
        risk_free: None,
      })
      .unwrap();
    assert!(report.metrics.volatility <= equal.metrics.volatility + 1e-12);
  }

  #[test]
  fn every_method_runs_on_sectors() {
    let engine = engine();
    for method in [
      OptimizerMethod::MinVariance,
      OptimizerMethod::MaxSharpe,
      OptimizerMethod::MarkowitzTarget,
      OptimizerMethod::BlackLitterman,
    ] {
      let report = engine
        .optimize(&OptimizationRequest {
          universe: Universe::Sectors,
          method,
          ..OptimizationRequest::default()
        })
        .unwrap();

      assert_eq!(report.result.weights.len(), 11);
      assert!(report.result.weights.iter().all(|w| *w >= -1e-12));
      // No SPLG column in the sector universe.
      assert!(report.metrics.beta.is_nan());
    }
  }

  #[test]
  fn black_litterman_request_resolves_views() {
    let engine = engine();
    let request = OptimizationRequest {
      universe: Universe::Regions,
      method: OptimizerMethod::BlackLitterman,
      target_return: None,
      views: vec![
        View::absolute("EEM", 0.002, 0.95),
        View::relative("EWJ", "IEUR", 0.001, 0.3),
      ],
    };
    let report = engine.optimize(&request).unwrap();
    let posterior = report.result.posterior.as_ref().unwrap();
    let eem = report.moments.assets().position("EEM").unwrap();

    assert!(posterior.posterior_mean[eem] > posterior.prior_mean[eem]);
    assert_ne!(report.result.diagnostics.status, SolverStatus::Infeasible);

    let bad = OptimizationRequest {
      views: vec![View::absolute("XLK", 0.002, 0.8)],
      ..request
    };
    assert!(matches!(
      engine.optimize(&bad),
      Err(PortfolioError::InvalidViewSpecification { view: 0, .. })
    ));
  }

  #[test]
  fn annualization_scales_optimizer_inputs_only() {
    let daily = engine();
    let annual = PortfolioEngine::new(
      synthetic_source(42),
      PortfolioEngineConfig {
        annualize: true,
        risk_free: 0.0252,
        ..PortfolioEngineConfig::default()
      },
    );
    let request = OptimizationRequest::default();
    let d = daily.optimize(&request).unwrap();
    let a = annual.optimize(&request).unwrap();

    assert_abs_diff_eq!(a.moments.mean()[0], d.moments.mean()[0] * 252.0, epsilon = 1e-12);
    assert_abs_diff_eq!(annual.config().per_period_risk_free(), 0.0001, epsilon = 1e-15);
    // Scaling Sigma does not move the minimum-variance weights.
    for (x, y) in a.result.weights.iter().zip(d.result.weights.iter()) {
      assert_abs_diff_eq!(*x, *y, epsilon = 1e-8);
    }
    assert_abs_diff_eq!(a.metrics.mean, d.metrics.mean, epsilon = 1e-8);
  }

  #[test]
  fn date_range_truncates_history() {
    let engine = PortfolioEngine::new(
      synthetic_source(7),
      PortfolioEngineConfig {
        date_range: DateRange::new(None, Some(start() + Days::new(99))),
        ..PortfolioEngineConfig::default()
      },
    );
    let returns = engine.load_universe(Universe::Regions).unwrap();
    assert_eq!(returns.n_periods(), 99);
  }

  #[traced_test]
  #[test]
  fn arbitrary_weights_warn_when_not_fully_invested() {
    let engine = engine();
    let weights_pct = BTreeMap::from([
      ("SPLG".to_string(), 40.0),
      ("XLK".to_string(), 30.0),
      ("XLU".to_string(), 20.0),
    ]);
    let report = engine
      .analyze_weights(&ArbitraryPortfolioRequest {
        weights_pct,
        ..ArbitraryPortfolioRequest::default()
      })
      .unwrap();

    assert_eq!(report.assets.len(), 16);
    assert_abs_diff_eq!(report.weight_sum, 0.9, epsilon = 1e-12);
    assert!(!report.sums_to_one);
    assert_abs_diff_eq!(report.weights.sum(), 1.0, epsilon = 1e-12);
    assert_abs_diff_eq!(report.weights[0], 0.4 / 0.9, epsilon = 1e-12);
    assert!(report.metrics.beta.is_finite());
    assert!(logs_contain("weights sum to 0.90"));
  }

  #[test]
  fn arbitrary_weights_reject_unknown_and_zero() {
    let engine = engine();
    let unknown = ArbitraryPortfolioRequest {
      weights_pct: BTreeMap::from([("QQQ".to_string(), 100.0)]),
      ..ArbitraryPortfolioRequest::default()
    };
    assert!(matches!(
      engine.analyze_weights(&unknown),
      Err(PortfolioError::UnknownTicker(t)) if t == "QQQ"
    ));

    let zero = ArbitraryPortfolioRequest::default();
    assert!(matches!(
      engine.analyze_weights(&zero),
      Err(PortfolioError::ZeroWeightSum)
    ));
  }

  #[test]
  fn missing_ticker_aborts_request() {
    let partial: InMemoryPriceSource = Universe::Regions
      .tickers()
      .into_iter()
      .filter(|t| *t != "EWJ")
      .map(|t| {
        PriceSeries::from_records(
          t,
          (0..10).map(|d| (start() + Days::new(d), Some(100.0 + d as f64))),
        )
        .unwrap()
      })
      .collect();
    let engine = PortfolioEngine::new(partial, PortfolioEngineConfig::default());

    assert!(matches!(
      engine.optimize(&OptimizationRequest::default()),
      Err(PortfolioError::DataUnavailable { ticker, .. }) if ticker == "EWJ"
    ));
  }
}
