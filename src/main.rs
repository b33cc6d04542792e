use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::ensure;
use chrono::NaiveDate;
use clap::Parser;
use clap::Subcommand;
use etf_portfolio::portfolio::ArbitraryPortfolioRequest;
use etf_portfolio::portfolio::BlackLittermanConfig;
use etf_portfolio::portfolio::CachedPriceSource;
use etf_portfolio::portfolio::CsvPriceSource;
use etf_portfolio::portfolio::DateRange;
use etf_portfolio::portfolio::OptimizationReport;
use etf_portfolio::portfolio::OptimizationRequest;
use etf_portfolio::portfolio::OptimizerMethod;
use etf_portfolio::portfolio::PortfolioEngine;
use etf_portfolio::portfolio::PortfolioEngineConfig;
use etf_portfolio::portfolio::PortfolioMetrics;
use etf_portfolio::portfolio::PosteriorCovariance;
use etf_portfolio::portfolio::SolverConfig;
use etf_portfolio::portfolio::Universe;
use etf_portfolio::portfolio::View;
use etf_portfolio::portfolio::format_metric;
use prettytable::Table;
use prettytable::row;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

type Engine = PortfolioEngine<CachedPriceSource<CsvPriceSource>>;

#[derive(Parser)]
#[command(name = "etf-portfolio")]
#[command(about = "Portfolio construction over regional and sector ETF universes")]
struct Cli {
  #[command(subcommand)]
  command: Command,

  /// Directory with one `<TICKER>.csv` file per ETF.
  #[arg(long, global = true, default_value = "MarketData")]
  data_dir: PathBuf,

  /// `regiones`, `sectores` or `todos`.
  #[arg(long, global = true)]
  universe: Option<Universe>,

  /// Risk-free rate (annual with `--annualize`, per period otherwise).
  #[arg(long, global = true, default_value_t = 0.0)]
  rf: f64,

  /// Allow negative weights.
  #[arg(long, global = true)]
  short: bool,

  /// Optimize annualized moments.
  #[arg(long, global = true)]
  annualize: bool,

  #[arg(long, global = true, default_value_t = 252.0)]
  periods_per_year: f64,

  /// First day of price history (YYYY-MM-DD).
  #[arg(long, global = true)]
  start: Option<NaiveDate>,

  /// Last day of price history (YYYY-MM-DD).
  #[arg(long, global = true)]
  end: Option<NaiveDate>,

  /// Column used for beta.
  #[arg(long, global = true, default_value = "SPLG")]
  market_proxy: String,

  #[arg(long, global = true, default_value_t = 500)]
  max_iters: usize,
}

#[derive(Subcommand)]
enum Command {
  /// Print mean, volatility and correlations of a universe.
  Moments,
  /// Optimize weights with one of the mean-variance methods.
  Optimize {
    /// `min-variance`, `max-sharpe`, `markowitz` or `black-litterman`.
    #[arg(long, default_value = "min-variance")]
    method: OptimizerMethod,
    /// Target return; mean of the expected returns when omitted.
    #[arg(long)]
    target: Option<f64>,
  },
  /// Markowitz target solve on Black-Litterman posterior returns.
  BlackLitterman {
    /// `TICKER=RET@CONF` or `LONG-SHORT=SPREAD@CONF`, confidence in (0, 1].
    #[arg(long = "view", value_parser = parse_view)]
    views: Vec<View>,
    #[arg(long)]
    target: Option<f64>,
    #[arg(long, default_value_t = 0.05)]
    tau: f64,
    /// Optimize with the sample covariance instead of the posterior one.
    #[arg(long)]
    prior_covariance: bool,
  },
  /// Metrics of a user-weighted portfolio.
  Arbitrary {
    /// `TICKER=PCT`, e.g. `SPLG=60 XLK=40`.
    #[arg(value_parser = parse_weight, required = true)]
    weights: Vec<(String, f64)>,
  },
}

fn parse_view(s: &str) -> Result<View, String> {
  let (assets, rest) = s
    .split_once('=')
    .ok_or_else(|| format!("expected TICKER=RET@CONF, got {s}"))?;
  let (value, confidence) = rest
    .split_once('@')
    .ok_or_else(|| format!("missing @CONF in {s}"))?;
  let value: f64 = value
    .trim()
    .parse()
    .map_err(|e| format!("bad view value in {s}: {e}"))?;
  let confidence: f64 = confidence
    .trim()
    .parse()
    .map_err(|e| format!("bad confidence in {s}: {e}"))?;

  Ok(match assets.split_once('-') {
    Some((long, short)) => View::relative(long.trim(), short.trim(), value, confidence),
    None => View::absolute(assets.trim(), value, confidence),
  })
}

fn parse_weight(s: &str) -> Result<(String, f64), String> {
  let (ticker, pct) = s
    .split_once('=')
    .ok_or_else(|| format!("expected TICKER=PCT, got {s}"))?;
  let pct: f64 = pct
    .trim()
    .parse()
    .map_err(|e| format!("bad weight in {s}: {e}"))?;
  Ok((ticker.trim().to_uppercase(), pct))
}

fn print_metrics(metrics: &PortfolioMetrics) {
  let mut table = Table::new();
  table.set_titles(row!["Metric", "Value"]);
  for (key, value) in metrics.entries() {
    table.add_row(row![key.label(), format_metric(value)]);
  }
  table.printstd();
}

fn print_report(report: &OptimizationReport) {
  let result = &report.result;
  let mut weights = Table::new();
  weights.set_titles(row!["Ticker", "Weight"]);
  for (ticker, weight) in result.allocations() {
    weights.add_row(row![ticker, format!("{:.4}", weight)]);
  }
  weights.printstd();

  let mut summary = Table::new();
  summary.add_row(row!["Expected return", format_metric(result.expected_return)]);
  summary.add_row(row!["Volatility", format_metric(result.volatility)]);
  summary.add_row(row!["Sharpe", format_metric(result.sharpe)]);
  summary.add_row(row!["Solver status", result.diagnostics.status]);
  summary.add_row(row!["Iterations", result.diagnostics.iterations]);
  summary.printstd();

  if !result.is_converged() {
    eprintln!(
      "warning: solver stopped with status '{}'; weights are best-effort",
      result.diagnostics.status
    );
  }

  println!("Historical metrics");
  print_metrics(&report.metrics);
}

fn moments(engine: &Engine, universe: Universe) -> anyhow::Result<()> {
  let returns = engine.load_universe(universe)?;
  let moments = engine.moments(&returns)?;
  println!(
    "{universe}: {} assets, {} synchronized periods",
    returns.n_assets(),
    returns.n_periods()
  );

  let mut table = Table::new();
  table.set_titles(row!["Ticker", "Mean", "Volatility"]);
  let vols = moments.volatilities();
  for (i, ticker) in moments.assets().tickers().iter().enumerate() {
    table.add_row(row![
      ticker,
      format_metric(moments.mean()[i]),
      format_metric(vols[i])
    ]);
  }
  table.printstd();

  let mut corr = Table::new();
  let tickers = moments.assets().tickers();
  let mut header = vec![String::new()];
  header.extend(tickers.iter().cloned());
  corr.set_titles(header.into_iter().collect());
  for (i, ticker) in tickers.iter().enumerate() {
    let mut cells = vec![ticker.clone()];
    cells.extend(
      moments
        .correlation()
        .row(i)
        .iter()
        .map(|c| if c.is_nan() { "N/A".to_string() } else { format!("{c:.3}") }),
    );
    corr.add_row(cells.into_iter().collect());
  }
  corr.printstd();
  Ok(())
}

fn main() -> anyhow::Result<()> {
  tracing_subscriber::registry()
    .with(tracing_subscriber::fmt::layer())
    .with(tracing_subscriber::EnvFilter::from_default_env())
    .init();

  let cli = Cli::parse();
  ensure!(
    cli.periods_per_year > 0.0,
    "--periods-per-year must be positive"
  );

  let mut config = PortfolioEngineConfig {
    risk_free: cli.rf,
    allow_short: cli.short,
    annualize: cli.annualize,
    periods_per_year: cli.periods_per_year,
    market_proxy: cli.market_proxy.clone(),
    date_range: DateRange::new(cli.start, cli.end),
    solver: SolverConfig {
      max_iters: cli.max_iters,
      ..SolverConfig::default()
    },
    ..PortfolioEngineConfig::default()
  };

  if let Command::BlackLitterman {
    tau,
    prior_covariance,
    ..
  } = &cli.command
  {
    ensure!(*tau > 0.0 && tau.is_finite(), "--tau must be positive");
    config.black_litterman = BlackLittermanConfig {
      tau: *tau,
      covariance: if *prior_covariance {
        PosteriorCovariance::Prior
      } else {
        PosteriorCovariance::Posterior
      },
    };
  }

  let source = CachedPriceSource::new(CsvPriceSource::new(cli.data_dir.clone()));
  let engine: Engine = PortfolioEngine::new(source, config);

  match cli.command {
    Command::Moments => {
      moments(&engine, cli.universe.unwrap_or_default())?;
    }
    Command::Optimize { method, target } => {
      let report = engine
        .optimize(&OptimizationRequest {
          universe: cli.universe.unwrap_or_default(),
          method,
          target_return: target,
          views: Vec::new(),
        })
        .with_context(|| format!("{method} optimization failed"))?;
      print_report(&report);
    }
    Command::BlackLitterman { views, target, .. } => {
      let report = engine
        .optimize(&OptimizationRequest {
          universe: cli.universe.unwrap_or_default(),
          method: OptimizerMethod::BlackLitterman,
          target_return: target,
          views,
        })
        .context("black-litterman optimization failed")?;
      if let Some(posterior) = &report.result.posterior {
        let mut table = Table::new();
        table.set_titles(row!["Ticker", "Prior mean", "Posterior mean"]);
        for (i, ticker) in report.moments.assets().tickers().iter().enumerate() {
          table.add_row(row![
            ticker,
            format_metric(posterior.prior_mean[i]),
            format_metric(posterior.posterior_mean[i])
          ]);
        }
        table.printstd();
      }
      print_report(&report);
    }
    Command::Arbitrary { weights } => {
      let weights_pct: BTreeMap<String, f64> = weights.into_iter().collect();
      let report = engine.analyze_weights(&ArbitraryPortfolioRequest {
        universe: cli.universe.unwrap_or(Universe::All),
        weights_pct,
        risk_free: None,
      })?;

      if !report.sums_to_one {
        eprintln!(
          "warning: weights sum to {:.2}; they were rescaled to 100%",
          report.weight_sum
        );
      }
      let mut table = Table::new();
      table.set_titles(row!["Ticker", "Weight"]);
      for (ticker, weight) in report.assets.tickers().iter().zip(report.weights.iter()) {
        if *weight != 0.0 {
          table.add_row(row![ticker, format!("{:.4}", weight)]);
        }
      }
      table.printstd();
      print_metrics(&report.metrics);
    }
  }

  Ok(())
}
