//! # Portfolio
//!
//! $$
//! \sigma_p^2 = \mathbf{w}^\top \Sigma \mathbf{w}
//! $$
//!
//! ETF portfolio construction: returns, moments, constrained optimization,
//! Black-Litterman views and portfolio metrics.

pub mod black_litterman;
pub mod data;
pub mod engine;
pub(crate) mod linalg;
pub mod metrics;
pub mod moments;
pub mod optimizers;
pub mod solver;
pub mod source;
pub mod types;
pub mod universe;

pub use black_litterman::BlackLittermanConfig;
pub use black_litterman::BlackLittermanPosterior;
pub use black_litterman::PosteriorCovariance;
pub use black_litterman::View;
pub use black_litterman::ViewSpec;
pub use black_litterman::posterior;
pub use data::DateRange;
pub use data::PriceSeries;
pub use data::ReturnMatrix;
pub use data::ReturnSeries;
pub use data::load_return_matrix;
pub use engine::ArbitraryPortfolioReport;
pub use engine::ArbitraryPortfolioRequest;
pub use engine::OptimizationReport;
pub use engine::OptimizationRequest;
pub use engine::PortfolioEngine;
pub use engine::PortfolioEngineConfig;
pub use metrics::MetricKey;
pub use metrics::PortfolioMetrics;
pub use metrics::compute_metrics;
pub use metrics::format_metric;
pub use moments::Moments;
pub use optimizers::OptimizerConfig;
pub use optimizers::optimize_black_litterman;
pub use optimizers::optimize_markowitz;
pub use optimizers::optimize_max_sharpe;
pub use optimizers::optimize_min_variance;
pub use optimizers::optimize_with_method;
pub use source::CachedPriceSource;
pub use source::CsvPriceSource;
pub use source::InMemoryPriceSource;
pub use source::PriceSource;
pub use types::Objective;
pub use types::OptimizerMethod;
pub use types::PortfolioResult;
pub use types::SolverConfig;
pub use types::SolverDiagnostics;
pub use types::SolverStatus;
pub use universe::AssetIndex;
pub use universe::Universe;
