//! # ETF Portfolio
//!
//! $$
//! \mathbf{w}^\* = \arg\min_{\mathbf{w}\in\Delta}\ \mathbf{w}^\top\Sigma\mathbf{w}
//! \quad\text{or}\quad \arg\max_{\mathbf{w}\in\Delta}\ \frac{\mathbf{w}^\top\mu - r_f}{\sqrt{\mathbf{w}^\top\Sigma\mathbf{w}}}
//! $$
//!
//! Portfolio construction over regional and sector ETF universes from daily
//! closing prices.

pub mod error;
pub mod portfolio;

pub use error::PortfolioError;
pub use error::Result;
