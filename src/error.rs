//! # Errors
//!
//! $$
//! \text{fault} \in \{\text{data}, \text{shape}, \text{views}, \text{solver}, \text{weights}\}
//! $$
//!
//! Error taxonomy shared by every stage of the portfolio pipeline. Undefined
//! but legitimate metric values (e.g. a Sharpe ratio over zero volatility) are
//! not errors; they surface as `NaN`.

use thiserror::Error;

use crate::portfolio::types::SolverStatus;

/// Portfolio pipeline errors.
#[derive(Debug, Error)]
pub enum PortfolioError {
  /// No usable price history for a ticker the request requires.
  #[error("price data unavailable for {ticker}: {reason}")]
  DataUnavailable { ticker: String, reason: String },

  /// Inconsistent vector/matrix shapes.
  #[error("dimension mismatch in {context}: expected {expected}, got {got}")]
  DimensionMismatch {
    context: &'static str,
    expected: String,
    got: String,
  },

  /// Too few synchronized observations to estimate moments.
  #[error("insufficient data: required {required} observations, got {got}")]
  InsufficientData { required: usize, got: usize },

  /// A view's uncertainty is zero, so Omega cannot be inverted.
  #[error("uncertainty matrix is singular at view {view} (confidence of 100% leaves zero variance)")]
  SingularUncertaintyMatrix { view: usize },

  /// A malformed Black-Litterman view.
  #[error("invalid view {view}: {reason}")]
  InvalidViewSpecification { view: usize, reason: String },

  /// A linear system in the posterior computation could not be solved.
  #[error("singular matrix in {context}")]
  SingularMatrix { context: &'static str },

  /// A configuration value outside its valid domain.
  #[error("invalid parameter {name}: {reason}")]
  InvalidParameter { name: &'static str, reason: String },

  /// The optimizer stopped without satisfying its tolerance.
  #[error("solver did not converge after {iterations} iterations ({status})")]
  SolverNonConvergence {
    status: SolverStatus,
    iterations: usize,
  },

  /// An objective or gradient callback failed during a solve.
  #[error("objective evaluation failed: {0}")]
  ObjectiveEvaluation(String),

  /// Weights cannot be normalized because they sum to zero.
  #[error("portfolio weights sum to zero")]
  ZeroWeightSum,

  /// A ticker that is not part of the selected universe.
  #[error("unknown ticker: {0}")]
  UnknownTicker(String),

  /// A universe name that is not in the catalog.
  #[error("unknown universe: {0}")]
  UnknownUniverse(String),
}

/// Result alias for portfolio operations.
pub type Result<T> = std::result::Result<T, PortfolioError>;

impl PortfolioError {
  pub(crate) fn shape(context: &'static str, expected: impl ToString, got: impl ToString) -> Self {
    Self::DimensionMismatch {
      context,
      expected: expected.to_string(),
      got: got.to_string(),
    }
  }

  pub(crate) fn invalid_view(view: usize, reason: impl Into<String>) -> Self {
    Self::InvalidViewSpecification {
      view,
      reason: reason.into(),
    }
  }
}
