//! # Moments
//!
//! $$
//! \hat\mu_i = \frac{1}{T}\sum_t r_{t,i},\qquad
//! \hat\Sigma_{ij} = \frac{1}{T-1}\sum_t (r_{t,i}-\hat\mu_i)(r_{t,j}-\hat\mu_j)
//! $$
//!
//! Mean vector, sample covariance and correlation of synchronized returns.

use ndarray::Array1;
use ndarray::Array2;
use ndarray::ArrayView1;
use ndarray::Axis;
use ndarray_stats::CorrelationExt;

use super::data::ReturnMatrix;
use super::universe::AssetIndex;
use crate::error::PortfolioError;
use crate::error::Result;

/// Trading days used to annualize daily moments.
pub const TRADING_DAYS: f64 = 252.0;

/// First and second moments of asset returns, in [`AssetIndex`] order.
#[derive(Clone, Debug)]
pub struct Moments {
  assets: AssetIndex,
  mean: Array1<f64>,
  covariance: Array2<f64>,
  correlation: Array2<f64>,
}

impl Moments {
  /// Estimate moments from a synchronized return matrix.
  ///
  /// Covariance uses the `T - 1` normalization.
  pub fn estimate(returns: &ReturnMatrix) -> Result<Self> {
    let t = returns.n_periods();
    if t < 2 {
      return Err(PortfolioError::InsufficientData {
        required: 2,
        got: t,
      });
    }

    let data = returns.returns();
    let mean = data
      .mean_axis(Axis(0))
      .ok_or(PortfolioError::InsufficientData {
        required: 2,
        got: 0,
      })?;
    // Rows of the transposed view are variables, columns observations.
    let covariance = data
      .t()
      .cov(1.0)
      .map_err(|_| PortfolioError::InsufficientData {
        required: 2,
        got: 0,
      })?;

    Self::from_parts(returns.assets().clone(), mean, covariance)
  }

  /// Assemble moments from a supplied mean vector and covariance matrix.
  pub fn from_parts(
    assets: AssetIndex,
    mean: Array1<f64>,
    covariance: Array2<f64>,
  ) -> Result<Self> {
    let n = assets.len();
    if mean.len() != n {
      return Err(PortfolioError::shape("mean vector", n, mean.len()));
    }
    if covariance.dim() != (n, n) {
      return Err(PortfolioError::shape(
        "covariance matrix",
        format!("{n}x{n}"),
        format!("{}x{}", covariance.nrows(), covariance.ncols()),
      ));
    }

    let correlation = corr_from_cov(&covariance);
    Ok(Self {
      assets,
      mean,
      covariance,
      correlation,
    })
  }

  /// Scale mean and covariance by `periods_per_year`. Correlation is unchanged.
  pub fn annualized(&self, periods_per_year: f64) -> Self {
    Self {
      assets: self.assets.clone(),
      mean: &self.mean * periods_per_year,
      covariance: &self.covariance * periods_per_year,
      correlation: self.correlation.clone(),
    }
  }

  pub fn assets(&self) -> &AssetIndex {
    &self.assets
  }

  pub fn len(&self) -> usize {
    self.mean.len()
  }

  pub fn is_empty(&self) -> bool {
    self.mean.is_empty()
  }

  /// Expected return per asset.
  pub fn mean(&self) -> &Array1<f64> {
    &self.mean
  }

  pub fn covariance(&self) -> &Array2<f64> {
    &self.covariance
  }

  pub fn correlation(&self) -> &Array2<f64> {
    &self.correlation
  }

  /// Standard deviation per asset.
  pub fn volatilities(&self) -> Array1<f64> {
    self.covariance.diag().mapv(|v| v.max(0.0).sqrt())
  }

  /// `w' mu`.
  pub fn portfolio_return(&self, weights: ArrayView1<'_, f64>) -> f64 {
    weights.dot(&self.mean)
  }

  /// `w' Sigma w`.
  pub fn portfolio_variance(&self, weights: ArrayView1<'_, f64>) -> f64 {
    weights.dot(&self.covariance.dot(&weights))
  }
}

/// Normalize a covariance matrix into a correlation matrix.
///
/// The diagonal is 1; pairs involving a zero-variance asset are `NaN`.
pub(crate) fn corr_from_cov(cov: &Array2<f64>) -> Array2<f64> {
  let n = cov.nrows();
  let sd: Vec<f64> = (0..n).map(|i| cov[[i, i]].max(0.0).sqrt()).collect();

  Array2::from_shape_fn((n, n), |(i, j)| {
    if i == j {
      return 1.0;
    }
    let denom = sd[i] * sd[j];
    if denom > 0.0 {
      (cov[[i, j]] / denom).clamp(-1.0, 1.0)
    } else {
      f64::NAN
    }
  })
}

#[cfg(test)]
mod tests {
  use chrono::NaiveDate;
  use ndarray::array;

  use super::*;

  fn matrix(rows: Array2<f64>, tickers: &[&str]) -> ReturnMatrix {
    let start = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
    let dates = (0..rows.nrows())
      .map(|i| start + chrono::Days::new(i as u64))
      .collect();
    ReturnMatrix::new(AssetIndex::new(tickers.iter().copied()), dates, rows).unwrap()
  }

  #[test]
  fn sample_covariance_uses_n_minus_one() {
    let m = matrix(
      array![[0.01, 0.00], [-0.02, 0.01], [0.03, -0.01], [0.00, 0.02]],
      &["A", "B"],
    );
    let moments = Moments::estimate(&m).unwrap();

    assert!((moments.mean()[0] - 0.005).abs() < 1e-15);
    assert!((moments.mean()[1] - 0.005).abs() < 1e-15);

    // var(A) = (0.005^2 + 0.025^2 + 0.025^2 + 0.005^2) / 3
    let var_a = (2.0 * 0.005_f64.powi(2) + 2.0 * 0.025_f64.powi(2)) / 3.0;
    assert!((moments.covariance()[[0, 0]] - var_a).abs() < 1e-15);
    assert!((moments.covariance()[[0, 1]] - moments.covariance()[[1, 0]]).abs() < 1e-18);
  }

  #[test]
  fn correlation_has_unit_diagonal_and_is_symmetric() {
    let m = matrix(
      array![
        [0.010, 0.004, -0.002],
        [-0.004, 0.001, 0.006],
        [0.007, 0.003, -0.001],
        [0.002, -0.005, 0.004],
        [-0.006, 0.002, 0.001]
      ],
      &["SPLG", "EWC", "EEM"],
    );
    let corr = Moments::estimate(&m).unwrap().correlation().clone();

    for i in 0..3 {
      assert_eq!(corr[[i, i]], 1.0);
      for j in 0..3 {
        assert!((corr[[i, j]] - corr[[j, i]]).abs() < 1e-15);
        assert!(corr[[i, j]].abs() <= 1.0);
      }
    }
  }

  #[test]
  fn zero_variance_asset_has_undefined_correlation() {
    let corr = corr_from_cov(&array![[0.04, 0.0], [0.0, 0.0]]);
    assert_eq!(corr[[1, 1]], 1.0);
    assert!(corr[[0, 1]].is_nan());
  }

  #[test]
  fn annualization_scales_mean_and_covariance() {
    let m = matrix(array![[0.01, 0.02], [0.03, -0.01], [0.0, 0.01]], &["A", "B"]);
    let daily = Moments::estimate(&m).unwrap();
    let annual = daily.annualized(TRADING_DAYS);

    assert!((annual.mean()[1] - daily.mean()[1] * 252.0).abs() < 1e-12);
    assert!((annual.covariance()[[0, 1]] - daily.covariance()[[0, 1]] * 252.0).abs() < 1e-12);
    assert_eq!(annual.correlation(), daily.correlation());
  }

  #[test]
  fn single_row_is_insufficient() {
    let m = matrix(array![[0.01, 0.02]], &["A", "B"]);
    assert!(matches!(
      Moments::estimate(&m),
      Err(PortfolioError::InsufficientData { required: 2, got: 1 })
    ));
  }

  #[test]
  fn from_parts_validates_shapes() {
    let err = Moments::from_parts(
      AssetIndex::new(["A", "B"]),
      array![0.1, 0.2, 0.3],
      Array2::eye(2),
    )
    .unwrap_err();
    assert!(matches!(err, PortfolioError::DimensionMismatch { .. }));
  }
}
