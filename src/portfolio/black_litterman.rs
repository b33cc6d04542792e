//! # Black-Litterman
//!
//! $$
//! \mu_{BL} = \pi + \tau\Sigma P^\top\left(P\tau\Sigma P^\top + \Omega\right)^{-1}(Q - P\pi)
//! $$
//!
//! Blends the sample-mean prior with investor views into posterior expected
//! returns and covariance.

use std::fmt::Display;

use ndarray::Array1;
use ndarray::Array2;

use super::linalg::from_dmatrix;
use super::linalg::from_dvector;
use super::linalg::to_dmatrix;
use super::linalg::to_dvector;
use super::moments::Moments;
use super::universe::AssetIndex;
use crate::error::PortfolioError;
use crate::error::Result;

/// Default prior scaling.
pub const DEFAULT_TAU: f64 = 0.05;

/// One investor view.
///
/// `confidence` lies in `(0, 1]`; the view's variance is `(1 - confidence)^2`.
#[derive(Clone, PartialEq, Debug)]
pub enum View {
  /// `asset` returns `expected_return`.
  Absolute {
    asset: String,
    expected_return: f64,
    confidence: f64,
  },
  /// `long` outperforms `short` by `spread`.
  Relative {
    long: String,
    short: String,
    spread: f64,
    confidence: f64,
  },
}

impl View {
  pub fn absolute(asset: impl Into<String>, expected_return: f64, confidence: f64) -> Self {
    View::Absolute {
      asset: asset.into(),
      expected_return,
      confidence,
    }
  }

  pub fn relative(
    long: impl Into<String>,
    short: impl Into<String>,
    spread: f64,
    confidence: f64,
  ) -> Self {
    View::Relative {
      long: long.into(),
      short: short.into(),
      spread,
      confidence,
    }
  }

  pub fn confidence(&self) -> f64 {
    match self {
      View::Absolute { confidence, .. } | View::Relative { confidence, .. } => *confidence,
    }
  }

  /// `Omega_ii = (1 - confidence)^2`.
  pub fn uncertainty(&self) -> f64 {
    (1.0 - self.confidence()).powi(2)
  }
}

impl Display for View {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      View::Absolute {
        asset,
        expected_return,
        confidence,
      } => write!(f, "{asset} = {expected_return} @ {confidence}"),
      View::Relative {
        long,
        short,
        spread,
        confidence,
      } => write!(f, "{long} - {short} = {spread} @ {confidence}"),
    }
  }
}

/// Validated view matrices: pick matrix `P` (k x n), targets `Q` (k) and
/// diagonal uncertainty `Omega` (k x k).
#[derive(Clone, Debug)]
pub struct ViewSpec {
  p: Array2<f64>,
  q: Array1<f64>,
  omega: Array2<f64>,
}

impl ViewSpec {
  /// Resolve typed views against the asset index.
  pub fn from_views(views: &[View], assets: &AssetIndex) -> Result<Self> {
    let n = assets.len();
    let k = views.len();
    let mut p = Array2::zeros((k, n));
    let mut q = Array1::zeros(k);
    let mut omega = Array2::zeros((k, k));

    for (i, view) in views.iter().enumerate() {
      let confidence = view.confidence();
      if !(confidence > 0.0 && confidence <= 1.0) {
        return Err(PortfolioError::invalid_view(
          i,
          format!("confidence {confidence} outside (0, 1]"),
        ));
      }
      let column = |ticker: &str| {
        assets
          .position(ticker)
          .ok_or_else(|| PortfolioError::invalid_view(i, format!("unknown ticker {ticker}")))
      };

      match view {
        View::Absolute {
          asset,
          expected_return,
          ..
        } => {
          p[[i, column(asset)?]] = 1.0;
          q[i] = *expected_return;
        }
        View::Relative {
          long, short, spread, ..
        } => {
          let (l, s) = (column(long)?, column(short)?);
          if l == s {
            return Err(PortfolioError::invalid_view(
              i,
              "relative view needs two distinct assets",
            ));
          }
          p[[i, l]] = 1.0;
          p[[i, s]] = -1.0;
          q[i] = *spread;
        }
      }
      omega[[i, i]] = view.uncertainty();
    }

    Self::from_matrices(p, q, omega)
  }

  /// Validate raw view matrices.
  ///
  /// Every row of `P` must be absolute (a single `+1` or `-1`) or relative (a
  /// `+1` and a `-1`); `Omega` must be diagonal with a strictly positive
  /// diagonal.
  pub fn from_matrices(p: Array2<f64>, q: Array1<f64>, omega: Array2<f64>) -> Result<Self> {
    let k = p.nrows();
    if q.len() != k {
      return Err(PortfolioError::shape("view targets Q", k, q.len()));
    }
    if omega.dim() != (k, k) {
      return Err(PortfolioError::shape(
        "view uncertainty Omega",
        format!("{k}x{k}"),
        format!("{}x{}", omega.nrows(), omega.ncols()),
      ));
    }

    for (i, row) in p.outer_iter().enumerate() {
      let nonzero: Vec<f64> = row.iter().copied().filter(|v| *v != 0.0).collect();
      let valid = match nonzero.as_slice() {
        [a] => a.abs() == 1.0,
        [a, b] => (*a == 1.0 && *b == -1.0) || (*a == -1.0 && *b == 1.0),
        _ => false,
      };
      if !valid {
        return Err(PortfolioError::invalid_view(
          i,
          format!(
            "pick row must be a single +/-1 (absolute) or a +1/-1 pair (relative), got {:?}",
            nonzero
          ),
        ));
      }
      if !q[i].is_finite() {
        return Err(PortfolioError::invalid_view(i, "expected return is not finite"));
      }
    }

    for ((i, j), v) in omega.indexed_iter() {
      if i != j && *v != 0.0 {
        return Err(PortfolioError::invalid_view(
          i,
          format!("uncertainty matrix must be diagonal, found {v} at ({i}, {j})"),
        ));
      }
    }
    for i in 0..k {
      let v = omega[[i, i]];
      if !v.is_finite() || v < 0.0 {
        return Err(PortfolioError::invalid_view(
          i,
          format!("uncertainty {v} must be finite and non-negative"),
        ));
      }
      if v == 0.0 {
        return Err(PortfolioError::SingularUncertaintyMatrix { view: i });
      }
    }

    Ok(Self { p, q, omega })
  }

  /// No views over `n` assets.
  pub fn empty(n: usize) -> Self {
    Self {
      p: Array2::zeros((0, n)),
      q: Array1::zeros(0),
      omega: Array2::zeros((0, 0)),
    }
  }

  pub fn len(&self) -> usize {
    self.q.len()
  }

  pub fn is_empty(&self) -> bool {
    self.q.is_empty()
  }

  /// Number of assets the pick matrix spans.
  pub fn n_assets(&self) -> usize {
    self.p.ncols()
  }

  pub fn p(&self) -> &Array2<f64> {
    &self.p
  }

  pub fn q(&self) -> &Array1<f64> {
    &self.q
  }

  pub fn omega(&self) -> &Array2<f64> {
    &self.omega
  }
}

/// Covariance fed to the optimizer after blending.
#[derive(Default, Clone, Copy, PartialEq, Eq, Debug)]
pub enum PosteriorCovariance {
  /// `Sigma + M^{-1}`.
  #[default]
  Posterior,
  /// The sample covariance.
  Prior,
}

/// Blender configuration.
#[derive(Clone, Copy, Debug)]
pub struct BlackLittermanConfig {
  /// Prior uncertainty scaling.
  pub tau: f64,
  pub covariance: PosteriorCovariance,
}

impl Default for BlackLittermanConfig {
  fn default() -> Self {
    Self {
      tau: DEFAULT_TAU,
      covariance: PosteriorCovariance::Posterior,
    }
  }
}

/// Prior and posterior moments of one blend.
#[derive(Clone, Debug)]
pub struct BlackLittermanPosterior {
  pub prior_mean: Array1<f64>,
  pub posterior_mean: Array1<f64>,
  pub posterior_covariance: Array2<f64>,
  pub tau: f64,
}

/// Blend `moments` with `views`.
///
/// The prior `pi` is the sample mean. Only the k x k system
/// `P tau Sigma P' + Omega` is inverted.
pub fn posterior(moments: &Moments, views: &ViewSpec, tau: f64) -> Result<BlackLittermanPosterior> {
  if !(tau > 0.0 && tau.is_finite()) {
    return Err(PortfolioError::InvalidParameter {
      name: "tau",
      reason: format!("{tau} must be positive and finite"),
    });
  }

  let n = moments.len();
  if views.n_assets() != n {
    return Err(PortfolioError::shape("view pick matrix P columns", n, views.n_assets()));
  }

  let pi = to_dvector(moments.mean().view());
  let sigma = to_dmatrix(moments.covariance());
  let tau_sigma = &sigma * tau;

  if views.is_empty() {
    return Ok(BlackLittermanPosterior {
      prior_mean: moments.mean().clone(),
      posterior_mean: moments.mean().clone(),
      posterior_covariance: from_dmatrix(&(&sigma + &tau_sigma)),
      tau,
    });
  }

  let p = to_dmatrix(views.p());
  let q = to_dvector(views.q().view());
  let omega = to_dmatrix(views.omega());

  let ts_pt = &tau_sigma * p.transpose();
  let a = &p * &ts_pt + omega;
  let a_inv = a.try_inverse().ok_or(PortfolioError::SingularMatrix {
    context: "black-litterman view system",
  })?;

  let mean = &pi + &ts_pt * (&a_inv * (q - &p * &pi));
  let m_inv = &tau_sigma - &ts_pt * &a_inv * ts_pt.transpose();
  let mut cov = sigma + m_inv;
  // Re-symmetrize after the subtraction.
  cov = (&cov + cov.transpose()) * 0.5;

  Ok(BlackLittermanPosterior {
    prior_mean: moments.mean().clone(),
    posterior_mean: from_dvector(&mean),
    posterior_covariance: from_dmatrix(&cov),
    tau,
  })
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;
  use ndarray::array;

  use super::*;

  fn prior() -> Moments {
    Moments::from_parts(
      AssetIndex::new(["SPLG", "EWC", "EEM"]),
      array![0.0004, 0.0003, 0.0002],
      array![
        [0.00010, 0.00004, 0.00003],
        [0.00004, 0.00012, 0.00002],
        [0.00003, 0.00002, 0.00020]
      ],
    )
    .unwrap()
  }

  #[test]
  fn no_views_keeps_prior_mean() {
    let m = prior();
    let post = posterior(&m, &ViewSpec::empty(3), DEFAULT_TAU).unwrap();
    assert_eq!(post.posterior_mean, *m.mean());
    assert_abs_diff_eq!(
      post.posterior_covariance[[0, 0]],
      1.05 * m.covariance()[[0, 0]],
      epsilon = 1e-18
    );
  }

  #[test]
  fn confident_views_are_matched() {
    let m = prior();
    let views = [
      View::absolute("EEM", 0.0010, 0.99999),
      View::relative("SPLG", "EWC", 0.0005, 0.99999),
    ];
    let spec = ViewSpec::from_views(&views, m.assets()).unwrap();
    let post = posterior(&m, &spec, DEFAULT_TAU).unwrap();
    let implied = spec.p().dot(&post.posterior_mean);

    assert_abs_diff_eq!(implied[0], 0.0010, epsilon = 1e-6);
    assert_abs_diff_eq!(implied[1], 0.0005, epsilon = 1e-6);
  }

  #[test]
  fn weak_view_barely_moves_prior() {
    let m = prior();
    let spec = ViewSpec::from_views(&[View::absolute("EEM", 0.01, 0.01)], m.assets()).unwrap();
    let post = posterior(&m, &spec, DEFAULT_TAU).unwrap();
    let shift = post.posterior_mean[2] - m.mean()[2];

    assert!(shift > 0.0);
    assert!(shift < 1e-4);
  }

  #[test]
  fn posterior_covariance_is_symmetric_and_inflated() {
    let m = prior();
    let spec = ViewSpec::from_views(&[View::absolute("SPLG", 0.001, 0.5)], m.assets()).unwrap();
    let cov = posterior(&m, &spec, DEFAULT_TAU).unwrap().posterior_covariance;

    for i in 0..3 {
      assert!(cov[[i, i]] >= m.covariance()[[i, i]]);
      for j in 0..3 {
        assert_abs_diff_eq!(cov[[i, j]], cov[[j, i]], epsilon = 1e-20);
      }
    }
  }

  #[test]
  fn full_confidence_is_singular() {
    let m = prior();
    let err = ViewSpec::from_views(
      &[
        View::absolute("SPLG", 0.001, 0.5),
        View::absolute("EWC", 0.001, 1.0),
      ],
      m.assets(),
    )
    .unwrap_err();
    assert!(matches!(err, PortfolioError::SingularUncertaintyMatrix { view: 1 }));
  }

  #[test]
  fn malformed_pick_rows_are_rejected() {
    let bad_pair = ViewSpec::from_matrices(
      array![[1.0, 1.0, 0.0]],
      array![0.01],
      array![[0.1]],
    );
    assert!(matches!(
      bad_pair,
      Err(PortfolioError::InvalidViewSpecification { view: 0, .. })
    ));

    let three = ViewSpec::from_matrices(
      array![[1.0, 0.0, 0.0], [1.0, -1.0, 1.0]],
      array![0.01, 0.0],
      array![[0.1, 0.0], [0.0, 0.1]],
    );
    assert!(matches!(
      three,
      Err(PortfolioError::InvalidViewSpecification { view: 1, .. })
    ));
  }

  #[test]
  fn view_validation_covers_inputs() {
    let assets = prior().assets().clone();

    let unknown = ViewSpec::from_views(&[View::absolute("QQQ", 0.01, 0.5)], &assets);
    assert!(matches!(
      unknown,
      Err(PortfolioError::InvalidViewSpecification { view: 0, .. })
    ));

    let zero = ViewSpec::from_views(&[View::absolute("EWC", 0.01, 0.0)], &assets);
    assert!(matches!(
      zero,
      Err(PortfolioError::InvalidViewSpecification { view: 0, .. })
    ));

    let same = ViewSpec::from_views(&[View::relative("EWC", "EWC", 0.01, 0.5)], &assets);
    assert!(matches!(
      same,
      Err(PortfolioError::InvalidViewSpecification { view: 0, .. })
    ));

    let off_diag = ViewSpec::from_matrices(
      array![[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
      array![0.01, 0.02],
      array![[0.1, 0.01], [0.0, 0.1]],
    );
    assert!(matches!(
      off_diag,
      Err(PortfolioError::InvalidViewSpecification { view: 0, .. })
    ));

    let shape = ViewSpec::from_matrices(array![[1.0, 0.0, 0.0]], array![0.01, 0.02], array![[0.1]]);
    assert!(matches!(shape, Err(PortfolioError::DimensionMismatch { .. })));
  }

  #[test]
  fn negated_absolute_row_matches_positive_row() {
    let m = prior();
    let pos = ViewSpec::from_matrices(array![[0.0, 0.0, 1.0]], array![0.001], array![[1e-5]]).unwrap();
    let neg = ViewSpec::from_matrices(array![[0.0, 0.0, -1.0]], array![-0.001], array![[1e-5]]).unwrap();
    let a = posterior(&m, &pos, DEFAULT_TAU).unwrap();
    let b = posterior(&m, &neg, DEFAULT_TAU).unwrap();

    for i in 0..3 {
      assert_abs_diff_eq!(a.posterior_mean[i], b.posterior_mean[i], epsilon = 1e-15);
      for j in 0..3 {
        assert_abs_diff_eq!(
          a.posterior_covariance[[i, j]],
          b.posterior_covariance[[i, j]],
          epsilon = 1e-18
        );
      }
    }
  }

  #[test]
  fn non_positive_tau_is_an_error() {
    let m = prior();
    for tau in [0.0, -0.05, f64::NAN, f64::INFINITY] {
      assert!(matches!(
        posterior(&m, &ViewSpec::empty(3), tau),
        Err(PortfolioError::InvalidParameter { name: "tau", .. })
      ));
    }
  }

  #[test]
  fn pick_matrix_must_span_universe() {
    let spec = ViewSpec::from_matrices(array![[1.0, 0.0]], array![0.01], array![[0.1]]).unwrap();
    assert!(matches!(
      posterior(&prior(), &spec, DEFAULT_TAU),
      Err(PortfolioError::DimensionMismatch { .. })
    ));
  }
}
