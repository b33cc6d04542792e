//! Conversions between the `ndarray` containers used in the public API and
//! the `nalgebra` ones used for linear solves.

use nalgebra::DMatrix;
use nalgebra::DVector;
use ndarray::Array1;
use ndarray::Array2;
use ndarray::ArrayView1;

pub(crate) fn to_dmatrix(a: &Array2<f64>) -> DMatrix<f64> {
  DMatrix::from_fn(a.nrows(), a.ncols(), |i, j| a[[i, j]])
}

pub(crate) fn to_dvector(v: ArrayView1<'_, f64>) -> DVector<f64> {
  DVector::from_iterator(v.len(), v.iter().copied())
}

pub(crate) fn from_dmatrix(m: &DMatrix<f64>) -> Array2<f64> {
  Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| m[(i, j)])
}

pub(crate) fn from_dvector(v: &DVector<f64>) -> Array1<f64> {
  v.iter().copied().collect()
}

/// Solve `a x = b`, falling back to the pseudo-inverse when `a` is singular
/// or the LU solution does not reproduce `b`.
pub(crate) fn solve_or_lstsq(a: DMatrix<f64>, b: &DVector<f64>) -> Option<DVector<f64>> {
  if let Some(x) = a.clone().lu().solve(b) {
    let residual = (&a * &x - b).amax();
    if x.iter().all(|v| v.is_finite()) && residual <= 1e-9 * (1.0 + b.amax()) {
      return Some(x);
    }
  }
  a.pseudo_inverse(1e-14).ok().map(|pinv| pinv * b)
}

#[cfg(test)]
mod tests {
  use ndarray::array;

  use super::*;

  #[test]
  fn conversions_preserve_layout() {
    let a = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
    let m = to_dmatrix(&a);
    assert_eq!(m[(1, 2)], 6.0);
    assert_eq!(from_dmatrix(&m), a);

    let v = array![1.0, -1.0];
    assert_eq!(from_dvector(&to_dvector(v.view())), v);
  }

  #[test]
  fn singular_system_falls_back_to_least_squares() {
    let a = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
    let b = DVector::from_vec(vec![2.0, 2.0]);
    let x = solve_or_lstsq(a, &b).unwrap();
    assert!((x[0] - 1.0).abs() < 1e-10);
    assert!((x[1] - 1.0).abs() < 1e-10);
  }
}
