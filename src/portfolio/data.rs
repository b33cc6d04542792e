//! # Portfolio Data Utilities
//!
//! $$
//! r_t = \frac{P_t}{P_{t-1}} - 1
//! $$
//!
//! Price cleaning, simple returns and date synchronization across assets.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt::Display;

use chrono::NaiveDate;
use ndarray::Array2;
use ndarray::ArrayView1;
use ndarray::Axis;
use tracing::debug;
use tracing::info;

use super::source::PriceSource;
use super::universe::AssetIndex;
use crate::error::PortfolioError;
use crate::error::Result;

/// Inclusive date window applied to price history.
#[derive(Default, Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct DateRange {
  /// First date kept, if bounded.
  pub start: Option<NaiveDate>,
  /// Last date kept, if bounded.
  pub end: Option<NaiveDate>,
}

impl DateRange {
  pub fn new(start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
    Self { start, end }
  }

  pub fn contains(&self, date: NaiveDate) -> bool {
    self.start.map_or(true, |s| date >= s) && self.end.map_or(true, |e| date <= e)
  }
}

impl Display for DateRange {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let start = self.start.map(|d| d.to_string()).unwrap_or_else(|| "..".into());
    let end = self.end.map(|d| d.to_string()).unwrap_or_else(|| "..".into());
    write!(f, "[{start}, {end}]")
  }
}

/// One closing price observation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PricePoint {
  pub date: NaiveDate,
  pub close: f64,
}

/// Cleaned closing prices for one asset, strictly increasing in date.
#[derive(Clone, Debug, PartialEq)]
pub struct PriceSeries {
  ticker: String,
  points: Vec<PricePoint>,
}

impl PriceSeries {
  /// Build a series from raw `(date, close)` records.
  ///
  /// Records whose close is missing, non-finite or non-positive are dropped,
  /// the rest are sorted by date and repeated dates keep their first record.
  /// Fails with [`PortfolioError::DataUnavailable`] when nothing survives.
  pub fn from_records<I>(ticker: impl Into<String>, records: I) -> Result<Self>
  where
    I: IntoIterator<Item = (NaiveDate, Option<f64>)>,
  {
    let ticker = ticker.into();
    let mut points: Vec<PricePoint> = records
      .into_iter()
      .filter_map(|(date, close)| match close {
        Some(c) if c.is_finite() && c > 0.0 => Some(PricePoint { date, close: c }),
        _ => None,
      })
      .collect();

    points.sort_by_key(|p| p.date);
    points.dedup_by_key(|p| p.date);

    if points.is_empty() {
      return Err(PortfolioError::DataUnavailable {
        ticker,
        reason: "no usable closing prices".into(),
      });
    }

    Ok(Self { ticker, points })
  }

  pub fn ticker(&self) -> &str {
    &self.ticker
  }

  pub fn points(&self) -> &[PricePoint] {
    &self.points
  }

  pub fn len(&self) -> usize {
    self.points.len()
  }

  pub fn is_empty(&self) -> bool {
    self.points.is_empty()
  }

  /// Restrict the series to `range`.
  pub fn within(&self, range: &DateRange) -> Result<Self> {
    let points: Vec<PricePoint> = self
      .points
      .iter()
      .filter(|p| range.contains(p.date))
      .copied()
      .collect();

    if points.is_empty() {
      return Err(PortfolioError::DataUnavailable {
        ticker: self.ticker.clone(),
        reason: format!("no prices within {range}"),
      });
    }

    Ok(Self {
      ticker: self.ticker.clone(),
      points,
    })
  }

  /// Simple (pct-change) returns; the first observation has no prior price
  /// and is dropped.
  pub fn simple_returns(&self) -> ReturnSeries {
    let (dates, returns): (Vec<NaiveDate>, Vec<f64>) = self
      .points
      .windows(2)
      .map(|w| (w[1].date, w[1].close / w[0].close - 1.0))
      .unzip();

    ReturnSeries {
      ticker: self.ticker.clone(),
      dates,
      returns,
    }
  }
}

/// Dated simple returns for one asset.
#[derive(Clone, Debug, PartialEq)]
pub struct ReturnSeries {
  ticker: String,
  dates: Vec<NaiveDate>,
  returns: Vec<f64>,
}

impl ReturnSeries {
  pub fn ticker(&self) -> &str {
    &self.ticker
  }

  pub fn dates(&self) -> &[NaiveDate] {
    &self.dates
  }

  pub fn returns(&self) -> &[f64] {
    &self.returns
  }

  pub fn len(&self) -> usize {
    self.returns.len()
  }

  pub fn is_empty(&self) -> bool {
    self.returns.is_empty()
  }
}

/// Returns of several assets on their common dates.
///
/// Rows are dates (ascending), columns follow the [`AssetIndex`].
#[derive(Clone, Debug)]
pub struct ReturnMatrix {
  assets: AssetIndex,
  dates: Vec<NaiveDate>,
  returns: Array2<f64>,
}

impl ReturnMatrix {
  /// Wrap an already aligned `T x n` array.
  pub fn new(assets: AssetIndex, dates: Vec<NaiveDate>, returns: Array2<f64>) -> Result<Self> {
    if returns.ncols() != assets.len() {
      return Err(PortfolioError::shape(
        "return matrix columns",
        assets.len(),
        returns.ncols(),
      ));
    }
    if returns.nrows() != dates.len() {
      return Err(PortfolioError::shape(
        "return matrix rows",
        dates.len(),
        returns.nrows(),
      ));
    }

    Ok(Self {
      assets,
      dates,
      returns,
    })
  }

  /// Inner-join return series on date. Only dates present for every asset
  /// survive, so one short history shrinks the whole sample.
  pub fn synchronize(series: &[ReturnSeries]) -> Result<Self> {
    let Some((first, rest)) = series.split_first() else {
      return Err(PortfolioError::InsufficientData {
        required: 1,
        got: 0,
      });
    };

    let assets = AssetIndex::new(series.iter().map(|s| s.ticker.clone()));
    if assets.len() != series.len() {
      return Err(PortfolioError::shape(
        "synchronized tickers (duplicates)",
        series.len(),
        assets.len(),
      ));
    }

    let mut joined: BTreeMap<NaiveDate, Vec<f64>> = first
      .dates
      .iter()
      .zip(first.returns.iter())
      .map(|(d, r)| (*d, vec![*r]))
      .collect();

    for s in rest {
      let lookup: HashMap<NaiveDate, f64> = s
        .dates
        .iter()
        .copied()
        .zip(s.returns.iter().copied())
        .collect();
      joined.retain(|date, row| match lookup.get(date) {
        Some(r) => {
          row.push(*r);
          true
        }
        None => false,
      });
    }

    let n = assets.len();
    let t = joined.len();
    let mut dates = Vec::with_capacity(t);
    let mut flat = Vec::with_capacity(t * n);
    for (date, row) in joined {
      dates.push(date);
      flat.extend(row);
    }

    let returns = Array2::from_shape_vec((t, n), flat)
      .map_err(|e| PortfolioError::shape("synchronized returns", format!("{t}x{n}"), e))?;

    Ok(Self {
      assets,
      dates,
      returns,
    })
  }

  pub fn assets(&self) -> &AssetIndex {
    &self.assets
  }

  pub fn dates(&self) -> &[NaiveDate] {
    &self.dates
  }

  /// `T x n` array of per-period returns.
  pub fn returns(&self) -> &Array2<f64> {
    &self.returns
  }

  pub fn n_periods(&self) -> usize {
    self.returns.nrows()
  }

  pub fn n_assets(&self) -> usize {
    self.returns.ncols()
  }

  /// Return column of `ticker`, if the asset is present.
  pub fn column(&self, ticker: &str) -> Option<ArrayView1<'_, f64>> {
    self
      .assets
      .position(ticker)
      .map(|j| self.returns.index_axis(Axis(1), j))
  }
}

/// Load every ticker through `source`, convert to returns and synchronize.
///
/// Any ticker without data aborts the whole load.
pub fn load_return_matrix<S, T>(
  source: &S,
  tickers: &[T],
  range: &DateRange,
) -> Result<ReturnMatrix>
where
  S: PriceSource + ?Sized,
  T: AsRef<str>,
{
  let mut series = Vec::with_capacity(tickers.len());
  for ticker in tickers {
    let prices = source.load(ticker.as_ref(), range)?;
    let returns = prices.simple_returns();
    debug!(
      ticker = ticker.as_ref(),
      prices = prices.len(),
      returns = returns.len(),
      "loaded price history"
    );
    series.push(returns);
  }

  let matrix = ReturnMatrix::synchronize(&series)?;
  info!(
    assets = matrix.n_assets(),
    periods = matrix.n_periods(),
    "synchronized return matrix"
  );
  Ok(matrix)
}
