//! # Price Sources
//!
//! $$
//! \text{ticker} \mapsto \{(t_i, P_{t_i})\}_{i}
//! $$
//!
//! Where closing prices come from. The core only needs a table keyed by
//! ticker; flat files and caller-supplied tables are provided here.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;

use chrono::NaiveDate;
use impl_new_derive::ImplNew;
use tracing::debug;

use super::data::DateRange;
use super::data::PriceSeries;
use crate::error::PortfolioError;
use crate::error::Result;

/// Source of cleaned closing prices for a ticker.
pub trait PriceSource {
  /// Load the price history of `ticker` restricted to `range`.
  fn load(&self, ticker: &str, range: &DateRange) -> Result<PriceSeries>;
}

/// Reads `<data_dir>/<TICKER>.csv` files with `Date` and `Close` columns.
///
/// Rows whose date does not parse (extra header lines written by some
/// downloaders) are skipped, as are rows whose close is not numeric.
#[derive(ImplNew, Clone, Debug)]
pub struct CsvPriceSource {
  /// Directory holding one CSV file per ticker.
  pub data_dir: PathBuf,
}

impl CsvPriceSource {
  fn path_for(&self, ticker: &str) -> PathBuf {
    self.data_dir.join(format!("{ticker}.csv"))
  }
}

fn parse_date(field: &str) -> Option<NaiveDate> {
  let field = field.trim();
  // Timestamps such as `2020-01-02 00:00:00-05:00` keep only the day.
  let day = field.get(..10).unwrap_or(field);
  NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

fn column_of(headers: &csv::StringRecord, name: &str) -> Option<usize> {
  headers
    .iter()
    .position(|h| h.trim().eq_ignore_ascii_case(name))
}

impl PriceSource for CsvPriceSource {
  fn load(&self, ticker: &str, range: &DateRange) -> Result<PriceSeries> {
    let path = self.path_for(ticker);
    let unavailable = |reason: String| PortfolioError::DataUnavailable {
      ticker: ticker.to_string(),
      reason,
    };

    let mut reader = csv::ReaderBuilder::new()
      .flexible(true)
      .from_path(&path)
      .map_err(|e| unavailable(format!("{}: {e}", path.display())))?;

    let headers = reader
      .headers()
      .map_err(|e| unavailable(format!("{}: {e}", path.display())))?
      .clone();
    let date_col = column_of(&headers, "Date")
      .ok_or_else(|| unavailable(format!("{}: missing Date column", path.display())))?;
    let close_col = column_of(&headers, "Close")
      .ok_or_else(|| unavailable(format!("{}: missing Close column", path.display())))?;

    let mut records = Vec::new();
    let mut skipped = 0usize;
    for row in reader.records() {
      let Ok(row) = row else {
        skipped += 1;
        continue;
      };
      let Some(date) = row.get(date_col).and_then(parse_date) else {
        skipped += 1;
        continue;
      };
      let close = row.get(close_col).and_then(|c| c.trim().parse::<f64>().ok());
      records.push((date, close));
    }

    debug!(
      ticker,
      path = %path.display(),
      rows = records.len(),
      skipped,
      "read price file"
    );

    PriceSeries::from_records(ticker, records)?.within(range)
  }
}

/// Price tables supplied directly by the caller.
#[derive(Clone, Debug, Default)]
pub struct InMemoryPriceSource {
  series: HashMap<String, PriceSeries>,
}

impl InMemoryPriceSource {
  pub fn new() -> Self {
    Self::default()
  }

  /// Add or replace the table of one ticker.
  pub fn insert(&mut self, series: PriceSeries) {
    self.series.insert(series.ticker().to_string(), series);
  }

  pub fn with_series(mut self, series: PriceSeries) -> Self {
    self.insert(series);
    self
  }

  pub fn tickers(&self) -> impl Iterator<Item = &str> {
    self.series.keys().map(String::as_str)
  }
}

impl FromIterator<PriceSeries> for InMemoryPriceSource {
  fn from_iter<I: IntoIterator<Item = PriceSeries>>(iter: I) -> Self {
    let mut source = Self::new();
    for series in iter {
      source.insert(series);
    }
    source
  }
}

impl PriceSource for InMemoryPriceSource {
  fn load(&self, ticker: &str, range: &DateRange) -> Result<PriceSeries> {
    self
      .series
      .get(ticker)
      .ok_or_else(|| PortfolioError::DataUnavailable {
        ticker: ticker.to_string(),
        reason: "ticker not present in price table".into(),
      })?
      .within(range)
  }
}

/// Pass-through memo of another source keyed by ticker and date range.
///
/// Failed loads are not cached.
#[derive(Debug)]
pub struct CachedPriceSource<S> {
  inner: S,
  cache: RefCell<HashMap<(String, DateRange), PriceSeries>>,
}

impl<S: PriceSource> CachedPriceSource<S> {
  pub fn new(inner: S) -> Self {
    Self {
      inner,
      cache: RefCell::new(HashMap::new()),
    }
  }

  pub fn inner(&self) -> &S {
    &self.inner
  }

  /// Number of memoized `(ticker, range)` entries.
  pub fn cached(&self) -> usize {
    self.cache.borrow().len()
  }

  pub fn clear(&self) {
    self.cache.borrow_mut().clear();
  }
}

impl<S: PriceSource> PriceSource for CachedPriceSource<S> {
  fn load(&self, ticker: &str, range: &DateRange) -> Result<PriceSeries> {
    let key = (ticker.to_string(), *range);
    if let Some(hit) = self.cache.borrow().get(&key) {
      return Ok(hit.clone());
    }

    let series = self.inner.load(ticker, range)?;
    self.cache.borrow_mut().insert(key, series.clone());
    Ok(series)
  }
}
