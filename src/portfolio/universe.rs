//! # Universe
//!
//! $$
//! \mathcal U \to \{0,\dots,n-1\}
//! $$
//!
//! ETF catalog and the ordered ticker-to-column mapping every vector and
//! matrix in the pipeline is indexed through.

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;

use crate::error::PortfolioError;
use crate::error::Result;

/// Regional ETFs.
pub const REGION_TICKERS: [&str; 5] = ["SPLG", "EWC", "IEUR", "EEM", "EWJ"];

/// Sector ETFs.
pub const SECTOR_TICKERS: [&str; 11] = [
  "XLC", "XLY", "XLP", "XLE", "XLF", "XLV", "XLI", "XLB", "XLRE", "XLK", "XLU",
];

/// Default market proxy used for beta.
pub const DEFAULT_MARKET_PROXY: &str = "SPLG";

/// Investable universe.
#[derive(Default, Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Universe {
  /// Regional ETFs (`Regiones`).
  #[default]
  Regions,
  /// Sector ETFs (`Sectores`).
  Sectors,
  /// Regional followed by sector ETFs.
  All,
}

impl Universe {
  /// Tickers in catalog order.
  pub fn tickers(&self) -> Vec<&'static str> {
    match self {
      Universe::Regions => REGION_TICKERS.to_vec(),
      Universe::Sectors => SECTOR_TICKERS.to_vec(),
      Universe::All => REGION_TICKERS
        .iter()
        .chain(SECTOR_TICKERS.iter())
        .copied()
        .collect(),
    }
  }

  /// Build the column mapping for this universe.
  pub fn asset_index(&self) -> AssetIndex {
    AssetIndex::new(self.tickers())
  }

  /// Whether `ticker` is catalogued in this universe.
  pub fn contains(&self, ticker: &str) -> bool {
    self.tickers().iter().any(|t| *t == ticker)
  }
}

impl Display for Universe {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Universe::Regions => write!(f, "Regiones"),
      Universe::Sectors => write!(f, "Sectores"),
      Universe::All => write!(f, "Todos"),
    }
  }
}

impl FromStr for Universe {
  type Err = PortfolioError;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_lowercase().as_str() {
      "regions" | "regiones" | "regional" => Ok(Self::Regions),
      "sectors" | "sectores" | "sectoral" => Ok(Self::Sectors),
      "all" | "todos" => Ok(Self::All),
      other => Err(PortfolioError::UnknownUniverse(other.to_string())),
    }
  }
}

/// Ordered ticker to column mapping.
///
/// Built once per universe selection; vectors and matrices are laid out in
/// this order and lookups go through [`AssetIndex::position`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssetIndex {
  tickers: Vec<String>,
  positions: HashMap<String, usize>,
}

impl AssetIndex {
  /// Build an index from tickers in column order. Repeated tickers keep
  /// their first position.
  pub fn new<I, S>(tickers: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let mut ordered = Vec::new();
    let mut positions = HashMap::new();
    for ticker in tickers {
      let ticker = ticker.into();
      if positions.contains_key(&ticker) {
        continue;
      }
      positions.insert(ticker.clone(), ordered.len());
      ordered.push(ticker);
    }

    Self {
      tickers: ordered,
      positions,
    }
  }

  pub fn len(&self) -> usize {
    self.tickers.len()
  }

  pub fn is_empty(&self) -> bool {
    self.tickers.is_empty()
  }

  /// Tickers in column order.
  pub fn tickers(&self) -> &[String] {
    &self.tickers
  }

  /// Column of `ticker`, if present.
  pub fn position(&self, ticker: &str) -> Option<usize> {
    self.positions.get(ticker).copied()
  }

  /// Column of `ticker`, or [`PortfolioError::UnknownTicker`].
  pub fn require(&self, ticker: &str) -> Result<usize> {
    self
      .position(ticker)
      .ok_or_else(|| PortfolioError::UnknownTicker(ticker.to_string()))
  }

  pub fn ticker(&self, column: usize) -> Option<&str> {
    self.tickers.get(column).map(String::as_str)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn all_universe_is_regions_then_sectors() {
    let all = Universe::All.tickers();
    assert_eq!(all.len(), 16);
    assert_eq!(all[0], "SPLG");
    assert_eq!(all[5], "XLC");
    assert_eq!(all[15], "XLU");
  }

  #[test]
  fn asset_index_keeps_order_and_drops_repeats() {
    let index = AssetIndex::new(["EEM", "SPLG", "EEM", "EWJ"]);
    assert_eq!(index.len(), 3);
    assert_eq!(index.position("SPLG"), Some(1));
    assert_eq!(index.ticker(2), Some("EWJ"));
    assert!(matches!(
      index.require("XLK"),
      Err(PortfolioError::UnknownTicker(t)) if t == "XLK"
    ));
  }

  #[test]
  fn universe_parses_spanish_and_english_names() {
    assert_eq!("Regiones".parse::<Universe>().unwrap(), Universe::Regions);
    assert_eq!("sectors".parse::<Universe>().unwrap(), Universe::Sectors);
    assert!("bonds".parse::<Universe>().is_err());
    assert!(Universe::Regions.contains(DEFAULT_MARKET_PROXY));
    assert!(!Universe::Sectors.contains(DEFAULT_MARKET_PROXY));
  }
}
