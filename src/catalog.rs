//! The ETF reference table: ticker -> display name and group label.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Read;
use std::path::Path;
use thiserror::Error;

const SYMBOL_PATTERN: &str = r"^[A-Za-z0-9^][A-Za-z0-9.\-=^]{0,19}$";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtfCatalogEntry {
    #[serde(rename = "ETF Ticker")]
    pub ticker: String,
    #[serde(rename = "ETF Name")]
    pub name: String,
    #[serde(rename = "Group")]
    pub group: String,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("cannot read catalog: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed catalog: {0}")]
    Csv(#[from] csv::Error),

    #[error("row {row}: invalid ticker {ticker:?}")]
    InvalidTicker { row: usize, ticker: String },

    #[error("row {row}: duplicate ticker {ticker}")]
    DuplicateTicker { row: usize, ticker: String },

    #[error("catalog has no entries")]
    Empty,

    #[error(transparent)]
    Pattern(#[from] regex::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    entries: Vec<EtfCatalogEntry>,
}

impl Catalog {
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(file)
    }

    /// Parses a CSV table with `ETF Ticker`, `ETF Name` and `Group` columns.
    /// Extra columns are ignored, a UTF-8 BOM is tolerated.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, CatalogError> {
        let symbol = Regex::new(SYMBOL_PATTERN)?;
        let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);

        // Spreadsheet exports often start with a BOM that sticks to the first header.
        let headers: csv::StringRecord = reader
            .headers()?
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}'))
            .collect();
        reader.set_headers(headers);

        let mut seen = HashSet::new();
        let mut entries = Vec::new();

        for (i, record) in reader.deserialize::<EtfCatalogEntry>().enumerate() {
            let row = i + 2; // header is row 1
            let mut entry = record?;
            entry.ticker = entry.ticker.to_uppercase();

            if !symbol.is_match(&entry.ticker) {
                return Err(CatalogError::InvalidTicker { row, ticker: entry.ticker });
            }
            if !seen.insert(entry.ticker.clone()) {
                return Err(CatalogError::DuplicateTicker { row, ticker: entry.ticker });
            }
            entries.push(entry);
        }

        if entries.is_empty() {
            return Err(CatalogError::Empty);
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[EtfCatalogEntry] {
        &self.entries
    }

    /// Distinct group labels, sorted.
    pub fn groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.entries.iter().map(|e| e.group.clone()).collect();
        groups.sort();
        groups.dedup();
        groups
    }
}

impl FromIterator<EtfCatalogEntry> for Catalog {
    fn from_iter<T: IntoIterator<Item = EtfCatalogEntry>>(iter: T) -> Self {
        Self { entries: iter.into_iter().collect() }
    }
}
