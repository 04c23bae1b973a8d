//! Daily closing-price series for a single ticker.
//!
//! A `PriceSeries` is always sorted ascending by date, holds one point per
//! trading day and is never empty. Everything downstream relies on those
//! three properties, so they are enforced here at construction time.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub date: NaiveDate,
    pub close: f64,
}

#[derive(Debug, Error, PartialEq)]
pub enum SeriesError {
    #[error("no usable closing prices for {0}")]
    Empty(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSeries {
    ticker: String,
    points: Vec<PricePoint>,
}

impl PriceSeries {
    /// Builds a series from raw provider rows in any order.
    ///
    /// Rows without a usable close (missing, NaN, infinite, zero or negative)
    /// are dropped. When a date appears more than once the last usable row
    /// for that date wins.
    pub fn new<I>(ticker: impl Into<String>, rows: I) -> Result<Self, SeriesError>
    where
        I: IntoIterator<Item = (NaiveDate, Option<f64>)>,
    {
        let ticker = ticker.into();
        let mut by_date: BTreeMap<NaiveDate, f64> = BTreeMap::new();

        for (date, close) in rows {
            if let Some(close) = close.filter(|c| c.is_finite() && *c > 0.0) {
                by_date.insert(date, close);
            }
        }

        if by_date.is_empty() {
            return Err(SeriesError::Empty(ticker));
        }

        let points = by_date
            .into_iter()
            .map(|(date, close)| PricePoint { date, close })
            .collect();

        Ok(Self { ticker, points })
    }

    /// Convenience constructor for already-clean `(date, close)` pairs.
    pub fn from_closes<I>(ticker: impl Into<String>, closes: I) -> Result<Self, SeriesError>
    where
        I: IntoIterator<Item = (NaiveDate, f64)>,
    {
        Self::new(ticker, closes.into_iter().map(|(d, c)| (d, Some(c))))
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

    pub fn first(&self) -> &PricePoint {
        &self.points[0]
    }

    pub fn last(&self) -> &PricePoint {
        &self.points[self.points.len() - 1]
    }

    pub fn closes(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.close).collect()
    }

    /// The point `n` trading days before the last one, if the series reaches that far.
    pub fn back(&self, n: usize) -> Option<&PricePoint> {
        let last = self.points.len() - 1;
        last.checked_sub(n).map(|i| &self.points[i])
    }

    /// First point dated on or after `date`.
    pub fn first_on_or_after(&self, date: NaiveDate) -> Option<&PricePoint> {
        let idx = self.points.partition_point(|p| p.date < date);
        self.points.get(idx)
    }

    /// A new series holding only the points strictly before `date`.
    pub fn before(&self, date: NaiveDate) -> Result<Self, SeriesError> {
        let end = self.points.partition_point(|p| p.date < date);
        if end == 0 {
            return Err(SeriesError::Empty(self.ticker.clone()));
        }
        Ok(Self {
            ticker: self.ticker.clone(),
            points: self.points[..end].to_vec(),
        })
    }
}
