//! Tabular export of a batch: one row per ticker, one column per metric.
//!
//! This is the only place values are rounded. Unavailable fields are
//! written as empty cells.

use chrono::NaiveDate;
use std::collections::HashMap;
use std::io::{Read, Write};
use thiserror::Error;

use crate::analysis::ReportRow;
use crate::catalog::EtfCatalogEntry;
use crate::metrics::{Metric, MetricColumn};

pub const DECIMALS: usize = 2;

const TICKER: &str = "ETF Ticker";
const NAME: &str = "ETF Name";
const GROUP: &str = "Group";
const BASE_DATE: &str = "Base Date";
const WEEKLY_BASE_DATE: &str = "Weekly Base Date";
const MONTHLY_BASE_DATE: &str = "Monthly Base Date";

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("missing column {0:?}")]
    MissingColumn(String),

    #[error("column {column:?}: cannot parse {value:?}")]
    BadValue { column: String, value: String },

    #[error("row {row} ({ticker}): {reason}")]
    Inconsistent { row: usize, ticker: String, reason: String },
}

/// A row read back from an exported file.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportedRow {
    pub entry: EtfCatalogEntry,
    pub values: HashMap<MetricColumn, Option<f64>>,
    pub base_date: Option<NaiveDate>,
    pub weekly_base_date: Option<NaiveDate>,
    pub monthly_base_date: Option<NaiveDate>,
}

pub fn format_value(v: f64) -> String {
    format!("{:.*}", DECIMALS, v)
}

fn metric_cell(m: Metric) -> String {
    m.value().map(format_value).unwrap_or_default()
}

fn date_cell(d: Option<NaiveDate>) -> String {
    d.map(|d| d.format(DATE_FORMAT).to_string()).unwrap_or_default()
}

pub fn headers() -> Vec<&'static str> {
    let mut headers = vec![TICKER, NAME, GROUP];
    headers.extend(MetricColumn::ALL.iter().map(|c| c.label()));
    headers.extend([BASE_DATE, WEEKLY_BASE_DATE, MONTHLY_BASE_DATE]);
    headers
}

pub fn write_csv<W: Write>(rows: &[ReportRow], writer: W) -> Result<(), ExportError> {
    let mut writer = csv::Writer::from_writer(writer);
    writer.write_record(headers())?;

    for row in rows {
        let mut record = vec![
            row.entry.ticker.clone(),
            row.entry.name.clone(),
            row.entry.group.clone(),
        ];
        record.extend(MetricColumn::ALL.iter().map(|c| metric_cell(row.metrics.get(*c))));
        record.push(date_cell(Some(row.metrics.as_of)));
        record.push(date_cell(row.metrics.weekly_base_date));
        record.push(date_cell(row.metrics.monthly_base_date));
        writer.write_record(&record)?;
    }

    writer.flush()?;
    Ok(())
}

pub fn to_csv_bytes(rows: &[ReportRow]) -> Result<Vec<u8>, ExportError> {
    let mut buf = Vec::new();
    write_csv(rows, &mut buf)?;
    Ok(buf)
}

pub fn read_csv<R: Read>(reader: R) -> Result<Vec<ExportedRow>, ExportError> {
    let mut reader = csv::Reader::from_reader(reader);
    let header_index: HashMap<String, usize> = reader
        .headers()?
        .iter()
        .enumerate()
        .map(|(i, h)| (h.to_string(), i))
        .collect();

    let column = |name: &str| -> Result<usize, ExportError> {
        header_index
            .get(name)
            .copied()
            .ok_or_else(|| ExportError::MissingColumn(name.to_string()))
    };

    let ticker_col = column(TICKER)?;
    let name_col = column(NAME)?;
    let group_col = column(GROUP)?;
    let metric_cols = MetricColumn::ALL
        .iter()
        .map(|c| column(c.label()).map(|i| (*c, i)))
        .collect::<Result<Vec<_>, _>>()?;
    let date_cols = [column(BASE_DATE)?, column(WEEKLY_BASE_DATE)?, column(MONTHLY_BASE_DATE)?];

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let cell = |i: usize| record.get(i).unwrap_or("").trim();

        let mut values = HashMap::new();
        for (metric, i) in &metric_cols {
            values.insert(*metric, parse_number(metric.label(), cell(*i))?);
        }

        rows.push(ExportedRow {
            entry: EtfCatalogEntry {
                ticker: cell(ticker_col).to_string(),
                name: cell(name_col).to_string(),
                group: cell(group_col).to_string(),
            },
            values,
            base_date: parse_date(BASE_DATE, cell(date_cols[0]))?,
            weekly_base_date: parse_date(WEEKLY_BASE_DATE, cell(date_cols[1]))?,
            monthly_base_date: parse_date(MONTHLY_BASE_DATE, cell(date_cols[2]))?,
        });
    }
    Ok(rows)
}

/// Checks rows read back from an export describe fetched tickers: every row
/// has a ticker, a close and a base date, and the weekly and monthly base
/// dates do not run past it.
pub fn check_rows(rows: &[ExportedRow]) -> Result<(), ExportError> {
    for (i, row) in rows.iter().enumerate() {
        let fail = |reason: &str| ExportError::Inconsistent {
            row: i + 1,
            ticker: row.entry.ticker.clone(),
            reason: reason.to_string(),
        };

        if row.entry.ticker.is_empty() {
            return Err(fail("empty ticker"));
        }
        if row.values.get(&MetricColumn::Close).copied().flatten().is_none() {
            return Err(fail("no close"));
        }
        let Some(base) = row.base_date else {
            return Err(fail("no base date"));
        };
        if row.weekly_base_date.is_some_and(|w| w > base) {
            return Err(fail("weekly base date after base date"));
        }
        if row.monthly_base_date.is_some_and(|m| m > base) {
            return Err(fail("monthly base date after base date"));
        }
    }
    Ok(())
}

fn parse_number(column: &str, value: &str) -> Result<Option<f64>, ExportError> {
    if value.is_empty() {
        return Ok(None);
    }
    value.parse().map(Some).map_err(|_| ExportError::BadValue {
        column: column.to_string(),
        value: value.to_string(),
    })
}

fn parse_date(column: &str, value: &str) -> Result<Option<NaiveDate>, ExportError> {
    if value.is_empty() {
        return Ok(None);
    }
    NaiveDate::parse_from_str(value, DATE_FORMAT)
        .map(Some)
        .map_err(|_| ExportError::BadValue {
            column: column.to_string(),
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics;
    use crate::series::PriceSeries;
    use chrono::Duration;

    fn row(ticker: &str, closes: &[f64]) -> ReportRow {
        let start = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
        let series = PriceSeries::from_closes(
            ticker,
            closes.iter().enumerate().map(|(i, c)| (start + Duration::days(i as i64), *c)),
        )
        .unwrap();
        ReportRow {
            entry: EtfCatalogEntry {
                ticker: ticker.to_string(),
                name: format!("{ticker}, Inc. \"ETF\""),
                group: "Equity".to_string(),
            },
            metrics: metrics::compute(&series),
        }
    }

    #[test]
    fn test_round_trip_within_rounding() {
        let long: Vec<f64> = (0..380).map(|i| 50.0 + (i as f64 * 0.21).cos() * 3.0 + i as f64 * 0.01).collect();
        let rows = vec![row("AAA", &long), row("BBB", &[20.0, 21.0, 19.5])];

        let bytes = to_csv_bytes(&rows).unwrap();
        let parsed = read_csv(bytes.as_slice()).unwrap();
        assert_eq!(parsed.len(), rows.len());

        let tolerance = 0.5 * 10f64.powi(-(DECIMALS as i32)) + 1e-9;
        for (written, back) in rows.iter().zip(&parsed) {
            assert_eq!(back.entry, written.entry);
            assert_eq!(back.base_date, Some(written.metrics.as_of));
            assert_eq!(back.weekly_base_date, written.metrics.weekly_base_date);

            for column in MetricColumn::ALL {
                let expected = written.metrics.get(column).value();
                let actual = back.values[&column];
                match (expected, actual) {
                    (Some(e), Some(a)) => assert!((e - a).abs() <= tolerance, "{}", column.label()),
                    (None, None) => {}
                    other => panic!("{}: {:?}", column.label(), other),
                }
            }
        }
    }

    #[test]
    fn test_unavailable_fields_are_blank() {
        let bytes = to_csv_bytes(&[row("ONE", &[10.0])]).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let line = text.lines().nth(1).unwrap();
        assert!(line.starts_with("ONE,"));
        assert!(line.contains("10.00,,"));
    }

    #[test]
    fn test_missing_column_reported() {
        let err = read_csv("ETF Ticker,ETF Name\nSPY,x\n".as_bytes()).unwrap_err();
        assert!(matches!(err, ExportError::MissingColumn(ref c) if c == "Group"));
    }

    #[test]
    fn test_check_rows() {
        let bytes = to_csv_bytes(&[row("AAA", &[10.0, 10.5, 10.2, 10.8, 11.0, 11.2])]).unwrap();
        let rows = read_csv(bytes.as_slice()).unwrap();
        assert!(check_rows(&rows).is_ok());

        let mut no_close = rows.clone();
        no_close[0].values.insert(MetricColumn::Close, None);
        assert!(matches!(
            check_rows(&no_close),
            Err(ExportError::Inconsistent { row: 1, ref reason, .. }) if reason == "no close"
        ));

        let mut shifted = rows.clone();
        shifted[0].weekly_base_date = shifted[0].base_date.map(|d| d + Duration::days(1));
        assert!(check_rows(&shifted).is_err());

        let mut undated = rows;
        undated[0].base_date = None;
        assert!(check_rows(&undated).is_err());
    }
}
