use std::cmp::Ordering;

use crate::analysis::ReportRow;
use crate::metrics::MetricColumn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Group,
    Metric(MetricColumn),
}

impl SortKey {
    /// Group first, then every metric column.
    pub fn all() -> Vec<SortKey> {
        std::iter::once(SortKey::Group)
            .chain(MetricColumn::ALL.into_iter().map(SortKey::Metric))
            .collect()
    }

    pub fn label(&self) -> &'static str {
        match self {
            SortKey::Group => "Group",
            SortKey::Metric(column) => column.label(),
        }
    }
}

/// An empty selection means every group.
pub fn matches_groups(row: &ReportRow, selected: &[String]) -> bool {
    selected.is_empty() || selected.iter().any(|g| *g == row.entry.group)
}

/// Rows of the selected groups, ordered by group and then by the sort
/// metric descending. Unavailable values sink to the bottom of their group.
pub fn filter_and_sort<'a>(rows: &'a [ReportRow], selected: &[String], key: SortKey) -> Vec<&'a ReportRow> {
    let mut out: Vec<&ReportRow> = rows.iter().filter(|r| matches_groups(r, selected)).collect();

    out.sort_by(|a, b| {
        let by_group = a.entry.group.cmp(&b.entry.group);
        match key {
            SortKey::Group => by_group,
            SortKey::Metric(column) => by_group.then_with(|| {
                match (a.metrics.get(column).value(), b.metrics.get(column).value()) {
                    (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(Ordering::Equal),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                }
            }),
        }
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::EtfCatalogEntry;
    use crate::metrics;
    use crate::series::PriceSeries;
    use chrono::{Duration, NaiveDate};

    fn row(ticker: &str, group: &str, closes: &[f64]) -> ReportRow {
        let start = NaiveDate::from_ymd_opt(2024, 4, 1).unwrap();
        let series = PriceSeries::from_closes(
            ticker,
            closes.iter().enumerate().map(|(i, c)| (start + Duration::days(i as i64), *c)),
        )
        .unwrap();
        ReportRow {
            entry: EtfCatalogEntry {
                ticker: ticker.to_string(),
                name: ticker.to_string(),
                group: group.to_string(),
            },
            metrics: metrics::compute(&series),
        }
    }

    fn tickers(rows: &[&ReportRow]) -> Vec<String> {
        rows.iter().map(|r| r.entry.ticker.clone()).collect()
    }

    #[test]
    fn test_sort_by_metric_within_group() {
        let rows = vec![
            row("B1", "Bonds", &[100.0, 101.0]),
            row("E1", "Equity", &[100.0, 99.0]),
            row("E2", "Equity", &[100.0, 105.0]),
            row("E3", "Equity", &[100.0]),
            row("B2", "Bonds", &[100.0, 103.0]),
        ];

        let sorted = filter_and_sort(&rows, &[], SortKey::Metric(MetricColumn::DailyReturn));
        assert_eq!(tickers(&sorted), vec!["B2", "B1", "E2", "E1", "E3"]);

        let by_group = filter_and_sort(&rows, &[], SortKey::Group);
        assert_eq!(tickers(&by_group), vec!["B1", "B2", "E1", "E2", "E3"]);
    }

    #[test]
    fn test_group_filter() {
        let rows = vec![row("B1", "Bonds", &[1.0, 2.0]), row("E1", "Equity", &[1.0, 2.0])];
        let only_bonds = filter_and_sort(&rows, &["Bonds".to_string()], SortKey::Group);
        assert_eq!(tickers(&only_bonds), vec!["B1"]);
    }

    #[test]
    fn test_sort_keys_cover_every_column() {
        let keys = SortKey::all();
        assert_eq!(keys.len(), MetricColumn::ALL.len() + 1);
        assert_eq!(keys[0].label(), "Group");
    }
}
