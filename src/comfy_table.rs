use anyhow::Result;
use comfy_table::{
    Attribute, Cell, CellAlignment, Color, ContentArrangement, Table, modifiers::UTF8_ROUND_CORNERS,
    presets::UTF8_BORDERS_ONLY,
};

use crate::analysis::{BatchReport, FailedTicker, TickerOutcome};
use crate::export::format_value;
use crate::filter_utils::{SortKey, filter_and_sort};
use crate::metrics::{Metric, MetricColumn};

fn header(label: &str) -> Cell {
    Cell::new(label).add_attribute(Attribute::Bold)
}

fn metric_cell(column: MetricColumn, metric: Metric) -> Cell {
    let Some(v) = metric.value() else {
        return Cell::new("N/A").fg(Color::DarkGrey).set_alignment(CellAlignment::Right);
    };
    let cell = Cell::new(format_value(v)).set_alignment(CellAlignment::Right);

    // Close and volatilities have no sign worth coloring.
    let signed = !matches!(
        column,
        MetricColumn::Close | MetricColumn::VolUltraShort | MetricColumn::VolShort | MetricColumn::VolLong
    );
    if signed && v > 0.0 {
        cell.fg(Color::Green)
    } else if signed && v < 0.0 {
        cell.fg(Color::Red)
    } else {
        cell
    }
}

pub fn metrics_table(report: &BatchReport, groups: &[String], key: SortKey) -> Table {
    let mut table = Table::new();

    let mut headers = vec![header("Ticker"), header("Name"), header("Group")];
    headers.extend(
        MetricColumn::ALL
            .iter()
            .map(|c| header(c.label()).set_alignment(CellAlignment::Right)),
    );

    table
        .load_preset(UTF8_BORDERS_ONLY)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(headers);

    for row in filter_and_sort(&report.rows, groups, key) {
        let mut cells = vec![
            Cell::new(&row.entry.ticker).fg(Color::Cyan),
            Cell::new(&row.entry.name),
            Cell::new(&row.entry.group).fg(Color::Grey),
        ];
        cells.extend(
            MetricColumn::ALL
                .iter()
                .map(|c| metric_cell(*c, row.metrics.get(*c))),
        );
        table.add_row(cells);
    }

    table
}

pub fn failures_table(report: &BatchReport) -> Option<Table> {
    let failures: Vec<&FailedTicker> = report
        .outcomes()
        .filter_map(|o| match o {
            TickerOutcome::Failed(failure) => Some(failure),
            _ => None,
        })
        .collect();
    if failures.is_empty() {
        return None;
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_BORDERS_ONLY)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![header("Ticker"), header("Name"), header("Reason")]);

    for failure in failures {
        table.add_row(vec![
            Cell::new(&failure.entry.ticker).fg(Color::Red),
            Cell::new(&failure.entry.name),
            Cell::new(&failure.reason),
        ]);
    }
    Some(table)
}

pub fn summary_line(report: &BatchReport) -> String {
    format!(
        "{} complete, {} partial, {} failed",
        report.complete_count(),
        report.partial_count(),
        report.failures.len()
    )
}

pub fn run(report: &BatchReport, groups: &[String], key: SortKey, clear: bool) -> Result<()> {
    if clear {
        // Not fatal when stdout is not a terminal.
        let _ = clearscreen::clear();
    }

    if report.rows.is_empty() && report.failures.is_empty() {
        println!("No data found.");
        return Ok(());
    }

    let as_of = report
        .as_of()
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "-".to_string());
    let title = format!(
        "(Base date {}, taken at {} UTC)",
        as_of,
        report.generated_at.format("%d-%m-%Y %H:%M:%S")
    );

    println!("\n{}\n{}", title, metrics_table(report, groups, key));
    println!("{}", summary_line(report));

    if let Some(failures) = failures_table(report) {
        println!("\nFailed tickers:\n{}", failures);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{FailureKind, ReportRow};
    use crate::catalog::EtfCatalogEntry;
    use crate::metrics;
    use crate::series::PriceSeries;
    use chrono::{NaiveDate, Utc};

    fn entry(ticker: &str) -> EtfCatalogEntry {
        EtfCatalogEntry {
            ticker: ticker.to_string(),
            name: format!("{ticker} Trust"),
            group: "Core".to_string(),
        }
    }

    fn report() -> BatchReport {
        let d = |day| NaiveDate::from_ymd_opt(2024, 7, day).unwrap();
        let series = PriceSeries::from_closes("SPY", vec![(d(1), 100.0), (d(2), 98.0)]).unwrap();
        BatchReport {
            generated_at: Utc::now(),
            rows: vec![ReportRow {
                entry: entry("SPY"),
                metrics: metrics::compute(&series),
            }],
            failures: vec![FailedTicker {
                entry: entry("GONE"),
                kind: FailureKind::DataUnavailable,
                reason: "data unavailable for GONE: 404".to_string(),
            }],
        }
    }

    #[test]
    fn test_table_marks_unavailable_fields() {
        let mut table = metrics_table(&report(), &[], SortKey::Group);
        let rendered = table.force_no_tty().to_string();
        assert!(rendered.contains("SPY"));
        assert!(rendered.contains("-2.00"));
        assert!(rendered.contains("N/A"));
        assert!(!rendered.contains("GONE"));
    }

    #[test]
    fn test_failures_listed_separately() {
        let r = report();
        let mut table = failures_table(&r).unwrap();
        let failures = table.force_no_tty().to_string();
        assert!(failures.contains("GONE"));
        assert_eq!(summary_line(&r), "0 complete, 1 partial, 1 failed");
    }
}
