//! This module contains the core analysis pipeline logic.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::{Tz, US::Eastern};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, EtfCatalogEntry};
use crate::export;
use crate::github_sync::{self, GithubSync, SyncOutcome};
use crate::metrics::{self, MetricRow, RowStatus};
use crate::price_fetcher::{FetchError, PriceFetcher, PriceProvider, YahooProvider};
use crate::storage_utils::{AppConfig, AsyncStorageManager, GithubConfig};
use std::path::PathBuf;

pub const RESULTS_FILE: &str = "results";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    InvalidTicker,
    DataUnavailable,
    EmptySeries,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedTicker {
    pub entry: EtfCatalogEntry,
    pub kind: FailureKind,
    pub reason: String,
}

impl FailedTicker {
    fn new(entry: &EtfCatalogEntry, err: &FetchError) -> Self {
        let kind = match err {
            FetchError::InvalidTicker(_) => FailureKind::InvalidTicker,
            FetchError::DataUnavailable { .. } => FailureKind::DataUnavailable,
            FetchError::EmptySeries(_) => FailureKind::EmptySeries,
        };
        Self {
            entry: entry.clone(),
            kind,
            reason: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRow {
    pub entry: EtfCatalogEntry,
    pub metrics: MetricRow,
}

/// How a single catalog ticker came out of the batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickerOutcome<'a> {
    Complete(&'a ReportRow),
    Partial(&'a ReportRow),
    Failed(&'a FailedTicker),
}

/// One refresh cycle: a row per ticker that could be fetched, in catalog
/// order, plus every ticker that could not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub generated_at: DateTime<Utc>,
    pub rows: Vec<ReportRow>,
    pub failures: Vec<FailedTicker>,
}

impl TickerOutcome<'_> {
    pub fn ticker(&self) -> &str {
        match self {
            TickerOutcome::Complete(row) | TickerOutcome::Partial(row) => &row.entry.ticker,
            TickerOutcome::Failed(failure) => &failure.entry.ticker,
        }
    }
}

impl BatchReport {
    /// Rows first, then failures.
    pub fn outcomes(&self) -> impl Iterator<Item = TickerOutcome<'_>> {
        let rows = self.rows.iter().map(|row| match row.metrics.status() {
            RowStatus::Complete => TickerOutcome::Complete(row),
            RowStatus::Partial => TickerOutcome::Partial(row),
        });
        rows.chain(self.failures.iter().map(TickerOutcome::Failed))
    }

    pub fn complete_count(&self) -> usize {
        self.outcomes()
            .filter(|o| matches!(o, TickerOutcome::Complete(_)))
            .count()
    }

    pub fn partial_count(&self) -> usize {
        self.outcomes()
            .filter(|o| matches!(o, TickerOutcome::Partial(_)))
            .count()
    }

    /// Latest trading date across all rows.
    pub fn as_of(&self) -> Option<NaiveDate> {
        self.rows.iter().map(|r| r.metrics.as_of).max()
    }
}

/// Fetches and computes every catalog ticker. Per-ticker failures are
/// recorded and never stop the batch.
pub async fn run_batch<P: PriceProvider>(fetcher: &PriceFetcher<P>, catalog: &Catalog) -> BatchReport {
    run_batch_at(fetcher, catalog, Utc::now().with_timezone(&Eastern)).await
}

pub async fn run_batch_at<P: PriceProvider>(
    fetcher: &PriceFetcher<P>,
    catalog: &Catalog,
    now: DateTime<Tz>,
) -> BatchReport {
    let lookback = fetcher.lookback();
    let batch_size = fetcher.config().concurrency.max(1);

    let mut rows = Vec::with_capacity(catalog.entries().len());
    let mut failures = Vec::new();

    // 1. Fetch in chunks of `concurrency` tickers. join_all keeps input
    //    order, so rows come out in catalog order.
    for batch in catalog.entries().chunks(batch_size) {
        let tasks: Vec<_> = batch
            .iter()
            .map(|entry| async move { (entry, fetcher.fetch_at(&entry.ticker, lookback, now).await) })
            .collect();

        // 2. Compute each fetched series; a failed ticker is recorded and skipped
        for (entry, result) in futures::future::join_all(tasks).await {
            match result {
                Ok(series) => {
                    let metrics = metrics::compute(&series);
                    if metrics.status() == RowStatus::Partial {
                        debug!(ticker = %entry.ticker, missing = ?metrics.unavailable_columns(), "partial row");
                    }
                    rows.push(ReportRow {
                        entry: entry.clone(),
                        metrics,
                    });
                }
                Err(e) => {
                    warn!(ticker = %entry.ticker, error = %e, "ticker failed");
                    failures.push(FailedTicker::new(entry, &e));
                }
            }
        }
    }

    // 3. Assemble the report
    let report = BatchReport {
        generated_at: now.with_timezone(&Utc),
        rows,
        failures,
    };
    info!(
        complete = report.complete_count(),
        partial = report.partial_count(),
        failed = report.failures.len(),
        "batch finished"
    );
    report
}

/// Runs the full analysis pipeline:
/// 1. Loads the ETF catalog.
/// 2. Fetches daily closes for each ticker.
/// 3. Computes the metric rows and saves the report to storage.
pub async fn run_analysis_pipeline(storage: &AsyncStorageManager, config: &AppConfig) -> Result<BatchReport> {
    // Step 1: Load Catalog
    let catalog = Catalog::load(&config.catalog_path)
        .with_context(|| format!("loading catalog {}", config.catalog_path.display()))?;
    info!(tickers = catalog.entries().len(), groups = ?catalog.groups(), "catalog loaded");

    // Step 2: Fetch and Compute
    let provider = YahooProvider::new(&config.fetch).context("building HTTP client")?;
    let fetcher = PriceFetcher::new(provider, config.fetch.clone());

    let report = run_batch(&fetcher, &catalog).await;

    // Step 3: Persist Results
    storage.save(RESULTS_FILE, &report).await?;
    Ok(report)
}

pub async fn load_last_report(storage: &AsyncStorageManager) -> Result<BatchReport> {
    storage
        .load(RESULTS_FILE)
        .await
        .context("no saved results, run `update` first")
}

/// **Export**
/// Writes the report's rows as CSV into the storage directory.
pub async fn export_report(storage: &AsyncStorageManager, config: &AppConfig, report: &BatchReport) -> Result<PathBuf> {
    let bytes = export::to_csv_bytes(&report.rows)?;
    storage.write_atomic(&config.export.file_name, &bytes).await?;

    let path = storage.path(&config.export.file_name);
    info!(path = %path.display(), rows = report.rows.len(), "exported");
    Ok(path)
}

/// **Push Fresh Batch**
/// Pushes the report's CSV to the configured repository.
pub async fn push_report(config: &AppConfig, report: &BatchReport) -> Result<SyncOutcome> {
    let github = config
        .github
        .clone()
        .context("no `github` section in config.json")?;

    let bytes = export::to_csv_bytes(&report.rows)?;
    push_bytes(github, &bytes).await
}

/// Pushes the CSV already exported to the storage directory, after checking
/// it still parses as a dataset.
pub async fn push_exported(storage: &AsyncStorageManager, config: &AppConfig) -> Result<SyncOutcome> {
    let github = config
        .github
        .clone()
        .context("no `github` section in config.json")?;

    let path = storage.path(&config.export.file_name);
    let bytes = tokio::fs::read(&path)
        .await
        .with_context(|| format!("reading {}, run `update` first", path.display()))?;
    let rows = export::read_csv(bytes.as_slice())
        .and_then(|rows| export::check_rows(&rows).map(|_| rows))
        .with_context(|| format!("{} is not a valid export", path.display()))?;
    info!(path = %path.display(), rows = rows.len(), "pushing exported file");

    push_bytes(github, &bytes).await
}

async fn push_bytes(github: GithubConfig, bytes: &[u8]) -> Result<SyncOutcome> {
    let sync = GithubSync::from_env(github)?;
    let message = github_sync::commit_message(Utc::now());
    Ok(sync.upsert_file(bytes, &message).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metric;
    use crate::price_fetcher::{DailyBar, DailyHistory};
    use crate::storage_utils::FetchConfig;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use std::collections::HashMap;

    struct StubProvider {
        bars: HashMap<String, Vec<DailyBar>>,
    }

    #[async_trait]
    impl PriceProvider for StubProvider {
        async fn daily_bars(&self, ticker: &str, _: NaiveDate, _: NaiveDate) -> Result<DailyHistory, FetchError> {
            self.bars.get(ticker).cloned().map(DailyHistory::new_york).ok_or_else(|| FetchError::DataUnavailable {
                ticker: ticker.to_string(),
                reason: "404 Not Found".to_string(),
            })
        }
    }

    fn bars(closes: &[f64]) -> Vec<DailyBar> {
        let start = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| DailyBar {
                date: start + Duration::days(i as i64),
                close: Some(c),
            })
            .collect()
    }

    fn entry(ticker: &str, group: &str) -> EtfCatalogEntry {
        EtfCatalogEntry {
            ticker: ticker.to_string(),
            name: format!("{ticker} fund"),
            group: group.to_string(),
        }
    }

    fn fixture(concurrency: usize) -> (PriceFetcher<StubProvider>, Catalog) {
        let long: Vec<f64> = (0..400).map(|i| 100.0 + ((i as f64) * 0.3).sin() * 5.0).collect();
        let mut map = HashMap::new();
        map.insert("SPY".to_string(), bars(&long));
        map.insert("NEW".to_string(), bars(&[10.0, 10.5, 10.2]));
        map.insert("HOLE".to_string(), vec![]);

        let fetcher = PriceFetcher::new(
            StubProvider { bars: map },
            FetchConfig { concurrency, ..FetchConfig::default() },
        );
        let catalog: Catalog = vec![
            entry("SPY", "US"),
            entry("GONE", "US"),
            entry("NEW", "Thematic"),
            entry("HOLE", "Thematic"),
        ]
        .into_iter()
        .collect();
        (fetcher, catalog)
    }

    fn now() -> DateTime<Tz> {
        Eastern.with_ymd_and_hms(2024, 3, 1, 20, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let (fetcher, catalog) = fixture(1);
        let report = run_batch_at(&fetcher, &catalog, now()).await;

        let tickers: Vec<_> = report.rows.iter().map(|r| r.entry.ticker.as_str()).collect();
        assert_eq!(tickers, vec!["SPY", "NEW"]);

        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].entry.ticker, "GONE");
        assert_eq!(report.failures[0].kind, FailureKind::DataUnavailable);
        assert_eq!(report.failures[1].kind, FailureKind::EmptySeries);
    }

    #[tokio::test]
    async fn test_outcomes_distinguish_complete_partial_failed() {
        let (fetcher, catalog) = fixture(1);
        let report = run_batch_at(&fetcher, &catalog, now()).await;
        let outcome = |ticker: &str| report.outcomes().find(|o| o.ticker() == ticker);

        assert!(matches!(outcome("SPY"), Some(TickerOutcome::Complete(_))));
        assert!(matches!(outcome("NEW"), Some(TickerOutcome::Partial(_))));
        assert!(matches!(outcome("GONE"), Some(TickerOutcome::Failed(_))));
        assert!(outcome("XYZ").is_none());
        assert_eq!(report.complete_count(), 1);
        assert_eq!(report.partial_count(), 1);

        let Some(TickerOutcome::Partial(row)) = outcome("NEW") else {
            panic!("NEW should be partial");
        };
        assert!(row.metrics.daily_return.is_available());
        assert_eq!(row.metrics.weekly_return, Metric::InsufficientHistory);
    }

    #[tokio::test]
    async fn test_fan_out_keeps_catalog_order() {
        let (sequential, catalog) = fixture(1);
        let (parallel, _) = fixture(3);

        let a = run_batch_at(&sequential, &catalog, now()).await;
        let b = run_batch_at(&parallel, &catalog, now()).await;
        assert_eq!(a.rows, b.rows);
        assert_eq!(a.failures, b.failures);
    }

    #[tokio::test]
    async fn test_report_persists() {
        let (fetcher, catalog) = fixture(2);
        let report = run_batch_at(&fetcher, &catalog, now()).await;

        let dir = tempfile::tempdir().unwrap();
        let storage = AsyncStorageManager::new(dir.path()).await.unwrap();
        storage.save(RESULTS_FILE, &report).await.unwrap();

        let loaded = load_last_report(&storage).await.unwrap();
        assert_eq!(loaded, report);
        assert_eq!(loaded.as_of(), report.rows[0].metrics.as_of.into());
    }

    #[tokio::test]
    async fn test_export_report_writes_rows_only() {
        let (fetcher, catalog) = fixture(1);
        let report = run_batch_at(&fetcher, &catalog, now()).await;

        let dir = tempfile::tempdir().unwrap();
        let storage = AsyncStorageManager::new(dir.path()).await.unwrap();
        let path = export_report(&storage, &AppConfig::default(), &report).await.unwrap();

        let parsed = export::read_csv(std::fs::File::open(path).unwrap()).unwrap();
        let tickers: Vec<_> = parsed.iter().map(|r| r.entry.ticker.as_str()).collect();
        assert_eq!(tickers, vec!["SPY", "NEW"]);
    }

    #[tokio::test]
    async fn test_push_without_github_section_fails_cleanly() {
        let (fetcher, catalog) = fixture(1);
        let report = run_batch_at(&fetcher, &catalog, now()).await;
        assert!(push_report(&AppConfig::default(), &report).await.is_err());
        assert_eq!(report.rows.len(), 2);
    }

    #[tokio::test]
    async fn test_push_exported_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = AsyncStorageManager::new(dir.path()).await.unwrap();
        let mut config = AppConfig::default();
        config.github = Some(
            serde_json::from_str(r#"{"owner":"acme","repo":"etf-data","token_env":"ETF_DASHBOARD_UNSET_TOKEN"}"#)
                .unwrap(),
        );

        assert!(push_exported(&storage, &config).await.is_err());

        storage.write_atomic(&config.export.file_name, b"Ticker\nSPY\n").await.unwrap();
        let err = push_exported(&storage, &config).await.unwrap_err();
        assert!(format!("{:#}", err).contains("not a valid export"));

        // Right columns, but the row carries no close.
        let blank_row = format!("{}\nSPY,SPDR S&P 500,US{}\n", export::headers().join(","), ",".repeat(17));
        storage.write_atomic(&config.export.file_name, blank_row.as_bytes()).await.unwrap();
        let err = format!("{:#}", push_exported(&storage, &config).await.unwrap_err());
        assert!(err.contains("not a valid export") && err.contains("no close"), "{}", err);
    }

    #[tokio::test]
    async fn test_push_exported_checks_file_before_token() {
        let (fetcher, catalog) = fixture(1);
        let report = run_batch_at(&fetcher, &catalog, now()).await;

        let dir = tempfile::tempdir().unwrap();
        let storage = AsyncStorageManager::new(dir.path()).await.unwrap();
        let mut config = AppConfig::default();
        config.github = Some(
            serde_json::from_str(r#"{"owner":"acme","repo":"etf-data","token_env":"ETF_DASHBOARD_UNSET_TOKEN"}"#)
                .unwrap(),
        );
        export_report(&storage, &config, &report).await.unwrap();

        // A well-formed export gets as far as the missing token.
        let err = format!("{:#}", push_exported(&storage, &config).await.unwrap_err());
        assert!(!err.contains("not a valid export"), "{}", err);
        assert!(err.contains("ETF_DASHBOARD_UNSET_TOKEN"), "{}", err);
    }
}
