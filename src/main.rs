mod analysis;
mod catalog;
mod comfy_table;
mod export;
mod filter_utils;
mod github_sync;
mod indicators;
mod metrics;
mod price_fetcher;
mod series;
mod storage_utils;
mod tui;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::filter_utils::SortKey;
use crate::github_sync::GithubSync;
use crate::metrics::MetricColumn;
use crate::storage_utils::{AppConfig, AsyncStorageManager};

const CONFIG_FILE: &str = "config";
const LOG_FILE: &str = "etf-dashboard.log";
const DEFAULT_FILTER: &str = "etf_dashboard=info";

#[derive(Parser, Debug)]
#[command(name = "etf-dashboard")]
#[command(about = "ETF return and risk metrics dashboard")]
struct Cli {
    /// Storage directory for config.json, results and exports
    /// (defaults to `storage` next to the binary)
    #[arg(long, global = true)]
    storage: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch prices, compute metrics, print the table and export the CSV
    Update {
        /// Also push the CSV to the configured GitHub repository
        #[arg(long)]
        sync: bool,

        /// Only show these groups (repeatable)
        #[arg(long = "group")]
        groups: Vec<String>,

        /// Column to sort by within each group, e.g. "Sharpe Ratio"
        #[arg(long, default_value = "Group")]
        sort: String,

        /// Clear the terminal before printing
        #[arg(long)]
        clear: bool,
    },
    /// Interactive dashboard over the last saved results
    Tui,
    /// Push the last exported CSV to GitHub
    Sync,
    /// Verify the GitHub token and repository access
    CheckGithub,
}

fn parse_sort(label: &str) -> Result<SortKey> {
    if label.trim().eq_ignore_ascii_case(SortKey::Group.label()) {
        return Ok(SortKey::Group);
    }
    MetricColumn::from_label(label)
        .map(SortKey::Metric)
        .with_context(|| {
            let known: Vec<_> = SortKey::all().iter().map(|k| k.label()).collect();
            format!("unknown sort column {:?}, expected one of: {}", label, known.join(", "))
        })
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into())
}

/// The TUI owns the terminal, so its logs go to a file in the storage directory.
fn init_tracing(storage: &AsyncStorageManager, to_file: bool) -> Result<()> {
    if to_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(storage.path(LOG_FILE))?;
        tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_writer(std::io::stderr)
            .init();
    }
    Ok(())
}

async fn update(
    storage: &AsyncStorageManager,
    config: &AppConfig,
    sync: bool,
    groups: &[String],
    sort: SortKey,
    clear: bool,
) -> Result<()> {
    let report = analysis::run_analysis_pipeline(storage, config).await?;
    comfy_table::run(&report, groups, sort, clear)?;

    let path = analysis::export_report(storage, config, &report).await?;
    println!("\nSaved {}", path.display());

    if sync {
        // The computed data is already saved, a failed push only gets reported.
        match analysis::push_report(config, &report).await {
            Ok(outcome) => {
                let action = if outcome.created { "created" } else { "updated" };
                println!("GitHub file {}", action);
                if let Some(url) = outcome.commit_url {
                    println!("Commit: {}", url);
                }
            }
            Err(e) => {
                error!(error = %format!("{:#}", e), "GitHub update failed");
                eprintln!("GitHub update failed: {:#}", e);
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let storage = match &cli.storage {
        Some(dir) => AsyncStorageManager::new(dir).await?,
        None => AsyncStorageManager::new_relative("storage").await?,
    };
    init_tracing(&storage, matches!(cli.command, Command::Tui))?;

    let config: AppConfig = storage
        .load_or_init(CONFIG_FILE)
        .await
        .with_context(|| format!("reading {}", storage.path("config.json").display()))?;
    info!(storage = %storage.base_dir.display(), "config loaded");

    match cli.command {
        Command::Update { sync, groups, sort, clear } => {
            let sort = parse_sort(&sort)?;
            update(&storage, &config, sync, &groups, sort, clear).await?;
        }
        Command::Tui => tui::run_tui(storage, config).await?,
        Command::Sync => {
            let outcome = analysis::push_exported(&storage, &config).await?;
            let action = if outcome.created { "created" } else { "updated" };
            println!("GitHub file {}", action);
            if let Some(url) = outcome.file_url {
                println!("{}", url);
            }
        }
        Command::CheckGithub => {
            let github = config
                .github
                .clone()
                .context("no `github` section in config.json")?;
            let repo = GithubSync::from_env(github)?.check_connection().await?;
            println!("GitHub connection OK: {}", repo);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sort() {
        assert_eq!(parse_sort("group").unwrap(), SortKey::Group);
        assert_eq!(
            parse_sort("Sharpe Ratio").unwrap(),
            SortKey::Metric(MetricColumn::SharpeRatio)
        );
        assert_eq!(
            parse_sort(" ytd return (%)").unwrap(),
            SortKey::Metric(MetricColumn::YtdReturn)
        );
        assert!(parse_sort("Alpha").is_err());
    }

    #[test]
    fn test_cli_update_flags() {
        let cli = Cli::parse_from([
            "etf-dashboard",
            "--storage",
            "/tmp/etf",
            "update",
            "--sync",
            "--group",
            "Bonds",
            "--group",
            "Equity",
        ]);
        assert_eq!(cli.storage, Some(PathBuf::from("/tmp/etf")));
        let Command::Update { sync, groups, sort, clear } = cli.command else {
            panic!("expected update");
        };
        assert!(sync);
        assert!(!clear);
        assert_eq!(groups, vec!["Bonds", "Equity"]);
        assert_eq!(sort, "Group");
    }
}
