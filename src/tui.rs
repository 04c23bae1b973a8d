use anyhow::Result;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEvent},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::{
    prelude::*,
    text::Line,
    widgets::{Block, Borders, Cell, Clear, Paragraph, Row, Table},
};
use std::io;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::analysis::{self, BatchReport};
use crate::export::format_value;
use crate::filter_utils::{SortKey, filter_and_sort};
use crate::metrics::{Metric, MetricColumn};
use crate::storage_utils::{AppConfig, AsyncStorageManager};

const ALL_GROUPS: &str = "All";

// --- Background work results ---

enum Update {
    Refreshed(Result<BatchReport>),
    Exported(Result<String>),
    Synced(Result<String>),
}

// --- App State ---

struct App {
    report: Option<BatchReport>,
    groups: Vec<String>,
    selected_group_index: usize,
    sort_keys: Vec<SortKey>,
    sort_index: usize,
    busy: Option<&'static str>,
    status: String,
}

impl App {
    fn new(report: Option<BatchReport>) -> Self {
        let mut app = Self {
            report: None,
            groups: vec![ALL_GROUPS.to_string()],
            selected_group_index: 0,
            sort_keys: SortKey::all(),
            sort_index: 0,
            busy: None,
            status: "F5 refreshes data".to_string(),
        };
        if let Some(report) = report {
            app.set_report(report);
        }
        app
    }

    fn set_report(&mut self, report: BatchReport) {
        let mut groups: Vec<String> = report.rows.iter().map(|r| r.entry.group.clone()).collect();
        groups.sort();
        groups.dedup();

        self.groups = std::iter::once(ALL_GROUPS.to_string()).chain(groups).collect();
        self.selected_group_index = self.selected_group_index.min(self.groups.len() - 1);
        self.report = Some(report);
    }

    fn selected_groups(&self) -> Vec<String> {
        match self.selected_group_index {
            0 => Vec::new(),
            i => vec![self.groups[i].clone()],
        }
    }

    fn sort_key(&self) -> SortKey {
        self.sort_keys[self.sort_index]
    }

    fn apply(&mut self, update: Update) {
        self.busy = None;
        self.status = match update {
            Update::Refreshed(Ok(report)) => {
                let msg = format!(
                    "Data updated: {} complete, {} partial, {} failed",
                    report.complete_count(),
                    report.partial_count(),
                    report.failures.len()
                );
                self.set_report(report);
                msg
            }
            Update::Exported(Ok(msg)) | Update::Synced(Ok(msg)) => msg,
            Update::Refreshed(Err(e)) => format!("Refresh failed: {:#}", e),
            Update::Exported(Err(e)) => format!("Export failed: {:#}", e),
            Update::Synced(Err(e)) => format!("GitHub update failed: {:#}", e),
        };
    }
}

// --- TUI ---

pub async fn run_tui(storage: AsyncStorageManager, config: AppConfig) -> Result<()> {
    let initial = analysis::load_last_report(&storage).await.ok();

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let res = run_app(&mut terminal, App::new(initial), storage, config).await;

    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;
    res
}

async fn run_app<B: Backend>(
    terminal: &mut Terminal<B>,
    mut app: App,
    storage: AsyncStorageManager,
    config: AppConfig,
) -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<Update>(4);

    loop {
        terminal.draw(|f| ui(f, &app))?;

        if let Ok(update) = rx.try_recv() {
            app.apply(update);
        }

        if event::poll(Duration::from_millis(50))? {
            // Resize needs no handling, the next draw picks up the new size.
            if let Event::Key(key) = event::read()? {
                if !handle_key_event(key, &mut app, &tx, &storage, &config) {
                    return Ok(());
                }
            }
        }
    }
}

fn handle_key_event(
    key: KeyEvent,
    app: &mut App,
    tx: &mpsc::Sender<Update>,
    storage: &AsyncStorageManager,
    config: &AppConfig,
) -> bool {
    match key.code {
        KeyCode::Char('q') => return false,
        KeyCode::F(5) if app.busy.is_none() => {
            app.busy = Some("Running analysis pipeline...");
            let (tx, storage, config) = (tx.clone(), storage.clone(), config.clone());
            tokio::spawn(async move {
                let result = analysis::run_analysis_pipeline(&storage, &config).await;
                let _ = tx.send(Update::Refreshed(result)).await;
            });
        }
        KeyCode::Char('e') if app.busy.is_none() => {
            if let Some(report) = app.report.clone() {
                app.busy = Some("Exporting...");
                let (tx, storage, config) = (tx.clone(), storage.clone(), config.clone());
                tokio::spawn(async move {
                    let result = analysis::export_report(&storage, &config, &report)
                        .await
                        .map(|path| format!("Saved {}", path.display()));
                    let _ = tx.send(Update::Exported(result)).await;
                });
            } else {
                app.status = "Refresh the data first".to_string();
            }
        }
        KeyCode::Char('g') if app.busy.is_none() => {
            if let Some(report) = app.report.clone() {
                app.busy = Some("Uploading to GitHub...");
                let (tx, config) = (tx.clone(), config.clone());
                tokio::spawn(async move {
                    let result = analysis::push_report(&config, &report).await.map(|outcome| {
                        let action = if outcome.created { "created" } else { "updated" };
                        match outcome.commit_url {
                            Some(url) => format!("GitHub file {}: {}", action, url),
                            None => format!("GitHub file {}", action),
                        }
                    });
                    let _ = tx.send(Update::Synced(result)).await;
                });
            } else {
                app.status = "Refresh the data first".to_string();
            }
        }
        KeyCode::Char('s') | KeyCode::Right => {
            app.sort_index = (app.sort_index + 1) % app.sort_keys.len();
        }
        KeyCode::Left => {
            app.sort_index = app
                .sort_index
                .checked_sub(1)
                .unwrap_or(app.sort_keys.len() - 1);
        }
        KeyCode::Up => {
            app.selected_group_index = app
                .selected_group_index
                .checked_sub(1)
                .unwrap_or(app.groups.len() - 1);
        }
        KeyCode::Down => {
            app.selected_group_index = (app.selected_group_index + 1) % app.groups.len();
        }
        KeyCode::Char(c) if c.is_ascii_digit() => {
            let digit = c.to_digit(10).unwrap_or(0) as usize;
            if digit > 0 && digit <= app.groups.len() {
                app.selected_group_index = digit - 1;
            }
        }
        _ => {}
    }
    true
}

fn short_label(column: MetricColumn) -> &'static str {
    match column {
        MetricColumn::Close => "Close",
        MetricColumn::DailyReturn => "1D%",
        MetricColumn::WeeklyReturn => "1W%",
        MetricColumn::MonthlyReturn => "1M%",
        MetricColumn::YtdReturn => "YTD%",
        MetricColumn::Return22d => "22D%",
        MetricColumn::Return132d => "132D%",
        MetricColumn::Return264d => "264D%",
        MetricColumn::VolUltraShort => "VolUS%",
        MetricColumn::VolShort => "VolS%",
        MetricColumn::VolLong => "VolL%",
        MetricColumn::MaxDrawdown => "MDD%",
        MetricColumn::High52wDrawdown => "52WH%",
        MetricColumn::SharpeRatio => "Sharpe",
    }
}

fn metric_cell(metric: Metric) -> Cell<'static> {
    match metric.value() {
        Some(v) => {
            let color = if v > 0.0 {
                Color::Green
            } else if v < 0.0 {
                Color::Red
            } else {
                Color::Gray
            };
            Cell::from(format_value(v)).style(Style::default().fg(color))
        }
        None => Cell::from("N/A").style(Style::default().fg(Color::DarkGray)),
    }
}

fn ui(f: &mut Frame, app: &App) {
    let main_layout = Layout::horizontal([Constraint::Percentage(15), Constraint::Percentage(85)])
        .split(f.size());

    let right_chunks = Layout::vertical([
        Constraint::Length(3),
        Constraint::Min(0),
        Constraint::Length(3),
    ])
    .split(main_layout[1]);

    // Sidebar: group filter
    let sidebar_block = Block::default()
        .borders(Borders::ALL)
        .title("Groups")
        .title_alignment(Alignment::Center);
    let inner_sidebar_area = sidebar_block.inner(main_layout[0]);
    f.render_widget(sidebar_block, main_layout[0]);

    let sidebar_chunks = Layout::vertical([Constraint::Min(1), Constraint::Length(5)])
        .split(inner_sidebar_area);

    let group_lines: Vec<Line> = app
        .groups
        .iter()
        .enumerate()
        .map(|(i, group)| {
            if i == app.selected_group_index {
                Line::styled(group.clone(), Style::default().fg(Color::Yellow).bg(Color::DarkGray))
            } else {
                Line::from(group.clone())
            }
        })
        .collect();
    f.render_widget(Paragraph::new(group_lines), sidebar_chunks[0]);

    f.render_widget(
        Paragraph::new("F5 refresh\ns sort\ne export\ng GitHub\nq quit"),
        sidebar_chunks[1],
    );

    // Header
    let base_date = app
        .report
        .as_ref()
        .and_then(|r| r.as_of())
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "Never".to_string());
    f.render_widget(
        Block::default()
            .borders(Borders::ALL)
            .title_alignment(Alignment::Center)
            .title(format!(
                "Base date: {}  |  Sort: {}",
                base_date,
                app.sort_key().label()
            )),
        right_chunks[0],
    );

    // Metrics table
    let mut header_cells = vec![Cell::from("Ticker"), Cell::from("Name"), Cell::from("Group")];
    header_cells.extend(MetricColumn::ALL.iter().map(|c| Cell::from(short_label(*c))));
    let header = Row::new(header_cells).style(Style::default().bg(Color::DarkGray));

    let groups = app.selected_groups();
    let rows: Vec<Row> = app
        .report
        .as_ref()
        .map(|report| filter_and_sort(&report.rows, &groups, app.sort_key()))
        .unwrap_or_default()
        .into_iter()
        .map(|row| {
            let mut cells = vec![
                Cell::from(row.entry.ticker.clone()).style(Style::default().fg(Color::Cyan)),
                Cell::from(row.entry.name.clone()),
                Cell::from(row.entry.group.clone()).style(Style::default().fg(Color::Gray)),
            ];
            cells.extend(MetricColumn::ALL.iter().map(|c| metric_cell(row.metrics.get(*c))));
            Row::new(cells).height(1)
        })
        .collect();

    let mut widths = vec![
        Constraint::Length(8),  // Ticker
        Constraint::Min(12),    // Name: flexible
        Constraint::Length(10), // Group
    ];
    widths.extend(MetricColumn::ALL.iter().map(|_| Constraint::Length(7)));

    let failed = app.report.as_ref().map_or(0, |r| r.failures.len());
    f.render_widget(
        Table::new(rows, widths)
            .header(header)
            .block(Block::default().borders(Borders::ALL).title("ETF Metrics")),
        right_chunks[1],
    );

    // Status line, including which tickers failed outright
    let mut status = app.status.clone();
    if failed > 0 {
        let tickers: Vec<&str> = app
            .report
            .iter()
            .flat_map(|r| r.failures.iter().map(|x| x.entry.ticker.as_str()))
            .collect();
        status = format!("{}  |  Failed: {}", status, tickers.join(", "));
    }
    f.render_widget(
        Paragraph::new(status).block(Block::default().borders(Borders::ALL)),
        right_chunks[2],
    );

    if let Some(message) = app.busy {
        let area = centered_rect(60, 20, main_layout[1]);
        f.render_widget(Clear, area);
        f.render_widget(
            Paragraph::new(format!("{}\nPlease wait.", message))
                .block(Block::default().title("Working").borders(Borders::ALL))
                .alignment(Alignment::Center),
            area,
        );
    }
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::vertical([
        Constraint::Percentage((100 - percent_y) / 2),
        Constraint::Percentage(percent_y),
        Constraint::Percentage((100 - percent_y) / 2),
    ])
    .split(r);
    Layout::horizontal([
        Constraint::Percentage((100 - percent_x) / 2),
        Constraint::Percentage(percent_x),
        Constraint::Percentage((100 - percent_x) / 2),
    ])
    .split(popup_layout[1])[1]
}
