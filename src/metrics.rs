//! Return and risk metrics over a single price series.
//!
//! `compute` is a pure function: no I/O, no shared state, safe to call from
//! any number of tasks at once. Fields that cannot be produced are flagged
//! per field (`Metric::InsufficientHistory`, `Metric::Undefined`) instead of
//! failing the whole row. Nothing is rounded here.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::indicators::{self, TRADING_DAYS_PER_YEAR};
use crate::series::PriceSeries;

pub const DAILY_DAYS: usize = 1;
pub const WEEKLY_DAYS: usize = 5;
pub const MONTHLY_DAYS: usize = 22;

/// Fixed trading-day windows approximating 1 month, 6 months and 1 year.
pub const RETURN_WINDOWS: [usize; 3] = [22, 132, 264];

pub const VOL_ULTRA_SHORT_DAYS: usize = 5;
pub const VOL_SHORT_DAYS: usize = 22;
pub const VOL_LONG_DAYS: usize = 252;

pub const HIGH_WINDOW_DAYS: usize = 252;

const ZERO_VARIANCE_TOLERANCE: f64 = 1e-12;

/// A single computed figure, or the reason it is missing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Value(f64),
    /// The series is too short for this window.
    InsufficientHistory,
    /// The formula has no finite answer (e.g. zero variance).
    Undefined,
}

impl Metric {
    fn finite(v: f64) -> Self {
        if v.is_finite() { Metric::Value(v) } else { Metric::Undefined }
    }

    pub fn value(&self) -> Option<f64> {
        match self {
            Metric::Value(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Metric::Value(_))
    }
}

/// The metric columns of a row, in presentation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricColumn {
    Close,
    DailyReturn,
    WeeklyReturn,
    MonthlyReturn,
    YtdReturn,
    Return22d,
    Return132d,
    Return264d,
    VolUltraShort,
    VolShort,
    VolLong,
    MaxDrawdown,
    High52wDrawdown,
    SharpeRatio,
}

impl MetricColumn {
    pub const ALL: [MetricColumn; 14] = [
        MetricColumn::Close,
        MetricColumn::DailyReturn,
        MetricColumn::WeeklyReturn,
        MetricColumn::MonthlyReturn,
        MetricColumn::YtdReturn,
        MetricColumn::Return22d,
        MetricColumn::Return132d,
        MetricColumn::Return264d,
        MetricColumn::VolUltraShort,
        MetricColumn::VolShort,
        MetricColumn::VolLong,
        MetricColumn::MaxDrawdown,
        MetricColumn::High52wDrawdown,
        MetricColumn::SharpeRatio,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            MetricColumn::Close => "Close",
            MetricColumn::DailyReturn => "Daily Return (%)",
            MetricColumn::WeeklyReturn => "Weekly Return (%)",
            MetricColumn::MonthlyReturn => "Monthly Return (%)",
            MetricColumn::YtdReturn => "YTD Return (%)",
            MetricColumn::Return22d => "22 Days Return (%)",
            MetricColumn::Return132d => "132 Days Return (%)",
            MetricColumn::Return264d => "264 Days Return (%)",
            MetricColumn::VolUltraShort => "Ultra-Short Vol (%)",
            MetricColumn::VolShort => "Short-term Vol (%)",
            MetricColumn::VolLong => "Long-term Vol (%)",
            MetricColumn::MaxDrawdown => "MDD (%)",
            MetricColumn::High52wDrawdown => "52W High Drawdown (%)",
            MetricColumn::SharpeRatio => "Sharpe Ratio",
        }
    }

    /// Case-insensitive lookup by column label.
    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.trim();
        Self::ALL.into_iter().find(|c| c.label().eq_ignore_ascii_case(label))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowStatus {
    Complete,
    /// Emitted, but at least one field is unavailable.
    Partial,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRow {
    pub ticker: String,
    /// Date of the latest close the row describes.
    pub as_of: NaiveDate,
    pub close: f64,
    pub weekly_base_date: Option<NaiveDate>,
    pub monthly_base_date: Option<NaiveDate>,

    pub daily_return: Metric,
    pub weekly_return: Metric,
    pub monthly_return: Metric,
    pub ytd_return: Metric,
    pub return_22d: Metric,
    pub return_132d: Metric,
    pub return_264d: Metric,

    pub vol_ultra_short: Metric,
    pub vol_short: Metric,
    pub vol_long: Metric,

    pub max_drawdown: Metric,
    pub high_52w_drawdown: Metric,
    pub sharpe_ratio: Metric,
}

impl MetricRow {
    pub fn get(&self, column: MetricColumn) -> Metric {
        match column {
            MetricColumn::Close => Metric::Value(self.close),
            MetricColumn::DailyReturn => self.daily_return,
            MetricColumn::WeeklyReturn => self.weekly_return,
            MetricColumn::MonthlyReturn => self.monthly_return,
            MetricColumn::YtdReturn => self.ytd_return,
            MetricColumn::Return22d => self.return_22d,
            MetricColumn::Return132d => self.return_132d,
            MetricColumn::Return264d => self.return_264d,
            MetricColumn::VolUltraShort => self.vol_ultra_short,
            MetricColumn::VolShort => self.vol_short,
            MetricColumn::VolLong => self.vol_long,
            MetricColumn::MaxDrawdown => self.max_drawdown,
            MetricColumn::High52wDrawdown => self.high_52w_drawdown,
            MetricColumn::SharpeRatio => self.sharpe_ratio,
        }
    }

    pub fn status(&self) -> RowStatus {
        if MetricColumn::ALL.iter().all(|c| self.get(*c).is_available()) {
            RowStatus::Complete
        } else {
            RowStatus::Partial
        }
    }

    pub fn unavailable_columns(&self) -> Vec<MetricColumn> {
        MetricColumn::ALL
            .into_iter()
            .filter(|c| !self.get(*c).is_available())
            .collect()
    }
}

/// Computes the full metric row for one series.
pub fn compute(series: &PriceSeries) -> MetricRow {
    let closes = series.closes();
    let last = series.last();

    MetricRow {
        ticker: series.ticker().to_string(),
        as_of: last.date,
        close: last.close,
        weekly_base_date: series.back(WEEKLY_DAYS).map(|p| p.date),
        monthly_base_date: series.back(MONTHLY_DAYS).map(|p| p.date),

        daily_return: simple_return(series, DAILY_DAYS),
        weekly_return: simple_return(series, WEEKLY_DAYS),
        monthly_return: simple_return(series, MONTHLY_DAYS),
        ytd_return: ytd_return(series),
        return_22d: simple_return(series, RETURN_WINDOWS[0]),
        return_132d: simple_return(series, RETURN_WINDOWS[1]),
        return_264d: simple_return(series, RETURN_WINDOWS[2]),

        vol_ultra_short: volatility(&closes, VOL_ULTRA_SHORT_DAYS),
        vol_short: volatility(&closes, VOL_SHORT_DAYS),
        vol_long: volatility(&closes, VOL_LONG_DAYS),

        max_drawdown: max_drawdown(&closes),
        high_52w_drawdown: high_drawdown(&closes, HIGH_WINDOW_DAYS),
        sharpe_ratio: sharpe_ratio(&closes),
    }
}

/// `(P_t / P_{t-n} - 1) * 100`.
pub fn simple_return(series: &PriceSeries, n: usize) -> Metric {
    match series.back(n) {
        Some(base) => Metric::finite((series.last().close / base.close - 1.0) * 100.0),
        None => Metric::InsufficientHistory,
    }
}

/// Return since the first close of the latest point's calendar year.
///
/// The series has to reach back to the year boundary, otherwise the first
/// close we hold is not the first close of the year.
pub fn ytd_return(series: &PriceSeries) -> Metric {
    let last = series.last();
    let Some(jan_first) = NaiveDate::from_ymd_opt(last.date.year(), 1, 1) else {
        return Metric::Undefined;
    };

    if series.first().date > jan_first {
        return Metric::InsufficientHistory;
    }

    match series.first_on_or_after(jan_first) {
        Some(base) => Metric::finite((last.close / base.close - 1.0) * 100.0),
        None => Metric::InsufficientHistory,
    }
}

/// Annualized standard deviation of the daily returns inside the trailing
/// `window` closes, as a percentage.
pub fn volatility(closes: &[f64], window: usize) -> Metric {
    if closes.len() < window {
        return Metric::InsufficientHistory;
    }
    let start = closes.len() - window;
    let returns = indicators::daily_returns(&closes[start..]);

    match indicators::sample_std(&returns) {
        Some(std) => Metric::finite(std * TRADING_DAYS_PER_YEAR.sqrt() * 100.0),
        None => Metric::InsufficientHistory,
    }
}

/// Deepest decline from a running peak, as a percentage (always <= 0).
pub fn max_drawdown(closes: &[f64]) -> Metric {
    if closes.is_empty() {
        return Metric::InsufficientHistory;
    }

    let mut peak = f64::MIN;
    let mut worst = 0.0_f64;
    for &close in closes {
        peak = peak.max(close);
        worst = worst.min(close / peak - 1.0);
    }
    Metric::finite(worst * 100.0)
}

/// Distance of the last close from the highest close of the trailing
/// `window`, falling back to the whole series when it is shorter.
pub fn high_drawdown(closes: &[f64], window: usize) -> Metric {
    let (Some(&last), Some(high)) = (closes.last(), indicators::trailing_high(closes, window)) else {
        return Metric::InsufficientHistory;
    };
    Metric::finite((last / high - 1.0) * 100.0)
}

/// Annualized Sharpe ratio of daily returns with a zero risk-free rate.
pub fn sharpe_ratio(closes: &[f64]) -> Metric {
    let returns = indicators::daily_returns(closes);
    let (Some(mean), Some(std)) = (indicators::mean(&returns), indicators::sample_std(&returns)) else {
        return Metric::InsufficientHistory;
    };

    if std <= ZERO_VARIANCE_TOLERANCE * mean.abs().max(1.0) {
        return Metric::Undefined;
    }
    Metric::finite(mean / std * TRADING_DAYS_PER_YEAR.sqrt())
}
