//! Daily price history from the market-data provider.
//!
//! `PriceProvider` is the raw "daily OHLC for ticker X over a date range"
//! collaborator; `PriceFetcher` wraps one with the timeout/retry policy and
//! turns its rows into a clean `PriceSeries`.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::{Tz, US::Eastern};
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::series::{PriceSeries, SeriesError};
use crate::storage_utils::FetchConfig;

/// 52 weeks plus a buffer for the YTD base.
pub const MIN_LOOKBACK_DAYS: i64 = 370;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FetchError {
    #[error("invalid ticker symbol: {0:?}")]
    InvalidTicker(String),

    #[error("data unavailable for {ticker}: {reason}")]
    DataUnavailable { ticker: String, reason: String },

    #[error("provider returned no usable rows for {0}")]
    EmptySeries(String),
}

impl FetchError {
    fn unavailable(ticker: &str, reason: impl Into<String>) -> Self {
        FetchError::DataUnavailable {
            ticker: ticker.to_string(),
            reason: reason.into(),
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(self, FetchError::DataUnavailable { .. })
    }
}

impl From<SeriesError> for FetchError {
    fn from(err: SeriesError) -> Self {
        match err {
            SeriesError::Empty(ticker) => FetchError::EmptySeries(ticker),
        }
    }
}

/// One provider row, dated in the exchange's timezone. The close may be missing.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyBar {
    pub date: NaiveDate,
    pub close: Option<f64>,
}

/// Bars for one ticker plus the clock of the exchange it trades on.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyHistory {
    pub exchange_tz: Tz,
    /// Regular session close, exchange-local.
    pub session_close: NaiveTime,
    pub bars: Vec<DailyBar>,
}

impl DailyHistory {
    /// A US-listed history: New York time, 16:00 close.
    pub fn new_york(bars: Vec<DailyBar>) -> Self {
        Self {
            exchange_tz: Eastern,
            session_close: us_session_close(),
            bars,
        }
    }
}

fn us_session_close() -> NaiveTime {
    NaiveTime::from_hms_opt(16, 0, 0).unwrap_or(NaiveTime::MIN)
}

#[async_trait]
pub trait PriceProvider: Send + Sync {
    /// Daily bars for `ticker` between `start` and `end`, both inclusive.
    async fn daily_bars(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<DailyHistory, FetchError>;
}

pub struct PriceFetcher<P> {
    provider: P,
    config: FetchConfig,
}

impl<P: PriceProvider> PriceFetcher<P> {
    pub fn new(provider: P, config: FetchConfig) -> Self {
        Self { provider, config }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Default lookback from the configuration.
    pub fn lookback(&self) -> Duration {
        Duration::days(self.config.lookback_days)
    }

    pub async fn fetch(&self, ticker: &str, lookback: Duration) -> Result<PriceSeries, FetchError> {
        self.fetch_at(ticker, lookback, Utc::now().with_timezone(&Eastern))
            .await
    }

    /// `fetch` against an explicit clock. A batch passes one instant to every
    /// ticker; each one judges it against its own exchange's session.
    pub async fn fetch_at(
        &self,
        ticker: &str,
        lookback: Duration,
        now: DateTime<Tz>,
    ) -> Result<PriceSeries, FetchError> {
        let ticker = ticker.trim();
        if ticker.is_empty() {
            return Err(FetchError::InvalidTicker(ticker.to_string()));
        }

        let lookback = lookback.max(Duration::days(MIN_LOOKBACK_DAYS));
        // One day past the local date so exchanges ahead of this clock are covered.
        let end = now.date_naive() + Duration::days(1);
        let start = end - lookback;

        let history = self.daily_bars_with_retry(ticker, start, end).await?;
        if history.bars.is_empty() {
            return Err(FetchError::EmptySeries(ticker.to_string()));
        }

        let series = PriceSeries::new(ticker, history.bars.iter().map(|b| (b.date, b.close)))?;

        if self.config.drop_unsettled_session {
            Ok(drop_unsettled_session(series, &history, now)?)
        } else {
            Ok(series)
        }
    }

    async fn daily_bars_with_retry(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<DailyHistory, FetchError> {
        let mut attempt: u32 = 0;
        loop {
            match self.provider.daily_bars(ticker, start, end).await {
                Ok(history) => return Ok(history),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let wait = backoff_delay(self.config.retry_backoff_ms, attempt);
                    debug!(%ticker, attempt, ?wait, error = %e, "retrying price fetch");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Exponential backoff: base, 2x base, 4x base, ...
pub fn backoff_delay(base_ms: u64, attempt: u32) -> std::time::Duration {
    let factor = 1u64.checked_shl(attempt.min(16)).unwrap_or(u64::MAX);
    std::time::Duration::from_millis(base_ms.saturating_mul(factor))
}

/// Drops today's bar while the exchange's regular session is still trading,
/// so every figure describes settled closes only. "Today" and the close are
/// taken on the exchange's own clock.
///
/// A bar that is the only one held is kept: a fund on its first trading day
/// becomes a row with just its latest price rather than a failure.
pub fn drop_unsettled_session<T: TimeZone>(
    series: PriceSeries,
    history: &DailyHistory,
    now: DateTime<T>,
) -> Result<PriceSeries, SeriesError> {
    let local = now.with_timezone(&history.exchange_tz);
    let today = local.date_naive();

    let unsettled = series.last().date == today && local.time() < history.session_close;
    if unsettled && series.len() > 1 {
        series.before(today)
    } else {
        Ok(series)
    }
}

// --- Yahoo Finance chart API ---

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: Chart,
}

#[derive(Debug, Deserialize)]
struct Chart {
    result: Option<Vec<ChartData>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    meta: Option<ChartMeta>,
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartMeta {
    exchange_timezone_name: Option<String>,
    current_trading_period: Option<TradingPeriods>,
}

#[derive(Debug, Deserialize)]
struct TradingPeriods {
    regular: Option<TradingPeriod>,
}

#[derive(Debug, Deserialize)]
struct TradingPeriod {
    end: i64,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    #[serde(default)]
    quote: Vec<Quote>,
    adjclose: Option<Vec<AdjClose>>,
}

#[derive(Debug, Default, Deserialize)]
struct Quote {
    #[serde(default)]
    close: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct AdjClose {
    #[serde(default)]
    adjclose: Vec<Option<f64>>,
}

pub struct YahooProvider {
    client: Client,
    base_url: String,
    adjusted_close: bool,
}

impl YahooProvider {
    pub fn new(config: &FetchConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .pool_max_idle_per_host(config.concurrency.max(1))
            .user_agent("Mozilla/5.0 (etf-dashboard)")
            .build()?;

        Ok(Self {
            client,
            base_url: config.provider_url.trim_end_matches('/').to_string(),
            adjusted_close: config.adjusted_close,
        })
    }
}

#[async_trait]
impl PriceProvider for YahooProvider {
    async fn daily_bars(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<DailyHistory, FetchError> {
        let url = format!("{}/{}", self.base_url, ticker);
        let period1 = unix_midnight(start);
        // period2 is exclusive on the provider side
        let period2 = unix_midnight(end + Duration::days(1));

        let response = self
            .client
            .get(&url)
            .query(&[
                ("period1", period1.to_string()),
                ("period2", period2.to_string()),
                ("interval", "1d".to_string()),
                ("events", "history".to_string()),
            ])
            .send()
            .await
            .map_err(|e| FetchError::unavailable(ticker, e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::unavailable(ticker, e.to_string()))?;

        if !status.is_success() {
            // Unknown symbols come back as 404 with a chart.error payload.
            let reason = serde_json::from_str::<ChartResponse>(&body)
                .ok()
                .and_then(|r| r.chart.error)
                .map(|e| format!("{} ({}): {}", status, e.code, e.description))
                .unwrap_or_else(|| status.to_string());
            warn!(%ticker, %reason, "provider rejected request");
            return Err(FetchError::unavailable(ticker, reason));
        }

        parse_chart(ticker, &body, self.adjusted_close)
    }
}

fn unix_midnight(date: NaiveDate) -> i64 {
    date.and_time(NaiveTime::MIN).and_utc().timestamp()
}

/// Parses a chart-API payload into daily bars dated in the exchange's timezone.
/// Without timezone metadata the exchange is taken to be New York.
pub fn parse_chart(ticker: &str, body: &str, adjusted_close: bool) -> Result<DailyHistory, FetchError> {
    let response: ChartResponse = serde_json::from_str(body)
        .map_err(|e| FetchError::unavailable(ticker, format!("invalid response: {}", e)))?;

    if let Some(err) = response.chart.error {
        return Err(FetchError::unavailable(
            ticker,
            format!("{}: {}", err.code, err.description),
        ));
    }

    let data = response
        .chart
        .result
        .and_then(|r| r.into_iter().next())
        .ok_or_else(|| FetchError::unavailable(ticker, "no chart result"))?;

    let (tz, session_end) = match data.meta {
        Some(meta) => (
            meta.exchange_timezone_name.and_then(|name| name.parse::<Tz>().ok()),
            meta.current_trading_period.and_then(|p| p.regular).map(|r| r.end),
        ),
        None => (None, None),
    };
    let exchange_tz = tz.unwrap_or(Eastern);
    let session_close = session_end
        .and_then(|end| exchange_tz.timestamp_opt(end, 0).single())
        .map(|end| end.time())
        .unwrap_or_else(us_session_close);

    let Some(timestamps) = data.timestamp else {
        return Ok(DailyHistory { exchange_tz, session_close, bars: Vec::new() });
    };

    let quote = data.indicators.quote.into_iter().next().unwrap_or_default();
    let adjclose = data
        .indicators
        .adjclose
        .and_then(|a| a.into_iter().next())
        .map(|a| a.adjclose)
        .filter(|_| adjusted_close);

    let at = |values: &Vec<Option<f64>>, i: usize| values.get(i).copied().flatten();

    let bars = timestamps
        .iter()
        .enumerate()
        .filter_map(|(i, &ts)| {
            let date = exchange_tz.timestamp_opt(ts, 0).single()?.date_naive();
            let close = match &adjclose {
                Some(adj) => at(adj, i),
                None => at(&quote.close, i),
            };
            Some(DailyBar { date, close })
        })
        .collect();

    Ok(DailyHistory { exchange_tz, session_close, bars })
}
