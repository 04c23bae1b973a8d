use ta::Next;
use ta::indicators::Maximum;

/// Trading days per year used to annualize daily figures.
pub const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Day-over-day fractional returns, `close[i] / close[i - 1] - 1`.
pub fn daily_returns(closes: &[f64]) -> Vec<f64> {
    closes.windows(2).map(|w| w[1] / w[0] - 1.0).collect()
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample standard deviation (n - 1 denominator). Needs at least two values.
pub fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(var.sqrt())
}

/// Highest close over the trailing `period` values, or over everything
/// available when there are fewer.
pub fn trailing_high(closes: &[f64], period: usize) -> Option<f64> {
    let mut maximum = Maximum::new(period).ok()?;

    let mut last_max: Option<f64> = None;
    for &close in closes {
        last_max = Some(maximum.next(close));
    }
    last_max
}
