/*
[INPUT]:  Coin, timeframe and lookback window
[OUTPUT]: OHLCV candles from the public info endpoint
[POS]:    HTTP layer - REST fallback market data (no auth required)
[UPDATE]: When adding timeframes or changing the candle request format
*/

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::debug;

use crate::error::{AdapterError, Result};
use crate::http::InfoClient;
use crate::types::Candle;

const MINUTE_MS: u64 = 60_000;
const HOUR_MS: u64 = 60 * MINUTE_MS;
const DAY_MS: u64 = 24 * HOUR_MS;

/// Tabular OHLCV source used when the stream cannot serve fresh data.
#[async_trait]
pub trait OhlcvSource: Send + Sync {
    /// Fetch `days_back` days of `timeframe` bars for `token`, oldest first.
    async fn get_data(&self, token: &str, days_back: u32, timeframe: &str) -> Result<Vec<Candle>>;
}

impl InfoClient {
    /// Query candles for a coin
    ///
    /// POST /info {"type": "candleSnapshot", "req": {coin, interval, startTime, endTime}}
    pub async fn candle_snapshot(
        &self,
        coin: &str,
        interval: &str,
        start_time: u64,
        end_time: u64,
    ) -> Result<Vec<Candle>> {
        let body = json!({
            "type": "candleSnapshot",
            "req": {
                "coin": coin,
                "interval": interval,
                "startTime": start_time,
                "endTime": end_time,
            }
        });
        let builder = self.info_request()?.json(&body);
        self.send_json(builder).await
    }
}

#[async_trait]
impl OhlcvSource for InfoClient {
    async fn get_data(&self, token: &str, days_back: u32, timeframe: &str) -> Result<Vec<Candle>> {
        let interval = normalize_timeframe(timeframe);
        let step = interval_millis(&interval)
            .ok_or_else(|| AdapterError::Config(format!("unsupported timeframe: {timeframe}")))?;
        let bars = bars_needed(days_back, timeframe);

        let end_time = Utc::now().timestamp_millis().max(0) as u64;
        let start_time = end_time.saturating_sub(bars.saturating_mul(step));
        debug!(token, %interval, bars, start_time, end_time, "requesting candle snapshot");

        let mut candles = self
            .candle_snapshot(token, &interval, start_time, end_time)
            .await?;
        candles.sort_by_key(|candle| candle.open_time);
        Ok(candles)
    }
}

/// Convert a user timeframe to the gateway's interval token (`1H` -> `1h`, `1D` -> `1d`).
pub fn normalize_timeframe(timeframe: &str) -> String {
    let trimmed = timeframe.trim();
    if trimmed.ends_with("month") || (trimmed.ends_with('M') && trimmed.len() > 1) {
        let count = trimmed.trim_end_matches("month").trim_end_matches('M');
        return format!("{count}M");
    }
    trimmed.replace('H', "h").replace('D', "d").replace('W', "w")
}

/// Bars per day for a timeframe; unknown timeframes count as hourly.
pub fn bars_per_day(timeframe: &str) -> f64 {
    match interval_millis(&normalize_timeframe(timeframe)) {
        Some(step) => DAY_MS as f64 / step as f64,
        None => 24.0,
    }
}

pub fn bars_needed(days_back: u32, timeframe: &str) -> u64 {
    ((days_back as f64 * bars_per_day(timeframe)) as u64).max(1)
}

/// Length of one bar in milliseconds for a normalized interval token.
pub fn interval_millis(interval: &str) -> Option<u64> {
    let step = match interval {
        "1m" => MINUTE_MS,
        "3m" => 3 * MINUTE_MS,
        "5m" => 5 * MINUTE_MS,
        "15m" => 15 * MINUTE_MS,
        "30m" => 30 * MINUTE_MS,
        "1h" => HOUR_MS,
        "2h" => 2 * HOUR_MS,
        "4h" => 4 * HOUR_MS,
        "6h" => 6 * HOUR_MS,
        "8h" => 8 * HOUR_MS,
        "12h" => 12 * HOUR_MS,
        "1d" => DAY_MS,
        "3d" => 3 * DAY_MS,
        "1w" => 7 * DAY_MS,
        "1M" => 30 * DAY_MS,
        _ => return None,
    };
    Some(step)
}
