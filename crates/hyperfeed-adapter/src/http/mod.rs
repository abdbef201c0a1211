/*
[INPUT]:  HTTP client configuration and info endpoint requests
[OUTPUT]: HTTP responses and typed API results
[POS]:    HTTP layer - REST fallback communication
[UPDATE]: When adding new info requests or changing client behavior
*/

pub mod candles;
pub mod client;

pub use candles::{OhlcvSource, bars_needed, bars_per_day, interval_millis, normalize_timeframe};
pub use client::{ClientConfig, InfoClient, MAINNET_INFO_URL};
