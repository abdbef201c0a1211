/*
[INPUT]:  YAML configuration file
[OUTPUT]: Parsed and validated feed configuration
[POS]:    Configuration layer - feed setup
[UPDATE]: When adding new configuration options
*/

use std::time::Duration;

use hyperfeed_adapter::{
    Channel, GatewayConfig, MAINNET_INFO_URL, ReconnectPolicy, interval_millis,
    normalize_timeframe,
};
use serde::{Deserialize, Serialize};

use crate::error::{DataError, Result};

const MAX_SYMBOL_LEN: usize = 32;

/// Top-level configuration for the market data layer
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeedConfig {
    /// Gateway WebSocket endpoint
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    /// Base URL of the REST info endpoint used for fallback reads
    #[serde(default = "default_info_url")]
    pub info_url: String,
    /// Symbols subscribed on start (e.g., "BTC")
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default = "default_channels")]
    pub channels: Vec<Channel>,
    /// Age after which a stream price counts as stale
    #[serde(default = "default_price_ttl_ms")]
    pub price_ttl_ms: u64,
    #[serde(default = "default_rest_timeout_ms")]
    pub rest_timeout_ms: u64,
    #[serde(default = "default_rest_days_back")]
    pub rest_days_back: u32,
    #[serde(default = "default_rest_timeframe")]
    pub rest_timeframe: String,
    /// Upper bound on waiting for background tasks in `stop()`
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
}

/// Reconnect backoff configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Consecutive connect failures before the stream is reported degraded
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval_ms(),
            timeout_ms: default_heartbeat_timeout_ms(),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            info_url: default_info_url(),
            symbols: Vec::new(),
            channels: default_channels(),
            price_ttl_ms: default_price_ttl_ms(),
            rest_timeout_ms: default_rest_timeout_ms(),
            rest_days_back: default_rest_days_back(),
            rest_timeframe: default_rest_timeframe(),
            stop_timeout_ms: default_stop_timeout_ms(),
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

fn default_ws_url() -> String {
    hyperfeed_adapter::MAINNET_WS_URL.to_string()
}

fn default_info_url() -> String {
    MAINNET_INFO_URL.to_string()
}

fn default_channels() -> Vec<Channel> {
    vec![Channel::Trades, Channel::L2Book]
}

fn default_price_ttl_ms() -> u64 {
    5_000
}

fn default_rest_timeout_ms() -> u64 {
    3_000
}

fn default_rest_days_back() -> u32 {
    1
}

fn default_rest_timeframe() -> String {
    "5m".to_string()
}

fn default_stop_timeout_ms() -> u64 {
    1_000
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_consecutive_failures() -> u32 {
    5
}

fn default_heartbeat_interval_ms() -> u64 {
    15_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    45_000
}

impl FeedConfig {
    /// Load configuration from YAML file
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Check timings and the REST fallback settings. Symbols are checked in
    /// [`validate_subscriptions`] since `start()` may receive its own list.
    pub fn validate(&self) -> Result<()> {
        if self.ws_url.trim().is_empty() {
            return Err(DataError::FatalConfig("ws_url is empty".to_string()));
        }
        if self.price_ttl_ms == 0 {
            return Err(DataError::FatalConfig("price_ttl_ms must be positive".to_string()));
        }
        if self.rest_timeout_ms == 0 {
            return Err(DataError::FatalConfig("rest_timeout_ms must be positive".to_string()));
        }
        if self.rest_days_back == 0 {
            return Err(DataError::FatalConfig("rest_days_back must be positive".to_string()));
        }
        if interval_millis(&normalize_timeframe(&self.rest_timeframe)).is_none() {
            return Err(DataError::FatalConfig(format!(
                "unsupported rest_timeframe: {}",
                self.rest_timeframe
            )));
        }
        if self.reconnect.base_delay_ms == 0 || self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(DataError::FatalConfig(
                "reconnect delays must satisfy 0 < base_delay_ms <= max_delay_ms".to_string(),
            ));
        }
        if self.reconnect.max_consecutive_failures == 0 {
            return Err(DataError::FatalConfig(
                "max_consecutive_failures must be positive".to_string(),
            ));
        }
        if self.heartbeat.interval_ms == 0 || self.heartbeat.timeout_ms <= self.heartbeat.interval_ms {
            return Err(DataError::FatalConfig(
                "heartbeat timings must satisfy 0 < interval_ms < timeout_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn price_ttl(&self) -> Duration {
        Duration::from_millis(self.price_ttl_ms)
    }

    pub fn rest_timeout(&self) -> Duration {
        Duration::from_millis(self.rest_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            url: self.ws_url.clone(),
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(self.reconnect.base_delay_ms),
                max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
                max_consecutive_failures: self.reconnect.max_consecutive_failures,
            },
            heartbeat_interval: Duration::from_millis(self.heartbeat.interval_ms),
            heartbeat_timeout: Duration::from_millis(self.heartbeat.timeout_ms),
            ..GatewayConfig::default()
        }
    }
}

/// Reject empty lists and malformed symbols before anything is subscribed.
pub fn validate_subscriptions(symbols: &[String], channels: &[Channel]) -> Result<()> {
    if symbols.is_empty() {
        return Err(DataError::FatalConfig("no symbols configured".to_string()));
    }
    if channels.is_empty() {
        return Err(DataError::FatalConfig("no channels configured".to_string()));
    }
    for symbol in symbols {
        if symbol.is_empty() || symbol.len() > MAX_SYMBOL_LEN {
            return Err(DataError::FatalConfig(format!("invalid symbol length: {symbol:?}")));
        }
        if symbol.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(DataError::FatalConfig(format!("invalid symbol: {symbol:?}")));
        }
    }
    Ok(())
}
