/*
[INPUT]:  Crate modules and public type definitions
[OUTPUT]: Public gateway adapter crate surface
[POS]:    Crate root - module wiring
[UPDATE]: When public modules or exports change
*/

pub mod error;
pub mod http;
pub mod types;
pub mod ws;

pub use error::{AdapterError, Result};

// Re-export commonly used types from http
pub use http::{
    ClientConfig, InfoClient, MAINNET_INFO_URL, OhlcvSource, bars_needed, bars_per_day,
    interval_millis, normalize_timeframe,
};

// Re-export all types
pub use types::*;

// Re-export commonly used types from ws
pub use ws::{
    ClientEvent,
    ConnectionState,
    GatewayClient,
    GatewayConfig,
    GatewayMessage,
    MAINNET_WS_URL,
    ReconnectPolicy,
    Subscription,
};
