/*
[INPUT]:  Gateway configuration and subscription channels
[OUTPUT]: Real-time market data frames and connection lifecycle events
[POS]:    WebSocket layer - real-time data streams
[UPDATE]: When adding new channels or changing connection logic
*/

pub mod backoff;
pub mod client;
pub mod message;

pub use backoff::Backoff;
pub use client::{
    ClientEvent, ConnectionState, GatewayClient, GatewayConfig, MAINNET_WS_URL, ReconnectPolicy,
};
pub use message::{GatewayMessage, Subscription};
