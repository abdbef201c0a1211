/*
[INPUT]:  Error sources (transport, wire protocol, HTTP, serialization)
[OUTPUT]: Structured error types with retry hints
[POS]:    Error handling layer - unified error types for the adapter crate
[UPDATE]: When adding new error sources or improving error messages
*/

use reqwest::StatusCode;
use thiserror::Error;

/// Main error type for the gateway adapter
#[derive(Error, Debug)]
pub enum AdapterError {
    /// Transport could not be established or was lost
    #[error("Connection error: {0}")]
    Connection(String),

    /// Frame was malformed or did not match the gateway protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Client was closed and no longer accepts commands
    #[error("Gateway client is closed")]
    Closed,

    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response
    #[error("API error (code {code}): {message}")]
    Api { code: i32, message: String },

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// URL parsing failed
    #[error("Invalid URL: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rate limit exceeded
    #[error("Rate limit exceeded, retry after {retry_after}s")]
    RateLimit { retry_after: u64 },

    /// Operation timed out
    #[error("Timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
}

impl AdapterError {
    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AdapterError::Connection(_)
                | AdapterError::Http(_)
                | AdapterError::RateLimit { .. }
                | AdapterError::Timeout { .. }
        )
    }

    /// Get retry delay in seconds (if retryable)
    pub fn retry_delay(&self) -> Option<u64> {
        match self {
            AdapterError::RateLimit { retry_after } => Some(*retry_after),
            AdapterError::Timeout { .. } => Some(1),
            _ => None,
        }
    }

    /// Create an API error from status code and message
    pub fn api_error(status: StatusCode, message: impl Into<String>) -> Self {
        AdapterError::Api {
            code: status.as_u16() as i32,
            message: message.into(),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AdapterError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        AdapterError::Connection(err.to_string())
    }
}

/// Result type alias for adapter operations
pub type Result<T> = std::result::Result<T, AdapterError>;
