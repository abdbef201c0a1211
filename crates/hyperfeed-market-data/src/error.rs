/*
[INPUT]:  Failure sources in feed maintenance and manager startup
[OUTPUT]: DataError taxonomy for the market data layer
[POS]:    Error handling layer - market data crate
[UPDATE]: When adding new failure modes to feeds or the manager
*/

use hyperfeed_adapter::AdapterError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    /// Invalid symbol/channel/timing configuration; not retried
    #[error("Invalid configuration: {0}")]
    FatalConfig(String),

    /// Book delta arrived out of order
    #[error("Sequence gap on {symbol}: expected {expected}, received {received}")]
    SequenceGap {
        symbol: String,
        expected: u64,
        received: u64,
    },

    /// Update would leave best bid at or above best ask
    #[error("Crossed book on {symbol}")]
    CrossedBook { symbol: String },

    /// Delta for a book that has no valid snapshot yet
    #[error("Book for {symbol} is awaiting a snapshot")]
    BookNotReady { symbol: String },

    /// `start()` raced a `stop()` that has not finished
    #[error("Manager is stopping")]
    Stopping,

    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

impl DataError {
    /// Errors that the feed repairs by resynchronizing rather than surfacing
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DataError::SequenceGap { .. } | DataError::CrossedBook { .. } | DataError::BookNotReady { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, DataError>;
