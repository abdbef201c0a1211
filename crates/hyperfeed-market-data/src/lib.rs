/*
[INPUT]:  Public API exports for hyperfeed-market-data crate
[OUTPUT]: Module declarations and public re-exports
[POS]:    Crate root - library entry point
[UPDATE]: When adding new modules or public exports
*/

pub mod config;
pub mod error;
pub mod manager;
pub mod order_book;
pub mod price_feed;
pub mod source;

// Re-export main types for convenience
pub use config::FeedConfig;
pub use error::{DataError, Result};
pub use manager::{DataManager, ManagerState, MarketInfo};
pub use order_book::{
    BookLevel, BookStatus, BookUpdate, OrderBookFeed, OrderBookView, ResyncReason, ResyncRequest,
    TopOfBook,
};
pub use price_feed::{
    PriceFeed, PriceRead, PriceSnapshot, PriceSource, PriceUpdate, SubscriptionHandle, SymbolFilter,
};
pub use source::{AskBid, DataSource, MarketDataSource, PriceQuote, RestSource, StreamSource};
