/*
[INPUT]:  Gateway payload schemas and serde requirements
[OUTPUT]: Typed Rust structs with serialization support
[POS]:    Data layer - type definitions for gateway communication
[UPDATE]: When payload schemas change or new types added
*/

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::enums::{BookUpdateKind, Side};

/// One aggregated price level as sent by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireLevel {
    #[serde(with = "rust_decimal::serde::str")]
    pub px: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub sz: Decimal,
    #[serde(default)]
    pub n: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeData {
    pub coin: String,
    pub side: Side,
    #[serde(with = "rust_decimal::serde::str")]
    pub px: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub sz: Decimal,
    /// Exchange time in epoch milliseconds
    pub time: u64,
    #[serde(default)]
    pub tid: u64,
}

/// Snapshot or incremental update of a symbol's L2 book.
///
/// `levels` is `[bids, asks]`. In a delta a level with zero size removes the price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct L2BookData {
    pub coin: String,
    pub time: u64,
    pub seq: u64,
    #[serde(rename = "type", default = "default_book_kind")]
    pub kind: BookUpdateKind,
    pub levels: (Vec<WireLevel>, Vec<WireLevel>),
}

fn default_book_kind() -> BookUpdateKind {
    BookUpdateKind::Snapshot
}

/// OHLCV bar returned by the `candleSnapshot` info request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    #[serde(rename = "t")]
    pub open_time: u64,
    #[serde(rename = "T")]
    pub close_time: u64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "i")]
    pub interval: String,
    #[serde(rename = "o", with = "rust_decimal::serde::str")]
    pub open: Decimal,
    #[serde(rename = "c", with = "rust_decimal::serde::str")]
    pub close: Decimal,
    #[serde(rename = "h", with = "rust_decimal::serde::str")]
    pub high: Decimal,
    #[serde(rename = "l", with = "rust_decimal::serde::str")]
    pub low: Decimal,
    #[serde(rename = "v", with = "rust_decimal::serde::str")]
    pub volume: Decimal,
    #[serde(rename = "n", default)]
    pub trades: u64,
}
