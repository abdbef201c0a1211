/*
[INPUT]:  L2 snapshots and sequenced deltas per symbol (dispatch path)
[OUTPUT]: Validated order books, depth-limited copies, resync requests
[POS]:    Data layer - L2 book maintenance
[UPDATE]: When changing sequencing, crossing checks, or resync signalling
*/

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use hyperfeed_adapter::{BookUpdateKind, L2BookData, WireLevel};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{DataError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub size: Decimal,
}

impl BookLevel {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }
}

impl From<&WireLevel> for BookLevel {
    fn from(level: &WireLevel) -> Self {
        Self::new(level.px, level.sz)
    }
}

/// Level changes for both sides. In a delta a zero size removes the price.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BookUpdate {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

impl BookUpdate {
    pub fn new(bids: Vec<BookLevel>, asks: Vec<BookLevel>) -> Self {
        Self { bids, asks }
    }
}

/// Immutable depth-limited copy of a valid book.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderBookView {
    pub symbol: String,
    /// Best (highest) first
    pub bids: Vec<BookLevel>,
    /// Best (lowest) first
    pub asks: Vec<BookLevel>,
    pub sequence: u64,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TopOfBook {
    pub best_bid: BookLevel,
    pub best_ask: BookLevel,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BookStatus {
    Valid,
    AwaitingSnapshot,
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncReason {
    SequenceGap { expected: u64, received: u64 },
    CrossedBook,
    /// A delta arrived for a book that never had a snapshot
    NotSynced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResyncRequest {
    pub symbol: String,
    pub reason: ResyncReason,
}

#[derive(Debug, Clone, Copy)]
enum SideKind {
    Bid,
    Ask,
}

#[derive(Debug)]
struct BookSide {
    kind: SideKind,
    levels: BTreeMap<Decimal, Decimal>,
    best: Option<BookLevel>,
}

impl BookSide {
    fn new(kind: SideKind) -> Self {
        Self {
            kind,
            levels: BTreeMap::new(),
            best: None,
        }
    }

    fn replace(&mut self, levels: &[BookLevel]) {
        self.levels.clear();
        for level in levels {
            if level.size > Decimal::ZERO {
                self.levels.insert(level.price, level.size);
            }
        }
        self.refresh_best();
    }

    fn apply(&mut self, changes: &[BookLevel]) {
        for level in changes {
            if level.size.is_zero() {
                self.levels.remove(&level.price);
            } else {
                self.levels.insert(level.price, level.size);
            }
        }
        self.refresh_best();
    }

    fn clear(&mut self) {
        self.levels.clear();
        self.best = None;
    }

    fn refresh_best(&mut self) {
        let best = match self.kind {
            SideKind::Bid => self.levels.last_key_value(),
            SideKind::Ask => self.levels.first_key_value(),
        };
        self.best = best.map(|(price, size)| BookLevel::new(*price, *size));
    }

    fn top(&self, depth: usize) -> Vec<BookLevel> {
        let to_level = |(price, size): (&Decimal, &Decimal)| BookLevel::new(*price, *size);
        match self.kind {
            SideKind::Bid => self.levels.iter().rev().take(depth).map(to_level).collect(),
            SideKind::Ask => self.levels.iter().take(depth).map(to_level).collect(),
        }
    }
}

#[derive(Debug)]
struct Book {
    bids: BookSide,
    asks: BookSide,
    sequence: u64,
    timestamp_ms: u64,
    valid: bool,
    /// A resync was requested and no snapshot has arrived yet
    resync_pending: bool,
}

impl Book {
    fn new() -> Self {
        Self {
            bids: BookSide::new(SideKind::Bid),
            asks: BookSide::new(SideKind::Ask),
            sequence: 0,
            timestamp_ms: 0,
            valid: false,
            resync_pending: false,
        }
    }

    fn is_crossed(&self) -> bool {
        match (self.bids.best, self.asks.best) {
            (Some(bid), Some(ask)) => bid.price >= ask.price,
            _ => false,
        }
    }

    fn invalidate(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.valid = false;
    }

    fn top_of_book(&self) -> Option<TopOfBook> {
        if !self.valid {
            return None;
        }
        Some(TopOfBook {
            best_bid: self.bids.best?,
            best_ask: self.asks.best?,
            timestamp_ms: self.timestamp_ms,
        })
    }
}

/// Per-symbol L2 books fed by the dispatch path.
///
/// A book is readable only while valid. Any sequence mismatch or crossing update
/// invalidates it and emits a single [`ResyncRequest`]; later deltas are dropped
/// quietly until a snapshot arrives.
#[derive(Debug, Default)]
pub struct OrderBookFeed {
    books: DashMap<String, Book>,
    resync_tx: Mutex<Option<mpsc::UnboundedSender<ResyncRequest>>>,
    halted: AtomicBool,
}

impl OrderBookFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route resync requests to a fresh channel, replacing any previous one.
    pub fn attach_resync_channel(&self) -> mpsc::UnboundedReceiver<ResyncRequest> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.resync_tx.lock() = Some(tx);
        rx
    }

    pub fn apply_snapshot(
        &self,
        symbol: &str,
        levels: &BookUpdate,
        sequence: u64,
        timestamp_ms: u64,
    ) -> Result<()> {
        let entry = self.books.entry(symbol.to_string());
        if self.halted.load(Ordering::SeqCst) {
            return Err(DataError::Stopping);
        }
        let mut book = entry.or_insert_with(Book::new);
        book.bids.replace(&levels.bids);
        book.asks.replace(&levels.asks);
        book.sequence = sequence;
        book.timestamp_ms = timestamp_ms;

        if book.is_crossed() {
            book.invalidate();
            book.resync_pending = true;
            drop(book);
            warn!(symbol, sequence, "rejected crossed book snapshot");
            self.request_resync(symbol, ResyncReason::CrossedBook);
            return Err(DataError::CrossedBook {
                symbol: symbol.to_string(),
            });
        }

        let was_pending = book.resync_pending;
        book.valid = true;
        book.resync_pending = false;
        drop(book);
        if was_pending {
            info!(symbol, sequence, "order book resynchronized");
        } else {
            debug!(symbol, sequence, "order book snapshot applied");
        }
        Ok(())
    }

    pub fn apply_delta(
        &self,
        symbol: &str,
        changes: &BookUpdate,
        sequence: u64,
        timestamp_ms: u64,
    ) -> Result<()> {
        let entry = self.books.entry(symbol.to_string());
        if self.halted.load(Ordering::SeqCst) {
            return Err(DataError::Stopping);
        }
        let mut book = entry.or_insert_with(Book::new);

        if !book.valid {
            let first_request = !book.resync_pending;
            book.resync_pending = true;
            drop(book);
            if first_request {
                debug!(symbol, sequence, "delta before snapshot");
                self.request_resync(symbol, ResyncReason::NotSynced);
            }
            return Err(DataError::BookNotReady {
                symbol: symbol.to_string(),
            });
        }

        let expected = book.sequence.saturating_add(1);
        if sequence != expected {
            book.invalidate();
            book.resync_pending = true;
            drop(book);
            warn!(symbol, expected, received = sequence, "order book sequence gap");
            self.request_resync(
                symbol,
                ResyncReason::SequenceGap {
                    expected,
                    received: sequence,
                },
            );
            return Err(DataError::SequenceGap {
                symbol: symbol.to_string(),
                expected,
                received: sequence,
            });
        }

        book.bids.apply(&changes.bids);
        book.asks.apply(&changes.asks);

        if book.is_crossed() {
            book.invalidate();
            book.resync_pending = true;
            drop(book);
            warn!(symbol, sequence, "rejected crossing book delta");
            self.request_resync(symbol, ResyncReason::CrossedBook);
            return Err(DataError::CrossedBook {
                symbol: symbol.to_string(),
            });
        }

        book.sequence = sequence;
        book.timestamp_ms = timestamp_ms;
        Ok(())
    }

    /// Apply a gateway book frame and return the resulting top of book.
    pub fn apply_message(&self, data: &L2BookData) -> Result<Option<TopOfBook>> {
        let (bids, asks) = &data.levels;
        let update = BookUpdate::new(
            bids.iter().map(BookLevel::from).collect(),
            asks.iter().map(BookLevel::from).collect(),
        );
        match data.kind {
            BookUpdateKind::Snapshot => self.apply_snapshot(&data.coin, &update, data.seq, data.time)?,
            BookUpdateKind::Delta => self.apply_delta(&data.coin, &update, data.seq, data.time)?,
        }
        Ok(self.top_of_book(&data.coin))
    }

    pub fn get_book(&self, symbol: &str, depth: usize) -> Option<OrderBookView> {
        let book = self.books.get(symbol)?;
        if !book.valid {
            return None;
        }
        Some(OrderBookView {
            symbol: symbol.to_string(),
            bids: book.bids.top(depth),
            asks: book.asks.top(depth),
            sequence: book.sequence,
            timestamp_ms: book.timestamp_ms,
        })
    }

    pub fn top_of_book(&self, symbol: &str) -> Option<TopOfBook> {
        self.books.get(symbol)?.top_of_book()
    }

    pub fn status(&self, symbol: &str) -> BookStatus {
        match self.books.get(symbol) {
            Some(book) if book.valid => BookStatus::Valid,
            Some(_) => BookStatus::AwaitingSnapshot,
            None => BookStatus::Absent,
        }
    }

    /// Mark every book as awaiting a snapshot. No resync is requested here; the
    /// gateway re-sends snapshots for the replayed subscriptions, and a delta
    /// that still finds the book unsynced requests one.
    pub fn invalidate_all(&self) {
        let mut invalidated = 0usize;
        for mut book in self.books.iter_mut() {
            if book.valid {
                invalidated += 1;
            }
            book.invalidate();
            book.resync_pending = false;
        }
        if invalidated > 0 {
            info!(invalidated, "order books invalidated for new connection epoch");
        }
    }

    pub fn symbols(&self) -> Vec<String> {
        self.books.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn clear(&self) {
        self.books.clear();
    }

    /// Reject all further snapshots and deltas, then drop every book.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
        self.books.clear();
    }

    pub fn resume(&self) {
        self.halted.store(false, Ordering::SeqCst);
    }

    fn request_resync(&self, symbol: &str, reason: ResyncReason) {
        let request = ResyncRequest {
            symbol: symbol.to_string(),
            reason,
        };
        match self.resync_tx.lock().as_ref() {
            Some(tx) => {
                if tx.send(request).is_err() {
                    debug!(symbol, "resync receiver dropped");
                }
            }
            None => debug!(symbol, ?reason, "resync requested with no receiver attached"),
        }
    }
}
