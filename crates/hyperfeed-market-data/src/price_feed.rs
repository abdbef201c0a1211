/*
[INPUT]:  Trade and top-of-book updates per symbol (dispatch path) + subscriber registrations
[OUTPUT]: Latest PriceSnapshot per symbol with staleness flag; synchronous subscriber fan-out
[POS]:    Data layer - best bid/ask/last price cache
[UPDATE]: When changing merge rules, staleness semantics, or subscriber delivery
*/

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, warn};

pub const DEFAULT_PRICE_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceSource {
    Stream,
    Rest,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceSnapshot {
    pub symbol: String,
    pub last_price: Option<Decimal>,
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    /// Exchange time of the newest accepted update, in epoch milliseconds
    pub timestamp_ms: u64,
    /// Exchange time of the trade behind `last_price`
    pub last_trade_ms: Option<u64>,
    pub source: PriceSource,
}

impl PriceSnapshot {
    pub fn mid(&self) -> Option<Decimal> {
        match (self.best_bid, self.best_ask) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::TWO),
            _ => None,
        }
    }

    /// The last trade when it is the newest observation, otherwise the mid.
    pub fn price(&self) -> Option<Decimal> {
        if self.last_trade_ms == Some(self.timestamp_ms) {
            return self.last_price.or_else(|| self.mid());
        }
        self.mid().or(self.last_price)
    }

    fn merged(&self, update: &PriceUpdate) -> Self {
        Self {
            symbol: self.symbol.clone(),
            last_price: update.last_price.or(self.last_price),
            best_bid: update.best_bid.or(self.best_bid),
            best_ask: update.best_ask.or(self.best_ask),
            timestamp_ms: update.timestamp_ms,
            last_trade_ms: update.trade_time().or(self.last_trade_ms),
            source: update.source,
        }
    }

    fn from_update(symbol: &str, update: &PriceUpdate) -> Self {
        Self {
            symbol: symbol.to_string(),
            last_price: update.last_price,
            best_bid: update.best_bid,
            best_ask: update.best_ask,
            timestamp_ms: update.timestamp_ms,
            last_trade_ms: update.trade_time(),
            source: update.source,
        }
    }
}

/// Partial price observation; absent fields carry forward from the previous snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceUpdate {
    pub last_price: Option<Decimal>,
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    pub timestamp_ms: u64,
    pub source: PriceSource,
}

impl PriceUpdate {
    pub fn trade(price: Decimal, timestamp_ms: u64) -> Self {
        Self {
            last_price: Some(price),
            best_bid: None,
            best_ask: None,
            timestamp_ms,
            source: PriceSource::Stream,
        }
    }

    pub fn quote(best_bid: Decimal, best_ask: Decimal, timestamp_ms: u64) -> Self {
        Self {
            last_price: None,
            best_bid: Some(best_bid),
            best_ask: Some(best_ask),
            timestamp_ms,
            source: PriceSource::Stream,
        }
    }

    fn trade_time(&self) -> Option<u64> {
        self.last_price.map(|_| self.timestamp_ms)
    }
}

/// A cached snapshot plus whether it is older than the feed's TTL.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceRead {
    pub snapshot: Arc<PriceSnapshot>,
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolFilter {
    All,
    Symbol(String),
}

impl SymbolFilter {
    fn matches(&self, symbol: &str) -> bool {
        match self {
            SymbolFilter::All => true,
            SymbolFilter::Symbol(wanted) => wanted == symbol,
        }
    }
}

impl From<&str> for SymbolFilter {
    fn from(value: &str) -> Self {
        if value == "*" {
            SymbolFilter::All
        } else {
            SymbolFilter::Symbol(value.to_string())
        }
    }
}

/// Opaque registration handle returned by [`PriceFeed::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

type PriceCallback = Arc<dyn Fn(&PriceSnapshot) + Send + Sync>;

struct Subscriber {
    handle: SubscriptionHandle,
    filter: SymbolFilter,
    callback: PriceCallback,
}

/// Latest-price cache fed by the single dispatch path and read by many consumers.
///
/// Each symbol's entry is an `Arc<PriceSnapshot>` replaced whole, so readers never
/// see a half-merged snapshot.
pub struct PriceFeed {
    ttl: Duration,
    prices: DashMap<String, Arc<PriceSnapshot>>,
    subscribers: RwLock<Vec<Subscriber>>,
    next_handle: AtomicU64,
    halted: AtomicBool,
}

impl PriceFeed {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            prices: DashMap::new(),
            subscribers: RwLock::new(Vec::new()),
            next_handle: AtomicU64::new(1),
            halted: AtomicBool::new(false),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Merge an update. Accepted only if strictly newer than the cached snapshot;
    /// accepted updates are delivered to matching subscribers before returning.
    /// Rejected while the feed is halted.
    pub fn update(&self, symbol: &str, update: PriceUpdate) -> bool {
        let entry = self.prices.entry(symbol.to_string());
        // Checked under the shard lock so a halt's clear cannot be overtaken.
        if self.halted.load(Ordering::SeqCst) {
            debug!(symbol, "price update ignored; feed halted");
            return false;
        }
        let accepted = match entry {
            Entry::Occupied(mut entry) => {
                if update.timestamp_ms <= entry.get().timestamp_ms {
                    None
                } else {
                    let next = Arc::new(entry.get().merged(&update));
                    entry.insert(next.clone());
                    Some(next)
                }
            }
            Entry::Vacant(entry) => {
                let next = Arc::new(PriceSnapshot::from_update(symbol, &update));
                entry.insert(next.clone());
                Some(next)
            }
        };

        match accepted {
            Some(snapshot) => {
                self.notify(&snapshot);
                true
            }
            None => {
                debug!(symbol, timestamp_ms = update.timestamp_ms, "price update ignored; not newer");
                false
            }
        }
    }

    pub fn get_price(&self, symbol: &str) -> Option<PriceRead> {
        self.get_price_at(symbol, now_millis())
    }

    /// Same as [`PriceFeed::get_price`] with an explicit clock, in epoch milliseconds.
    pub fn get_price_at(&self, symbol: &str, now_ms: u64) -> Option<PriceRead> {
        let snapshot = self.prices.get(symbol)?.value().clone();
        let stale = now_ms.saturating_sub(snapshot.timestamp_ms) > self.ttl.as_millis() as u64;
        Some(PriceRead { snapshot, stale })
    }

    pub fn subscribe<F>(&self, filter: impl Into<SymbolFilter>, callback: F) -> SubscriptionHandle
    where
        F: Fn(&PriceSnapshot) + Send + Sync + 'static,
    {
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push(Subscriber {
            handle,
            filter: filter.into(),
            callback: Arc::new(callback),
        });
        handle
    }

    /// Returns `false` if the handle was unknown or already removed.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|subscriber| subscriber.handle != handle);
        subscribers.len() != before
    }

    pub fn symbols(&self) -> Vec<String> {
        self.prices.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Drop cached prices. Subscribers stay registered.
    pub fn clear(&self) {
        self.prices.clear();
    }

    /// Reject all further updates, then drop cached prices. When this returns no
    /// update can land until [`PriceFeed::resume`].
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
        self.prices.clear();
    }

    pub fn resume(&self) {
        self.halted.store(false, Ordering::SeqCst);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    fn notify(&self, snapshot: &PriceSnapshot) {
        let matching: Vec<(SubscriptionHandle, PriceCallback)> = self
            .subscribers
            .read()
            .iter()
            .filter(|subscriber| subscriber.filter.matches(&snapshot.symbol))
            .map(|subscriber| (subscriber.handle, subscriber.callback.clone()))
            .collect();

        for (handle, callback) in matching {
            if catch_unwind(AssertUnwindSafe(|| callback(snapshot))).is_err() {
                warn!(symbol = %snapshot.symbol, ?handle, "price subscriber panicked");
            }
        }
    }
}

impl Default for PriceFeed {
    fn default() -> Self {
        Self::new(DEFAULT_PRICE_TTL)
    }
}

impl std::fmt::Debug for PriceFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriceFeed")
            .field("ttl", &self.ttl)
            .field("symbols", &self.prices.len())
            .field("subscribers", &self.subscribers.read().len())
            .finish()
    }
}

pub(crate) fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
