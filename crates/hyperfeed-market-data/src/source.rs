/*
[INPUT]:  Stream feeds (PriceFeed, OrderBookFeed) or the REST OHLCV collaborator
[OUTPUT]: Price and ask/bid quotes tagged with the source that produced them
[POS]:    Data layer - pluggable read sources behind the DataManager fallback policy
[UPDATE]: When adding a source or changing REST caching
*/

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use hyperfeed_adapter::{Candle, OhlcvSource};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

use crate::order_book::OrderBookFeed;
use crate::price_feed::{PriceFeed, PriceSource, now_millis};

/// Which tier currently answers reads for a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Stream,
    Rest,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceQuote {
    pub symbol: String,
    pub price: Decimal,
    pub timestamp_ms: u64,
    pub source: PriceSource,
    /// Older than the price TTL; still the freshest value available
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AskBid {
    pub ask: Decimal,
    pub bid: Decimal,
    pub timestamp_ms: u64,
    pub source: PriceSource,
}

#[async_trait]
pub trait MarketDataSource: Send + Sync {
    fn kind(&self) -> DataSource;

    async fn current_price(&self, symbol: &str) -> Option<PriceQuote>;

    async fn ask_bid(&self, symbol: &str) -> Option<AskBid>;
}

/// Reads the streaming feeds. Never awaits network I/O.
#[derive(Debug, Clone)]
pub struct StreamSource {
    prices: Arc<PriceFeed>,
    books: Arc<OrderBookFeed>,
}

impl StreamSource {
    pub fn new(prices: Arc<PriceFeed>, books: Arc<OrderBookFeed>) -> Self {
        Self { prices, books }
    }

    /// Latest stream price, including stale ones.
    pub fn latest_price(&self, symbol: &str) -> Option<PriceQuote> {
        let read = self.prices.get_price(symbol)?;
        Some(PriceQuote {
            symbol: symbol.to_string(),
            price: read.snapshot.price()?,
            timestamp_ms: read.snapshot.timestamp_ms,
            source: PriceSource::Stream,
            stale: read.stale,
        })
    }

    pub fn latest_ask_bid(&self, symbol: &str) -> Option<AskBid> {
        if let Some(top) = self.books.top_of_book(symbol) {
            return Some(AskBid {
                ask: top.best_ask.price,
                bid: top.best_bid.price,
                timestamp_ms: top.timestamp_ms,
                source: PriceSource::Stream,
            });
        }

        let read = self.prices.get_price(symbol)?;
        if read.stale {
            return None;
        }
        Some(AskBid {
            ask: read.snapshot.best_ask?,
            bid: read.snapshot.best_bid?,
            timestamp_ms: read.snapshot.timestamp_ms,
            source: PriceSource::Stream,
        })
    }
}

#[async_trait]
impl MarketDataSource for StreamSource {
    fn kind(&self) -> DataSource {
        DataSource::Stream
    }

    async fn current_price(&self, symbol: &str) -> Option<PriceQuote> {
        self.latest_price(symbol).filter(|quote| !quote.stale)
    }

    async fn ask_bid(&self, symbol: &str) -> Option<AskBid> {
        self.latest_ask_bid(symbol)
    }
}

#[derive(Debug, Clone)]
pub struct RestSettings {
    /// How long a fetched result (or failure) is reused
    pub cache_ttl: Duration,
    pub timeout: Duration,
    pub days_back: u32,
    pub timeframe: String,
}

impl Default for RestSettings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(5),
            timeout: Duration::from_secs(3),
            days_back: 1,
            timeframe: "5m".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedQuote {
    quote: Option<PriceQuote>,
    fetched_at: Instant,
}

/// REST fallback over an [`OhlcvSource`].
///
/// Results and failures are cached per symbol for `cache_ttl`. Concurrent
/// misses for one symbol wait on a per-symbol lock so only one request is made.
pub struct RestSource {
    source: Arc<dyn OhlcvSource>,
    settings: RestSettings,
    cache: DashMap<String, CachedQuote>,
    inflight: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl RestSource {
    pub fn new(source: Arc<dyn OhlcvSource>, settings: RestSettings) -> Self {
        Self {
            source,
            settings,
            cache: DashMap::new(),
            inflight: DashMap::new(),
        }
    }

    /// Cached quote if it is still within the cache window.
    pub fn cached(&self, symbol: &str) -> Option<PriceQuote> {
        self.cached_entry(symbol)?.quote
    }

    pub fn clear(&self) {
        self.cache.clear();
        self.inflight.clear();
    }

    fn cached_entry(&self, symbol: &str) -> Option<CachedQuote> {
        let entry = self.cache.get(symbol)?;
        if entry.fetched_at.elapsed() <= self.settings.cache_ttl {
            Some(entry.value().clone())
        } else {
            None
        }
    }

    async fn fetch(&self, symbol: &str) -> Option<PriceQuote> {
        if let Some(entry) = self.cached_entry(symbol) {
            return entry.quote;
        }

        let lock = self
            .inflight
            .entry(symbol.to_string())
            .or_default()
            .value()
            .clone();
        let _guard = lock.lock().await;

        if let Some(entry) = self.cached_entry(symbol) {
            return entry.quote;
        }

        let started = Instant::now();
        let quote = match timeout(
            self.settings.timeout,
            self.source
                .get_data(symbol, self.settings.days_back, &self.settings.timeframe),
        )
        .await
        {
            Ok(Ok(candles)) => quote_from_candles(symbol, &candles),
            Ok(Err(err)) => {
                warn!(symbol, error = %err, "REST fallback request failed");
                None
            }
            Err(_) => {
                warn!(symbol, timeout_ms = self.settings.timeout.as_millis() as u64, "REST fallback timed out");
                None
            }
        };

        match &quote {
            Some(quote) => info!(
                symbol,
                price = %quote.price,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "REST fallback price fetched"
            ),
            None => debug!(symbol, "REST fallback produced no price; caching miss"),
        }

        self.cache.insert(
            symbol.to_string(),
            CachedQuote {
                quote: quote.clone(),
                fetched_at: Instant::now(),
            },
        );
        quote
    }
}

impl std::fmt::Debug for RestSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestSource")
            .field("settings", &self.settings)
            .field("cached", &self.cache.len())
            .finish()
    }
}

#[async_trait]
impl MarketDataSource for RestSource {
    fn kind(&self) -> DataSource {
        DataSource::Rest
    }

    async fn current_price(&self, symbol: &str) -> Option<PriceQuote> {
        self.fetch(symbol).await
    }

    async fn ask_bid(&self, symbol: &str) -> Option<AskBid> {
        let quote = self.fetch(symbol).await?;
        Some(AskBid {
            ask: quote.price,
            bid: quote.price,
            timestamp_ms: quote.timestamp_ms,
            source: PriceSource::Rest,
        })
    }
}

fn quote_from_candles(symbol: &str, candles: &[Candle]) -> Option<PriceQuote> {
    let last = candles.iter().max_by_key(|candle| candle.open_time)?;
    Some(PriceQuote {
        symbol: symbol.to_string(),
        price: last.close,
        // The last bar is usually still open; its close time lies in the future
        timestamp_ms: last.close_time.min(now_millis()),
        source: PriceSource::Rest,
        stale: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::price_feed::PriceUpdate;
    use hyperfeed_adapter::{AdapterError, Result as AdapterResult};
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        calls: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl CountingSource {
        fn new(delay: Duration, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                fail,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OhlcvSource for CountingSource {
        async fn get_data(&self, token: &str, _days_back: u32, timeframe: &str) -> AdapterResult<Vec<Candle>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(AdapterError::Api {
                    code: 500,
                    message: "unavailable".to_string(),
                });
            }
            Ok(vec![candle(token, timeframe, 1_000, "2990"), candle(token, timeframe, 2_000, "3001.5")])
        }
    }

    fn candle(symbol: &str, interval: &str, open_time: u64, close: &str) -> Candle {
        let close = Decimal::from_str(close).unwrap();
        Candle {
            open_time,
            close_time: open_time + 999,
            symbol: symbol.to_string(),
            interval: interval.to_string(),
            open: close,
            close,
            high: close,
            low: close,
            volume: Decimal::ONE,
            trades: 1,
        }
    }

    fn rest(source: Arc<CountingSource>, timeout_ms: u64) -> RestSource {
        RestSource::new(
            source,
            RestSettings {
                timeout: Duration::from_millis(timeout_ms),
                ..RestSettings::default()
            },
        )
    }

    #[tokio::test]
    async fn rest_price_is_last_close_and_cached() {
        let counting = CountingSource::new(Duration::ZERO, false);
        let source = rest(counting.clone(), 500);

        let quote = source.current_price("ETH").await.unwrap();
        assert_eq!(quote.price, Decimal::from_str("3001.5").unwrap());
        assert_eq!(quote.source, PriceSource::Rest);
        assert_eq!(quote.timestamp_ms, 2_999);

        let ask_bid = source.ask_bid("ETH").await.unwrap();
        assert_eq!(ask_bid.ask, ask_bid.bid);
        assert_eq!(source.cached("ETH"), Some(quote));
        assert_eq!(counting.calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_request() {
        let counting = CountingSource::new(Duration::from_millis(50), false);
        let source = rest(counting.clone(), 1_000);

        let (a, b, c) = tokio::join!(
            source.current_price("BTC"),
            source.current_price("BTC"),
            source.current_price("BTC")
        );

        assert!(a.is_some() && b.is_some() && c.is_some());
        assert_eq!(counting.calls(), 1);
    }

    #[tokio::test]
    async fn failures_are_cached_for_the_window() {
        let counting = CountingSource::new(Duration::ZERO, true);
        let source = rest(counting.clone(), 500);

        assert!(source.current_price("SOL").await.is_none());
        assert!(source.current_price("SOL").await.is_none());
        assert_eq!(counting.calls(), 1);
        assert_eq!(source.kind(), DataSource::Rest);
    }

    #[tokio::test]
    async fn slow_collaborator_is_bounded_by_timeout() {
        let counting = CountingSource::new(Duration::from_secs(10), false);
        let source = rest(counting, 50);

        let started = std::time::Instant::now();
        assert!(source.current_price("BTC").await.is_none());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn stream_source_prefers_book_for_ask_bid() {
        let prices = Arc::new(PriceFeed::default());
        let books = Arc::new(OrderBookFeed::new());
        let source = StreamSource::new(prices.clone(), books.clone());
        let now = now_millis();

        prices.update("BTC", PriceUpdate::quote(Decimal::from(90), Decimal::from(110), now));
        let ask_bid = source.ask_bid("BTC").await.unwrap();
        assert_eq!((ask_bid.ask, ask_bid.bid), (Decimal::from(110), Decimal::from(90)));

        let levels = crate::order_book::BookUpdate::new(
            vec![crate::order_book::BookLevel::new(Decimal::from(99), Decimal::ONE)],
            vec![crate::order_book::BookLevel::new(Decimal::from(100), Decimal::ONE)],
        );
        books.apply_snapshot("BTC", &levels, 1, now).unwrap();
        let ask_bid = source.ask_bid("BTC").await.unwrap();
        assert_eq!((ask_bid.ask, ask_bid.bid), (Decimal::from(100), Decimal::from(99)));
    }

    #[tokio::test]
    async fn stream_source_hides_stale_prices() {
        let prices = Arc::new(PriceFeed::new(Duration::from_millis(100)));
        let source = StreamSource::new(prices.clone(), Arc::new(OrderBookFeed::new()));
        prices.update("BTC", PriceUpdate::trade(Decimal::from(100), now_millis() - 10_000));

        assert!(source.current_price("BTC").await.is_none());
        let latest = source.latest_price("BTC").unwrap();
        assert!(latest.stale);
        assert_eq!(source.kind(), DataSource::Stream);
    }
}
