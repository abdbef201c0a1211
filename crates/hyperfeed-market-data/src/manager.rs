/*
[INPUT]:  FeedConfig, symbols/channels to track, gateway stream, REST OHLCV collaborator
[OUTPUT]: Facade reads (price, ask/bid, L2 book, diagnostics) with stream-first REST fallback
[POS]:    Data layer - lifecycle owner wiring the gateway client into the feeds
[UPDATE]: When changing fallback priority, lifecycle states, or background tasks
*/

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use hyperfeed_adapter::{
    Channel, ClientConfig, ClientEvent, ConnectionState, GatewayClient, GatewayMessage, InfoClient,
    OhlcvSource, TradeData,
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{FeedConfig, validate_subscriptions};
use crate::error::{DataError, Result};
use crate::order_book::{BookStatus, OrderBookFeed, OrderBookView, ResyncRequest};
use crate::price_feed::{PriceFeed, PriceUpdate};
use crate::source::{
    AskBid, DataSource, MarketDataSource, PriceQuote, RestSettings, RestSource, StreamSource,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ManagerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Per-symbol diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketInfo {
    pub symbol: String,
    pub state: ManagerState,
    pub connected: bool,
    /// The stream exhausted its consecutive-failure budget and has not reconnected since
    pub degraded: bool,
    pub data_source: DataSource,
    pub book_status: BookStatus,
    /// Latest stream price, possibly stale
    pub stream_price: Option<PriceQuote>,
}

struct Running {
    client: Arc<GatewayClient>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

struct Lifecycle {
    state: ManagerState,
    running: Option<Running>,
}

/// Owns the gateway connection and the feeds it drives.
///
/// Share it as `Arc<DataManager>`. Stream reads never await network I/O; the REST
/// fallback is the only read that waits, bounded by `rest_timeout_ms`.
pub struct DataManager {
    config: FeedConfig,
    prices: Arc<PriceFeed>,
    books: Arc<OrderBookFeed>,
    stream: StreamSource,
    rest: RestSource,
    degraded: Arc<AtomicBool>,
    lifecycle: Mutex<Lifecycle>,
    /// Mirrors `lifecycle.state` for callers waiting on a teardown in progress
    state_tx: watch::Sender<ManagerState>,
}

impl DataManager {
    /// Manager whose REST fallback is the public info endpoint at `config.info_url`.
    pub fn new(config: FeedConfig) -> Result<Self> {
        let client = InfoClient::with_config_and_base_url(
            ClientConfig {
                timeout: config.rest_timeout(),
                ..ClientConfig::default()
            },
            &config.info_url,
        )?;
        Self::with_ohlcv_source(config, Arc::new(client))
    }

    pub fn with_ohlcv_source(config: FeedConfig, ohlcv: Arc<dyn OhlcvSource>) -> Result<Self> {
        config.validate()?;
        let prices = Arc::new(PriceFeed::new(config.price_ttl()));
        let books = Arc::new(OrderBookFeed::new());
        let rest = RestSource::new(
            ohlcv,
            RestSettings {
                cache_ttl: config.price_ttl(),
                timeout: config.rest_timeout(),
                days_back: config.rest_days_back,
                timeframe: config.rest_timeframe.clone(),
            },
        );

        Ok(Self {
            stream: StreamSource::new(prices.clone(), books.clone()),
            prices,
            books,
            rest,
            degraded: Arc::new(AtomicBool::new(false)),
            lifecycle: Mutex::new(Lifecycle {
                state: ManagerState::Stopped,
                running: None,
            }),
            state_tx: watch::Sender::new(ManagerState::Stopped),
            config,
        })
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    /// Price feed for registering subscribers.
    pub fn prices(&self) -> &Arc<PriceFeed> {
        &self.prices
    }

    pub fn books(&self) -> &Arc<OrderBookFeed> {
        &self.books
    }

    pub fn state(&self) -> ManagerState {
        self.lifecycle.lock().state
    }

    /// Connect, subscribe every `(channel, symbol)` pair and spawn background tasks.
    ///
    /// Must be called inside a Tokio runtime. Calling it while running is a no-op.
    pub fn start(&self, symbols: &[String], channels: &[Channel]) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        match lifecycle.state {
            ManagerState::Running | ManagerState::Starting => {
                debug!("data manager already started");
                return Ok(());
            }
            ManagerState::Stopping => return Err(DataError::Stopping),
            ManagerState::Stopped => {}
        }

        validate_subscriptions(symbols, channels)?;
        self.set_state(&mut lifecycle, ManagerState::Starting);
        self.prices.resume();
        self.books.resume();

        match self.spawn_running(symbols, channels) {
            Ok(running) => {
                lifecycle.running = Some(running);
                self.set_state(&mut lifecycle, ManagerState::Running);
                info!(symbols = ?symbols, channels = ?channels, "data manager started");
                Ok(())
            }
            Err(err) => {
                self.set_state(&mut lifecycle, ManagerState::Stopped);
                Err(err)
            }
        }
    }

    fn set_state(&self, lifecycle: &mut Lifecycle, state: ManagerState) {
        lifecycle.state = state;
        self.state_tx.send_replace(state);
    }

    fn spawn_running(&self, symbols: &[String], channels: &[Channel]) -> Result<Running> {
        let client = Arc::new(GatewayClient::new(self.config.gateway_config()));

        let prices = self.prices.clone();
        let books = self.books.clone();
        client.on_message(move |message| route_message(&prices, &books, message));

        for symbol in symbols {
            for channel in channels {
                client.subscribe(*channel, symbol)?;
            }
        }

        let events = client
            .take_events()
            .ok_or_else(|| DataError::FatalConfig("gateway events already taken".to_string()))?;
        let resyncs = self.books.attach_resync_channel();
        client.start()?;

        let shutdown = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(run_event_loop(
                events,
                self.books.clone(),
                self.degraded.clone(),
                shutdown.clone(),
            )),
            tokio::spawn(run_resync_loop(resyncs, client.clone(), shutdown.clone())),
        ];

        Ok(Running {
            client,
            shutdown,
            tasks,
        })
    }

    /// Close the connection, wait (bounded by `stop_timeout_ms`) for background
    /// tasks and clear all cached state. Safe without a prior `start()`.
    ///
    /// Once this returns the feeds accept no further writes. A call made while
    /// another `stop()` is tearing down waits for that teardown to finish.
    pub async fn stop(&self) {
        let (running, in_progress) = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state == ManagerState::Stopping {
                (None, Some(self.state_tx.subscribe()))
            } else {
                self.set_state(&mut lifecycle, ManagerState::Stopping);
                (lifecycle.running.take(), None)
            }
        };

        if let Some(mut state) = in_progress {
            let wait = self.config.stop_timeout().saturating_mul(2);
            let stopped = tokio::time::timeout(wait, state.wait_for(|s| *s == ManagerState::Stopped)).await;
            if !matches!(stopped, Ok(Ok(_))) {
                warn!(timeout_ms = wait.as_millis() as u64, "concurrent stop did not finish in time");
            }
            return;
        }

        if let Some(Running {
            client,
            shutdown,
            tasks,
        }) = running
        {
            shutdown.cancel();
            client.close();

            let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
            let worker = client.clone();
            let drained = tokio::time::timeout(self.config.stop_timeout(), async move {
                worker.join().await;
                for task in tasks {
                    if let Err(err) = task.await {
                        warn!(error = %err, "data manager task ended abnormally");
                    }
                }
            })
            .await;

            if drained.is_err() {
                warn!(
                    timeout_ms = self.config.stop_timeout_ms,
                    "background tasks did not finish in time; aborting"
                );
                client.abort();
                for abort in aborts {
                    abort.abort();
                }
            }
        }

        self.prices.halt();
        self.books.halt();
        self.rest.clear();
        self.degraded.store(false, Ordering::Release);
        let mut lifecycle = self.lifecycle.lock();
        self.set_state(&mut lifecycle, ManagerState::Stopped);
        info!("data manager stopped");
    }

    /// Request shutdown without waiting. Safe to call from inside a price or
    /// message callback; follow up with [`DataManager::stop`] to tear down state.
    pub fn shutdown(&self) {
        let lifecycle = self.lifecycle.lock();
        if let Some(running) = lifecycle.running.as_ref() {
            running.shutdown.cancel();
            running.client.close();
        }
    }

    /// Fresh stream price, else REST, else the latest stale stream price.
    pub async fn get_current_price(&self, symbol: &str) -> Option<PriceQuote> {
        let state = self.state();
        if !readable(state) {
            return None;
        }
        if state == ManagerState::Running
            && let Some(quote) = self.stream.current_price(symbol).await
        {
            return Some(quote);
        }

        if let Some(quote) = self.rest.current_price(symbol).await {
            return Some(quote);
        }

        let stale = self.stream.latest_price(symbol);
        if stale.is_some() {
            debug!(symbol, "REST fallback unavailable; serving stale stream price");
        }
        stale
    }

    /// Book top-of-book, else stream bid/ask, else REST close.
    pub async fn ask_bid(&self, symbol: &str) -> Option<AskBid> {
        let state = self.state();
        if !readable(state) {
            return None;
        }
        if state == ManagerState::Running
            && let Some(ask_bid) = self.stream.ask_bid(symbol).await
        {
            return Some(ask_bid);
        }
        self.rest.ask_bid(symbol).await
    }

    pub fn get_l2_book(&self, symbol: &str, depth: usize) -> Option<OrderBookView> {
        if self.state() != ManagerState::Running {
            return None;
        }
        self.books.get_book(symbol, depth)
    }

    pub fn get_market_info(&self, symbol: &str) -> MarketInfo {
        MarketInfo {
            symbol: symbol.to_string(),
            state: self.state(),
            connected: self.is_connected(),
            degraded: self.is_degraded(),
            data_source: self.get_data_source(symbol),
            book_status: self.books.status(symbol),
            stream_price: self.stream.latest_price(symbol),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == Some(ConnectionState::Connected)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Gateway connection state while running.
    pub fn connection_state(&self) -> Option<ConnectionState> {
        let lifecycle = self.lifecycle.lock();
        lifecycle.running.as_ref().map(|running| running.client.state())
    }

    /// The tier a read for `symbol` would be answered from right now, without
    /// issuing a REST request.
    pub fn get_data_source(&self, symbol: &str) -> DataSource {
        if self.state() == ManagerState::Running {
            let fresh_price = self
                .stream
                .latest_price(symbol)
                .is_some_and(|quote| !quote.stale);
            if fresh_price || self.books.top_of_book(symbol).is_some() {
                return DataSource::Stream;
            }
        }
        if self.rest.cached(symbol).is_some() {
            return DataSource::Rest;
        }
        DataSource::None
    }
}

impl Drop for DataManager {
    fn drop(&mut self) {
        if let Some(running) = self.lifecycle.get_mut().running.take() {
            running.shutdown.cancel();
            running.client.close();
        }
    }
}

impl std::fmt::Debug for DataManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataManager")
            .field("state", &self.state())
            .field("prices", &self.prices)
            .field("rest", &self.rest)
            .finish()
    }
}

fn readable(state: ManagerState) -> bool {
    matches!(state, ManagerState::Running | ManagerState::Stopped)
}

/// Dispatch path: runs on the connection task, one message at a time.
fn route_message(prices: &PriceFeed, books: &OrderBookFeed, message: &GatewayMessage) {
    match message {
        GatewayMessage::Trades { symbol, trades } => {
            if let Some(last) = latest_trade(trades) {
                prices.update(symbol, PriceUpdate::trade(last.px, last.time));
            }
        }
        GatewayMessage::L2Book(data) => match books.apply_message(data) {
            Ok(Some(top)) => {
                prices.update(
                    &data.coin,
                    PriceUpdate::quote(top.best_bid.price, top.best_ask.price, top.timestamp_ms),
                );
            }
            Ok(None) | Err(DataError::Stopping) => {}
            Err(err) if err.is_recoverable() => {
                debug!(symbol = %data.coin, seq = data.seq, error = %err, "book update dropped");
            }
            Err(err) => warn!(symbol = %data.coin, error = %err, "book update failed"),
        },
    }
}

fn latest_trade(trades: &[TradeData]) -> Option<&TradeData> {
    trades.iter().max_by_key(|trade| (trade.time, trade.tid))
}

async fn run_event_loop(
    mut events: mpsc::UnboundedReceiver<ClientEvent>,
    books: Arc<OrderBookFeed>,
    degraded: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            ClientEvent::StateChanged(ConnectionState::Reconnecting) => {
                books.invalidate_all();
            }
            ClientEvent::StateChanged(state) => debug!(?state, "gateway state changed"),
            ClientEvent::Connected { epoch } => {
                books.invalidate_all();
                if degraded.swap(false, Ordering::AcqRel) {
                    info!(epoch, "stream recovered from degraded state");
                } else {
                    info!(epoch, "stream connected");
                }
            }
            ClientEvent::Degraded {
                consecutive_failures,
            } => {
                degraded.store(true, Ordering::Release);
                warn!(
                    retry_count = consecutive_failures,
                    "stream degraded; reads fall back to REST"
                );
            }
        }
    }
    debug!("data manager event loop exited");
}

async fn run_resync_loop(
    mut resyncs: mpsc::UnboundedReceiver<ResyncRequest>,
    client: Arc<GatewayClient>,
    shutdown: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            _ = shutdown.cancelled() => break,
            request = resyncs.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        match client.resubscribe(Channel::L2Book, &request.symbol) {
            Ok(true) => info!(symbol = %request.symbol, reason = ?request.reason, "book resync requested"),
            Ok(false) => debug!(symbol = %request.symbol, "resync for unsubscribed book ignored"),
            Err(err) => {
                debug!(symbol = %request.symbol, error = %err, "resync skipped; client closed");
                break;
            }
        }
    }
    debug!("data manager resync loop exited");
}
