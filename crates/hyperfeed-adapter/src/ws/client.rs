/*
[INPUT]:  Gateway WebSocket URL, reconnect/heartbeat policy, subscription intents
[OUTPUT]: Parsed market data dispatched to handlers + connection lifecycle events
[POS]:    WebSocket layer - single physical connection with reconnect and replay
[UPDATE]: When adding new channels or changing connection logic
*/

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AdapterError, Result};
use crate::types::Channel;
use crate::ws::backoff::Backoff;
use crate::ws::message::{
    GatewayMessage, Inbound, Subscription, parse_frame, ping_frame, subscribe_frame,
    unsubscribe_frame,
};

pub const MAINNET_WS_URL: &str = "wss://api.hyperliquid.xyz/ws";
const PARSE_FAIL_LOG_LIMIT: usize = 10;
const UNKNOWN_LOG_LIMIT: usize = 5;
const RAW_LOG_MAX_BYTES: usize = 512;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type MessageHandler = Arc<dyn Fn(&GatewayMessage) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

/// Lifecycle notifications for the client's registrant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    StateChanged(ConnectionState),
    /// A new connection epoch began; ordering is not preserved across epochs.
    Connected { epoch: u64 },
    /// Consecutive connect failures reached the configured budget.
    Degraded { consecutive_failures: u32 },
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_consecutive_failures: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_consecutive_failures: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub url: String,
    pub reconnect: ReconnectPolicy,
    pub heartbeat_interval: Duration,
    /// Silence longer than this counts as a dead connection
    pub heartbeat_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: MAINNET_WS_URL.to_string(),
            reconnect: ReconnectPolicy::default(),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(45),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
enum Command {
    Subscribe(Subscription),
    Unsubscribe(Subscription),
    Resubscribe(Subscription),
    Close,
}

struct Shared {
    id: Uuid,
    state: watch::Sender<ConnectionState>,
    subscriptions: Mutex<Vec<Subscription>>,
    handlers: RwLock<Vec<MessageHandler>>,
    events: mpsc::UnboundedSender<ClientEvent>,
    /// Events are only queued once a registrant has taken the receiver
    events_taken: AtomicBool,
    epoch: AtomicU64,
    consecutive_failures: AtomicU32,
    parse_fail_count: AtomicUsize,
    unknown_count: AtomicUsize,
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            debug!(client_id = %self.id, state = ?next, "gateway connection state changed");
            self.emit(ClientEvent::StateChanged(next));
        }
    }

    fn emit(&self, event: ClientEvent) {
        if self.events_taken.load(Ordering::Acquire) {
            let _ = self.events.send(event);
        }
    }
}

/// Client for one physical gateway connection.
///
/// Subscription bookkeeping lives here; the socket itself is owned by a single
/// background worker spawned by [`GatewayClient::start`]. Public methods only
/// record intent and post a command, so they never block and are safe to call
/// from inside a message handler.
pub struct GatewayClient {
    config: GatewayConfig,
    shared: Arc<Shared>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ClientEvent>>>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_abort: Mutex<Option<AbortHandle>>,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig) -> Self {
        let (state, _rx) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        Self {
            config,
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                state,
                subscriptions: Mutex::new(Vec::new()),
                handlers: RwLock::new(Vec::new()),
                events: events_tx,
                events_taken: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                consecutive_failures: AtomicU32::new(0),
                parse_fail_count: AtomicUsize::new(0),
                unknown_count: AtomicUsize::new(0),
            }),
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
            events_rx: Mutex::new(Some(events_rx)),
            shutdown: CancellationToken::new(),
            worker: Mutex::new(None),
            worker_abort: Mutex::new(None),
        }
    }

    /// Take the lifecycle event receiver. Returns `None` after the first call.
    ///
    /// Events raised before the receiver is taken are discarded.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        let receiver = self.events_rx.lock().take()?;
        self.shared.events_taken.store(true, Ordering::Release);
        Some(receiver)
    }

    /// Register a dispatch callback, invoked once per parsed frame on the connection task.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(&GatewayMessage) + Send + Sync + 'static,
    {
        self.shared.handlers.write().push(Arc::new(handler));
    }

    /// Register a subscription. Returns `false` if the pair was already registered.
    ///
    /// If connected the frame goes out immediately; either way the pair is replayed
    /// after every reconnect, in registration order.
    pub fn subscribe(&self, channel: Channel, symbol: &str) -> Result<bool> {
        self.ensure_open()?;
        let subscription = Subscription::new(channel, symbol);
        {
            let mut subscriptions = self.shared.subscriptions.lock();
            if subscriptions.contains(&subscription) {
                return Ok(false);
            }
            subscriptions.push(subscription.clone());
        }
        let _ = self.cmd_tx.send(Command::Subscribe(subscription));
        Ok(true)
    }

    /// Remove a subscription. Returns `false` if the pair was not registered.
    pub fn unsubscribe(&self, channel: Channel, symbol: &str) -> Result<bool> {
        self.ensure_open()?;
        let subscription = Subscription::new(channel, symbol);
        {
            let mut subscriptions = self.shared.subscriptions.lock();
            let Some(pos) = subscriptions.iter().position(|s| *s == subscription) else {
                return Ok(false);
            };
            subscriptions.remove(pos);
        }
        let _ = self.cmd_tx.send(Command::Unsubscribe(subscription));
        Ok(true)
    }

    /// Re-issue an existing subscription (unsubscribe + subscribe) so the gateway
    /// sends a fresh snapshot.
    pub fn resubscribe(&self, channel: Channel, symbol: &str) -> Result<bool> {
        self.ensure_open()?;
        let subscription = Subscription::new(channel, symbol);
        if !self.shared.subscriptions.lock().contains(&subscription) {
            return Ok(false);
        }
        let _ = self.cmd_tx.send(Command::Resubscribe(subscription));
        Ok(true)
    }

    /// Registered subscriptions, in registration order.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.shared.subscriptions.lock().clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Current connection epoch; 0 before the first successful connect.
    pub fn epoch(&self) -> u64 {
        self.shared.epoch.load(Ordering::Acquire)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.shared.consecutive_failures.load(Ordering::Acquire)
    }

    /// Spawn the connection worker. Calling it again is a no-op.
    pub fn start(&self) -> Result<()> {
        self.ensure_open()?;
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        if tokio::runtime::Handle::try_current().is_err() {
            return Err(AdapterError::Config(
                "GatewayClient::start requires a Tokio runtime".to_string(),
            ));
        }

        let Some(cmd_rx) = self.cmd_rx.lock().take() else {
            return Ok(());
        };

        let connection = Connection {
            config: self.config.clone(),
            shared: self.shared.clone(),
            cmd_rx,
            shutdown: self.shutdown.clone(),
        };
        info!(client_id = %self.shared.id, url = %self.config.url, "starting gateway client");
        let handle = tokio::spawn(connection.run());
        *self.worker_abort.lock() = Some(handle.abort_handle());
        *worker = Some(handle);
        Ok(())
    }

    /// Request graceful shutdown. Idempotent and non-blocking.
    ///
    /// Interrupts a blocked receive or a pending backoff wait; the worker drives the
    /// state to `Closed` on its way out. Use [`GatewayClient::join`] to wait for it.
    pub fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        let _ = self.cmd_tx.send(Command::Close);
        if self.worker.lock().is_none() {
            self.shared.set_state(ConnectionState::Closed);
        }
    }

    /// Wait for the worker task to finish. Returns immediately if it never started.
    pub async fn join(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            warn!(client_id = %self.shared.id, error = %err, "gateway worker ended abnormally");
        }
    }

    /// Abort the worker at its next await point. For callers whose bounded wait
    /// on [`GatewayClient::join`] expired; call [`GatewayClient::close`] first.
    pub fn abort(&self) {
        if let Some(handle) = self.worker_abort.lock().take() {
            handle.abort();
        }
        self.shared.set_state(ConnectionState::Closed);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(AdapterError::Closed);
        }
        Ok(())
    }
}

impl Drop for GatewayClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("id", &self.shared.id)
            .field("url", &self.config.url)
            .field("state", &self.state())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionExit {
    Disconnected(String),
    Shutdown,
}

/// Connection worker; the only writer to the socket.
struct Connection {
    config: GatewayConfig,
    shared: Arc<Shared>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    shutdown: CancellationToken,
}

impl Connection {
    async fn run(mut self) {
        let policy = self.config.reconnect.clone();
        let mut backoff = Backoff::new(policy.base_delay, policy.max_delay);
        let mut failures: u32 = 0;

        'run: loop {
            if self.shutdown.is_cancelled() {
                break 'run;
            }

            let connected = tokio::select! {
                _ = self.shutdown.cancelled() => break 'run,
                result = self.connect() => result,
            };

            match connected {
                Ok(stream) => {
                    failures = 0;
                    self.shared.consecutive_failures.store(0, Ordering::Release);
                    backoff.reset();

                    let epoch = self.shared.epoch.fetch_add(1, Ordering::AcqRel) + 1;
                    self.shared.set_state(ConnectionState::Connected);
                    self.shared.emit(ClientEvent::Connected { epoch });
                    info!(client_id = %self.shared.id, epoch, "gateway connected");

                    match self.session(stream).await {
                        SessionExit::Shutdown => break 'run,
                        SessionExit::Disconnected(reason) => {
                            warn!(client_id = %self.shared.id, epoch, %reason, "gateway connection lost");
                        }
                    }
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    self.shared
                        .consecutive_failures
                        .store(failures, Ordering::Release);
                    warn!(client_id = %self.shared.id, retry_count = failures, error = %err, "gateway connect failed");

                    if failures == policy.max_consecutive_failures {
                        warn!(
                            client_id = %self.shared.id,
                            retry_count = failures,
                            max_consecutive_failures = policy.max_consecutive_failures,
                            "gateway failure budget exhausted; reporting degraded"
                        );
                        self.shared.emit(ClientEvent::Degraded {
                            consecutive_failures: failures,
                        });
                    }
                }
            }

            self.shared.set_state(ConnectionState::Reconnecting);
            let delay = backoff.next_delay(&mut rand::thread_rng());
            debug!(client_id = %self.shared.id, retry_count = failures, ?delay, "gateway reconnect scheduled");

            tokio::select! {
                _ = self.shutdown.cancelled() => break 'run,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.shared.set_state(ConnectionState::Closed);
        info!(client_id = %self.shared.id, "gateway client closed");
    }

    /// Establish the transport and complete the WebSocket handshake.
    async fn connect(&self) -> Result<WsStream> {
        self.shared.set_state(ConnectionState::Connecting);
        debug!(client_id = %self.shared.id, url = %self.config.url, "connecting to gateway");

        let timeout = self.config.connect_timeout;
        match tokio::time::timeout(timeout, connect_async(self.config.url.as_str())).await {
            Ok(Ok((stream, _response))) => Ok(stream),
            Ok(Err(err)) => Err(AdapterError::Connection(err.to_string())),
            Err(_) => Err(AdapterError::Timeout {
                duration_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn session(&mut self, stream: WsStream) -> SessionExit {
        let (mut write, mut read) = stream.split();
        let mut sent: Vec<Subscription> = Vec::new();

        // Queued commands predate this epoch; the registry replay below covers them.
        while let Ok(command) = self.cmd_rx.try_recv() {
            if matches!(command, Command::Close) {
                let _ = write.send(WsMessage::Close(None)).await;
                return SessionExit::Shutdown;
            }
        }

        let replay = self.shared.subscriptions.lock().clone();
        for subscription in replay {
            if let Err(err) = send_json(&mut write, &subscribe_frame(&subscription)).await {
                return SessionExit::Disconnected(err.to_string());
            }
            log_subscription(&self.shared, "subscribe", &subscription);
            sent.push(subscription);
        }

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.tick().await;
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    return SessionExit::Shutdown;
                }
                command = self.cmd_rx.recv() => {
                    let result = match command {
                        Some(Command::Subscribe(subscription)) => {
                            if sent.contains(&subscription) {
                                Ok(())
                            } else {
                                let result = send_json(&mut write, &subscribe_frame(&subscription)).await;
                                log_subscription(&self.shared, "subscribe", &subscription);
                                sent.push(subscription);
                                result
                            }
                        }
                        Some(Command::Unsubscribe(subscription)) => {
                            match sent.iter().position(|s| *s == subscription) {
                                Some(pos) => {
                                    sent.remove(pos);
                                    log_subscription(&self.shared, "unsubscribe", &subscription);
                                    send_json(&mut write, &unsubscribe_frame(&subscription)).await
                                }
                                None => Ok(()),
                            }
                        }
                        Some(Command::Resubscribe(subscription)) => {
                            if sent.contains(&subscription) {
                                log_subscription(&self.shared, "resubscribe", &subscription);
                                match send_json(&mut write, &unsubscribe_frame(&subscription)).await {
                                    Ok(()) => send_json(&mut write, &subscribe_frame(&subscription)).await,
                                    Err(err) => Err(err),
                                }
                            } else {
                                Ok(())
                            }
                        }
                        Some(Command::Close) | None => {
                            let _ = write.send(WsMessage::Close(None)).await;
                            return SessionExit::Shutdown;
                        }
                    };
                    if let Err(err) = result {
                        return SessionExit::Disconnected(err.to_string());
                    }
                }
                _ = heartbeat.tick() => {
                    let silence = last_inbound.elapsed();
                    if silence > self.config.heartbeat_timeout {
                        return SessionExit::Disconnected(format!("heartbeat timeout after {silence:?}"));
                    }
                    if let Err(err) = send_json(&mut write, &ping_frame()).await {
                        return SessionExit::Disconnected(err.to_string());
                    }
                }
                incoming = read.next() => {
                    match incoming {
                        Some(Ok(WsMessage::Close(_))) => {
                            return SessionExit::Disconnected("closed by gateway".to_string());
                        }
                        Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {
                            last_inbound = Instant::now();
                        }
                        Some(Ok(message)) => {
                            last_inbound = Instant::now();
                            self.handle_frame(message);
                        }
                        Some(Err(err)) => {
                            return SessionExit::Disconnected(err.to_string());
                        }
                        None => {
                            return SessionExit::Disconnected("stream ended".to_string());
                        }
                    }
                }
            }
        }
    }

    fn handle_frame(&self, message: WsMessage) {
        let text = match message {
            WsMessage::Text(text) => text.to_string(),
            WsMessage::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(err) => {
                    log_parse_fail(&self.shared, &err.to_string(), "<binary>");
                    return;
                }
            },
            _ => return,
        };

        match parse_frame(&text) {
            Ok(Inbound::Messages(messages)) => {
                for message in &messages {
                    if self.shutdown.is_cancelled() {
                        debug!(client_id = %self.shared.id, "dispatch stopped; client closing");
                        break;
                    }
                    self.dispatch(message);
                }
            }
            Ok(Inbound::Pong) => {}
            Ok(Inbound::Ack(data)) => {
                debug!(client_id = %self.shared.id, ack = %data, "gateway subscription acknowledged");
            }
            Ok(Inbound::ServerError(message)) => {
                warn!(client_id = %self.shared.id, %message, "gateway reported protocol error");
            }
            Ok(Inbound::Unknown(channel)) => {
                let count = self.shared.unknown_count.fetch_add(1, Ordering::Relaxed);
                if count < UNKNOWN_LOG_LIMIT {
                    info!(
                        client_id = %self.shared.id,
                        sample_index = count + 1,
                        sample_limit = UNKNOWN_LOG_LIMIT,
                        %channel,
                        "gateway channel unrecognized"
                    );
                }
            }
            Err(err) => log_parse_fail(&self.shared, &err.to_string(), &text),
        }
    }

    fn dispatch(&self, message: &GatewayMessage) {
        let handlers = self.shared.handlers.read().clone();
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
                warn!(
                    client_id = %self.shared.id,
                    channel = %message.channel(),
                    symbol = message.symbol(),
                    "gateway message handler panicked"
                );
            }
        }
    }
}

async fn send_json(write: &mut WsSink, value: &Value) -> Result<()> {
    write
        .send(WsMessage::Text(value.to_string().into()))
        .await
        .map_err(AdapterError::from)
}

fn log_subscription(shared: &Shared, action: &'static str, subscription: &Subscription) {
    debug!(
        client_id = %shared.id,
        action,
        channel = %subscription.channel,
        symbol = %subscription.symbol,
        "ws subscription sent"
    );
}

fn log_parse_fail(shared: &Shared, error: &str, raw: &str) {
    let count = shared.parse_fail_count.fetch_add(1, Ordering::Relaxed);
    let preview = truncate_for_log(raw, RAW_LOG_MAX_BYTES);
    if count < PARSE_FAIL_LOG_LIMIT {
        warn!(
            client_id = %shared.id,
            sample_index = count + 1,
            sample_limit = PARSE_FAIL_LOG_LIMIT,
            error,
            bytes = raw.len(),
            "ws frame dropped"
        );
        debug!(client_id = %shared.id, message = %preview, "ws frame dropped");
    } else {
        debug!(client_id = %shared.id, error, message = %preview, "ws frame dropped");
    }
}

fn truncate_for_log(value: &str, max_len: usize) -> String {
    if value.len() <= max_len {
        return value.to_string();
    }
    let mut end = max_len;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = String::with_capacity(end + 3);
    out.push_str(&value[..end]);
    out.push_str("...");
    out
}
