/*
[INPUT]:  Test configuration and mock collaborator requirements
[OUTPUT]: Shared test utilities: mock gateway, counting REST source, fast feed config
[POS]:    Test infrastructure - shared across manager test modules
[UPDATE]: When adding new test patterns or fixtures
*/

//! Common test utilities for hyperfeed-market-data tests

#![allow(dead_code)]

use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use hyperfeed_adapter::{AdapterError, Candle, OhlcvSource, Result as AdapterResult};
use hyperfeed_market_data::FeedConfig;
use hyperfeed_market_data::config::{HeartbeatConfig, ReconnectConfig};
use rust_decimal::Decimal;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

enum Control {
    Send(String),
    Drop,
}

/// Localhost gateway that serves one connection at a time and records
/// every JSON frame with the 1-based index of its connection.
pub struct MockGateway {
    pub url: String,
    received: mpsc::UnboundedReceiver<(usize, serde_json::Value)>,
    control: mpsc::UnboundedSender<Control>,
}

impl MockGateway {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock gateway");
        let url = format!("ws://{}", listener.local_addr().expect("local addr"));
        let (received_tx, received) = mpsc::unbounded_channel();
        let (control, mut control_rx) = mpsc::unbounded_channel::<Control>();

        tokio::spawn(async move {
            let mut connection = 0usize;
            while let Ok((tcp, _)) = listener.accept().await {
                let Ok(mut ws) = accept_async(tcp).await else {
                    continue;
                };
                connection += 1;

                loop {
                    tokio::select! {
                        control = control_rx.recv() => match control {
                            Some(Control::Send(text)) => {
                                if ws.send(Message::Text(text.into())).await.is_err() {
                                    break;
                                }
                            }
                            Some(Control::Drop) => break,
                            None => return,
                        },
                        incoming = ws.next() => match incoming {
                            Some(Ok(Message::Text(text))) => {
                                if let Ok(value) = serde_json::from_str(text.as_str()) {
                                    let _ = received_tx.send((connection, value));
                                }
                            }
                            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                            Some(Ok(_)) => {}
                        },
                    }
                }
            }
        });

        Self {
            url,
            received,
            control,
        }
    }

    /// Next non-ping frame, or `None` after `wait`.
    pub async fn next_frame(&mut self, wait: Duration) -> Option<(usize, serde_json::Value)> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let frame = tokio::time::timeout_at(deadline, self.received.recv())
                .await
                .ok()??;
            if frame.1["method"] != "ping" {
                return Some(frame);
            }
        }
    }

    pub async fn expect_frames(&mut self, count: usize) -> Vec<(usize, serde_json::Value)> {
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            let frame = self
                .next_frame(Duration::from_secs(5))
                .await
                .expect("expected frame from client");
            frames.push(frame);
        }
        frames
    }

    pub fn send(&self, frame: serde_json::Value) {
        let _ = self.control.send(Control::Send(frame.to_string()));
    }

    pub fn drop_connection(&self) {
        let _ = self.control.send(Control::Drop);
    }
}

/// OHLCV collaborator that counts calls and returns two 5m bars closing at 3001.5.
pub struct CountingSource {
    calls: AtomicUsize,
    fail: bool,
}

impl CountingSource {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: false,
        }
    }

    /// Counts calls and answers every one with a 503.
    pub fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: true,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OhlcvSource for CountingSource {
    async fn get_data(&self, token: &str, _days_back: u32, timeframe: &str) -> AdapterResult<Vec<Candle>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(AdapterError::Api {
                code: 503,
                message: "service unavailable".to_string(),
            });
        }
        let now = now_millis();
        Ok(vec![
            candle(token, timeframe, now - 600_000, "2998"),
            candle(token, timeframe, now - 300_000, "3001.5"),
        ])
    }
}

fn candle(symbol: &str, interval: &str, open_time: u64, close: &str) -> Candle {
    let close = Decimal::from_str(close).expect("decimal");
    Candle {
        open_time,
        close_time: open_time + 299_999,
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

/// Feed config with millisecond-scale reconnect timings for tests.
pub fn fast_config(ws_url: &str) -> FeedConfig {
    FeedConfig {
        ws_url: ws_url.to_string(),
        rest_timeout_ms: 500,
        reconnect: ReconnectConfig {
            base_delay_ms: 20,
            max_delay_ms: 100,
            max_consecutive_failures: 3,
        },
        heartbeat: HeartbeatConfig {
            interval_ms: 15_000,
            timeout_ms: 45_000,
        },
        ..FeedConfig::default()
    }
}

/// A ws:// URL nothing is listening on.
pub async fn unreachable_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    format!("ws://{addr}")
}

pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

/// Poll `check` every 10ms until it holds, panicking after 5s.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn subscription_of(frame: &serde_json::Value) -> (String, String, String) {
    (
        frame["method"].as_str().unwrap_or_default().to_string(),
        frame["subscription"]["type"].as_str().unwrap_or_default().to_string(),
        frame["subscription"]["coin"].as_str().unwrap_or_default().to_string(),
    )
}
